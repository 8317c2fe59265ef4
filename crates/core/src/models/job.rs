use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use cuniculus_errors::{CuniculusError, CuniculusResult};

/// 任务消息体
///
/// `class` 与 `args` 为必填字段，缺失时视为毒消息。`_cun_retries` 缺省为0。
/// 其余未知字段原样保留，重试重新发布时不会丢失。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobEnvelope {
    pub class: String,
    pub args: Vec<Value>,
    #[serde(rename = "_cun_retries", default, skip_serializing_if = "is_zero")]
    pub retries: u32,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn is_zero(value: &u32) -> bool {
    *value == 0
}

impl JobEnvelope {
    pub fn new(class: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            class: class.into(),
            args,
            retries: 0,
            extra: Map::new(),
        }
    }

    /// 解析broker投递的消息体，任何格式问题都返回 `BadlyFormattedPayload`
    pub fn parse(payload: &[u8]) -> CuniculusResult<Self> {
        let value: Value = serde_json::from_slice(payload)
            .map_err(|e| CuniculusError::badly_formatted(format!("无效的JSON: {e}")))?;

        let object = value
            .as_object()
            .ok_or_else(|| CuniculusError::badly_formatted("消息体必须是JSON对象"))?;
        for key in ["class", "args"] {
            if !object.contains_key(key) {
                return Err(CuniculusError::badly_formatted(format!(
                    "消息体缺少必填字段 '{key}'"
                )));
            }
        }

        serde_json::from_value(value).map_err(|e| {
            CuniculusError::badly_formatted(format!("消息体字段类型错误: {e}"))
        })
    }

    pub fn to_bytes(&self) -> CuniculusResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// 返回重试计数加一后的副本
    pub fn next_attempt(&self) -> Self {
        let mut next = self.clone();
        next.retries = self.retries.saturating_add(1);
        next
    }
}
