use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_CONCURRENCY, DEFAULT_MAX_RETRY, DEFAULT_PREFETCH_COUNT, DEFAULT_QUEUE_NAME, MAX_RETRY,
};
use cuniculus_errors::{CuniculusError, CuniculusResult};

/// 单个逻辑队列的声明参数
///
/// 每个队列在broker上展开为：基础队列 `name`，以及 `max_retry` 个重试队列
/// `name_1 .. name_{max_retry}`。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    #[serde(default = "default_durable")]
    pub durable: bool,
    #[serde(default = "default_max_retry")]
    pub max_retry: u32,
    #[serde(default = "default_prefetch_count")]
    pub prefetch_count: u16,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

fn default_durable() -> bool {
    true
}

fn default_max_retry() -> u32 {
    DEFAULT_MAX_RETRY
}

fn default_prefetch_count() -> u16 {
    DEFAULT_PREFETCH_COUNT
}

fn default_concurrency() -> usize {
    DEFAULT_CONCURRENCY
}

impl Default for QueueSpec {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_NAME)
    }
}

impl QueueSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: default_durable(),
            max_retry: default_max_retry(),
            prefetch_count: default_prefetch_count(),
            concurrency: default_concurrency(),
        }
    }

    pub fn with_max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = max_retry;
        self
    }

    pub fn with_durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn with_prefetch_count(mut self, prefetch_count: u16) -> Self {
        self.prefetch_count = prefetch_count;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn validate(&self) -> CuniculusResult<()> {
        if self.name.trim().is_empty() {
            return Err(CuniculusError::config_error("队列名称不能为空"));
        }

        if self.max_retry > MAX_RETRY {
            return Err(CuniculusError::config_error(format!(
                "队列 {} 的最大重试次数为 {}，超过上限 {MAX_RETRY}",
                self.name, self.max_retry
            )));
        }

        if self.prefetch_count == 0 {
            return Err(CuniculusError::config_error(format!(
                "队列 {} 的预取数量必须大于0",
                self.name
            )));
        }

        if self.concurrency == 0 {
            return Err(CuniculusError::config_error(format!(
                "队列 {} 的并发数必须大于0",
                self.name
            )));
        }

        Ok(())
    }

    /// 第`index`个重试队列的名称，`index`从1开始
    pub fn retry_queue_name(&self, index: u32) -> String {
        format!("{}_{}", self.name, index)
    }

    /// 按顺序返回完整的重试链
    pub fn retry_queue_names(&self) -> Vec<String> {
        (1..=self.max_retry)
            .map(|index| self.retry_queue_name(index))
            .collect()
    }
}
