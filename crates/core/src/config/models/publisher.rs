use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use cuniculus_errors::{CuniculusError, CuniculusResult};

/// 重连尝试次数上限
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "ReconnectAttemptsRepr", into = "ReconnectAttemptsRepr")]
pub enum ReconnectAttempts {
    Limited(u32),
    Infinite,
}

impl ReconnectAttempts {
    /// 第`attempt`次（从1开始）失败后是否还允许继续尝试
    pub fn allows(&self, attempt: u32) -> bool {
        match self {
            ReconnectAttempts::Limited(max) => attempt <= *max,
            ReconnectAttempts::Infinite => true,
        }
    }
}

impl fmt::Display for ReconnectAttempts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconnectAttempts::Limited(max) => write!(f, "{max}"),
            ReconnectAttempts::Infinite => write!(f, "infinite"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum ReconnectAttemptsRepr {
    Count(u32),
    Text(String),
}

impl TryFrom<ReconnectAttemptsRepr> for ReconnectAttempts {
    type Error = String;

    fn try_from(value: ReconnectAttemptsRepr) -> Result<Self, Self::Error> {
        match value {
            ReconnectAttemptsRepr::Count(count) => Ok(ReconnectAttempts::Limited(count)),
            ReconnectAttemptsRepr::Text(text) => {
                let text = text.trim();
                if text.eq_ignore_ascii_case("infinite") {
                    Ok(ReconnectAttempts::Infinite)
                } else {
                    text.parse::<u32>()
                        .map(ReconnectAttempts::Limited)
                        .map_err(|_| format!("无效的重连次数: {text}，应为整数或 \"infinite\""))
                }
            }
        }
    }
}

impl From<ReconnectAttempts> for ReconnectAttemptsRepr {
    fn from(value: ReconnectAttempts) -> Self {
        match value {
            ReconnectAttempts::Limited(count) => ReconnectAttemptsRepr::Count(count),
            ReconnectAttempts::Infinite => ReconnectAttemptsRepr::Text("infinite".to_string()),
        }
    }
}

/// 重连延迟和关闭宽限期的上限（秒）
pub const MAX_PUBLISHER_SECONDS: f64 = 86_400.0;

fn seconds_to_duration(seconds: f64) -> Duration {
    Duration::try_from_secs_f64(seconds.clamp(0.0, MAX_PUBLISHER_SECONDS)).unwrap_or(Duration::ZERO)
}

fn check_seconds(name: &str, value: f64) -> CuniculusResult<()> {
    if !value.is_finite() || value > MAX_PUBLISHER_SECONDS {
        return Err(CuniculusError::config_error(format!(
            "{name} 必须是不超过 {MAX_PUBLISHER_SECONDS} 秒的有限数值，当前为 {value}"
        )));
    }
    Ok(())
}

/// Publisher (Dispatcher + PublisherWorker pool) configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PublisherConfig {
    pub pool_size: usize,
    pub reconnect_attempts: ReconnectAttempts,
    pub reconnect_delay_seconds: f64,
    pub reconnect_delay_max_seconds: f64,
    pub shutdown_grace_period_seconds: f64,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            pool_size: 5,
            reconnect_attempts: ReconnectAttempts::Infinite,
            reconnect_delay_seconds: 1.5,
            reconnect_delay_max_seconds: 10.0,
            shutdown_grace_period_seconds: 50.0,
        }
    }
}

impl PublisherConfig {
    pub fn validate(&self) -> CuniculusResult<()> {
        if self.pool_size == 0 {
            return Err(CuniculusError::config_error("发布者连接池大小必须大于0"));
        }

        check_seconds("reconnect_delay_seconds", self.reconnect_delay_seconds)?;
        check_seconds("reconnect_delay_max_seconds", self.reconnect_delay_max_seconds)?;
        check_seconds(
            "shutdown_grace_period_seconds",
            self.shutdown_grace_period_seconds,
        )?;

        if !(self.reconnect_delay_seconds > 0.0) {
            return Err(CuniculusError::config_error("重连延迟必须大于0"));
        }

        if !(self.reconnect_delay_max_seconds > 0.0) {
            return Err(CuniculusError::config_error("最大重连延迟必须大于0"));
        }

        if self.reconnect_delay_max_seconds < self.reconnect_delay_seconds {
            return Err(CuniculusError::config_error("最大重连延迟不能小于重连延迟"));
        }

        if !(self.shutdown_grace_period_seconds >= 0.0) {
            return Err(CuniculusError::config_error("关闭宽限期不能为负数"));
        }

        Ok(())
    }

    // 以下访问器把超出范围的值截断到 [0, MAX_PUBLISHER_SECONDS]

    pub fn reconnect_delay(&self) -> Duration {
        seconds_to_duration(self.reconnect_delay_seconds)
    }

    pub fn reconnect_delay_max(&self) -> Duration {
        seconds_to_duration(self.reconnect_delay_max_seconds)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        seconds_to_duration(self.shutdown_grace_period_seconds)
    }
}
