use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

use cuniculus_errors::{CuniculusError, CuniculusResult};

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_level: String,
    /// "pretty" 或 "json"
    pub log_format: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

impl ObservabilityConfig {
    pub fn validate(&self) -> CuniculusResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(CuniculusError::config_error(format!(
                "无效的日志级别: {}",
                self.log_level
            )));
        }

        if !matches!(self.log_format.as_str(), "pretty" | "json") {
            return Err(CuniculusError::config_error(format!(
                "无效的日志格式: {}，仅支持 pretty 或 json",
                self.log_format
            )));
        }

        Ok(())
    }
}

/// 健康检查探针配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HealthCheckConfig {
    pub enabled: bool,
    pub bind_to: String,
    pub port: u16,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_to: "0.0.0.0".to_string(),
            port: 3000,
        }
    }
}

impl HealthCheckConfig {
    pub fn socket_addr(&self) -> CuniculusResult<SocketAddr> {
        format!("{}:{}", self.bind_to, self.port)
            .parse()
            .map_err(|e| CuniculusError::config_error(format!("无效的健康检查监听地址: {e}")))
    }

    pub fn validate(&self) -> CuniculusResult<()> {
        if self.enabled {
            self.socket_addr()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observability_validate() {
        assert!(ObservabilityConfig::default().validate().is_ok());

        let config = ObservabilityConfig {
            log_level: "loud".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ObservabilityConfig {
            log_format: "xml".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_health_check_addr() {
        let config = HealthCheckConfig {
            enabled: true,
            bind_to: "127.0.0.1".to_string(),
            port: 0,
        };
        assert_eq!(config.socket_addr().unwrap().to_string(), "127.0.0.1:0");

        let config = HealthCheckConfig {
            enabled: true,
            bind_to: "not an address".to_string(),
            port: 3000,
        };
        assert!(config.validate().is_err());

        let config = HealthCheckConfig {
            enabled: false,
            bind_to: "not an address".to_string(),
            port: 3000,
        };
        assert!(config.validate().is_ok());
    }
}
