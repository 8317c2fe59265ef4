use serde::{Deserialize, Serialize};

use cuniculus_errors::{CuniculusError, CuniculusResult};

/// RabbitMQ connection configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RabbitMqConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub vhost: String,
    /// 完整的AMQP URL，设置后忽略上面的分项配置
    pub url: Option<String>,
    pub connection_timeout_seconds: u64,
}

impl Default for RabbitMqConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5672,
            username: "guest".to_string(),
            password: "guest".to_string(),
            vhost: "/".to_string(),
            url: None,
            connection_timeout_seconds: 30,
        }
    }
}

impl RabbitMqConfig {
    /// Validate RabbitMQ configuration
    pub fn validate(&self) -> CuniculusResult<()> {
        if let Some(url) = &self.url {
            if !url.starts_with("amqp://") && !url.starts_with("amqps://") {
                return Err(CuniculusError::config_error("RabbitMQ URL必须是AMQP格式"));
            }
            return Ok(());
        }

        if self.host.trim().is_empty() {
            return Err(CuniculusError::config_error("RabbitMQ主机地址不能为空"));
        }

        if self.port == 0 {
            return Err(CuniculusError::config_error("RabbitMQ端口必须大于0"));
        }

        if self.connection_timeout_seconds == 0 {
            return Err(CuniculusError::config_error("RabbitMQ连接超时时间必须大于0"));
        }

        Ok(())
    }

    /// Build AMQP connection URL
    pub fn build_url(&self) -> String {
        if let Some(url) = &self.url {
            return url.clone();
        }

        let vhost = if self.vhost == "/" {
            "%2f".to_string()
        } else {
            self.vhost.trim_start_matches('/').to_string()
        };
        format!(
            "amqp://{}:{}@{}:{}/{}",
            self.username, self.password, self.host, self.port, vhost
        )
    }

    /// 用于日志输出的地址，不包含凭据
    pub fn display_address(&self) -> String {
        match &self.url {
            Some(url) => match url.rsplit_once('@') {
                Some((_, address)) => address.to_string(),
                None => url.clone(),
            },
            None => format!("{}:{}{}", self.host, self.port, self.vhost),
        }
    }
}
