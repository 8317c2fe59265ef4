use thiserror::Error;

/// 任务处理器返回的原始错误
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum CuniculusError {
    #[error("配置错误: {0}")]
    Configuration(String),
    #[error("RabbitMQ连接错误: {0}")]
    BrokerConnection(String),
    #[error("RabbitMQ通道操作错误: {0}")]
    Broker(String),
    #[error("队列 '{queue}' 声明失败，已存在的队列配置与请求的配置冲突: {message}")]
    QueueConflict { queue: String, message: String },
    #[error("任务消息格式错误: {0}")]
    BadlyFormattedPayload(String),
    #[error("未注册的任务类型: {0}")]
    UnknownJobClass(String),
    #[error("任务 {class} 执行失败: {message}")]
    Execution {
        class: String,
        message: String,
        #[source]
        source: Option<BoxError>,
    },
    #[error("序列化错误: {0}")]
    Serialization(String),
    #[error("调度器正在关闭，拒绝新任务")]
    ShuttingDown,
    #[error("内部错误: {0}")]
    Internal(String),
}

pub type CuniculusResult<T> = Result<T, CuniculusError>;

impl CuniculusError {
    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }
    pub fn connection_error<S: Into<String>>(msg: S) -> Self {
        Self::BrokerConnection(msg.into())
    }
    pub fn broker_error<S: Into<String>>(msg: S) -> Self {
        Self::Broker(msg.into())
    }
    pub fn queue_conflict<Q: Into<String>, S: Into<String>>(queue: Q, msg: S) -> Self {
        Self::QueueConflict {
            queue: queue.into(),
            message: msg.into(),
        }
    }
    pub fn badly_formatted<S: Into<String>>(msg: S) -> Self {
        Self::BadlyFormattedPayload(msg.into())
    }

    /// 将任务处理器的错误包装为执行错误，保留原始错误链
    pub fn execution<C: Into<String>>(class: C, err: anyhow::Error) -> Self {
        Self::Execution {
            class: class.into(),
            message: format!("{err:#}"),
            source: Some(err.into()),
        }
    }

    pub fn execution_message<C: Into<String>, S: Into<String>>(class: C, msg: S) -> Self {
        Self::Execution {
            class: class.into(),
            message: msg.into(),
            source: None,
        }
    }

    /// 发布侧可以通过重连恢复的错误
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            CuniculusError::BrokerConnection(_) | CuniculusError::Broker(_)
        )
    }

    /// 启动阶段遇到即中止，不做自动重试
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CuniculusError::Configuration(_) | CuniculusError::QueueConflict { .. }
        )
    }

    /// 走重试链的错误
    pub fn is_execution_error(&self) -> bool {
        matches!(
            self,
            CuniculusError::Execution { .. } | CuniculusError::UnknownJobClass(_)
        )
    }

    /// 错误种类名称，用于日志和错误上报
    pub fn kind(&self) -> &'static str {
        match self {
            CuniculusError::Configuration(_) => "ConfigError",
            CuniculusError::BrokerConnection(_) => "BrokerConnectionError",
            CuniculusError::Broker(_) => "BrokerError",
            CuniculusError::QueueConflict { .. } => "QueueConflict",
            CuniculusError::BadlyFormattedPayload(_) => "BadlyFormattedPayload",
            CuniculusError::UnknownJobClass(_) => "UnknownJobClass",
            CuniculusError::Execution { .. } => "ExecutionError",
            CuniculusError::Serialization(_) => "SerializationError",
            CuniculusError::ShuttingDown => "ShuttingDown",
            CuniculusError::Internal(_) => "InternalError",
        }
    }
}

impl From<serde_json::Error> for CuniculusError {
    fn from(err: serde_json::Error) -> Self {
        CuniculusError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for CuniculusError {
    fn from(err: anyhow::Error) -> Self {
        CuniculusError::Internal(format!("{err:#}"))
    }
}
