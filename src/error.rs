// src/error.rs
use thiserror::Error;

// 对外暴露的错误类型。连接任务内部用 anyhow，跨 API 边界时收敛到这里
#[derive(Debug, Error)]
pub enum ConsoleError {
    #[error("Reqwest error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("Failed to parse URL: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("Payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Not connected: {0}")]
    NotConnected(String),

    #[error("Connection command channel closed")]
    ChannelClosed,
}
