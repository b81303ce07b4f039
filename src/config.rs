// src/config.rs
use std::time::Duration;

#[derive(Clone)]
pub struct Config {
    pub stream_url: String,
    pub api_base_url: String,
    pub heartbeat_interval: Duration,
    /// 追踪模式 REST 轮询间隔
    pub poll_interval: Duration,
    pub max_reconnect_attempts: u32,
    /// 重连退避的起始延迟 (指数递增，封顶 30s)
    pub reconnect_base_delay: Duration,
    /// attend-alert 等待 ack/error 的上限
    pub ack_timeout: Duration,
}

impl Config {
    pub fn new() -> Self {
        Self {
            stream_url: "wss://dispatch.example.com/stream".to_string(),
            api_base_url: "https://dispatch.example.com/api".to_string(),
            heartbeat_interval: Duration::from_secs(20),
            poll_interval: Duration::from_secs(3),
            max_reconnect_attempts: 5,
            reconnect_base_delay: Duration::from_millis(250),
            ack_timeout: Duration::from_secs(10),
        }
    }
}
