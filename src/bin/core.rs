// src/bin/core.rs
use console::{
    alerts::{AudioCue, GridView, LogCue},
    config::Config,
    connection::ConnectionManager,
    events::EventRouter,
    init_tracing,
    subscription::ConnectionBinding,
};
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() {
    init_tracing();
    info!("🚀 Starting Operator Console Core");

    let config = Arc::new(Config::new());
    let router = Arc::new(EventRouter::new());
    let manager = Arc::new(ConnectionManager::new(config.clone(), router.clone()));
    let audio: Arc<dyn AudioCue> = Arc::new(LogCue);

    // 身份为空时 connect 整体跳过，等登录流程补上再重连
    let entity_id = std::env::var("CONSOLE_ENTITY_ID").unwrap_or_default();
    let _connection = ConnectionBinding::establish(manager.clone(), &entity_id, None);

    let grid = GridView::spawn(router, manager.clone(), audio);

    let mut state_rx = manager.watch_state();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = state_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                info!("🔌 [CONN] State: {:?}", *state_rx.borrow());
            }
        }
    }

    drop(grid);
    info!("👋 Console core stopped");
}
