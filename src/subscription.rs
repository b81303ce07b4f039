// src/subscription.rs
use super::{
    connection::ConnectionManager,
    events::{AlertEvent, EventKind, EventRouter, Scope, SubscriptionId},
};
use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

/// 一次注册对应一个守卫。守卫活着期间注册恰好存在一份，
/// Drop 时保证注销 (RAII)，换 (kind, scope) 就换一个新守卫
pub struct SubscriptionBinding {
    router: Arc<EventRouter>,
    kind: EventKind,
    scope: Scope,
    id: SubscriptionId,
}

impl SubscriptionBinding {
    /// 注册并返回专属接收通道
    pub fn bind(
        router: &Arc<EventRouter>,
        kind: EventKind,
        scope: Scope,
    ) -> (Self, UnboundedReceiver<AlertEvent>) {
        let (tx, rx) = unbounded_channel();
        (Self::bind_to(router, kind, scope, tx), rx)
    }

    /// 注册到调用方自备的通道上。多个种类可以共享同一条消费队列
    pub fn bind_to(
        router: &Arc<EventRouter>,
        kind: EventKind,
        scope: Scope,
        tx: UnboundedSender<AlertEvent>,
    ) -> Self {
        let id = router.register(kind, scope.clone(), tx);
        Self {
            router: router.clone(),
            kind,
            scope,
            id,
        }
    }
}

impl Drop for SubscriptionBinding {
    fn drop(&mut self) {
        self.router.deregister(self.kind, &self.scope, self.id);
    }
}

/// 连接的对称守卫：建立时 connect (空白身份整体跳过)，Drop 时必然 disconnect
pub struct ConnectionBinding {
    manager: Arc<ConnectionManager>,
}

impl ConnectionBinding {
    pub fn establish(manager: Arc<ConnectionManager>, identity: &str, scope: Option<&str>) -> Self {
        manager.connect(identity, scope);
        Self { manager }
    }
}

impl Drop for ConnectionBinding {
    fn drop(&mut self) {
        self.manager.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::connection::ConnectionPhase;
    use serde_json::json;

    #[test]
    fn dropping_a_binding_deregisters_it() {
        let router = Arc::new(EventRouter::new());
        let (binding, mut rx) = SubscriptionBinding::bind(
            &router,
            EventKind::AlertReceived,
            Scope::Global,
        );

        router.dispatch(EventKind::AlertReceived, json!({ "alertId": "a1" }));
        assert!(rx.try_recv().is_ok());

        drop(binding);
        router.dispatch(EventKind::AlertReceived, json!({ "alertId": "a2" }));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn shared_queue_receives_multiple_kinds() {
        let router = Arc::new(EventRouter::new());
        let (tx, mut rx) = unbounded_channel();
        let _b1 = SubscriptionBinding::bind_to(&router, EventKind::AlertReceived, Scope::Global, tx.clone());
        let _b2 = SubscriptionBinding::bind_to(&router, EventKind::AlertFinalized, Scope::Global, tx);

        router.dispatch(EventKind::AlertReceived, json!({ "alertId": "a1" }));
        router.dispatch(EventKind::AlertFinalized, json!({ "alertId": "a1" }));

        assert_eq!(rx.try_recv().unwrap().kind, EventKind::AlertReceived);
        assert_eq!(rx.try_recv().unwrap().kind, EventKind::AlertFinalized);
    }

    #[tokio::test]
    async fn connection_binding_skips_blank_identity_and_disconnects_on_drop() {
        let router = Arc::new(EventRouter::new());
        let manager = Arc::new(ConnectionManager::new(Arc::new(Config::new()), router));

        let binding = ConnectionBinding::establish(manager.clone(), "", None);
        assert_eq!(manager.state().phase, ConnectionPhase::Disconnected);

        drop(binding);
        assert_eq!(manager.state().phase, ConnectionPhase::Disconnected);
    }
}
