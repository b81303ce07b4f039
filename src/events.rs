// src/events.rs
use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

// ==============================================================================
// 1. 规范事件种类 (与线路名称解耦)
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    AlertReceived,
    AlertCreated,
    AlertAttended,
    AlertFinalized,
    LocationUpdate,
    AttendAck,
    AttendError,
}

impl EventKind {
    /// 线路事件名 -> 规范种类，1:1 映射。订阅方永远不接触线路词汇
    pub fn from_wire(name: &str) -> Option<Self> {
        match name {
            "panicAlert" => Some(Self::AlertReceived),
            "alerta-creada" => Some(Self::AlertCreated),
            "alerta-atendida" => Some(Self::AlertAttended),
            "alerta-finalizada" => Some(Self::AlertFinalized),
            "location-update" => Some(Self::LocationUpdate),
            "attend-alert-ack" => Some(Self::AttendAck),
            "attend-alert-error" => Some(Self::AttendError),
            _ => None,
        }
    }

    /// location-update 按 alertId 分域派发，其余种类是平铺列表
    pub fn is_scoped(&self) -> bool {
        matches!(self, Self::LocationUpdate)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::AlertReceived => "alert-received",
            Self::AlertCreated => "alert-created",
            Self::AlertAttended => "alert-attended",
            Self::AlertFinalized => "alert-finalized",
            Self::LocationUpdate => "location-update",
            Self::AttendAck => "attend-alert-ack",
            Self::AttendError => "attend-alert-error",
        };
        write!(f, "{}", name)
    }
}

/// 订阅域：特定 alertId 或全局桶。分域事件派发时命中精确域 + 全局桶
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    Global,
    Alert(String),
}

#[derive(Debug, Clone)]
pub struct AlertEvent {
    pub kind: EventKind,
    pub data: serde_json::Value,
}

// ==============================================================================
// 2. 路由器
// ==============================================================================

pub type SubscriptionId = u64;

struct Subscriber {
    id: SubscriptionId,
    tx: UnboundedSender<AlertEvent>,
}

/// 进程内发布/订阅注册表。同一 (kind, scope) 下可叠加多个订阅者，
/// 去重由上层 Binding 负责，这里只做派发
pub struct EventRouter {
    routes: DashMap<(EventKind, Scope), Vec<Subscriber>>,
    next_id: AtomicU64,
}

impl EventRouter {
    pub fn new() -> Self {
        Self {
            routes: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// 叠加式注册，返回用于注销的 id
    pub fn register(
        &self,
        kind: EventKind,
        scope: Scope,
        tx: UnboundedSender<AlertEvent>,
    ) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.routes
            .entry((kind, scope))
            .or_default()
            .push(Subscriber { id, tx });
        id
    }

    /// 按 id 注销；目标不存在时静默 no-op
    pub fn deregister(&self, kind: EventKind, scope: &Scope, id: SubscriptionId) {
        let key = (kind, scope.clone());
        if let Some(mut bucket) = self.routes.get_mut(&key) {
            bucket.retain(|sub| sub.id != id);
        }
        self.routes.remove_if(&key, |_, bucket| bucket.is_empty());
    }

    /// 派发一条入站事件。分域种类从 payload 里取 alertId，
    /// 命中 `Alert(id)` 桶和 `Global` 桶；非分域种类只走 `Global` 桶。
    /// 单个订阅者失效 (通道关闭) 只影响它自己，同批其余订阅者照常送达
    pub fn dispatch(&self, kind: EventKind, data: serde_json::Value) {
        let scopes = if kind.is_scoped() {
            match data.get("alertId").and_then(|v| v.as_str()) {
                Some(alert_id) => vec![Scope::Alert(alert_id.to_string()), Scope::Global],
                None => {
                    warn!("⚠️ [ROUTER] Scoped event '{}' without alertId. Dropping.", kind);
                    return;
                }
            }
        } else {
            vec![Scope::Global]
        };

        for scope in scopes {
            let key = (kind, scope);
            if let Some(mut bucket) = self.routes.get_mut(&key) {
                bucket.retain(|sub| {
                    let event = AlertEvent {
                        kind,
                        data: data.clone(),
                    };
                    match sub.tx.send(event) {
                        Ok(_) => true,
                        Err(_) => {
                            // 接收端已销毁，剔除后继续派发给剩余订阅者
                            debug!("[ROUTER] Subscriber #{} for '{}' is gone. Pruning.", sub.id, kind);
                            false
                        }
                    }
                });
            }
        }
    }
}
