// src/alerts.rs
use super::{
    config::Config,
    connection::{AckOutcome, ConnectionManager},
    error::ConsoleError,
    events::{AlertEvent, EventKind, EventRouter, Scope},
    geo,
    subscription::SubscriptionBinding,
    types::{
        Alert, AlertDetailResponse, AlertIdPayload, AlertReceivedPayload, LocationUpdatePayload,
        TrackedSnapshot, named_coords,
    },
};
use std::sync::Arc;
use tokio::{
    sync::{
        mpsc::{unbounded_channel, UnboundedSender},
        oneshot, watch,
    },
    task::JoinHandle,
    time::interval,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

// ==============================================================================
// 1. 音效侧路 (真实播放器由外部 UI 注入)
// ==============================================================================

pub trait AudioCue: Send + Sync {
    fn play(&self) -> anyhow::Result<()>;
    fn stop(&self) -> anyhow::Result<()>;
}

/// 默认实现：只打日志。播放失败永远不打断事件处理
pub struct LogCue;

impl AudioCue for LogCue {
    fn play(&self) -> anyhow::Result<()> {
        info!("🔔 [AUDIO] Cue started.");
        Ok(())
    }
    fn stop(&self) -> anyhow::Result<()> {
        info!("🔕 [AUDIO] Cue stopped.");
        Ok(())
    }
}

fn start_cue(audio: &dyn AudioCue) {
    if let Err(e) = audio.play() {
        warn!("🔇 [AUDIO] Playback failed: {:#}", e);
    }
}

fn stop_cue(audio: &dyn AudioCue) {
    if let Err(e) = audio.stop() {
        warn!("🔇 [AUDIO] Stop failed: {:#}", e);
    }
}

/// 非有限坐标直接丢弃，保留上一次的有效值
fn patch_coordinates(alert: &mut Alert, lat: f64, lng: f64) -> bool {
    if !lat.is_finite() || !lng.is_finite() {
        warn!(
            "⚠️ [ALERT {}] Dropping non-finite coordinates ({}, {}).",
            alert.alert_id, lat, lng
        );
        return false;
    }
    alert.lat = lat;
    alert.lng = lng;
    true
}

// ==============================================================================
// 2. 网格模式：多条活动报警
// ==============================================================================

/// 网格视图的状态机。到达顺序就是展示顺序，alertId 全集唯一
pub struct AlertBoard {
    alerts: Vec<Alert>,
    audio: Arc<dyn AudioCue>,
    operator_position: Option<(f64, f64)>,
}

impl AlertBoard {
    pub fn new(audio: Arc<dyn AudioCue>) -> Self {
        Self {
            alerts: Vec::new(),
            audio,
            operator_position: None,
        }
    }

    pub fn alerts(&self) -> &[Alert] {
        &self.alerts
    }

    pub fn set_operator_position(&mut self, lat: f64, lng: f64) {
        self.operator_position = Some((lat, lng));
    }

    pub fn apply(&mut self, event: &AlertEvent) {
        match event.kind {
            EventKind::AlertReceived => {
                match serde_json::from_value::<AlertReceivedPayload>(event.data.clone()) {
                    Ok(payload) => self.on_received(payload),
                    Err(e) => warn!("❌ [GRID] Payload mismatch for alert-received: {}", e),
                }
            }
            EventKind::AlertAttended | EventKind::AlertFinalized => {
                match serde_json::from_value::<AlertIdPayload>(event.data.clone()) {
                    Ok(payload) => self.on_closed(&payload.alert_id),
                    Err(e) => warn!("❌ [GRID] Payload mismatch for {}: {}", event.kind, e),
                }
            }
            EventKind::LocationUpdate => {
                match serde_json::from_value::<LocationUpdatePayload>(event.data.clone()) {
                    Ok(payload) => self.on_location(payload),
                    Err(e) => warn!("❌ [GRID] Payload mismatch for location-update: {}", e),
                }
            }
            _ => {}
        }
    }

    fn on_received(&mut self, payload: AlertReceivedPayload) {
        if self.alerts.iter().any(|a| a.alert_id == payload.alert_id) {
            debug!("[GRID] Duplicate alert {}. Ignoring.", payload.alert_id);
            return;
        }
        let alert = Alert::from_wire(payload);
        info!("🚨 [GRID] Alert received: {} ({})", alert.alert_id, alert.emitter_name);
        self.alerts.push(alert);
        start_cue(self.audio.as_ref());
    }

    fn on_closed(&mut self, alert_id: &str) {
        let before = self.alerts.len();
        self.alerts.retain(|a| a.alert_id != alert_id);
        if self.alerts.len() == before {
            // 本地已经乐观移除过，或者从未见过这条报警
            debug!("[GRID] Close for unknown alert {}. No-op.", alert_id);
            return;
        }
        info!("✅ [GRID] Alert {} closed. {} remaining.", alert_id, self.alerts.len());
        // 以事件处理时的集合大小为准判断是否静音
        if self.alerts.is_empty() {
            stop_cue(self.audio.as_ref());
        }
    }

    fn on_location(&mut self, payload: LocationUpdatePayload) {
        let (lat, lng) = named_coords(payload.coordinates);
        match self.alerts.iter_mut().find(|a| a.alert_id == payload.alert_id) {
            Some(alert) => {
                patch_coordinates(alert, lat, lng);
            }
            None => debug!("[GRID] Location for unknown alert {}. Dropping.", payload.alert_id),
        }
    }

    /// 操作员点击"出警"后的本地乐观处理。后续服务端对同一 id 的
    /// 移除事件会落进 on_closed 的 no-op 分支
    pub fn attend_locally(&mut self, alert_id: &str) {
        self.alerts.retain(|a| a.alert_id != alert_id);
        stop_cue(self.audio.as_ref());
    }

    /// 距操作员最近已知位置的展示文案
    pub fn distance_label(&self, alert: &Alert) -> Option<String> {
        let position = self.operator_position?;
        Some(geo::format_distance(geo::distance_km(
            position,
            (alert.lat, alert.lng),
        )))
    }
}

// ==============================================================================
// 3. 追踪模式：单条报警 + REST 轮询兜底
// ==============================================================================

/// 地图追踪视图的状态机：至多一个元素。推送和轮询写同一条记录，
/// 后到者覆盖，不做时间戳仲裁
pub struct AlertTracker {
    tracked_id: String,
    current: Option<Alert>,
    audio: Arc<dyn AudioCue>,
    active: bool,
}

impl AlertTracker {
    pub fn new(tracked_id: impl Into<String>, audio: Arc<dyn AudioCue>) -> Self {
        Self {
            tracked_id: tracked_id.into(),
            current: None,
            audio,
            active: true,
        }
    }

    pub fn current(&self) -> Option<&Alert> {
        self.current.as_ref()
    }

    /// 关闭后轮询定时器随之停掉
    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn apply(&mut self, event: &AlertEvent) {
        match event.kind {
            EventKind::LocationUpdate => {
                match serde_json::from_value::<LocationUpdatePayload>(event.data.clone()) {
                    Ok(payload) => {
                        if payload.alert_id != self.tracked_id {
                            debug!("[TRACK {}] Update for {} leaked in. Dropping.", self.tracked_id, payload.alert_id);
                            return;
                        }
                        let (lat, lng) = named_coords(payload.coordinates);
                        self.write_location(lat, lng);
                    }
                    Err(e) => warn!("❌ [TRACK {}] Payload mismatch: {}", self.tracked_id, e),
                }
            }
            EventKind::AlertAttended | EventKind::AlertFinalized => {
                match serde_json::from_value::<AlertIdPayload>(event.data.clone()) {
                    Ok(payload) if payload.alert_id == self.tracked_id => self.close(),
                    Ok(_) => {}
                    Err(e) => warn!("❌ [TRACK {}] Payload mismatch: {}", self.tracked_id, e),
                }
            }
            _ => {}
        }
    }

    /// 轮询结果：缺席则建档，在场则只补坐标
    pub fn apply_snapshot(&mut self, snapshot: TrackedSnapshot) {
        if !self.active {
            // 迟到的轮询响应，报警已经结束
            return;
        }
        match &mut self.current {
            Some(alert) => {
                patch_coordinates(alert, snapshot.lat, snapshot.lng);
            }
            None => {
                if !snapshot.lat.is_finite() || !snapshot.lng.is_finite() {
                    warn!("⚠️ [TRACK {}] Poll returned non-finite coordinates. Dropping.", self.tracked_id);
                    return;
                }
                self.current = Some(Alert {
                    id: Uuid::new_v4().to_string(),
                    alert_id: self.tracked_id.clone(),
                    lat: snapshot.lat,
                    lng: snapshot.lng,
                    emitter_name: snapshot.reporter_name,
                    emitter_phone: snapshot.reporter_phone,
                    emitter_id: snapshot.reporter_id,
                    reported_at: None,
                });
            }
        }
    }

    pub fn attend_locally(&mut self) {
        self.close();
    }

    fn write_location(&mut self, lat: f64, lng: f64) {
        match &mut self.current {
            Some(alert) => {
                patch_coordinates(alert, lat, lng);
            }
            None => {
                if !lat.is_finite() || !lng.is_finite() {
                    warn!("⚠️ [TRACK {}] Dropping non-finite coordinates.", self.tracked_id);
                    return;
                }
                // 推送先于首次轮询到达：先建一条骨架记录，举报人信息等轮询补齐
                self.current = Some(Alert {
                    id: Uuid::new_v4().to_string(),
                    alert_id: self.tracked_id.clone(),
                    lat,
                    lng,
                    emitter_name: String::new(),
                    emitter_phone: String::new(),
                    emitter_id: String::new(),
                    reported_at: None,
                });
            }
        }
    }

    fn close(&mut self) {
        if !self.active {
            return;
        }
        info!("🏁 [TRACK {}] Alert closed. Stopping poll.", self.tracked_id);
        self.active = false;
        self.current = None;
        stop_cue(self.audio.as_ref());
    }
}

// ==============================================================================
// 4. 异步封装：订阅 + 指令 + 轮询都汇入同一个单线程任务
// ==============================================================================

/// JoinHandle 的 RAII 包装。持有者 (或持有它的任务) 被销毁时定时器一并终止，
/// 不会有僵尸定时器往已销毁的状态里写数据
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

enum GridMsg {
    Attend {
        alert_id: String,
        user_id: String,
        recipient_id: String,
    },
    SetOperatorPosition {
        lat: f64,
        lng: f64,
    },
    Snapshot(oneshot::Sender<Vec<Alert>>),
}

/// 网格视图的运行时外壳：拥有状态的单任务 + 消息通道
pub struct GridView {
    msg_tx: UnboundedSender<GridMsg>,
    left_rx: watch::Receiver<bool>,
    _task: AbortOnDrop,
}

impl GridView {
    pub fn spawn(
        router: Arc<EventRouter>,
        manager: Arc<ConnectionManager>,
        audio: Arc<dyn AudioCue>,
    ) -> Self {
        let (msg_tx, mut msg_rx) = unbounded_channel();
        let (left_tx, left_rx) = watch::channel(false);
        let (ev_tx, mut ev_rx) = unbounded_channel();

        let bindings = vec![
            SubscriptionBinding::bind_to(&router, EventKind::AlertReceived, Scope::Global, ev_tx.clone()),
            SubscriptionBinding::bind_to(&router, EventKind::AlertAttended, Scope::Global, ev_tx.clone()),
            SubscriptionBinding::bind_to(&router, EventKind::AlertFinalized, Scope::Global, ev_tx.clone()),
            SubscriptionBinding::bind_to(&router, EventKind::LocationUpdate, Scope::Global, ev_tx),
        ];

        let task = tokio::spawn(async move {
            // 守卫随任务销毁，注销全部订阅
            let _bindings = bindings;
            let mut board = AlertBoard::new(audio);

            loop {
                tokio::select! {
                    ev = ev_rx.recv() => match ev {
                        Some(event) => board.apply(&event),
                        None => break,
                    },
                    msg = msg_rx.recv() => match msg {
                        Some(GridMsg::Attend { alert_id, user_id, recipient_id }) => {
                            board.attend_locally(&alert_id);
                            let _ = left_tx.send(true);
                            let manager = manager.clone();
                            tokio::spawn(async move {
                                report_attend_outcome(
                                    "GRID",
                                    &alert_id,
                                    manager.attend_alert(&alert_id, &user_id, &recipient_id).await,
                                );
                            });
                        }
                        Some(GridMsg::SetOperatorPosition { lat, lng }) => {
                            board.set_operator_position(lat, lng);
                        }
                        Some(GridMsg::Snapshot(tx)) => {
                            let _ = tx.send(board.alerts().to_vec());
                        }
                        None => break,
                    },
                }
            }
        });

        Self {
            msg_tx,
            left_rx,
            _task: AbortOnDrop(task),
        }
    }

    /// 出警：乐观移除 + 发指令 + 发出离开网格的导航信号
    pub fn attend(&self, alert_id: &str, user_id: &str, recipient_id: &str) {
        let _ = self.msg_tx.send(GridMsg::Attend {
            alert_id: alert_id.to_string(),
            user_id: user_id.to_string(),
            recipient_id: recipient_id.to_string(),
        });
    }

    pub fn set_operator_position(&self, lat: f64, lng: f64) {
        let _ = self.msg_tx.send(GridMsg::SetOperatorPosition { lat, lng });
    }

    pub async fn snapshot(&self) -> Vec<Alert> {
        let (tx, rx) = oneshot::channel();
        if self.msg_tx.send(GridMsg::Snapshot(tx)).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// 出警后翻 true，消费方据此离开网格画面
    pub fn navigation(&self) -> watch::Receiver<bool> {
        self.left_rx.clone()
    }
}

enum TrackerMsg {
    Poll(TrackedSnapshot),
    Attend {
        user_id: String,
        recipient_id: String,
    },
    Snapshot(oneshot::Sender<Option<Alert>>),
}

/// 追踪视图的运行时外壳：激活即入房并启动轮询，关停即全部释放
pub struct TrackerView {
    msg_tx: UnboundedSender<TrackerMsg>,
    _task: AbortOnDrop,
}

impl TrackerView {
    pub fn spawn(
        router: Arc<EventRouter>,
        manager: Arc<ConnectionManager>,
        config: Arc<Config>,
        audio: Arc<dyn AudioCue>,
        alert_id: impl Into<String>,
    ) -> Self {
        let alert_id = alert_id.into();
        let (msg_tx, mut msg_rx) = unbounded_channel();
        let (ev_tx, mut ev_rx) = unbounded_channel();

        manager.join_alert_room(&alert_id);

        let bindings = vec![
            SubscriptionBinding::bind_to(
                &router,
                EventKind::LocationUpdate,
                Scope::Alert(alert_id.clone()),
                ev_tx.clone(),
            ),
            SubscriptionBinding::bind_to(&router, EventKind::AlertAttended, Scope::Global, ev_tx.clone()),
            SubscriptionBinding::bind_to(&router, EventKind::AlertFinalized, Scope::Global, ev_tx),
        ];

        let poller = AbortOnDrop(tokio::spawn(poll_tracked(
            config,
            alert_id.clone(),
            msg_tx.clone(),
        )));

        let task = tokio::spawn(async move {
            let _bindings = bindings;
            // 轮询定时器与本任务同生共死
            let _poller = poller;
            let mut tracker = AlertTracker::new(alert_id.clone(), audio);

            loop {
                tokio::select! {
                    ev = ev_rx.recv() => match ev {
                        Some(event) => tracker.apply(&event),
                        None => break,
                    },
                    msg = msg_rx.recv() => match msg {
                        Some(TrackerMsg::Poll(snapshot)) => tracker.apply_snapshot(snapshot),
                        Some(TrackerMsg::Attend { user_id, recipient_id }) => {
                            tracker.attend_locally();
                            let manager = manager.clone();
                            let alert_id = alert_id.clone();
                            tokio::spawn(async move {
                                report_attend_outcome(
                                    "TRACK",
                                    &alert_id,
                                    manager.attend_alert(&alert_id, &user_id, &recipient_id).await,
                                );
                            });
                        }
                        Some(TrackerMsg::Snapshot(tx)) => {
                            let _ = tx.send(tracker.current().cloned());
                        }
                        None => break,
                    },
                }

                if !tracker.is_active() {
                    break;
                }
            }
        });

        Self {
            msg_tx,
            _task: AbortOnDrop(task),
        }
    }

    pub fn attend(&self, user_id: &str, recipient_id: &str) {
        let _ = self.msg_tx.send(TrackerMsg::Attend {
            user_id: user_id.to_string(),
            recipient_id: recipient_id.to_string(),
        });
    }

    pub async fn snapshot(&self) -> Option<Alert> {
        let (tx, rx) = oneshot::channel();
        if self.msg_tx.send(TrackerMsg::Snapshot(tx)).is_err() {
            return None;
        }
        rx.await.unwrap_or(None)
    }
}

fn report_attend_outcome(tag: &str, alert_id: &str, result: Result<AckOutcome, ConsoleError>) {
    match result {
        Ok(AckOutcome::Acknowledged(_)) => info!("✅ [{}] attend-alert confirmed for {}", tag, alert_id),
        Ok(AckOutcome::Rejected(data)) => warn!("❌ [{}] attend-alert rejected for {}: {}", tag, alert_id, data),
        Ok(AckOutcome::TimedOut) => warn!("⏰ [{}] attend-alert unconfirmed for {}. Local removal stands.", tag, alert_id),
        Err(e) => error!("❌ [{}] attend-alert failed for {}: {:#}", tag, alert_id, e),
    }
}

/// 轮询任务：激活立即取一次，之后固定间隔。接收端消失即退出
async fn poll_tracked(config: Arc<Config>, alert_id: String, tx: UnboundedSender<TrackerMsg>) {
    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(8))
        .connect_timeout(std::time::Duration::from_secs(5))
        .build()
        .unwrap_or_else(|_| reqwest::Client::new());

    let mut ticker = interval(config.poll_interval);
    loop {
        ticker.tick().await;
        match fetch_tracked(&client, &config.api_base_url, &alert_id).await {
            Ok(snapshot) => {
                if tx.send(TrackerMsg::Poll(snapshot)).is_err() {
                    return;
                }
            }
            // 失败只记日志，下一个周期照常再试
            Err(e) => warn!("⚠️ [TRACK {}] Poll failed: {:#}", alert_id, e),
        }
    }
}

async fn fetch_tracked(
    client: &reqwest::Client,
    base_url: &str,
    alert_id: &str,
) -> Result<TrackedSnapshot, ConsoleError> {
    let url = format!("{}/alerts/{}", base_url.trim_end_matches('/'), alert_id);
    let response = client.get(&url).send().await?.error_for_status()?;
    let body: AlertDetailResponse = response.json().await?;
    Ok(body.into())
}
