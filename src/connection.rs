// src/connection.rs
use super::{
    config::Config,
    error::ConsoleError,
    events::{EventKind, EventRouter},
    types::{AttendCommand, JoinRoomCommand, WireEnvelope},
};
use anyhow::{Context, Result};
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::{
    net::TcpStream,
    sync::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        oneshot, watch,
    },
    task::JoinHandle,
    time::{interval, sleep, timeout, Duration},
};
use tokio_native_tls::TlsConnector as TokioTlsConnector;
use tokio_retry::strategy::ExponentialBackoff;
use tokio_tungstenite::{
    client_async_with_config,
    tungstenite::{client::IntoClientRequest, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, warn};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWrite = SplitSink<WsStream, Message>;

const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

// ==============================================================================
// 1. 连接状态
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Disconnected,
    Connecting,
    Connected,
    /// 重连次数耗尽后的终态，只有显式的新 connect 调用能离开这里
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionState {
    pub phase: ConnectionPhase,
    pub reconnect_attempts: u32,
    pub max_reconnect_attempts: u32,
}

impl ConnectionState {
    fn new(phase: ConnectionPhase, attempts: u32, max: u32) -> Self {
        Self {
            phase,
            reconnect_attempts: attempts,
            max_reconnect_attempts: max,
        }
    }
}

/// attend-alert 指令的最终结局
#[derive(Debug)]
pub enum AckOutcome {
    Acknowledged(serde_json::Value),
    Rejected(serde_json::Value),
    /// ack/error 都没等到。乐观移除的本地状态保持不变
    TimedOut,
}

enum CtrlMsg {
    JoinRoom(String),
    Command {
        event: String,
        data: serde_json::Value,
        ack: oneshot::Sender<AckOutcome>,
    },
    Shutdown,
}

enum ServeExit {
    Shutdown,
    StreamClosed,
}

struct Session {
    ctrl_tx: UnboundedSender<CtrlMsg>,
    task: JoinHandle<()>,
}

// ==============================================================================
// 2. 管理器：单条流式连接的生命周期
// ==============================================================================

/// 由组合根构造一次、按引用传给各消费方。不做进程级单例，
/// 测试里可以并存多个互不干扰的实例
pub struct ConnectionManager {
    config: Arc<Config>,
    router: Arc<EventRouter>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    inner: StdMutex<Option<Session>>,
    /// 断线期间请求的房间，下一次 connect 时一并加入
    pending_rooms: StdMutex<HashSet<String>>,
}

impl ConnectionManager {
    pub fn new(config: Arc<Config>, router: Arc<EventRouter>) -> Self {
        let initial = ConnectionState::new(
            ConnectionPhase::Disconnected,
            0,
            config.max_reconnect_attempts,
        );
        let (state_tx, _) = watch::channel(initial);
        Self {
            config,
            router,
            state_tx: Arc::new(state_tx),
            inner: StdMutex::new(None),
            pending_rooms: StdMutex::new(HashSet::new()),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// 建立连接并进入身份房间；`scope` 给出时额外进入该报警的房间。
    /// 空白 identity 表示"还没就绪"，静默跳过。已在连接中/已连接时是 no-op
    pub fn connect(&self, identity: &str, scope: Option<&str>) {
        if identity.trim().is_empty() {
            debug!("[CONN] Blank identity. Skipping connect.");
            return;
        }

        let mut inner = self.inner.lock().expect("connection lock poisoned");
        if let Some(session) = inner.as_ref() {
            if !session.task.is_finished() {
                debug!("[CONN] Already connecting/connected. Ignoring.");
                return;
            }
        }

        let mut rooms = HashSet::new();
        rooms.insert(format!("entity:{}", identity));
        if let Some(alert_id) = scope {
            rooms.insert(format!("alert:{}", alert_id));
        }
        rooms.extend(
            self.pending_rooms
                .lock()
                .expect("pending rooms lock poisoned")
                .drain(),
        );

        let max = self.config.max_reconnect_attempts;
        self.state_tx
            .send_replace(ConnectionState::new(ConnectionPhase::Connecting, 0, max));

        let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_session(
            self.config.clone(),
            self.router.clone(),
            self.state_tx.clone(),
            ctrl_rx,
            rooms,
        ));
        *inner = Some(Session { ctrl_tx, task });
    }

    /// 撤掉所有传输层监听并关闭连接；重复调用是 no-op
    pub fn disconnect(&self) {
        let mut inner = self.inner.lock().expect("connection lock poisoned");
        if let Some(session) = inner.take() {
            let _ = session.ctrl_tx.send(CtrlMsg::Shutdown);
            session.task.abort();
            info!("🔌 [CONN] Disconnected.");
        }
        let max = self.config.max_reconnect_attempts;
        self.state_tx
            .send_replace(ConnectionState::new(ConnectionPhase::Disconnected, 0, max));
    }

    /// 追踪一条新报警时进入它的房间。断线重连后会自动补发；
    /// 完全没有会话时先记下来，下一次 connect 再加入
    pub fn join_alert_room(&self, alert_id: &str) {
        let room = format!("alert:{}", alert_id);
        let inner = self.inner.lock().expect("connection lock poisoned");
        match inner.as_ref() {
            Some(session) if !session.task.is_finished() => {
                let _ = session.ctrl_tx.send(CtrlMsg::JoinRoom(room));
            }
            _ => {
                info!("⏳ [ROOM] Not connected. Queuing {} for next connect.", room);
                self.pending_rooms
                    .lock()
                    .expect("pending rooms lock poisoned")
                    .insert(room);
            }
        }
    }

    /// 发出一条操作指令并等待对应的 ack/error，先到者为准。
    /// 等满 `ack_timeout` 都没回音则以 TimedOut 收场
    pub async fn send_command(
        &self,
        event: &str,
        data: serde_json::Value,
    ) -> Result<AckOutcome, ConsoleError> {
        if self.state().phase != ConnectionPhase::Connected {
            error!("❌ [CMD] '{}' refused: not connected.", event);
            return Err(ConsoleError::NotConnected(event.to_string()));
        }

        let (ack_tx, ack_rx) = oneshot::channel();
        {
            let inner = self.inner.lock().expect("connection lock poisoned");
            let session = inner
                .as_ref()
                .filter(|s| !s.task.is_finished())
                .ok_or_else(|| ConsoleError::NotConnected(event.to_string()))?;
            session
                .ctrl_tx
                .send(CtrlMsg::Command {
                    event: event.to_string(),
                    data,
                    ack: ack_tx,
                })
                .map_err(|_| ConsoleError::ChannelClosed)?;
        }

        match timeout(self.config.ack_timeout, ack_rx).await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(_)) => Err(ConsoleError::ChannelClosed),
            Err(_) => {
                warn!("⏰ [CMD] '{}' got no ack within {:?}.", event, self.config.ack_timeout);
                Ok(AckOutcome::TimedOut)
            }
        }
    }

    pub async fn attend_alert(
        &self,
        alert_id: &str,
        user_id: &str,
        recipient_id: &str,
    ) -> Result<AckOutcome, ConsoleError> {
        let command = AttendCommand {
            alert_id: alert_id.to_string(),
            user_id: user_id.to_string(),
            recipient_id: recipient_id.to_string(),
        };
        self.send_command("attend-alert", serde_json::to_value(command)?)
            .await
    }
}

// ==============================================================================
// 3. 会话任务：连接 + 有界重连
// ==============================================================================

/// 递增退避：起始档位来自配置，乘 10 递增，封顶 30s
fn backoff_strategy(config: &Config) -> ExponentialBackoff {
    let factor = (config.reconnect_base_delay.as_millis() as u64 / 10).max(1);
    ExponentialBackoff::from_millis(10)
        .factor(factor)
        .max_delay(MAX_RECONNECT_DELAY)
}

async fn run_session(
    config: Arc<Config>,
    router: Arc<EventRouter>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    mut ctrl_rx: UnboundedReceiver<CtrlMsg>,
    mut rooms: HashSet<String>,
) {
    let max = config.max_reconnect_attempts;
    let mut attempts: u32 = 0;
    let mut backoff = backoff_strategy(&config);

    loop {
        let result = connect_and_serve(
            &config,
            &router,
            &state_tx,
            &mut ctrl_rx,
            &mut rooms,
            &mut attempts,
        )
        .await;

        // 本轮握手成功过 (attempts 已清零)，退避计划从头来
        if attempts == 0 {
            backoff = backoff_strategy(&config);
        }

        match result {
            Ok(ServeExit::Shutdown) => {
                state_tx.send_replace(ConnectionState::new(ConnectionPhase::Disconnected, 0, max));
                info!("👋 [CONN] Session shut down gracefully.");
                return;
            }
            Ok(ServeExit::StreamClosed) => {
                warn!("🔁 [CONN] Stream closed by server. Reconnecting...");
            }
            Err(e) => error!("💥 [CONN] Connection crash: {:#}", e),
        }

        attempts += 1;
        if attempts >= max {
            error!("🔥 [CONN] Exceeded {} reconnect attempts. Giving up.", max);
            state_tx.send_replace(ConnectionState::new(ConnectionPhase::Failed, attempts, max));
            return;
        }

        let delay = backoff.next().unwrap_or(MAX_RECONNECT_DELAY);
        state_tx.send_replace(ConnectionState::new(ConnectionPhase::Connecting, attempts, max));
        warn!("🔁 [CONN] Retry {}/{} in {:?}...", attempts, max, delay);
        sleep(delay).await;
    }
}

async fn connect_and_serve(
    config: &Config,
    router: &EventRouter,
    state_tx: &watch::Sender<ConnectionState>,
    ctrl_rx: &mut UnboundedReceiver<CtrlMsg>,
    rooms: &mut HashSet<String>,
    attempts: &mut u32,
) -> Result<ServeExit> {
    let url = Url::parse(&config.stream_url)?;
    let stream = open_stream(&url).await?;

    let mut request = config.stream_url.as_str().into_client_request()?;
    request
        .headers_mut()
        .insert("User-Agent", "Rust/Console Operator".parse()?);

    let (ws_stream, response) = client_async_with_config(request, stream, None)
        .await
        .context("WebSocket handshake failed")?;

    info!("✅ [CONN] Connected! Status: {}", response.status());
    *attempts = 0;
    state_tx.send_replace(ConnectionState::new(
        ConnectionPhase::Connected,
        0,
        config.max_reconnect_attempts,
    ));

    let (mut write, mut read) = ws_stream.split();

    // 入房只在握手完成后发出。握手前到达的 JoinRoom 指令停在 ctrl 通道里，
    // 进入下面的事件循环后才会被消费，不会发给服务端尚未建立的会话。
    // 重连成功后这里也负责补发全部房间
    for room in rooms.iter() {
        info!("📥 [ROOM] Joining {}", room);
        send_event(&mut write, "join-room", join_room_data(room)?).await?;
    }

    let mut pending_acks: VecDeque<oneshot::Sender<AckOutcome>> = VecDeque::new();
    let mut heartbeat = interval(config.heartbeat_interval);
    heartbeat.tick().await;

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                write.send(Message::Ping(vec![].into())).await?;
            }

            cmd = ctrl_rx.recv() => {
                match cmd {
                    Some(CtrlMsg::JoinRoom(room)) => {
                        if rooms.insert(room.clone()) {
                            info!("📥 [ROOM] Joining {}", room);
                            send_event(&mut write, "join-room", join_room_data(&room)?).await?;
                        }
                    }
                    Some(CtrlMsg::Command { event, data, ack }) => {
                        info!("📤 [CMD] Emitting '{}'", event);
                        send_event(&mut write, &event, data).await?;
                        // ack 按 FIFO 对应：服务端对指令逐条应答
                        pending_acks.push_back(ack);
                    }
                    Some(CtrlMsg::Shutdown) | None => return Ok(ServeExit::Shutdown),
                }
            }

            msg_result = read.next() => {
                match msg_result {
                    Some(Ok(msg)) => match msg {
                        Message::Text(text) => handle_frame(&text, router, &mut pending_acks),
                        Message::Ping(p) => { write.send(Message::Pong(p)).await?; }
                        Message::Close(_) => return Ok(ServeExit::StreamClosed),
                        _ => {}
                    },
                    Some(Err(e)) => return Err(e.into()),
                    None => return Ok(ServeExit::StreamClosed),
                }
            }
        }
    }
}

/// 线路帧 -> 规范事件。ack/error 在这里就地结算，其余种类交给路由器
fn handle_frame(
    text: &str,
    router: &EventRouter,
    pending_acks: &mut VecDeque<oneshot::Sender<AckOutcome>>,
) {
    let envelope: WireEnvelope = match serde_json::from_str(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!("❌ [WIRE] Unparseable frame: {}", e);
            return;
        }
    };

    let Some(kind) = EventKind::from_wire(&envelope.event) else {
        debug!("[WIRE] Ignoring unknown event '{}'", envelope.event);
        return;
    };

    match kind {
        EventKind::AttendAck => match pending_acks.pop_front() {
            Some(ack) => {
                let _ = ack.send(AckOutcome::Acknowledged(envelope.data));
            }
            None => warn!("⚠️ [CMD] Ack without pending command."),
        },
        EventKind::AttendError => match pending_acks.pop_front() {
            Some(ack) => {
                warn!("❌ [CMD] attend-alert rejected: {}", envelope.data);
                let _ = ack.send(AckOutcome::Rejected(envelope.data));
            }
            None => warn!("⚠️ [CMD] Error ack without pending command."),
        },
        _ => router.dispatch(kind, envelope.data),
    }
}

async fn send_event(write: &mut WsWrite, event: &str, data: serde_json::Value) -> Result<()> {
    let frame = serde_json::to_string(&WireEnvelope {
        event: event.to_string(),
        data,
    })?;
    write.send(Message::Text(frame.into())).await?;
    Ok(())
}

fn join_room_data(room: &str) -> Result<serde_json::Value> {
    Ok(serde_json::to_value(JoinRoomCommand {
        room: room.to_string(),
    })?)
}

/// 直连 TCP，`wss` 时套 TLS。只有持久流式传输这一种模式
async fn open_stream(url: &Url) -> Result<MaybeTlsStream<TcpStream>> {
    let host = url.host_str().context("Stream URL missing host")?.to_string();
    let port = url
        .port_or_known_default()
        .unwrap_or(if url.scheme() == "wss" { 443 } else { 80 });

    let tcp = TcpStream::connect(format!("{}:{}", host, port))
        .await
        .context("TCP connect failed")?;

    if url.scheme() == "wss" {
        let connector = native_tls::TlsConnector::builder().build()?;
        let connector = TokioTlsConnector::from(connector);
        let tls = connector
            .connect(&host, tcp)
            .await
            .context("TLS handshake failed")?;
        Ok(MaybeTlsStream::NativeTls(tls))
    } else {
        Ok(MaybeTlsStream::Plain(tcp))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::net::TcpListener;

    fn test_config(url: &str, max_attempts: u32) -> Arc<Config> {
        let mut config = Config::new();
        config.stream_url = url.to_string();
        config.max_reconnect_attempts = max_attempts;
        config.reconnect_base_delay = Duration::from_millis(2);
        config.ack_timeout = Duration::from_millis(100);
        Arc::new(config)
    }

    /// 本地 websocket 服务端：接受 `sessions` 轮连接，每轮收齐
    /// `rooms_per_session` 条入房帧后挂断，把房间名排序后送回测试
    fn spawn_room_collector(
        listener: TcpListener,
        sessions: usize,
        rooms_per_session: usize,
    ) -> mpsc::UnboundedReceiver<Vec<String>> {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            for _ in 0..sessions {
                let Ok((socket, _)) = listener.accept().await else { return };
                let Ok(mut ws) = tokio_tungstenite::accept_async(socket).await else {
                    return;
                };
                let mut rooms = Vec::new();
                while rooms.len() < rooms_per_session {
                    match ws.next().await {
                        Some(Ok(Message::Text(text))) => {
                            if let Ok(envelope) = serde_json::from_str::<WireEnvelope>(&text) {
                                if envelope.event == "join-room" {
                                    if let Some(room) =
                                        envelope.data.get("room").and_then(|r| r.as_str())
                                    {
                                        rooms.push(room.to_string());
                                    }
                                }
                            }
                        }
                        Some(Ok(_)) => {}
                        _ => break,
                    }
                }
                rooms.sort();
                if tx.send(rooms).is_err() {
                    return;
                }
                // 循环末尾丢弃 ws，迫使客户端走重连路径
            }
        });
        rx
    }

    #[tokio::test]
    async fn rooms_join_after_handshake_and_rejoin_on_reconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let mut joins = spawn_room_collector(listener, 2, 2);

        let manager = ConnectionManager::new(test_config(&url, 5), Arc::new(EventRouter::new()));
        manager.connect("e1", Some("a1"));

        let expected = vec!["alert:a1".to_string(), "entity:e1".to_string()];
        // 入房帧只在握手完成后的会话里出现
        let first = timeout(Duration::from_secs(5), joins.recv())
            .await
            .expect("first session never joined")
            .unwrap();
        assert_eq!(first, expected);

        // 服务端挂断后重连，两个房间都要补发
        let second = timeout(Duration::from_secs(5), joins.recv())
            .await
            .expect("reconnected session never rejoined")
            .unwrap();
        assert_eq!(second, expected);

        manager.disconnect();
    }

    #[test]
    fn reconnect_delays_escalate_to_the_cap() {
        let delays: Vec<_> = backoff_strategy(&Config::new()).take(4).collect();
        assert_eq!(delays[0], Duration::from_millis(250));
        assert!(delays[0] < delays[1] && delays[1] < delays[2]);
        assert!(delays[2] < MAX_RECONNECT_DELAY);
        assert_eq!(delays[3], MAX_RECONNECT_DELAY);
    }

    #[tokio::test]
    async fn backoff_restarts_after_each_successful_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let mut joins = spawn_room_collector(listener, 3, 1);

        // 首档 400ms、次档 4s：若成功连上后退避不重置，
        // 第二次重连会落在 4s 档，整体耗时远超下面的上限
        let mut config = Config::new();
        config.stream_url = url;
        config.max_reconnect_attempts = 10;
        config.reconnect_base_delay = Duration::from_millis(400);
        let manager = ConnectionManager::new(Arc::new(config), Arc::new(EventRouter::new()));

        let started = std::time::Instant::now();
        manager.connect("e1", None);
        for _ in 0..3 {
            timeout(Duration::from_secs(8), joins.recv())
                .await
                .expect("session never arrived")
                .expect("collector dropped");
        }
        assert!(started.elapsed() < Duration::from_millis(2500));

        manager.disconnect();
    }

    #[tokio::test]
    async fn alert_rooms_queued_while_disconnected_join_on_next_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let mut joins = spawn_room_collector(listener, 1, 2);

        let manager = ConnectionManager::new(test_config(&url, 5), Arc::new(EventRouter::new()));
        // 还没有会话，入房请求先排队
        manager.join_alert_room("a9");
        manager.connect("e1", None);

        let rooms = timeout(Duration::from_secs(5), joins.recv())
            .await
            .expect("session never joined")
            .unwrap();
        assert_eq!(rooms, vec!["alert:a9".to_string(), "entity:e1".to_string()]);

        manager.disconnect();
    }

    #[test]
    fn blank_identity_never_connects() {
        let config = test_config("ws://127.0.0.1:9", 3);
        let manager = ConnectionManager::new(config, Arc::new(EventRouter::new()));

        manager.connect("", None);
        manager.connect("   ", None);

        assert_eq!(manager.state().phase, ConnectionPhase::Disconnected);
    }

    #[tokio::test]
    async fn exhausted_reconnects_park_in_failed_state() {
        // 端口 9 上没有监听者，每次尝试都会立刻失败
        let config = test_config("ws://127.0.0.1:9", 2);
        let manager = ConnectionManager::new(config, Arc::new(EventRouter::new()));
        let mut state_rx = manager.watch_state();

        manager.connect("entity-1", Some("a1"));

        let failed = timeout(Duration::from_secs(5), async {
            loop {
                if state_rx.borrow().phase == ConnectionPhase::Failed {
                    return state_rx.borrow().clone();
                }
                if state_rx.changed().await.is_err() {
                    panic!("state channel closed before failure");
                }
            }
        })
        .await
        .expect("never reached Failed");

        assert_eq!(failed.reconnect_attempts, 2);

        // 终态：不再自动重试
        sleep(Duration::from_millis(50)).await;
        assert_eq!(manager.state().phase, ConnectionPhase::Failed);
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let config = test_config("ws://127.0.0.1:9", 2);
        let manager = ConnectionManager::new(config, Arc::new(EventRouter::new()));

        manager.connect("entity-1", None);
        manager.disconnect();
        manager.disconnect();

        assert_eq!(manager.state().phase, ConnectionPhase::Disconnected);
    }

    #[tokio::test]
    async fn commands_are_refused_while_disconnected() {
        let config = test_config("ws://127.0.0.1:9", 2);
        let manager = ConnectionManager::new(config, Arc::new(EventRouter::new()));

        let result = manager.attend_alert("a1", "u1", "r1").await;
        assert!(matches!(result, Err(ConsoleError::NotConnected(_))));
    }

    #[test]
    fn acks_resolve_pending_commands_in_order() {
        let router = EventRouter::new();
        let mut pending = VecDeque::new();
        let (tx1, mut rx1) = oneshot::channel();
        let (tx2, mut rx2) = oneshot::channel();
        pending.push_back(tx1);
        pending.push_back(tx2);

        let ack = json!({ "event": "attend-alert-ack", "data": { "alertId": "a1" } });
        handle_frame(&ack.to_string(), &router, &mut pending);
        let err = json!({ "event": "attend-alert-error", "data": { "reason": "taken" } });
        handle_frame(&err.to_string(), &router, &mut pending);

        assert!(matches!(rx1.try_recv(), Ok(AckOutcome::Acknowledged(_))));
        assert!(matches!(rx2.try_recv(), Ok(AckOutcome::Rejected(_))));
        assert!(pending.is_empty());
    }

    #[test]
    fn unknown_wire_events_are_dropped() {
        let router = EventRouter::new();
        let mut pending = VecDeque::new();
        let frame = json!({ "event": "typing-indicator", "data": {} });
        handle_frame(&frame.to_string(), &router, &mut pending);
        handle_frame("not json at all", &router, &mut pending);
        assert!(pending.is_empty());
    }
}
