// コントロールチャネルのセッション
//
// ブローカーとの常時接続を1つのタスクで管理する。トランスポートの I/O は
// 接続ごとの別タスクで行い、そこからのイベントをチャネルで受け取って
// ControlSession::on_event で同期的に状態遷移させる。

use anyhow::{Context, Result};
use backoff::backoff::Backoff;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::config::AgentConfig;
use crate::protocol::{FatalReason, TunnelRequest, CLOSE_ABNORMAL};
use crate::reconnect::LinearBackoff;
use crate::transport;
use crate::tunnel::TunnelBridge;

const EVENT_CHANNEL_SIZE: usize = 32;
const OUTBOUND_CHANNEL_SIZE: usize = 8;
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// セッションの状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Connected,
    Disconnected,
    FatalStop,
}

/// トランスポートから届くイベント
#[derive(Debug)]
pub enum ControlEvent {
    Opened,
    Message(Vec<u8>),
    Closed(u16),
    Error(String),
}

/// 状態遷移の結果として実行すること
#[derive(Debug, PartialEq)]
pub enum Action {
    StartKeepalive,
    StopKeepalive,
    OpenTunnel(TunnelRequest),
    Reconnect(Duration),
    Stop(FatalReason),
}

/// セッションの終わり方
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionExit {
    /// シャットダウン要求
    Shutdown,
    /// 再接続してはいけない切断
    Fatal(FatalReason),
}

/// I/O タスクへの送信要求
#[derive(Debug)]
enum Outbound {
    Ping,
}

/// 接続中だけ動く定期 ping
///
/// drop すると止まる。セッションが持つのは常に高々1つ
#[derive(Debug)]
struct Keepalive {
    handle: JoinHandle<()>,
}

impl Keepalive {
    fn start(interval: Duration, outbound: mpsc::Sender<Outbound>) -> Self {
        let handle = tokio::spawn(async move {
            // 最初の ping は接続から1周期後
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            loop {
                ticker.tick().await;
                debug!("Sending ping");
                if outbound.send(Outbound::Ping).await.is_err() {
                    break;
                }
            }
        });
        Self { handle }
    }
}

impl Drop for Keepalive {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// ブローカーとのコントロールセッション
pub struct ControlSession {
    config: AgentConfig,
    state: SessionState,
    backoff: LinearBackoff,
    keepalive: Option<Keepalive>,
    outbound: Option<mpsc::Sender<Outbound>>,
}

impl ControlSession {
    pub fn new(config: AgentConfig) -> Self {
        let backoff = LinearBackoff::new(config.reconnect_step);
        Self {
            config,
            state: SessionState::Connecting,
            backoff,
            keepalive: None,
            outbound: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// 連続して失敗した再接続の回数
    pub fn reconnect_attempt(&self) -> u32 {
        self.backoff.attempt()
    }

    /// イベントを受けて状態を進め、実行すべきアクションを返す
    pub fn on_event(&mut self, event: ControlEvent) -> Vec<Action> {
        if self.state == SessionState::FatalStop {
            return Vec::new();
        }

        match event {
            ControlEvent::Opened => {
                info!("Connection is established");
                self.state = SessionState::Connected;
                self.backoff.reset();
                vec![Action::StartKeepalive]
            }
            ControlEvent::Message(payload) => match TunnelRequest::from_slice(&payload) {
                Ok(request) => vec![Action::OpenTunnel(request)],
                Err(e) => {
                    warn!("Unexpected control message: {:#}", e);
                    Vec::new()
                }
            },
            ControlEvent::Closed(code) => match FatalReason::from_close_code(code) {
                Some(reason) => {
                    error!("ERROR: {}", reason);
                    self.state = SessionState::FatalStop;
                    vec![Action::StopKeepalive, Action::Stop(reason)]
                }
                None => {
                    self.state = SessionState::Disconnected;
                    let delay = self
                        .backoff
                        .next_backoff()
                        .unwrap_or(self.config.reconnect_step);
                    info!(
                        "Connection closed with code {}. Waiting {} seconds to reconnect",
                        code,
                        delay.as_secs()
                    );
                    vec![Action::StopKeepalive, Action::Reconnect(delay)]
                }
            },
            ControlEvent::Error(e) => {
                // 続けて Closed が届くので、ここでは何もしない
                debug!("Control channel error: {}", e);
                Vec::new()
            }
        }
    }

    /// セッションを実行する
    ///
    /// 致命的な切断かシャットダウン要求があるまで再接続を繰り返す
    pub async fn run(mut self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<SessionExit> {
        let (events_tx, mut events_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
        self.connect(events_tx.clone());

        loop {
            let event = tokio::select! {
                event = events_rx.recv() => event.context("Control event channel closed")?,
                _ = shutdown_rx.recv() => {
                    info!("Agent shutdown requested");
                    return Ok(SessionExit::Shutdown);
                }
            };

            for action in self.on_event(event) {
                match action {
                    Action::StartKeepalive => {
                        if let Some(outbound) = &self.outbound {
                            self.keepalive = Some(Keepalive::start(
                                self.config.keepalive_interval,
                                outbound.clone(),
                            ));
                        }
                    }
                    Action::StopKeepalive => {
                        self.keepalive = None;
                    }
                    Action::OpenTunnel(request) => open_tunnel(request),
                    Action::Reconnect(delay) => {
                        tokio::select! {
                            _ = sleep(delay) => {}
                            _ = shutdown_rx.recv() => {
                                info!("Agent shutdown requested");
                                return Ok(SessionExit::Shutdown);
                            }
                        }
                        self.connect(events_tx.clone());
                    }
                    Action::Stop(reason) => return Ok(SessionExit::Fatal(reason)),
                }
            }
        }
    }

    /// 新しい接続を開始（前の接続の送信口は置き換える）
    fn connect(&mut self, events: mpsc::Sender<ControlEvent>) {
        info!("Connecting to bridge server");
        self.state = SessionState::Connecting;
        self.keepalive = None;

        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CHANNEL_SIZE);
        self.outbound = Some(outbound_tx);

        let request = transport::control_request(
            &self.config.endpoint,
            &self.config.agent_id,
            &self.config.agent_secret,
        );
        tokio::spawn(control_connection(request, events, outbound_rx));
    }
}

/// トンネルリクエストからブリッジを起動（結果は待たない）
fn open_tunnel(request: TunnelRequest) {
    match TunnelBridge::new(request) {
        Ok(bridge) => bridge.spawn(),
        Err(e) => warn!("Failed to create the bridge: {:#}", e),
    }
}

/// 1回分の接続の I/O タスク
///
/// 接続に失敗した場合も含めて、最後に必ず `Closed` を1回だけ送る
async fn control_connection(
    request: Result<Request>,
    events: mpsc::Sender<ControlEvent>,
    mut outbound: mpsc::Receiver<Outbound>,
) {
    let code = match request {
        Ok(request) => drive_connection(request, &events, &mut outbound).await,
        Err(e) => {
            let _ = events.send(ControlEvent::Error(format!("{:#}", e))).await;
            CLOSE_ABNORMAL
        }
    };
    let _ = events.send(ControlEvent::Closed(code)).await;
}

/// 接続してから切断されるまで。クローズコードを返す
async fn drive_connection(
    request: Request,
    events: &mpsc::Sender<ControlEvent>,
    outbound: &mut mpsc::Receiver<Outbound>,
) -> u16 {
    let ws = match transport::connect(request).await {
        Ok(ws) => ws,
        Err(e) => {
            let _ = events.send(ControlEvent::Error(format!("{:#}", e))).await;
            return CLOSE_ABNORMAL;
        }
    };

    if events.send(ControlEvent::Opened).await.is_err() {
        return CLOSE_ABNORMAL;
    }

    let (mut sink, mut stream) = ws.split();
    let mut close_code = None;

    loop {
        tokio::select! {
            msg = stream.next() => {
                let event = match msg {
                    Some(Ok(Message::Text(text))) => ControlEvent::Message(text.into_bytes()),
                    Some(Ok(Message::Binary(data))) => ControlEvent::Message(data),
                    Some(Ok(Message::Close(frame))) => {
                        // 返信のクローズフレームを送ってから終わる
                        close_code = Some(transport::close_code(frame.as_ref()));
                        let _ = timeout(CLOSE_TIMEOUT, sink.close()).await;
                        break;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        let _ = events.send(ControlEvent::Error(e.to_string())).await;
                        break;
                    }
                    None => break,
                };
                if events.send(event).await.is_err() {
                    break;
                }
            }
            cmd = outbound.recv() => match cmd {
                Some(Outbound::Ping) => {
                    if let Err(e) = sink.send(Message::Ping(Vec::new())).await {
                        let _ = events.send(ControlEvent::Error(e.to_string())).await;
                        break;
                    }
                }
                None => {
                    // セッション側が手放した
                    let _ = sink.close().await;
                    break;
                }
            }
        }
    }

    close_code.unwrap_or(CLOSE_ABNORMAL)
}
