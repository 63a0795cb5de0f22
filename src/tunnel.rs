use anyhow::{Context, Result};
use bytes::Bytes;
use futures_core::Stream;
use futures_sink::Sink;
use futures_util::{SinkExt, StreamExt};
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::codec::{BytesCodec, FramedWrite};
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use url::Url;

use crate::protocol::TunnelRequest;
use crate::tap::{BridgeStats, Direction, Tap};
use crate::transport::{self, RemoteReader, RemoteWriter, WsStream};

/// 切断時にクローズフレームの送信を待つ上限
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// トンネル1本分のブリッジ
///
/// ブローカー側の WebSocket (`remote`) とローカルサービスへの TCP (`local`) を
/// 双方向につなぐ。[`TunnelBridge::spawn`] で起動したら戻り値はなく、
/// セッション側に状態を報告することもない。
#[derive(Debug)]
pub struct TunnelBridge {
    address: Url,
    token: String,
    host: String,
    port: u16,
    room: String,
    stats: Arc<BridgeStats>,
}

impl TunnelBridge {
    /// リクエストを検証してブリッジを作成（まだ接続はしない）
    pub fn new(request: TunnelRequest) -> Result<Self> {
        let address = transport::parse_ws_url(&request.tunnel_address)
            .context("Invalid tunnel address")?;
        let room = room_name(&address);

        Ok(Self {
            address,
            token: request.tunnel_token,
            host: request.host,
            port: request.port,
            room,
            stats: Arc::new(BridgeStats::default()),
        })
    }

    /// ルーム名（ログの紐付けのみに使う）
    pub fn room(&self) -> &str {
        &self.room
    }

    /// 転送量カウンター
    pub fn stats(&self) -> Arc<BridgeStats> {
        self.stats.clone()
    }

    /// バックグラウンドでブリッジを実行
    pub fn spawn(self) {
        let span = info_span!("tunnel", room = %self.room);
        tokio::spawn(
            async move {
                if let Err(e) = self.run().await {
                    warn!("Failed to create the bridge: {:#}", e);
                }
            }
            .instrument(span),
        );
    }

    async fn run(self) -> Result<()> {
        info!(
            "Creating the bridge to {}:{} using tunnel {}",
            self.host, self.port, self.address
        );

        let request = transport::tunnel_request(&self.address, &self.token)?;
        let local_addr = format!("{}:{}", self.host, self.port);

        // 両方の接続は互いに依存しないので同時に開く
        let (remote, local) = tokio::try_join!(transport::connect(request), async {
            TcpStream::connect((self.host.as_str(), self.port))
                .await
                .with_context(|| format!("Failed to connect to local service at {}", local_addr))
        })?;

        debug!("Bridge established, starting bidirectional copy");
        bridge(remote, local, self.stats.clone()).await;

        info!(
            "Bridge closed ({} bytes received, {} bytes sent)",
            self.stats.received(),
            self.stats.sent()
        );
        Ok(())
    }
}

/// アドレスのパスからルーム名を取り出す
fn room_name(address: &Url) -> String {
    let path = address.path();
    path.strip_prefix('/').unwrap_or(path).to_string()
}

/// ブリッジの片側
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Leg {
    Remote,
    Local,
}

impl fmt::Display for Leg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Leg::Remote => write!(f, "remote"),
            Leg::Local => write!(f, "local"),
        }
    }
}

/// 転送経路が終わった理由
#[derive(Debug)]
enum RouteEnd {
    Closed(Leg),
    Failed(Leg, io::Error),
}

/// ブリッジごとに1つだけ持つ後始末のガード
///
/// どちらの経路が先に終わっても、発火するのは最初の1回だけ。
/// 発火するともう一方の経路もキャンセルされ、それぞれが持つ書き込み側を閉じる
#[derive(Debug)]
struct Teardown {
    fired: AtomicBool,
    cancel: CancellationToken,
}

impl Teardown {
    fn new() -> Self {
        Self {
            fired: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    /// 両側を閉じる。既に閉じていれば何もしないで `false` を返す
    fn fire(&self, end: &RouteEnd) -> bool {
        if self.fired.swap(true, Ordering::AcqRel) {
            return false;
        }

        match end {
            RouteEnd::Closed(leg) => info!("Close the pipe ({} closed)", leg),
            RouteEnd::Failed(leg, e) => warn!("Error on the pipe ({}): {}", leg, e),
        }
        self.cancel.cancel();
        true
    }

    fn is_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }
}

/// 接続済みの2本をつないで、どちらかが終わるまで転送する
async fn bridge(remote: WsStream, local: TcpStream, stats: Arc<BridgeStats>) {
    let (remote_tx, remote_rx) = remote.split::<Message>();
    let (local_rx, local_tx) = local.into_split();

    let inbound = Tap::new(RemoteReader::new(remote_rx), stats.clone(), Direction::Received);
    let outbound = Tap::new(ReaderStream::new(local_rx), stats, Direction::Sent);

    let teardown = Teardown::new();
    tokio::join!(
        route(
            inbound,
            FramedWrite::new(local_tx, BytesCodec::new()),
            (Leg::Remote, Leg::Local),
            &teardown,
        ),
        route(
            outbound,
            RemoteWriter::new(remote_tx),
            (Leg::Local, Leg::Remote),
            &teardown,
        ),
    );
}

/// 片方向の転送経路
///
/// `reader` の終端やエラー、`writer` のエラーで終わり、ガードを発火させる。
/// 最後に自分の `writer` を閉じる
async fn route<R, W>(mut reader: R, mut writer: W, (from, to): (Leg, Leg), teardown: &Teardown)
where
    R: Stream<Item = io::Result<Bytes>> + Unpin,
    W: Sink<Bytes, Error = io::Error> + Unpin,
{
    let forward = async {
        while let Some(chunk) = reader.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => return RouteEnd::Failed(from, e),
            };
            if let Err(e) = writer.send(chunk).await {
                return RouteEnd::Failed(to, e);
            }
        }
        RouteEnd::Closed(from)
    };

    tokio::select! {
        _ = teardown.cancel.cancelled() => {}
        end = forward => {
            teardown.fire(&end);
        }
    }

    if let Err(e) = timeout(CLOSE_TIMEOUT, writer.close()).await.unwrap_or(Ok(())) {
        debug!("Failed to close the {} side: {}", to, e);
    }
}
