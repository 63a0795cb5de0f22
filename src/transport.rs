// WebSocket トランスポートの補助関数
//
// コントロールチャネルとトンネルチャネルの両方で使う。
// トンネル側はメッセージ単位の WebSocket をバイト列のストリーム/シンクとして扱えるように
// RemoteReader と RemoteWriter で包む。

use anyhow::{Context as _, Result};
use bytes::Bytes;
use futures_core::Stream;
use futures_sink::Sink;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::protocol::{AGENT_ID_HEADER, AGENT_SECRET_HEADER, CLOSE_ABNORMAL};

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// URLを解析して WebSocket のスキームに揃える
///
/// `http` は `ws`、`https` は `wss` として扱う。それ以外のスキームはエラー
pub fn parse_ws_url(raw: &str) -> Result<Url> {
    let mut url = Url::parse(raw).with_context(|| format!("Invalid URL: {}", raw))?;

    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => anyhow::bail!("Unsupported URL scheme '{}' in {}", other, raw),
    };

    if url.scheme() != scheme {
        url.set_scheme(scheme)
            .map_err(|_| anyhow::anyhow!("Failed to rewrite URL scheme of {}", raw))?;
    }

    Ok(url)
}

/// コントロールチャネルへの接続リクエスト
pub fn control_request(endpoint: &Url, agent_id: &str, agent_secret: &str) -> Result<Request> {
    let mut request = endpoint
        .as_str()
        .into_client_request()
        .with_context(|| format!("Failed to build request for {}", endpoint))?;

    let headers = request.headers_mut();
    headers.insert(
        AGENT_ID_HEADER,
        HeaderValue::from_str(agent_id).context("Agent id is not a valid header value")?,
    );
    headers.insert(
        AGENT_SECRET_HEADER,
        HeaderValue::from_str(agent_secret).context("Agent secret is not a valid header value")?,
    );

    Ok(request)
}

/// トンネルチャネルへの接続リクエスト
pub fn tunnel_request(address: &Url, token: &str) -> Result<Request> {
    let mut request = address
        .as_str()
        .into_client_request()
        .with_context(|| format!("Failed to build request for {}", address))?;

    request.headers_mut().insert(
        AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {}", token))
            .context("Tunnel token is not a valid header value")?,
    );

    Ok(request)
}

/// WebSocket で接続
pub async fn connect(request: Request) -> Result<WsStream> {
    let uri = request.uri().to_string();
    let (stream, _response) = tokio_tungstenite::connect_async(request)
        .await
        .with_context(|| format!("Failed to connect to {}", uri))?;
    Ok(stream)
}

/// クローズフレームからコードを取り出す。フレームがなければ異常切断扱い
pub fn close_code(frame: Option<&CloseFrame<'_>>) -> u16 {
    frame.map(|f| u16::from(f.code)).unwrap_or(CLOSE_ABNORMAL)
}

fn into_io_error(err: WsError) -> io::Error {
    io::Error::new(io::ErrorKind::Other, err)
}

/// WebSocket のメッセージをバイト列のストリームに変換
///
/// Binary/Text はそのままペイロードとして流す。Ping/Pong はプロトコル上の
/// やりとりなので読み飛ばす。Close を受けたらストリーム終端
#[derive(Debug)]
pub struct RemoteReader<S> {
    inner: S,
}

impl<S> RemoteReader<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }
}

impl<S> Stream for RemoteReader<S>
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            let item = ready!(Pin::new(&mut self.inner).poll_next(cx));
            return match item {
                None => Poll::Ready(None),
                Some(Err(e)) => Poll::Ready(Some(Err(into_io_error(e)))),
                Some(Ok(Message::Binary(data))) => Poll::Ready(Some(Ok(Bytes::from(data)))),
                Some(Ok(Message::Text(text))) => Poll::Ready(Some(Ok(Bytes::from(text)))),
                Some(Ok(Message::Close(_))) => Poll::Ready(None),
                Some(Ok(_)) => continue,
            };
        }
    }
}

/// バイト列を WebSocket の Binary メッセージとして送るシンク
#[derive(Debug)]
pub struct RemoteWriter<S> {
    inner: S,
}

impl<S> RemoteWriter<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }
}

impl<S> Sink<Bytes> for RemoteWriter<S>
where
    S: Sink<Message, Error = WsError> + Unpin,
{
    type Error = io::Error;

    fn poll_ready(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_ready(cx).map_err(into_io_error)
    }

    fn start_send(mut self: Pin<&mut Self>, item: Bytes) -> io::Result<()> {
        Pin::new(&mut self.inner)
            .start_send(Message::Binary(item.to_vec()))
            .map_err(into_io_error)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx).map_err(into_io_error)
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_close(cx).map_err(into_io_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{stream, SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

    #[test]
    fn test_parse_ws_url() {
        assert_eq!(
            parse_ws_url("https://bridge.example/").unwrap().as_str(),
            "wss://bridge.example/"
        );
        assert_eq!(
            parse_ws_url("http://localhost:8080/agent").unwrap().as_str(),
            "ws://localhost:8080/agent"
        );
        assert_eq!(
            parse_ws_url("wss://bridge.example/rooms/abc").unwrap().as_str(),
            "wss://bridge.example/rooms/abc"
        );
        assert!(parse_ws_url("ftp://bridge.example/").is_err());
        assert!(parse_ws_url("not a url").is_err());
    }

    #[test]
    fn test_control_request_headers() {
        let url = parse_ws_url("ws://127.0.0.1:1/").unwrap();
        let request = control_request(&url, "agent-1", "s3cret").unwrap();

        assert_eq!(request.headers()["x-agent-id"], "agent-1");
        assert_eq!(request.headers()["x-agent-secret"], "s3cret");
    }

    #[test]
    fn test_control_request_rejects_bad_header_value() {
        let url = parse_ws_url("ws://127.0.0.1:1/").unwrap();
        assert!(control_request(&url, "agent\n1", "s").is_err());
    }

    #[test]
    fn test_tunnel_request_headers() {
        let url = parse_ws_url("wss://bridge.example/rooms/abc").unwrap();
        let request = tunnel_request(&url, "T1").unwrap();

        assert_eq!(request.headers()["authorization"], "Bearer T1");
        assert_eq!(request.uri().path(), "/rooms/abc");
    }

    #[test]
    fn test_close_code() {
        let frame = CloseFrame {
            code: CloseCode::from(4001),
            reason: "".into(),
        };
        assert_eq!(close_code(Some(&frame)), 4001);
        assert_eq!(close_code(None), 1006);
    }

    #[tokio::test]
    async fn test_remote_reader_payload_only() {
        let messages: Vec<Result<Message, WsError>> = vec![
            Ok(Message::Ping(vec![1])),
            Ok(Message::Binary(b"abc".to_vec())),
            Ok(Message::Pong(vec![])),
            Ok(Message::Text("def".into())),
            Ok(Message::Close(None)),
            Ok(Message::Binary(b"ignored".to_vec())),
        ];
        let mut reader = RemoteReader::new(stream::iter(messages));

        assert_eq!(reader.next().await.unwrap().unwrap(), Bytes::from_static(b"abc"));
        assert_eq!(reader.next().await.unwrap().unwrap(), Bytes::from_static(b"def"));
        assert!(reader.next().await.is_none());
    }

    #[tokio::test]
    async fn test_remote_reader_error() {
        let messages: Vec<Result<Message, WsError>> = vec![Err(WsError::ConnectionClosed)];
        let mut reader = RemoteReader::new(stream::iter(messages));

        assert!(reader.next().await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_remote_writer_sends_binary() {
        let (tx, mut rx) = futures_channel::mpsc::unbounded::<Message>();
        let mut writer = RemoteWriter::new(tx.sink_map_err(|_| WsError::ConnectionClosed));

        writer.send(Bytes::from_static(b"hello")).await.unwrap();
        assert_eq!(rx.next().await, Some(Message::Binary(b"hello".to_vec())));
    }
}
