use bytes::Bytes;
use futures_core::Stream;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tracing::trace;

/// ブリッジの転送量（観測用のみ、フロー制御には使わない）
#[derive(Debug, Default)]
pub struct BridgeStats {
    /// リモート → ローカル
    received: AtomicU64,
    /// ローカル → リモート
    sent: AtomicU64,
}

impl BridgeStats {
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }
}

/// 転送方向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Received,
    Sent,
}

impl Direction {
    fn label(&self) -> &'static str {
        match self {
            Direction::Received => "received",
            Direction::Sent => "sent",
        }
    }
}

/// チャンクを数えるだけのストリームラッパー
///
/// 内側のストリームから出てきたチャンクをそのまま返す。バッファリングはしない
#[derive(Debug)]
pub struct Tap<S> {
    inner: S,
    stats: Arc<BridgeStats>,
    direction: Direction,
}

impl<S> Tap<S> {
    pub fn new(inner: S, stats: Arc<BridgeStats>, direction: Direction) -> Self {
        Self {
            inner,
            stats,
            direction,
        }
    }

    fn counter(&self) -> &AtomicU64 {
        match self.direction {
            Direction::Received => &self.stats.received,
            Direction::Sent => &self.stats.sent,
        }
    }
}

impl<S> Stream for Tap<S>
where
    S: Stream<Item = io::Result<Bytes>> + Unpin,
{
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let poll = Pin::new(&mut self.inner).poll_next(cx);
        if let Poll::Ready(Some(Ok(chunk))) = &poll {
            self.counter()
                .fetch_add(chunk.len() as u64, Ordering::Relaxed);
            trace!("{} bytes {}", chunk.len(), self.direction.label());
        }
        poll
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}
