use backoff::backoff::Backoff;
use std::time::Duration;

/// 線形バックオフ
///
/// n 回目の再接続は `step * n` だけ待つ。上限はない。
/// 長時間の障害後は待ち時間が数時間に達しうる点に注意
#[derive(Debug, Clone)]
pub struct LinearBackoff {
    step: Duration,
    attempt: u32,
}

impl LinearBackoff {
    pub fn new(step: Duration) -> Self {
        Self { step, attempt: 0 }
    }

    /// 現在の試行回数
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

impl Backoff for LinearBackoff {
    fn reset(&mut self) {
        self.attempt = 0;
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        self.attempt = self.attempt.saturating_add(1);
        Some(self.step.saturating_mul(self.attempt))
    }
}
