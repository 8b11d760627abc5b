//! Clock port - 時刻の抽象化
//!
//! 記録用のタイムスタンプ（AttemptRecord, IntegrationRecord など）はここから取ります。
//! timeout や backoff は tokio の時計を使うので、この trait とは関係ありません。

use chrono::{DateTime, Utc};

/// Clock は現在時刻を提供
///
/// テストでは FixedClock を使って決定的な値にします。
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FixedClock {
    time: DateTime<Utc>,
}

impl FixedClock {
    pub fn new(time: DateTime<Utc>) -> Self {
        Self { time }
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.time
    }
}
