//! Ports - 抽象化レイヤー
//!
//! エンジンの外側（時刻、ID 採番、イベント通知、artifact の保存先）への
//! インターフェースです。実装は `impls` にあります。
//! executor の trait だけは scheduler と一緒に `schedule::executor` に置いています。

pub mod artifact_store;
pub mod clock;
pub mod event_sink;
pub mod id_generator;

pub use self::artifact_store::ArtifactStore;
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::event_sink::{EngineEvent, EventSink};
pub use self::id_generator::{IdGenerator, UlidGenerator};
