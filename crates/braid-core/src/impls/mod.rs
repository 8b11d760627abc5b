//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **InMemoryArtifactStore**: artifact の正本（CLI は JSON に永続化して使う）
//! - **TracingSink / ChannelSink / RecordingSink / NoopSink**: EventSink

pub mod event_sinks;
pub mod memory_store;

pub use self::event_sinks::{ChannelSink, NoopSink, RecordingSink, TracingSink};
pub use self::memory_store::{Artifact, ArtifactContent, InMemoryArtifactStore};
