//! braid-core
//!
//! Task orchestration and integration engine.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, task, state, mutation, outcome, decision, record）
//! - **classify**: 生テキスト → Task（タグ・スコア・依存関係の推定）
//! - **priority**: priority の計算と全順序
//! - **routing**: Capability Registry と Router
//! - **schedule**: TaskBoard, Scheduler（dispatch, timeout, retry, cancel）
//! - **integrate**: conflict 解決と artifact への commit / rollback
//! - **ports**: 抽象化レイヤー（ArtifactStore, EventSink, Clock, IdGenerator）
//! - **impls**: 実装（InMemoryArtifactStore, event sinks）
//! - **engine**: 上記をつなぐ batch 単位の実行
//! - **report**: BatchReport / StatusReport
//! - **config**: `braid.toml`

pub mod classify;
pub mod config;
pub mod domain;
pub mod engine;
pub mod error;
pub mod impls;
pub mod integrate;
pub mod ports;
pub mod priority;
pub mod report;
pub mod routing;
pub mod schedule;

pub use classify::{Classifier, Intake, KnownTasks};
pub use config::EngineConfig;
pub use engine::{Engine, EngineParts};
pub use error::{BraidError, ReportedError};
pub use report::{BatchOutcome, BatchReport, StatusReport};
pub use schedule::{cancellation, CancelHandle, CancelSignal, Executor, Scheduler};
