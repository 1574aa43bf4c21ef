//! offload-core
//!
//! 対話的なプロセスのためのバックグラウンド実行基盤。
//!
//! # 構成
//! - **domain**: ID、状態、タスクレコード、Outcome、Delivery、エラー
//! - **ports**: 時刻、ID 生成、DeliveryHandler、StallSink
//! - **app**: TaskRunner、Watchdog、Coalescer、Services の組み立て
//! - **cache**: `ResultCache`、キー合成、永続化
//! - **config**: `RuntimeConfig`
//! - **process**: ペイロードから子プロセスをキャンセル可能に実行
//!
//! 結果は所有スレッドが drain するキューを通して、タスクごとにちょうど 1 回届く。

pub mod app;
pub mod cache;
pub mod config;
pub mod domain;
pub mod ports;
pub mod process;

pub use app::{
    BuildError, CancelToken, Coalescer, Deliveries, Lookup, RunnerConfig, RunnerStats, Services, ServicesBuilder,
    SubmitError, SubmitOptions, TaskContext, TaskHandle, TaskRunner, Ticket, Watchdog,
};
pub use cache::{CacheError, CachePolicy, KeyPart, PersistenceError, ResultCache, make_key};
pub use config::{ConfigError, RuntimeConfig};
pub use domain::{BoxError, Delivery, Outcome, OutcomeKind, TaskError, TaskId, TaskStatus};
pub use ports::{Clock, DeliveryHandler, ManualClock, SystemClock};
pub use process::run_process;
