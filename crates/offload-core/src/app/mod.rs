//! App - domain と ports の上に組み立てるランタイム
//!
//! # コンポーネント
//! - **TaskRunner**: 固定サイズのプール、reaper スレッド、exactly-once 配送
//! - **Watchdog**: heartbeat の登録簿と stall 検出
//! - **Coalescer**: runner の手前で throttle / debounce
//! - **ServicesBuilder**: 上記とキャッシュを検証付きで配線

pub mod builder;
pub mod coalesce;
pub mod context;
pub mod delivery;
mod reaper_loop;
pub mod runtime;
pub mod status;
pub(crate) mod ticker;
pub mod watchdog;
mod worker_loop;

pub use self::builder::{BuildError, Lookup, Services, ServicesBuilder};
pub use self::coalesce::{Coalescer, CoalescerHandle, Ticket};
pub use self::context::{CancelToken, TaskContext};
pub use self::delivery::{Deliveries, DeliverySender, route};
pub use self::runtime::{
    Payload, RunnerConfig, RunnerError, ShutdownReport, SubmitError, SubmitOptions, TaskHandle, TaskRunner,
};
pub use self::status::RunnerStats;
pub use self::watchdog::{HeartbeatRecord, RegistrationId, Watchdog, WatchdogHandle};
