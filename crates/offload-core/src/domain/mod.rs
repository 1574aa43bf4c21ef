//! Domain モデル（ID、状態、レコード、Outcome、Delivery、エラー）

pub mod delivery;
pub mod errors;
pub mod ids;
pub mod outcome;
pub mod state;
pub mod task;

pub use delivery::Delivery;
pub use errors::{BoxError, SharedError, TaskError};
pub(crate) use errors::panic_message;
pub use ids::TaskId;
pub use outcome::{Outcome, OutcomeKind};
pub use state::TaskStatus;
pub use task::TaskRecord;
