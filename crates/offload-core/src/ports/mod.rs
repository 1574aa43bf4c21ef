//! Ports - ランタイムと外側の境界
//!
//! 各 trait は、テストで差し替えたいもの（時刻、ID 生成）か、別の層が持つもの
//! （プレゼンテーション、stall 通知）を隠す。

pub mod clock;
pub mod event_sink;
pub mod id_generator;

pub use self::clock::{Clock, ManualClock, SystemClock, elapsed_between};
pub use self::event_sink::{DeliveryHandler, NoopStallSink, StallSink, dispatch_outcome};
pub use self::id_generator::{IdGenerator, UlidGenerator};
