//! Delivery キュー - 生産者は多数（プールスレッド、reaper、watchdog）、
//! 消費者は 1 つ（所有スレッド）
//!
//! プールスレッドはプレゼンテーション層のコードを呼ばない。`Delivery` を積む
//! だけで、所有スレッドが drain しながら `DeliveryHandler` に振り分けるので、
//! ハンドラはすべてそのスレッド上で動く。

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::app::runtime::Shared;
use crate::domain::{Delivery, TaskId};
use crate::ports::{DeliveryHandler, StallSink, dispatch_outcome};

/// Producer side. Cheap to clone.
pub struct DeliverySender<T> {
    tx: mpsc::UnboundedSender<Delivery<T>>,
}

impl<T> Clone for DeliverySender<T> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone() }
    }
}

impl<T> DeliverySender<T> {
    pub(crate) fn send(&self, delivery: Delivery<T>) {
        if self.tx.send(delivery).is_err() {
            // receiver dropped: nobody is left to tell
            tracing::debug!("delivery queue closed, message dropped");
        }
    }
}

impl<T: Send> StallSink for DeliverySender<T> {
    fn stalled(&self, task_id: &TaskId) {
        self.send(Delivery::Stalled {
            task_id: task_id.clone(),
        });
    }
}

pub(crate) fn channel<T>() -> (DeliverySender<T>, mpsc::UnboundedReceiver<Delivery<T>>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (DeliverySender { tx }, rx)
}

/// Consumer side, owned by the owning thread.
///
/// Not `Clone`: there is exactly one drain point. Taking a `Finished` message
/// off the queue acknowledges it, which lets the runner forget the task and
/// frees its id for reuse. That holds for every method below.
pub struct Deliveries<T> {
    rx: mpsc::UnboundedReceiver<Delivery<T>>,
    shared: Arc<Shared<T>>,
}

impl<T: Send + 'static> Deliveries<T> {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<Delivery<T>>, shared: Arc<Shared<T>>) -> Self {
        Self { rx, shared }
    }

    /// Reclaim the task and let observers (the coalescer) settle it, so
    /// `try_next`, `recv` and `drain` all leave the same state behind.
    fn acknowledge(&self, delivery: &Delivery<T>) {
        if let Delivery::Finished { task_id, outcome } = delivery {
            self.shared.reclaim(task_id);
            self.shared.notify_finished(task_id, outcome);
        }
    }

    /// Next message if one is queued. Never blocks.
    pub fn try_next(&mut self) -> Option<Delivery<T>> {
        let delivery = self.rx.try_recv().ok()?;
        self.acknowledge(&delivery);
        Some(delivery)
    }

    /// Wait for the next message (for tokio-driven owning loops).
    pub async fn recv(&mut self) -> Option<Delivery<T>> {
        let delivery = self.rx.recv().await?;
        self.acknowledge(&delivery);
        Some(delivery)
    }

    /// One owning-thread tick: route everything queued right now.
    /// Returns the number of messages handled.
    pub fn drain<H>(&mut self, handler: &mut H) -> usize
    where
        H: DeliveryHandler<T> + ?Sized,
    {
        let mut handled = 0;
        while let Some(delivery) = self.try_next() {
            route(handler, delivery);
            handled += 1;
        }
        handled
    }
}

/// Send one delivery to its handler method.
pub fn route<T, H>(handler: &mut H, delivery: Delivery<T>)
where
    H: DeliveryHandler<T> + ?Sized,
{
    match delivery {
        Delivery::Finished { task_id, outcome } => dispatch_outcome(handler, &task_id, outcome),
        Delivery::Stalled { task_id } => handler.on_stalled(&task_id),
    }
}
