//! ペイロードと呼び出し側に渡す協調的キャンセルの部品

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::app::watchdog::Watchdog;
use crate::domain::{TaskError, TaskId};

/// CancelToken は共有のキャンセルフラグ
///
/// 投入されたタスクごとに 1 つ。ハンドル、ペイロードの context、runner の
/// テーブル、watchdog の登録簿がそれぞれ clone を持つので、stall、期限切れ、
/// 明示的な `cancel()` はどれも同じフラグを立てる。
///
/// # finished ビット
/// 終端遷移のときに runner のテーブルロック内で立つ。watchdog はこれを見て
/// 終わったタスクを飛ばす。
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<TokenState>,
}

#[derive(Debug, Default)]
struct TokenState {
    cancelled: AtomicBool,
    finished: AtomicBool,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// フラグを立てる。この呼び出しで立てたときだけ true
    pub fn cancel(&self) -> bool {
        !self.inner.cancelled.swap(true, Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    pub fn is_finished(&self) -> bool {
        self.inner.finished.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_finished(&self) {
        self.inner.finished.store(true, Ordering::SeqCst);
    }

    /// 同じタスク投入のトークンか
    pub fn same_as(&self, other: &CancelToken) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// TaskContext は実行中のペイロードから見える窓口
///
/// ペイロードは安全な地点（ループの各周回、I/O の境目）で `heartbeat()` と
/// `is_cancelled()` を呼ぶ。キャンセルは協調的で、フラグを見ないペイロードを
/// 止める手段はない。
pub struct TaskContext {
    id: TaskId,
    token: CancelToken,
    watchdog: Option<Arc<Watchdog>>,
}

impl TaskContext {
    pub(crate) fn new(id: TaskId, token: CancelToken, watchdog: Option<Arc<Watchdog>>) -> Self {
        Self { id, token, watchdog }
    }

    /// runner に属さない context。ペイロードを直接動かすとき用
    pub fn detached(id: impl Into<TaskId>) -> Self {
        Self::new(id.into(), CancelToken::new(), None)
    }

    pub fn id(&self) -> &TaskId {
        &self.id
    }

    /// watchdog に前進していることを知らせる
    pub fn heartbeat(&self) {
        if let Some(watchdog) = &self.watchdog {
            watchdog.heartbeat(&self.id);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// `Err(OperationCancelled)` once cancellation was requested, for `?`.
    pub fn checkpoint(&self) -> Result<(), TaskError> {
        if self.is_cancelled() {
            Err(TaskError::OperationCancelled)
        } else {
            Ok(())
        }
    }

    pub fn token(&self) -> &CancelToken {
        &self.token
    }
}
