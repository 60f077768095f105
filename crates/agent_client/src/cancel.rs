use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

/// Why a turn was asked to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The user asked for cancellation.
    User,
    /// The runtime tripped its stall circuit breaker.
    Stalled,
}

impl CancelReason {
    fn as_u8(self) -> u8 {
        match self {
            Self::User => 1,
            Self::Stalled => 2,
        }
    }

    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::User),
            2 => Some(Self::Stalled),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct CancelState {
    requested: Arc<AtomicBool>,
    reason: AtomicU8,
    acknowledged: AtomicBool,
}

/// Cooperative cancellation token for one turn.
///
/// Clones share state. The first caller to [`CancelToken::acknowledge`] after
/// cancellation gets `true`; every later call gets `false`, which keeps the
/// "request cancelled" notice to a single emission per turn.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    state: Arc<CancelState>,
}

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation on behalf of the user.
    pub fn cancel(&self) {
        self.cancel_with(CancelReason::User);
    }

    /// Requests cancellation with an explicit reason. The first reason wins.
    pub fn cancel_with(&self, reason: CancelReason) {
        let _ = self.state.reason.compare_exchange(
            0,
            reason.as_u8(),
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        self.state.requested.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.state.requested.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn reason(&self) -> Option<CancelReason> {
        if !self.is_cancelled() {
            return None;
        }
        CancelReason::from_u8(self.state.reason.load(Ordering::SeqCst))
    }

    /// Returns true exactly once, on the first call after cancellation.
    pub fn acknowledge(&self) -> bool {
        self.is_cancelled() && !self.state.acknowledged.swap(true, Ordering::SeqCst)
    }

    /// Raw flag shared with transports that poll an `AtomicBool`.
    #[must_use]
    pub fn signal(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.state.requested)
    }
}
