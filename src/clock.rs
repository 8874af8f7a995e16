//! Abstracts "now" and "sleep until" so FSM tests can run against an
//! instantly-advancing fake clock instead of real wall time.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Stands in for the original's `osmo_timer_*`/`uloop_timeout` API:
/// every FSM state arms at most one timer.
pub trait Clock: Send + Sync + 'static {
    fn sleep(&self, dur: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>>;
}

/// Production clock: a thin wrapper over `tokio::time::sleep`.
#[derive(Clone, Copy, Default)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn sleep(&self, dur: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(tokio::time::sleep(dur))
    }
}

#[cfg(any(test, feature = "test-util"))]
pub mod fake {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// A clock whose `sleep` resolves immediately, recording how many
    /// times and for how long it was asked to wait. Used by FSM unit
    /// tests that need determinism instead of wall-clock timers.
    #[derive(Clone, Default)]
    pub struct FakeClock {
        calls: Arc<AtomicUsize>,
    }

    impl FakeClock {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Clock for FakeClock {
        fn sleep(&self, _dur: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async {})
        }
    }
}
