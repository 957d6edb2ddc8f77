use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// A single-shot timer owned by a room (e.g. a per-turn deadline).
///
/// The callback runs on the runtime after `delay` unless the timer is
/// canceled first. Cancel whenever the guarded condition becomes moot;
/// dropping the timer cancels it, so a removed room cannot fire stale
/// deadlines.
#[derive(Debug)]
pub struct CancelableTimer {
    token: CancellationToken,
}

impl CancelableTimer {
    /// Must be called from within a tokio runtime.
    pub fn schedule<F>(delay: Duration, callback: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let token = CancellationToken::new();
        let guard = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = guard.cancelled() => {}
                _ = tokio::time::sleep(delay) => callback(),
            }
        });
        Self { token }
    }

    /// Idempotent.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for CancelableTimer {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
