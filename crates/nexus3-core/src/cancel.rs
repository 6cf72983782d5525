//! Cooperative cancellation: a single-shot latch with a callback list, reset
//! without discarding callbacks so one token can be reused across turns.
//!
//! `tokio_util::sync::CancellationToken` only gives a `cancelled()` future
//! and has no callback-registration or reset primitive, so this wraps a
//! small bit of shared state of our own rather than reaching for it.

use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};

type Callback = Box<dyn FnOnce() + Send + 'static>;

struct Inner {
    cancelled: bool,
    callbacks: Vec<Callback>,
}

/// Cheaply cloneable; all clones share the same latch and callback list.
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<Mutex<Inner>>,
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                cancelled: false,
                callbacks: Vec::new(),
            })),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.lock().unwrap().cancelled
    }

    /// Idempotent. First call flips the latch and invokes every registered
    /// callback; a callback that panics is caught so it cannot block
    /// cancellation of its peers.
    pub fn cancel(&self) {
        let callbacks = {
            let mut inner = self.inner.lock().unwrap();
            if inner.cancelled {
                return;
            }
            inner.cancelled = true;
            std::mem::take(&mut inner.callbacks)
        };

        for cb in callbacks {
            if let Err(panic) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(cb)) {
                tracing::debug!(?panic, "cancellation callback panicked, ignoring");
            }
        }
    }

    /// Registers `cb`. If the token is already cancelled, `cb` runs
    /// immediately instead of being stored.
    pub fn on_cancel(&self, cb: impl FnOnce() + Send + 'static) {
        let mut inner = self.inner.lock().unwrap();
        if inner.cancelled {
            drop(inner);
            cb();
        } else {
            inner.callbacks.push(Box::new(cb));
        }
    }

    /// Cooperative check point. Returns `Err(Error::Cancelled)` once
    /// cancelled, so call sites can propagate with `?`.
    pub fn raise_if_cancelled(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Clears the latch. Callbacks registered so far are kept, matching the
    /// Python original's behavior of reusing one token across turns.
    pub fn reset(&self) {
        self.inner.lock().unwrap().cancelled = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn cancel_is_idempotent_and_invokes_callbacks_once() {
        let token = CancellationToken::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let c = calls.clone();
        token.on_cancel(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        token.cancel();
        token.cancel();
        token.cancel();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(token.is_cancelled());
    }

    #[test]
    fn on_cancel_after_cancellation_fires_immediately() {
        let token = CancellationToken::new();
        token.cancel();

        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        token.on_cancel(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn reset_clears_latch_but_keeps_callbacks() {
        let token = CancellationToken::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        token.on_cancel(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        token.cancel();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        token.reset();
        assert!(!token.is_cancelled());

        token.cancel();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn raise_if_cancelled_reflects_state() {
        let token = CancellationToken::new();
        assert!(token.raise_if_cancelled().is_ok());
        token.cancel();
        assert!(token.raise_if_cancelled().is_err());
    }

    #[test]
    fn panicking_callback_does_not_block_peers() {
        let token = CancellationToken::new();
        let calls = Arc::new(AtomicUsize::new(0));

        token.on_cancel(|| panic!("misbehaving callback"));
        let c = calls.clone();
        token.on_cancel(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        token.cancel();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
