//! Bridges `nexus3_core::CancellationToken`'s callback-based API to a future
//! that can be raced with `tokio::select!`. The token itself only supports
//! "register a callback", so this registers one that fires a oneshot.

use nexus3_core::CancellationToken;
use tokio::sync::oneshot;

/// Resolves once `token` is cancelled. If the token is cancelled before
/// this is called, `on_cancel` fires the callback immediately and the
/// returned future resolves on its first poll.
pub async fn wait_cancelled(token: &CancellationToken) {
    let (tx, rx) = oneshot::channel::<()>();
    let tx = std::sync::Mutex::new(Some(tx));
    token.on_cancel(move || {
        if let Some(tx) = tx.lock().unwrap().take() {
            let _ = tx.send(());
        }
    });
    let _ = rx.await;
}
