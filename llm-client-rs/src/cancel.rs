// llm-client-rs/src/cancel.rs
// Cooperative cancellation over a watch channel. One signal, many observers:
// the queue, the worker and the in-flight HTTP call all watch the same token.

use tokio::sync::watch;

/// Sender half: owned by whoever may cancel the request.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    tx: watch::Sender<bool>,
}

/// Receiver half: cloned into every place that must observe cancellation.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

/// Creates a connected signal/token pair.
pub fn cancel_pair() -> (CancelSignal, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelSignal { tx }, CancelToken { rx })
}

impl CancelSignal {
    /// Fires the cancellation. Idempotent.
    pub fn cancel(&self) {
        // Receivers may already be gone; that just means nobody is waiting.
        let _ = self.tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the signal fires. Returns immediately if it already has.
    pub async fn cancelled(&mut self) {
        if *self.rx.borrow() {
            return;
        }
        loop {
            // If the signal half is dropped without firing, the request can
            // never be cancelled; park forever and let the other select arm win.
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
            if *self.rx.borrow() {
                return;
            }
        }
    }

    /// A token that never fires, for call sites without a caller to cancel them.
    pub fn detached() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }
}
