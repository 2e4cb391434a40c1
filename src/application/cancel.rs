use std::future;

use tokio::sync::watch;

/// Fires the paired [`Cancellation`] signals.
#[derive(Debug)]
pub struct CancelHandle {
    sender: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }
}

/// A cloneable cancellation signal supplied by the caller of an operation.
#[derive(Debug, Clone)]
pub struct Cancellation {
    receiver: Option<watch::Receiver<bool>>,
}

impl Cancellation {
    pub fn new() -> (CancelHandle, Cancellation) {
        let (sender, receiver) = watch::channel(false);
        (
            CancelHandle { sender },
            Cancellation {
                receiver: Some(receiver),
            },
        )
    }

    /// A signal that never fires.
    pub fn never() -> Self {
        Self { receiver: None }
    }

    pub fn is_cancelled(&self) -> bool {
        self.receiver.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Resolves once cancellation is requested. Never resolves for
    /// [`Cancellation::never`] or when the handle is dropped without cancelling.
    pub async fn cancelled(&self) {
        let Some(receiver) = &self.receiver else {
            return future::pending().await;
        };
        let mut receiver = receiver.clone();
        let sender_dropped = receiver.wait_for(|cancelled| *cancelled).await.is_err();
        if sender_dropped {
            future::pending::<()>().await;
        }
    }
}

impl Default for Cancellation {
    fn default() -> Self {
        Self::never()
    }
}
