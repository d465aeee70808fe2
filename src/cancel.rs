//! Linked cancellation tokens.
//!
//! A session owns a root token; each worker generation gets a child. A child
//! observes its parent, so cancelling the session stops every generation,
//! while a generation can be cancelled on its own during a restart.

use std::sync::Arc;

use tokio::sync::watch;

#[derive(Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
    parent: Option<Box<CancelToken>>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        CancelToken {
            tx: Arc::new(tx),
            rx,
            parent: None,
        }
    }

    /// A token that is cancelled when either it or `self` is cancelled.
    pub fn child(&self) -> Self {
        let mut token = CancelToken::new();
        token.parent = Some(Box::new(self.clone()));
        token
    }

    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
            || self
                .parent
                .as_ref()
                .map(|p| p.is_cancelled())
                .unwrap_or(false)
    }

    /// Resolves once this token (or any ancestor) is cancelled.
    pub async fn cancelled(&self) {
        let mut own = self.rx.clone();
        match &self.parent {
            None => {
                if own.wait_for(|c| *c).await.is_err() {
                    // Sender gone without cancelling: nothing will ever
                    // cancel us, park forever.
                    std::future::pending::<()>().await;
                }
            }
            Some(parent) => {
                tokio::select! {
                    is_err = async { own.wait_for(|c| *c).await.is_err() } => {
                        if is_err {
                            Box::pin(parent.cancelled()).await;
                        }
                    }
                    _ = Box::pin(parent.cancelled()) => {}
                }
            }
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn cancel_resolves_waiters() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());

        let waiter = token.clone();
        let handle = tokio::spawn(async move { waiter.cancelled().await });

        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn child_observes_parent() {
        let parent = CancelToken::new();
        let child = parent.child();

        parent.cancel();
        assert!(child.is_cancelled());
        tokio::time::timeout(Duration::from_secs(1), child.cancelled())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn child_cancel_leaves_parent_alive() {
        let parent = CancelToken::new();
        let child = parent.child();

        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
    }

    #[tokio::test]
    async fn already_cancelled_resolves_immediately() {
        let token = CancelToken::new();
        token.cancel();
        tokio::time::timeout(Duration::from_millis(50), token.cancelled())
            .await
            .unwrap();
    }
}
