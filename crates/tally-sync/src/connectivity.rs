//! Injected connectivity signal.
//!
//! The environment (browser events, OS reachability, a test) owns a
//! [`Connectivity`] and flips it; the coordinator holds a subscription and
//! reacts to transitions. Nothing here touches ambient globals.

use tokio::sync::watch;

/// Source side of the online/offline signal.
#[derive(Debug)]
pub struct Connectivity {
    tx: watch::Sender<bool>,
}

impl Connectivity {
    pub fn new(initially_online: bool) -> Self {
        let (tx, _) = watch::channel(initially_online);
        Self { tx }
    }

    /// Report a connectivity change. Redundant reports (online while
    /// already online) are delivered too; subscribers detect transitions
    /// themselves.
    pub fn set_online(&self, online: bool) {
        self.tx.send_replace(online);
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// A subscription handle for a coordinator (or anything else that
    /// cares). Dropping the `Connectivity` ends all subscriptions.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for Connectivity {
    fn default() -> Self {
        Self::new(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_observe_transitions() {
        let signal = Connectivity::new(true);
        let mut rx = signal.subscribe();
        assert!(*rx.borrow());

        signal.set_online(false);
        rx.changed().await.unwrap();
        assert!(!*rx.borrow());
        assert!(!signal.is_online());

        signal.set_online(true);
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
    }
}
