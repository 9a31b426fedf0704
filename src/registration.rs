//! One-shot signal telling the post office that the registration handshake has
//! completed.

use std::sync::Arc;

use tokio::sync::watch;

#[derive(Debug, Clone)]
pub struct RegistrationGate {
    state: Arc<watch::Sender<bool>>,
}

impl Default for RegistrationGate {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistrationGate {
    pub fn new() -> Self {
        let (state, _) = watch::channel(false);
        Self {
            state: Arc::new(state),
        }
    }

    /// A gate for clients which are already registered.
    pub fn completed() -> Self {
        let gate = Self::new();
        gate.complete();
        gate
    }

    /// Marks registration as complete. Calling it again has no effect.
    pub fn complete(&self) {
        self.state.send_if_modified(|registered| !std::mem::replace(registered, true));
    }

    pub fn is_complete(&self) -> bool {
        *self.state.borrow()
    }

    /// Resolves once registration has completed.
    pub async fn wait(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|registered| *registered).await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_wait_resolves_after_completion() {
        let gate = RegistrationGate::new();
        assert!(!gate.is_complete());

        let waiter = tokio::spawn({
            let gate = gate.clone();
            async move { gate.wait().await }
        });

        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        gate.complete();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(gate.is_complete());
    }

    #[tokio::test]
    async fn test_completed_gate_does_not_block() {
        let gate = RegistrationGate::completed();
        gate.complete();
        gate.wait().await;
        assert!(gate.is_complete());
    }
}
