// ===============================
// src/shutdown.rs
// ===============================
//
// One `Shutdown` per stage (signals -> monitor -> feeds). main triggers the
// stages in order and awaits each stage's tasks before moving on.
//
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
}

#[derive(Debug, Clone)]
pub struct ShutdownToken {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn token(&self) -> ShutdownToken {
        ShutdownToken { rx: self.tx.subscribe() }
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }
}

impl Default for Shutdown {
    fn default() -> Self { Self::new() }
}

impl ShutdownToken {
    #[cfg(test)]
    pub fn is_triggered(&self) -> bool { *self.rx.borrow() }

    /// Resolves once the stage is triggered (or its owner is gone).
    pub async fn wait(&self) {
        let mut rx = self.rx.clone();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Sleep unless shutdown arrives first. `true` when the full duration elapsed.
    pub async fn sleep(&self, d: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(d) => true,
            _ = self.wait() => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn sleep_is_cut_short_by_trigger() {
        let stop = Shutdown::new();
        let token = stop.token();
        let sleeper = tokio::spawn(async move { token.sleep(Duration::from_secs(3600)).await });
        tokio::time::sleep(Duration::from_secs(1)).await;
        stop.trigger();
        assert!(!sleeper.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_completes_without_trigger() {
        let stop = Shutdown::new();
        assert!(stop.token().sleep(Duration::from_secs(5)).await);
        assert!(!stop.token().is_triggered());
    }

    #[tokio::test]
    async fn token_taken_after_trigger_is_already_set() {
        let stop = Shutdown::new();
        stop.trigger();
        let token = stop.token();
        assert!(token.is_triggered());
        token.wait().await;
    }
}
