//! Session lifecycle tracking.

use std::time::Duration;

use conclave_common::SessionState;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Releases a token exactly once, when the coordination session is lost
pub struct SessionMonitor {
    states: watch::Receiver<SessionState>,
    lost: CancellationToken,
}

impl SessionMonitor {
    pub fn new(states: watch::Receiver<SessionState>) -> Self {
        Self {
            states,
            lost: CancellationToken::new(),
        }
    }

    /// Token cancelled on the first terminal session state
    pub fn lost_token(&self) -> CancellationToken {
        self.lost.clone()
    }

    /// Follow the session until it ends or `shutdown` fires
    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut last = *self.states.borrow_and_update();
        tracing::debug!(state = ?last, "Session monitor started");

        loop {
            if last.is_terminal() {
                tracing::warn!(state = ?last, "Coordination session lost");
                break;
            }

            tokio::select! {
                _ = shutdown.cancelled() => return,
                changed = self.states.changed() => {
                    if changed.is_err() {
                        tracing::warn!("Session state stream ended");
                        break;
                    }
                    let state = *self.states.borrow_and_update();
                    if state != last {
                        tracing::info!(from = ?last, to = ?state, "Session state changed");
                        last = state;
                    }
                }
            }
        }

        self.lost.cancel();
    }
}

/// Wait `delay` before repeating a failed pass.
///
/// Returns false instead once the session has ended or `shutdown` fired;
/// work bound to a lost session is not worth repeating.
pub async fn retry_pause(
    states: &mut watch::Receiver<SessionState>,
    shutdown: &CancellationToken,
    delay: Duration,
) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);

    loop {
        if states.borrow_and_update().is_terminal() {
            return false;
        }

        tokio::select! {
            _ = shutdown.cancelled() => return false,
            _ = &mut sleep => return !states.borrow().is_terminal(),
            changed = states.changed() => {
                if changed.is_err() {
                    return false;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::{Coordinator, MemoryEnsemble};
    use std::time::Duration;

    #[tokio::test]
    async fn test_released_on_expiry() {
        let ensemble = MemoryEnsemble::new();
        let session = ensemble.connect();
        let monitor = SessionMonitor::new(session.session_state());
        let lost = monitor.lost_token();
        let task = tokio::spawn(monitor.run(CancellationToken::new()));

        assert!(!lost.is_cancelled());
        ensemble.expire_session(session.session_id());

        tokio::time::timeout(Duration::from_secs(1), lost.cancelled())
            .await
            .expect("session loss not reported");
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_released_when_already_closed() {
        let ensemble = MemoryEnsemble::new();
        let session = ensemble.connect();
        session.close().await.unwrap();

        let monitor = SessionMonitor::new(session.session_state());
        let lost = monitor.lost_token();
        monitor.run(CancellationToken::new()).await;
        assert!(lost.is_cancelled());
    }

    #[tokio::test]
    async fn test_shutdown_does_not_release() {
        let (_tx, rx) = watch::channel(SessionState::Connected);
        let monitor = SessionMonitor::new(rx);
        let lost = monitor.lost_token();
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        monitor.run(shutdown).await;
        assert!(!lost.is_cancelled());
    }

    #[tokio::test]
    async fn test_retry_pause_while_live() {
        let (_tx, mut rx) = watch::channel(SessionState::Connected);
        let shutdown = CancellationToken::new();
        assert!(retry_pause(&mut rx, &shutdown, Duration::from_millis(5)).await);
    }

    #[tokio::test]
    async fn test_retry_pause_stops_on_session_loss() {
        let ensemble = MemoryEnsemble::new();
        let session = ensemble.connect();
        let mut states = session.session_state();
        let shutdown = CancellationToken::new();

        let pause = tokio::spawn(async move {
            retry_pause(&mut states, &shutdown, Duration::from_secs(30)).await
        });
        tokio::task::yield_now().await;
        ensemble.expire_session(session.session_id());

        let retry = tokio::time::timeout(Duration::from_secs(1), pause)
            .await
            .expect("pause outlived the session")
            .unwrap();
        assert!(!retry);
    }

    #[tokio::test]
    async fn test_released_when_stream_ends() {
        let (tx, rx) = watch::channel(SessionState::Connected);
        let monitor = SessionMonitor::new(rx);
        let lost = monitor.lost_token();
        drop(tx);

        monitor.run(CancellationToken::new()).await;
        assert!(lost.is_cancelled());
    }
}
