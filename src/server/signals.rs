use async_channel::{Receiver, Sender};
use bevy_log::debug;

use crate::WebServerError;

/// Notification channels owned by a server.
///
/// `done` carries one value per start/stop cycle, `errors` carries every
/// fault, and `stop` is the internal request consumed by the shutdown
/// coordinator.
#[derive(Debug)]
pub(crate) struct Signals {
    done_tx: Sender<bool>,
    done_rx: Receiver<bool>,
    error_tx: Sender<WebServerError>,
    error_rx: Receiver<WebServerError>,
    stop_tx: Sender<()>,
    stop_rx: Receiver<()>,
}

impl Default for Signals {
    fn default() -> Self {
        let (done_tx, done_rx) = async_channel::unbounded();
        let (error_tx, error_rx) = async_channel::unbounded();
        let (stop_tx, stop_rx) = async_channel::bounded(1);
        Self {
            done_tx,
            done_rx,
            error_tx,
            error_rx,
            stop_tx,
            stop_rx,
        }
    }
}

impl Signals {
    pub fn done(&self) -> Receiver<bool> {
        self.done_rx.clone()
    }

    pub fn errors(&self) -> Receiver<WebServerError> {
        self.error_rx.clone()
    }

    pub fn error_sender(&self) -> Sender<WebServerError> {
        self.error_tx.clone()
    }

    pub fn complete(&self, success: bool) {
        // Both ends live in `self`, so the channel cannot be closed here.
        let _ = self.done_tx.try_send(success);
    }

    pub fn fail(&self, error: WebServerError) {
        let _ = self.error_tx.try_send(error);
    }

    pub fn request_stop(&self) {
        if self.stop_tx.try_send(()).is_err() {
            debug!("Stop already requested");
        }
    }

    /// Wait for the next stop request.
    pub async fn stop_requested(&self) {
        let _ = self.stop_rx.recv().await;
    }

    /// Drop stop requests left over from an earlier cycle.
    pub fn clear_stop(&self) {
        while self.stop_rx.try_recv().is_ok() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::LifecycleState;
    use futures_lite::future;

    #[test]
    fn test_signals_are_queued_for_late_observers() {
        let signals = Signals::default();

        signals.fail(WebServerError::not_running(LifecycleState::Stopped));
        signals.complete(false);

        assert!(matches!(
            signals.errors().try_recv(),
            Ok(WebServerError::NotRunning { .. })
        ));
        assert_eq!(signals.done().try_recv(), Ok(false));
        assert!(signals.done().try_recv().is_err());
    }

    #[test]
    fn test_stop_request_is_coalesced() {
        let signals = Signals::default();

        signals.request_stop();
        signals.request_stop();
        future::block_on(signals.stop_requested());

        assert!(signals.stop_rx.try_recv().is_err());
    }

    #[test]
    fn test_clear_stop_discards_stale_request() {
        let signals = Signals::default();
        signals.request_stop();
        signals.clear_stop();
        assert!(signals.stop_rx.is_empty());
    }
}
