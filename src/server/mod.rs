use async_executor::Executor;
use axum::Router;
use bevy_log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::{WebServerError, WebServerResult};

mod accept;
mod config;
mod connection_tracker;
mod listener;
mod service;
mod signals;
mod status;
mod tls;

pub use config::*;
pub use connection_tracker::{ConnectionId, ConnectionState, RegistrySnapshot};
pub use status::*;

pub(crate) use accept::AcceptLoop;
#[cfg(test)]
pub(crate) use connection_tracker::Command;
pub(crate) use connection_tracker::{ConnectionHandle, ConnectionRegistry, RegistryHandle};
pub(crate) use listener::{Established, Listener, Transport};
pub(crate) use signals::Signals;

/// A single HTTP(S) server and its start/drain/stop lifecycle.
///
/// `start` drives the whole server on the calling task and only returns once
/// a `stop` has been fully processed, so it is usually run on its own thread
/// or task while another holder of the server calls `stop`.
#[derive(Debug)]
pub struct WebServer {
    config: ServerConfig,
    router: Router,
    lifecycle: LifecycleCell,
    signals: Signals,
    executor: Arc<Executor<'static>>,
    registry: Mutex<Option<RegistryHandle>>,
}

/// Puts the server back to Stopped if the `start` future is dropped before
/// the cycle ends.
struct AbandonGuard<'a> {
    server: &'a WebServer,
    armed: bool,
}

impl Drop for AbandonGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let state = self.server.lifecycle.reset();
        warn!(
            "Server on port {} abandoned mid-cycle ({})",
            self.server.config.port(),
            state.description()
        );
        self.server.set_registry(None);
        self.server.signals.complete(false);
        self.server.run_pending();
    }
}

impl WebServer {
    pub const ERROR_SLEEP_INTERVAL_MS: u64 = AcceptLoop::ERROR_SLEEP_INTERVAL_MS;

    pub fn new(config: ServerConfig, router: Router) -> Self {
        Self {
            config,
            router,
            lifecycle: LifecycleCell::default(),
            signals: Signals::default(),
            executor: Arc::new(Executor::new()),
            registry: Mutex::new(None),
        }
    }

    /// Bind, serve, and block until a stop request has drained every
    /// connection.
    ///
    /// Startup failures are returned promptly and are also reported on the
    /// error signal, followed by a `false` completion. Dropping the returned
    /// future before it finishes abandons the cycle: open connections are
    /// cut, the server returns to `Stopped` and completion fires `false`.
    pub async fn start(&self) -> WebServerResult<()> {
        if let Err(state) = self
            .lifecycle
            .transition(LifecycleState::Stopped, LifecycleState::Starting)
        {
            let err = WebServerError::already_running(self.config.port(), state);
            warn!("{} ({})", err, state.description());
            return Err(err);
        }
        self.signals.clear_stop();
        // Lets tasks cancelled by an abandoned cycle release what they hold.
        self.run_pending();

        let mut guard = AbandonGuard {
            server: self,
            armed: true,
        };
        let result = self.executor.run(self.serve()).await;
        guard.armed = false;
        result
    }

    /// Poll whatever is already scheduled on the server's executor.
    fn run_pending(&self) {
        const MAX_TICKS: usize = 1024;
        for _ in 0..MAX_TICKS {
            if !self.executor.try_tick() {
                break;
            }
        }
    }

    fn set_registry(&self, registry: Option<RegistryHandle>) {
        *self.registry.lock().unwrap_or_else(PoisonError::into_inner) = registry;
    }

    async fn serve(&self) -> WebServerResult<()> {
        let (ip, port) = (self.config.ip(), self.config.port());

        let bound = Listener::bind(&self.config).and_then(|listener| {
            let addr = listener
                .local_addr()
                .map_err(|e| WebServerError::bind_failed(ip, port, e))?;
            Ok((listener, addr))
        });
        let (listener, bound) = match bound {
            Ok(bound) => bound,
            Err(err) => return Err(self.abort_start(err)),
        };

        let scheme = if listener.transport().is_tls() { "https" } else { "http" };
        let keep_alive = Arc::new(AtomicBool::new(true));
        let (registry, registry_task) = ConnectionRegistry::spawn(&self.executor);
        self.set_registry(Some(registry.clone()));
        let (close_listener, listener_closed) = async_channel::bounded(1);

        let accept_task = self.executor.spawn(
            AcceptLoop {
                listener,
                router: self.router.clone(),
                registry: registry.clone(),
                keep_alive: Arc::clone(&keep_alive),
                executor: Arc::clone(&self.executor),
                errors: self.signals.error_sender(),
            }
            .run(listener_closed),
        );

        if let Err(state) = self
            .lifecycle
            .transition(LifecycleState::Starting, LifecycleState::Running)
        {
            warn!("Server on {}:{} left Starting unexpectedly ({:?})", ip, port, state);
        }
        info!("Web server listening on {}://{}", scheme, bound);

        self.signals.stop_requested().await;

        let live = registry.snapshot().await.map(|s| s.live).unwrap_or_default();
        info!(
            "Graceful shutdown of {}:{} requested, draining {} connections",
            ip, port, live
        );

        keep_alive.store(false, Ordering::Release);
        let _ = close_listener.try_send(());
        accept_task.await;

        registry.drain().await;
        self.set_registry(None);
        drop(registry);
        let snapshot = registry_task.await;
        debug!("Final connection registry for {}:{}: {:?}", ip, port, snapshot);

        if let Err(state) = self
            .lifecycle
            .transition(LifecycleState::Draining, LifecycleState::Stopped)
        {
            warn!("Server on {}:{} left Draining unexpectedly ({:?})", ip, port, state);
        }
        info!(
            "Graceful shutdown completed for server on {}:{} ({} connections served)",
            ip, port, snapshot.total_added
        );
        self.signals.complete(true);

        Ok(())
    }

    fn abort_start(&self, err: WebServerError) -> WebServerError {
        let _ = self
            .lifecycle
            .transition(LifecycleState::Starting, LifecycleState::Stopped);
        self.signals.fail(err.clone());
        self.signals.complete(false);
        err
    }

    /// Request a graceful shutdown. Never blocks.
    ///
    /// Only a running server can be stopped; otherwise the rejection is
    /// returned, reported on the error signal, and completion fires `false`.
    pub fn stop(&self) -> WebServerResult<()> {
        if let Err(state) = self
            .lifecycle
            .transition(LifecycleState::Running, LifecycleState::Draining)
        {
            let err = WebServerError::not_running(state);
            warn!(
                "Stop rejected for server on port {}: {}",
                self.config.port(),
                state.description()
            );
            self.signals.fail(err.clone());
            self.signals.complete(false);
            return Err(err);
        }

        debug!("Requested graceful shutdown for server on port {}", self.config.port());
        self.signals.request_stop();
        Ok(())
    }

    /// `stop`, then wait for the drain to finish. Returns whether the
    /// server shut down cleanly.
    pub async fn stop_and_wait(&self) -> bool {
        if self.stop().is_err() {
            return false;
        }
        let done = self.signals.done();
        loop {
            match done.recv().await {
                Ok(true) => return true,
                // A rejection queued by another caller, not ours.
                Ok(false) => continue,
                Err(_) => return false,
            }
        }
    }

    pub fn handler(&self) -> &Router {
        &self.router
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn state(&self) -> LifecycleState {
        self.lifecycle.load()
    }

    /// Live view of the connection registry, `None` unless a cycle is
    /// serving.
    pub async fn connections(&self) -> Option<RegistrySnapshot> {
        let registry = self
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()?;
        registry.snapshot().await
    }

    /// Completion signal: one value per finished cycle or rejected stop,
    /// `true` only after a full drain.
    pub fn done(&self) -> async_channel::Receiver<bool> {
        self.signals.done()
    }

    /// Every fault the server reports, fatal or not.
    pub fn errors(&self) -> async_channel::Receiver<WebServerError> {
        self.signals.errors()
    }
}
