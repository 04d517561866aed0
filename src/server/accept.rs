use async_executor::Executor;
use async_io::{Async, Timer};
use axum::Router;
use bevy_log::{debug, error, info};
use futures_lite::future;
use hyper::server::conn::{http1, http2};
use smol_hyper::rt::{FuturesIo, SmolExecutor, SmolTimer};
use std::future::Future;
use std::net::{SocketAddr, TcpStream};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::service::{ConnectionActivity, TrackedService};
use super::{ConnectionHandle, ConnectionId, Established, Listener, RegistryHandle, Transport};
use crate::WebServerError;

/// Accept/serve cycle. Owns the listener until told to close it.
pub(crate) struct AcceptLoop {
    pub listener: Listener,
    pub router: Router,
    pub registry: RegistryHandle,
    pub keep_alive: Arc<AtomicBool>,
    pub executor: Arc<Executor<'static>>,
    pub errors: async_channel::Sender<WebServerError>,
}

impl AcceptLoop {
    pub const ERROR_SLEEP_INTERVAL_MS: u64 = 100;

    /// Accept connections until `close` fires, then drop the listener.
    pub async fn run(self, close: async_channel::Receiver<()>) {
        let (ip, port) = (self.listener.ip(), self.listener.port());
        let mut next_id = 0u64;

        loop {
            // Close first: a steady stream of connections must not keep the
            // listener open after a stop.
            let accepted = future::or(
                async {
                    let _ = close.recv().await;
                    None
                },
                async { Some(self.listener.accept().await) },
            )
            .await;

            match accepted {
                None => break,
                Some(Ok((stream, peer))) => {
                    next_id += 1;
                    let id = ConnectionId::new(next_id);
                    let (closer, close_requests) = async_channel::bounded(1);

                    // Registered here rather than in the connection task so the
                    // add is queued before any later drain request.
                    self.registry
                        .add(ConnectionHandle::new(id, peer, closer));

                    let connection = Connection {
                        id,
                        peer,
                        transport: self.listener.transport().clone(),
                        router: self.router.clone(),
                        registry: self.registry.clone(),
                        keep_alive: Arc::clone(&self.keep_alive),
                        executor: Arc::clone(&self.executor),
                    };
                    self.executor
                        .spawn(connection.serve(stream, close_requests))
                        .detach();
                }
                Some(Err(e)) => {
                    error!("Error accepting connection on {}:{}: {}", ip, port, e);
                    let _ = self
                        .errors
                        .try_send(WebServerError::accept_failed(ip, port, e));
                    Timer::after(Duration::from_millis(Self::ERROR_SLEEP_INTERVAL_MS)).await;
                }
            }
            future::yield_now().await;
        }

        drop(self.listener);
        info!("Listener on {}:{} closed after {} connections", ip, port, next_id);
    }
}

/// Everything one connection task needs.
struct Connection {
    id: ConnectionId,
    peer: SocketAddr,
    transport: Transport,
    router: Router,
    registry: RegistryHandle,
    keep_alive: Arc<AtomicBool>,
    executor: Arc<Executor<'static>>,
}

impl Connection {
    async fn serve(self, stream: Async<TcpStream>, close_requests: async_channel::Receiver<()>) {
        let start_time = Instant::now();
        let activity = ConnectionActivity::new(self.id, self.registry.clone());
        let service = TrackedService::new(
            self.router.clone(),
            Arc::clone(&activity),
            Arc::clone(&self.keep_alive),
        );

        let handshake = future::or(
            async { Some(self.transport.establish(stream).await) },
            async {
                let _ = close_requests.recv().await;
                None
            },
        )
        .await;

        let result = match handshake {
            None => {
                debug!("Connection {} closed before its handshake finished", self.id);
                Ok(())
            }
            Some(Err(err)) => {
                debug!("Connection {} handshake with {} failed: {}", self.id, self.peer, err);
                Ok(())
            }
            Some(Ok(Established::Plain(stream))) => {
                self.serve_http1(FuturesIo::new(stream), service, &close_requests)
                    .await
            }
            Some(Ok(Established::Tls { stream, h2: false })) => {
                self.serve_http1(FuturesIo::new(stream), service, &close_requests)
                    .await
            }
            Some(Ok(Established::Tls { stream, h2: true })) => {
                self.serve_http2(FuturesIo::new(stream), service, &close_requests)
                    .await
            }
        };

        let duration = start_time.elapsed();
        match result {
            Ok(()) => debug!("Connection {} completed in {:?}", self.id, duration),
            Err(err) => {
                let err_msg = err.to_string();
                if err.is_timeout() || err.is_incomplete_message() || err_msg.contains("timeout") {
                    debug!("Connection {} timeout after {:?}: {}", self.id, duration, err);
                } else {
                    error!("Connection {} error after {:?}: {}", self.id, duration, err);
                }
            }
        }

        self.registry.notify(self.id, activity.final_state());
    }

    async fn serve_http1<I>(
        &self,
        io: I,
        service: TrackedService,
        close_requests: &async_channel::Receiver<()>,
    ) -> hyper::Result<()>
    where
        I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
    {
        let connection = http1::Builder::new()
            .timer(SmolTimer::new())
            .keep_alive(self.keep_alive.load(Ordering::Acquire))
            .serve_connection(io, service)
            .with_upgrades();
        let connection = std::pin::pin!(connection);

        close_when_asked(connection, close_requests, |conn| conn.graceful_shutdown()).await
    }

    async fn serve_http2<I>(
        &self,
        io: I,
        service: TrackedService,
        close_requests: &async_channel::Receiver<()>,
    ) -> hyper::Result<()>
    where
        I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
    {
        let connection = http2::Builder::new(SmolExecutor::new(Arc::clone(&self.executor)))
            .timer(SmolTimer::new())
            .serve_connection(io, service);
        let connection = std::pin::pin!(connection);

        close_when_asked(connection, close_requests, |conn| conn.graceful_shutdown()).await
    }
}

/// Drive `connection` to completion, switching it to a graceful shutdown
/// when the registry asks for it to be closed.
async fn close_when_asked<F, S>(
    mut connection: Pin<&mut F>,
    close_requests: &async_channel::Receiver<()>,
    shutdown: S,
) -> hyper::Result<()>
where
    F: Future<Output = hyper::Result<()>>,
    S: FnOnce(Pin<&mut F>),
{
    let finished = future::or(async { Some(connection.as_mut().await) }, async {
        match close_requests.recv().await {
            Ok(()) => None,
            // The registry is gone; nobody will ask again.
            Err(_) => future::pending().await,
        }
    })
    .await;

    match finished {
        Some(result) => result,
        None => {
            shutdown(connection.as_mut());
            connection.await
        }
    }
}
