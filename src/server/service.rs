use axum::body::{Body, Bytes};
use axum::http::header::{HeaderValue, CONNECTION};
use axum::http::{Request, Response, StatusCode, Version};
use axum::Router;
use bevy_log::debug;
use http_body::{Frame, SizeHint};
use hyper::body::Incoming;
use hyper::service::Service;
use hyper_util::service::TowerToHyperService;
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use super::{ConnectionId, ConnectionState, RegistryHandle};

/// Per-connection bookkeeping shared by the service and the response bodies
/// it hands out. Turns request traffic into Active/Idle notifications.
#[derive(Debug)]
pub(crate) struct ConnectionActivity {
    id: ConnectionId,
    in_flight: AtomicUsize,
    hijacked: AtomicBool,
    registry: RegistryHandle,
}

impl ConnectionActivity {
    pub fn new(id: ConnectionId, registry: RegistryHandle) -> Arc<Self> {
        Arc::new(Self {
            id,
            in_flight: AtomicUsize::new(0),
            hijacked: AtomicBool::new(false),
            registry,
        })
    }

    /// Record the start of an exchange. The connection stays Active until
    /// every returned guard is dropped.
    pub fn begin(self: &Arc<Self>) -> ActivityGuard {
        if self.in_flight.fetch_add(1, Ordering::AcqRel) == 0 {
            self.registry.notify(self.id, ConnectionState::Active);
        }
        ActivityGuard {
            activity: Arc::clone(self),
        }
    }

    pub fn mark_hijacked(&self) {
        self.hijacked.store(true, Ordering::Release);
    }

    /// The state to report once the connection future has finished.
    pub fn final_state(&self) -> ConnectionState {
        if self.hijacked.load(Ordering::Acquire) {
            ConnectionState::Hijacked
        } else {
            ConnectionState::Closed
        }
    }

    #[cfg(test)]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }
}

/// RAII guard that reports the connection Idle when its last exchange ends
#[derive(Debug)]
pub(crate) struct ActivityGuard {
    activity: Arc<ConnectionActivity>,
}

impl Drop for ActivityGuard {
    fn drop(&mut self) {
        if self.activity.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.activity
                .registry
                .notify(self.activity.id, ConnectionState::Idle);
        }
    }
}

/// Response body that holds the connection Active until it has been fully
/// written (or abandoned) by the transport.
pub(crate) struct TrackedBody {
    inner: Body,
    _guard: ActivityGuard,
}

impl http_body::Body for TrackedBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        http_body::Body::poll_frame(Pin::new(&mut self.inner), cx)
    }

    fn is_end_stream(&self) -> bool {
        http_body::Body::is_end_stream(&self.inner)
    }

    fn size_hint(&self) -> SizeHint {
        http_body::Body::size_hint(&self.inner)
    }
}

/// Hyper service used for one connection: runs the shared router, reports
/// connection activity, and stops keep-alive once the server is draining.
#[derive(Clone)]
pub(crate) struct TrackedService {
    inner: TowerToHyperService<Router>,
    activity: Arc<ConnectionActivity>,
    keep_alive: Arc<AtomicBool>,
}

impl TrackedService {
    pub fn new(
        router: Router,
        activity: Arc<ConnectionActivity>,
        keep_alive: Arc<AtomicBool>,
    ) -> Self {
        Self {
            inner: TowerToHyperService::new(router),
            activity,
            keep_alive,
        }
    }
}

impl Service<Request<Incoming>> for TrackedService {
    type Response = Response<TrackedBody>;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn call(&self, request: Request<Incoming>) -> Self::Future {
        let guard = self.activity.begin();
        let id = self.activity.id;
        let method = request.method().clone();
        let uri = request.uri().clone();
        let version = request.version();
        let started = Instant::now();

        let response = self.inner.call(request);
        let activity = Arc::clone(&self.activity);
        let keep_alive = Arc::clone(&self.keep_alive);

        Box::pin(async move {
            let (mut parts, body) = response.await?.into_parts();

            if parts.status == StatusCode::SWITCHING_PROTOCOLS {
                activity.mark_hijacked();
            }
            // HTTP/2 has no Connection header; GOAWAY covers it there.
            if version < Version::HTTP_2 && !keep_alive.load(Ordering::Acquire) {
                parts
                    .headers
                    .insert(CONNECTION, HeaderValue::from_static("close"));
            }

            debug!(
                "{} {} {} {:?} -> {} in {:?}",
                id,
                method,
                uri,
                version,
                parts.status.as_u16(),
                started.elapsed()
            );

            Ok(Response::from_parts(
                parts,
                TrackedBody {
                    inner: body,
                    _guard: guard,
                },
            ))
        })
    }
}
