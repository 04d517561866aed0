//! Start/stop lifecycle for a single HTTP(S) server.
//!
//! A [`WebServer`] owns an [`axum::Router`] and a [`ServerConfig`]. `start`
//! binds the listener (optionally behind TLS with HTTP/2 negotiated through
//! ALPN) and serves until `stop` is called, at which point new connections
//! are refused, idle ones are closed, and in-flight requests are allowed to
//! finish before the completion signal fires.

use std::net::{IpAddr, Ipv4Addr};

mod error;
mod server;

pub mod prelude;


pub const DEFAULT_PORT: WebPort = 8080;
pub const DEFAULT_IP: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);

pub use error::*;
pub use server::{
    ConnectionId, ConnectionState, LifecycleState, RegistrySnapshot, ServerConfig, SslConfig,
    WebPort, WebServer,
};
