use async_io::Async;
use bevy_log::{debug, error};
use futures_rustls::server::TlsStream;
use futures_rustls::TlsAcceptor;
use std::io;
use std::net::{IpAddr, SocketAddr, TcpListener, TcpStream};

use super::{tls, ServerConfig, WebPort};
use crate::{WebServerError, WebServerResult};

/// A bound listening socket, optionally decorated with a TLS upgrade.
pub(crate) struct Listener {
    inner: Async<TcpListener>,
    transport: Transport,
    ip: IpAddr,
    port: WebPort,
}

impl Listener {
    /// Bind according to `config`.
    ///
    /// TLS material is loaded before the socket is bound; a load or
    /// configuration failure therefore leaves the port untouched.
    pub fn bind(config: &ServerConfig) -> WebServerResult<Self> {
        let (ip, port) = (config.ip(), config.port());

        let transport = match config.tls() {
            Some(ssl) => Transport::Tls(tls::build_acceptor(ssl).inspect_err(|e| {
                error!("Failed to prepare TLS for {}:{}: {}", ip, port, e);
            })?),
            None => Transport::Plain,
        };

        let inner = Async::<TcpListener>::bind((ip, port)).map_err(|e| {
            error!("Failed to bind server on {}:{}: {}", ip, port, e);
            WebServerError::bind_failed(ip, port, e)
        })?;
        debug!("Successfully bound to {}:{}", ip, port);

        Ok(Self {
            inner,
            transport,
            ip,
            port,
        })
    }

    pub async fn accept(&self) -> io::Result<(Async<TcpStream>, SocketAddr)> {
        self.inner.accept().await
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.get_ref().local_addr()
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    pub fn port(&self) -> WebPort {
        self.port
    }
}

/// How an accepted socket becomes an HTTP transport.
#[derive(Clone)]
pub(crate) enum Transport {
    Plain,
    Tls(TlsAcceptor),
}

impl Transport {
    /// Perform any per-connection negotiation (the TLS handshake).
    pub async fn establish(&self, stream: Async<TcpStream>) -> io::Result<Established> {
        match self {
            Self::Plain => Ok(Established::Plain(stream)),
            Self::Tls(acceptor) => {
                let stream = acceptor.accept(stream).await?;
                let h2 = stream.get_ref().1.alpn_protocol() == Some(tls::ALPN_H2);
                Ok(Established::Tls {
                    stream: Box::new(stream),
                    h2,
                })
            }
        }
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, Self::Tls(_))
    }
}

pub(crate) enum Established {
    Plain(Async<TcpStream>),
    Tls {
        stream: Box<TlsStream<Async<TcpStream>>>,
        /// The client negotiated HTTP/2 through ALPN.
        h2: bool,
    },
}
