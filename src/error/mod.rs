use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

use crate::server::{LifecycleState, WebPort};

pub type WebServerResult<T> = Result<T, WebServerError>;

/// Faults reported by the server, either returned directly or emitted on the
/// error signal. Cloneable so one fault can be handed to several observers.
#[derive(Clone, Debug, Error)]
pub enum WebServerError {
    #[error("Failed to bind to {ip}:{port}: {source}")]
    BindFailed {
        ip: IpAddr,
        port: WebPort,
        #[source]
        source: Arc<std::io::Error>,
    },

    #[error("Failed to load TLS material from '{}': {reason}", path.display())]
    CertificateLoad { path: PathBuf, reason: String },

    #[error("TLS transport configuration failed: {reason}")]
    TlsConfig { reason: String },

    #[error("Error accepting connection on {ip}:{port}: {source}")]
    AcceptFailed {
        ip: IpAddr,
        port: WebPort,
        #[source]
        source: Arc<std::io::Error>,
    },

    #[error("Server is not running (state: {state:?})")]
    NotRunning { state: LifecycleState },

    #[error("Server on port {port} is already started (state: {state:?})")]
    AlreadyRunning { port: WebPort, state: LifecycleState },
}

impl WebServerError {
    pub fn bind_failed(ip: IpAddr, port: WebPort, source: std::io::Error) -> Self {
        Self::BindFailed {
            ip,
            port,
            source: Arc::new(source),
        }
    }

    pub fn certificate_load(path: impl AsRef<Path>, reason: impl Into<String>) -> Self {
        Self::CertificateLoad {
            path: path.as_ref().to_path_buf(),
            reason: reason.into(),
        }
    }

    pub fn tls_config(reason: impl Into<String>) -> Self {
        Self::TlsConfig {
            reason: reason.into(),
        }
    }

    pub fn accept_failed(ip: IpAddr, port: WebPort, source: std::io::Error) -> Self {
        Self::AcceptFailed {
            ip,
            port,
            source: Arc::new(source),
        }
    }

    pub fn not_running(state: LifecycleState) -> Self {
        Self::NotRunning { state }
    }

    pub fn already_running(port: WebPort, state: LifecycleState) -> Self {
        Self::AlreadyRunning { port, state }
    }

    /// Startup faults that prevent the server from ever reaching `Running`.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::BindFailed { .. } | Self::CertificateLoad { .. } | Self::TlsConfig { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error, ErrorKind};
    use std::net::Ipv4Addr;

    #[test]
    fn test_fatal_classification() {
        let ip = IpAddr::V4(Ipv4Addr::LOCALHOST);

        assert!(WebServerError::bind_failed(ip, 8080, Error::from(ErrorKind::AddrInUse)).is_fatal());
        assert!(WebServerError::certificate_load("missing.crt", "not found").is_fatal());
        assert!(WebServerError::tls_config("bad key").is_fatal());

        assert!(!WebServerError::accept_failed(ip, 8080, Error::other("too many files")).is_fatal());
        assert!(!WebServerError::not_running(LifecycleState::Stopped).is_fatal());
        assert!(!WebServerError::already_running(8080, LifecycleState::Running).is_fatal());
    }

    #[test]
    fn test_messages_name_the_failure() {
        let err = WebServerError::bind_failed(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            8888,
            Error::from(ErrorKind::AddrInUse),
        );
        assert!(err.to_string().starts_with("Failed to bind to 127.0.0.1:8888"));

        let err = WebServerError::certificate_load("certs/server.crt", "No such file");
        assert_eq!(
            err.to_string(),
            "Failed to load TLS material from 'certs/server.crt': No such file"
        );

        let err = WebServerError::not_running(LifecycleState::Stopped);
        assert_eq!(err.to_string(), "Server is not running (state: Stopped)");
    }

    #[test]
    fn test_clone_shares_io_source() {
        let err = WebServerError::bind_failed(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            8888,
            Error::from(ErrorKind::AddrInUse),
        );
        let cloned = err.clone();

        match (&err, &cloned) {
            (
                WebServerError::BindFailed { source: a, .. },
                WebServerError::BindFailed { source: b, .. },
            ) => {
                assert!(Arc::ptr_eq(a, b));
                assert_eq!(a.kind(), ErrorKind::AddrInUse);
            }
            _ => panic!("clone changed the variant"),
        }
    }
}
