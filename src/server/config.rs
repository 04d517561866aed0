use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};

pub type WebPort = u16;

/// Certificate material for the encrypted transport.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SslConfig {
    #[serde(default)]
    pub certificate: PathBuf,
    #[serde(default)]
    pub key: PathBuf,
    /// CA bundle used to require and verify client certificates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ca: Option<PathBuf>,
}

impl SslConfig {
    fn is_complete(&self) -> bool {
        !self.certificate.as_os_str().is_empty() && !self.key.as_os_str().is_empty()
    }
}

/// Connection parameters of a [`WebServer`](crate::WebServer).
///
/// Fixed once the server is built; the server only hands out shared references.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_ip")]
    ip: IpAddr,
    #[serde(default = "default_port")]
    port: WebPort,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ssl: Option<SslConfig>,
}

fn default_ip() -> IpAddr {
    crate::DEFAULT_IP
}

fn default_port() -> WebPort {
    crate::DEFAULT_PORT
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ip: crate::DEFAULT_IP,
            port: crate::DEFAULT_PORT,
            ssl: None,
        }
    }
}

impl ServerConfig {
    pub fn new(port: WebPort) -> Self {
        Self {
            port,
            ..Default::default()
        }
    }

    pub fn with_ip(mut self, ip: IpAddr) -> Self {
        self.ip = ip;
        self
    }

    /// Serve over TLS with HTTP/2 negotiation using the given PEM files.
    pub fn with_tls(mut self, certificate: impl Into<PathBuf>, key: impl Into<PathBuf>) -> Self {
        let client_ca = self.ssl.take().and_then(|ssl| ssl.client_ca);
        self.ssl = Some(SslConfig {
            certificate: certificate.into(),
            key: key.into(),
            client_ca,
        });
        self
    }

    /// Require client certificates signed by the CA bundle at `path`.
    ///
    /// Only takes effect together with [`with_tls`](Self::with_tls).
    pub fn with_client_ca(mut self, path: impl Into<PathBuf>) -> Self {
        self.ssl.get_or_insert_with(SslConfig::default).client_ca = Some(path.into());
        self
    }

    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    pub fn port(&self) -> WebPort {
        self.port
    }

    /// TLS material, present only when both the certificate and the key are set.
    pub fn tls(&self) -> Option<&SslConfig> {
        self.ssl.as_ref().filter(|ssl| ssl.is_complete())
    }

    pub fn certificate(&self) -> Option<&Path> {
        self.tls().map(|ssl| ssl.certificate.as_path())
    }

    pub fn key(&self) -> Option<&Path> {
        self.tls().map(|ssl| ssl.key.as_path())
    }
}
