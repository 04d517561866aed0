pub use crate::error::{WebServerError, WebServerResult};
pub use crate::server::{LifecycleState, ServerConfig, SslConfig, WebPort, WebServer};
pub use crate::{DEFAULT_IP, DEFAULT_PORT};
