//! Networking: configuration, sessions, the accept loop and shutdown control.

pub mod backoff;
pub mod config;
pub mod server;
pub mod session;
pub mod shutdown;

pub use backoff::{is_temporary, AcceptBackoff};
pub use config::{ConfigError, ServerConfig, SessionConfig};
pub use server::{AcceptError, Server, ServerError, ServerHandle, SessionHook};
pub use session::{Session, SessionError, SessionState, Transport};
pub use shutdown::{InFlightGuard, ServerState, ShutdownController};
