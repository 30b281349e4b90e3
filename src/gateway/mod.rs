//! Gateway server implementation

pub mod auth;
pub mod dispatch;
mod router;
mod server;
pub mod shutdown;
pub mod streaming;

pub use auth::{AuthState, CredentialValidator, auth_middleware};
pub use dispatch::Dispatcher;
pub use router::{AppState, create_router};
pub use server::{Gateway, GatewayHandle, ServerState, shutdown_signal};
pub use shutdown::ShutdownCoordinator;
pub use streaming::{Session, SessionEvent, SessionManager};
