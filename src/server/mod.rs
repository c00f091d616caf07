pub mod admin;
pub mod auth;
pub mod health;
mod requests_logging;
#[allow(clippy::module_inception)]
pub mod server;
pub mod state;
pub mod transport;

pub use auth::{AuthContext, AuthError, StaticTokenVerifier, TokenVerifier};
pub use requests_logging::{log_requests, RequestsLoggingLevel};
pub use server::{bootstrap, make_app, run_server, BootError};
pub use state::ServerState;
pub use transport::MCP_SESSION_HEADER;
