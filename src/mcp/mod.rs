//! MCP (Model Context Protocol) layer.
//!
//! Hand-rolled JSON-RPC 2.0 protocol types, the per-client session state
//! machine, and the method dispatcher that projects the skill catalog as
//! MCP tools, prompts and resources.
//!
//! Transport: Streamable HTTP at `/mcp` (POST for requests, SSE for
//! streamed responses and server-initiated notifications).

pub mod engine;
pub mod protocol;
pub mod session;

pub use engine::McpEngine;
pub use protocol::{McpError, McpRequest, McpResponse, SUPPORTED_PROTOCOL_VERSIONS};
pub use session::{SessionHandle, SessionRegistry, SessionState};
