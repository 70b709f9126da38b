//! mcp-search keeps one MCP event-stream connection open to a search backend
//! and serializes search calls from many callers onto it.
//!
//! The crate is organized around a small set of collaborating layers:
//! - [`mcp`] owns the wire: frame parsing, the connection lifecycle,
//!   handshake sequencing, request queuing and response correlation, and
//!   error classification.
//! - [`core`] holds on-disk configuration and credential storage.
//! - [`cli`] implements the `mcp-search` command-line front end.
//!
//! The binary (`src/main.rs`) routes through [`crate::cli::main`].

pub mod cli;
pub mod core;
pub mod mcp;
