//! MCP search client over an event-stream session.
//!
//! Leaves first: [`frame`] parses the stream, [`session`] and [`handshake`]
//! bring a connection up, [`queue`] tracks outstanding searches, and
//! [`client`] ties them together behind [`SearchClient`].

pub mod backoff;
pub mod classify;
pub mod client;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod protocol;
pub mod queue;
pub mod session;
pub mod transport;

pub use client::{ClientStatus, ConnectionState, SearchClient};
pub use error::SearchError;
pub use protocol::SearchOptions;
