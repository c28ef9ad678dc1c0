//! Tourgate Network Library
//!
//! TCP transport between guides' clients and the admission server.
//!
//! # Architecture
//!
//! - **Server**: Serves one event, one session loop per connection
//! - **Client**: A guide's connection, driven by a single worker task
//! - **Dispatcher**: Matches replies to pending tasks by correlation id
//! - **Protocol**: Length-prefixed JSON envelopes
//!
//! # Usage
//!
//! ```ignore
//! let server = Server::start(ServerConfig::from_event(&config), engine, accounts).await?;
//!
//! let mut client = Client::new(ClientConfig::new(server.addr()));
//! client.connect(|e| eprintln!("connect failed: {e}")).await?;
//! client.login("alice", "secret", || {}, |e| eprintln!("{e}")).await?;
//! client.add_ticket(room_id).await?;
//!
//! while let Some(event) = client.next_event().await {
//!     if let ClientEvent::GroupingProposed { correlation_id, proposal } = event {
//!         client.respond_grouping(correlation_id, &proposal, true).await?;
//!     }
//! }
//! ```

pub mod channel;
pub mod client;
pub mod dispatcher;
pub mod error;
mod frame;
pub mod protocol;
pub mod server;

pub use channel::{ChannelEvent, ConnectionChannel};
pub use client::{Client, ClientConfig, ClientEvent, ConnectionState, SessionContext};
pub use dispatcher::{Dispatched, Dispatcher, PendingTask, Resolution};
pub use error::{Error, Result};
pub use frame::MAX_FRAME_SIZE;
pub use protocol::{command, Envelope, Payload};
pub use server::{Server, ServerConfig};

/// Default port for Tourgate servers
pub use tourgate_core::config::DEFAULT_PORT;
