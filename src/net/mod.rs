//! In-process network layer.
//!
//! # Data Flow
//! ```text
//! dial(target, timeout)
//!     → pipe.rs (new in-memory duplex pair)
//!     → listener.rs (server end queued on the handoff channel)
//!     → accept() (server end handed to the RPC serve loop)
//!     → connection.rs (lifecycle tracking until either end drops)
//!
//! Transport States:
//!     Open → Closed (idempotent, terminal)
//! ```
//!
//! # Design Decisions
//! - No OS sockets: both ends live in this process's memory
//! - Bounded handoff queue; a dial only succeeds once an accept has paired it
//! - Closing the transport discards queued ends instead of blocking

pub mod connection;
pub mod listener;
pub mod pipe;

pub use connection::{ConnectionGuard, ConnectionId, ConnectionTracker};
pub use listener::{listen, PipeAddr, PipeDialer, PipeListener, TransportError};
pub use pipe::{pipe, PipeSide, PipeStream};
