//! Client engine for the Twin display-server protocol.
//!
//! # Overview
//!
//! This crate speaks the binary protocol of a Twin display server: it
//! opens and authenticates the connection, frames remote operation calls,
//! correlates their replies by serial, sorts asynchronous server messages
//! into their own queue, and dispatches them to registered listeners. An
//! optional zlib layer compresses the whole stream transparently once
//! negotiated.
//!
//! A [`Connection`] is shared by reference across threads; every remote
//! call is a plain blocking method that returns a `Result`.
//!
//! # Example
//!
//! ```no_run
//! use termlink::{Connection, Listener};
//!
//! fn main() -> Result<(), termlink::Error> {
//!     let conn = Connection::open(None)?;
//!     conn.add_listener(Listener::gadget(
//!         0x42,
//!         1,
//!         Box::new(|conn, _msg| conn.exit_main_loop()),
//!     ));
//!     conn.main_loop()
//! }
//! ```
//!
//! # Modules
//!
//! - [`connection`]: socket ownership, locking, handshake, compression.
//! - [`protocol`]: wire constants, frame building and scanning.
//! - [`queue`]: the growable byte queues everything flows through.
//! - [`event`]: decoded asynchronous message payloads.
//! - [`listener`]: the balanced dispatch registry.
//! - [`ops`]: remote operation descriptors and argument encoding.

pub mod connection;
pub mod error;
pub mod event;
pub mod listener;
pub mod ops;
pub mod protocol;
pub mod queue;

/// Version of this library, for logging next to
/// [`Connection::server_version`].
pub fn library_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

pub use connection::{AttachAnswer, Connection};
pub use error::Error;
pub use event::{Detail, Event, Msg, Selector, WidgetId};
pub use listener::{Handler, Listener, ListenerId};
pub use ops::{Arg, Op};
