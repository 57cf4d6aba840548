//! Minimal in-process message bus.
//!
//! Just enough framework to run a [`RequestPiper`](crate::piper::RequestPiper)
//! against:
//! - [`Dispatcher`] - single-threaded event loop with pipe and channel watches
//! - [`Connection`] - object adaptor and simulated wire; implements the
//!   completion and signal capabilities
//! - [`BusClient`] - thread-safe caller handle
//!
//! It is not a transport. Calls and answers never leave the process.

mod client;
mod connection;
mod dispatcher;

pub use client::BusClient;
pub use connection::Connection;
pub use dispatcher::{Dispatcher, WatchId};
