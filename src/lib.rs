//! # request-piper
//!
//! Forward method calls from a single-threaded dispatch loop to a worker
//! thread, and deliver the answers back on the dispatch thread.
//!
//! The dispatch thread owns the connection. A [`RequestPiper`] swaps the
//! connection's handlers for a forwarding stub that queues each call for the
//! worker and tells the framework to answer later. The worker runs the real
//! handler and queues the answer; the dispatch thread picks it up when the
//! response pipe turns readable and completes the call. Handlers may defer
//! again to a third thread, and may emit signals from anywhere.
//!
//! ## Architecture
//!
//! - **Transport** ([`transport::Pipe`]): length-framed self-pipe used only
//!   to wake the other side
//! - **Queues** ([`piper::PipeQueue`]): FIFO state that travels with the frames
//! - **Tags** ([`piper::Tag`]): single-owner tickets correlating a call with
//!   its answer
//! - **Bus** ([`bus`]): a small in-process event loop and connection the
//!   piper plugs into
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use request_piper::bus::{Connection, Dispatcher};
//! use request_piper::handler::MethodTable;
//! use request_piper::piper::{PiperContext, RequestPiper};
//!
//! let dispatcher = Dispatcher::new();
//! let (connection, client) = Connection::open(&dispatcher);
//!
//! let mut table = MethodTable::new();
//! table.register("Hello", |(name,): (String,), _ctx| Ok(format!("Hello {}!", name)));
//!
//! let context = PiperContext::new(Arc::new(table.clone()), connection.clone(), connection.clone());
//! let piper = RequestPiper::new(context)?;
//! connection.export(piper.redirect(&table));
//! piper.start_pipe(&dispatcher);
//!
//! let worker = piper.clone();
//! std::thread::spawn(move || worker.worker_thread());
//! std::thread::spawn(move || {
//!     let reply = client.call("Hello", &("world",)).unwrap();
//!     assert_eq!(reply.into_result::<String>().unwrap(), "Hello world!");
//! });
//!
//! dispatcher.enter()?;
//! ```

pub mod bus;
pub mod capability;
pub mod codec;
pub mod error;
pub mod handler;
pub mod piper;
pub mod protocol;
pub mod transport;

pub use error::{PiperError, Result};
pub use piper::{ForwardMode, PiperBuilder, PiperConfig, PiperContext, RequestPiper};
