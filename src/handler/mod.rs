//! Handler module - method tables and per-call context.
//!
//! Provides:
//! - [`Method`] - a callable handler, `(call, context) -> Outcome | MethodError`
//! - [`MethodTable`] - maps member names to handlers
//! - [`CallContext`] - lets a handler emit signals or defer its answer
//!
//! # Example
//!
//! ```
//! use request_piper::handler::MethodTable;
//! use request_piper::protocol::MethodError;
//!
//! let mut table = MethodTable::new();
//!
//! table.register("Hello", |(name,): (String,), _ctx| {
//!     Ok(format!("Hello {}!", name))
//! });
//!
//! table.register("Sum", |(ints,): (Vec<i32>,), _ctx| -> Result<i32, MethodError> {
//!     Ok(ints.iter().sum())
//! });
//!
//! assert!(table.get("Hello").is_some());
//! ```

mod context;
mod registry;

pub use context::{CallContext, Completer, Deferral};
pub(crate) use context::ReplyRoute;
pub use registry::{Method, MethodResult, MethodTable, Outcome, TypedMethod};
