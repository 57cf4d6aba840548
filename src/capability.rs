//! Capabilities the piper needs from the surrounding framework.
//!
//! The framework implements these and hands them to the piper through a
//! [`PiperContext`](crate::piper::PiperContext); nothing is inherited and no
//! global dispatcher or connection is consulted.

use std::sync::Arc;

use crate::error::Result;
use crate::handler::Method;
use crate::piper::TagId;
use crate::protocol::{CallMessage, Message, SignalMessage};

/// Resolves a member name to its handler.
pub trait MethodLookup: Send + Sync {
    /// `None` means "unknown method".
    fn lookup(&self, member: &str) -> Option<Arc<dyn Method>>;
}

/// Generic completion primitive of the framework.
///
/// Only ever called on the dispatch thread.
pub trait CompletionSink: Send + Sync {
    /// Suspend `call`; it will be answered later through `tag`.
    fn answer_later(&self, tag: TagId, call: CallMessage);

    /// Answer the call suspended under `tag`.
    ///
    /// Fails with [`PiperError::UnknownTag`](crate::PiperError::UnknownTag) if
    /// nothing is suspended under it.
    fn answer_now(&self, tag: TagId, reply: Message) -> Result<()>;
}

/// Outbound signal emission.
pub trait SignalSink: Send + Sync {
    fn emit_signal(&self, signal: SignalMessage) -> Result<()>;
}
