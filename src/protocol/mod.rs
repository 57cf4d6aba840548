//! Protocol module - message types exchanged with the framework.
//!
//! Marshalling onto a real wire is the framework's business; inside the
//! process a message is a small struct with a MessagePack body:
//! - [`CallMessage`] - an inbound method call
//! - [`ReturnMessage`] / [`ErrorMessage`] - the two kinds of answer
//! - [`SignalMessage`] - an outbound, unsolicited notification
//! - [`MethodError`] - an application error raised by a handler

mod message;

pub use message::{
    error_names, CallMessage, ErrorMessage, Message, MethodError, ReturnMessage, Serial,
    SignalMessage, DEFAULT_OBJECT_PATH,
};
