//! Call, return, error and signal messages.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::codec::MsgPackCodec;
use crate::error::Result;

/// Per-connection call serial number (0 = not yet assigned).
pub type Serial = u32;

/// Object path used when a call or signal does not name one.
pub const DEFAULT_OBJECT_PATH: &str = "/";

/// Well-known error identifiers.
pub mod error_names {
    /// Generic failure.
    pub const FAILED: &str = "org.freedesktop.DBus.Error.Failed";
    /// No handler registered under the called member name.
    pub const UNKNOWN_METHOD: &str = "org.freedesktop.DBus.Error.UnknownMethod";
    /// Arguments could not be decoded into the handler's parameter type.
    pub const INVALID_ARGS: &str = "org.freedesktop.DBus.Error.InvalidArgs";
    /// The call was accepted but nobody will ever answer it.
    pub const NO_REPLY: &str = "org.freedesktop.DBus.Error.NoReply";
    /// The connection went away.
    pub const DISCONNECTED: &str = "org.freedesktop.DBus.Error.Disconnected";
    /// A completion named a call that is not pending.
    pub const UNKNOWN_OBJECT: &str = "org.freedesktop.DBus.Error.UnknownObject";
}

/// Application error raised by a method handler.
///
/// Always turned into an [`ErrorMessage`] addressed to the caller; it never
/// crosses a thread boundary any other way.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{name}: {message}")]
pub struct MethodError {
    /// Symbolic error identifier, e.g. `org.example.Error.NotFound`.
    pub name: String,
    /// Human-readable description.
    pub message: String,
}

impl MethodError {
    /// Create an error with the given identifier and text.
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Generic failure.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(error_names::FAILED, message)
    }

    /// Arguments did not match what the handler expects.
    pub fn invalid_args(message: impl Into<String>) -> Self {
        Self::new(error_names::INVALID_ARGS, message)
    }

    /// Convert into an error response for `call`.
    pub fn into_message(self, call: &CallMessage) -> Message {
        Message::Error(ErrorMessage::new(call, self.name, self.message))
    }
}

/// An inbound method call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallMessage {
    serial: Serial,
    path: String,
    interface: Option<String>,
    member: String,
    body: Bytes,
}

impl CallMessage {
    /// Create a call to `member` on the default path with a pre-encoded body.
    pub fn new(member: impl Into<String>, body: Bytes) -> Self {
        Self {
            serial: 0,
            path: DEFAULT_OBJECT_PATH.to_string(),
            interface: None,
            member: member.into(),
            body,
        }
    }

    /// Create a call whose body is `args` encoded as MsgPack.
    pub fn with_args<T: Serialize + ?Sized>(member: impl Into<String>, args: &T) -> Result<Self> {
        Ok(Self::new(member, MsgPackCodec::encode_bytes(args)?))
    }

    /// Set the object path.
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    /// Set the interface name.
    pub fn interface(mut self, interface: impl Into<String>) -> Self {
        self.interface = Some(interface.into());
        self
    }

    /// Set the serial number.
    pub fn with_serial(mut self, serial: Serial) -> Self {
        self.serial = serial;
        self
    }

    #[inline]
    pub fn serial(&self) -> Serial {
        self.serial
    }

    #[inline]
    pub fn object_path(&self) -> &str {
        &self.path
    }

    #[inline]
    pub fn interface_name(&self) -> Option<&str> {
        self.interface.as_deref()
    }

    #[inline]
    pub fn member(&self) -> &str {
        &self.member
    }

    #[inline]
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Decode the call arguments.
    pub fn args<T: DeserializeOwned>(&self) -> Result<T> {
        MsgPackCodec::decode(&self.body)
    }
}

/// Successful answer to a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReturnMessage {
    reply_serial: Serial,
    body: Bytes,
}

impl ReturnMessage {
    /// Answer `call` with a pre-encoded body.
    pub fn new(call: &CallMessage, body: Bytes) -> Self {
        Self {
            reply_serial: call.serial(),
            body,
        }
    }

    /// Answer `call` with `value` encoded as MsgPack.
    pub fn with_value<T: Serialize + ?Sized>(call: &CallMessage, value: &T) -> Result<Self> {
        Ok(Self::new(call, MsgPackCodec::encode_bytes(value)?))
    }

    #[inline]
    pub fn reply_serial(&self) -> Serial {
        self.reply_serial
    }

    #[inline]
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Decode the returned value.
    pub fn value<T: DeserializeOwned>(&self) -> Result<T> {
        MsgPackCodec::decode(&self.body)
    }
}

/// Failed answer to a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorMessage {
    reply_serial: Serial,
    name: String,
    text: String,
}

impl ErrorMessage {
    /// Answer `call` with an error.
    pub fn new(call: &CallMessage, name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            reply_serial: call.serial(),
            name: name.into(),
            text: text.into(),
        }
    }

    #[inline]
    pub fn reply_serial(&self) -> Serial {
        self.reply_serial
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Recover the application error this message carries.
    pub fn to_method_error(&self) -> MethodError {
        MethodError::new(self.name.clone(), self.text.clone())
    }
}

/// Outbound signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalMessage {
    path: String,
    interface: Option<String>,
    member: String,
    body: Bytes,
}

impl SignalMessage {
    /// Create a signal on the default path with a pre-encoded body.
    pub fn new(member: impl Into<String>, body: Bytes) -> Self {
        Self {
            path: DEFAULT_OBJECT_PATH.to_string(),
            interface: None,
            member: member.into(),
            body,
        }
    }

    /// Create a signal whose body is `args` encoded as MsgPack.
    pub fn with_args<T: Serialize + ?Sized>(member: impl Into<String>, args: &T) -> Result<Self> {
        Ok(Self::new(member, MsgPackCodec::encode_bytes(args)?))
    }

    /// Set the object path.
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    /// Set the interface name.
    pub fn interface(mut self, interface: impl Into<String>) -> Self {
        self.interface = Some(interface.into());
        self
    }

    #[inline]
    pub fn object_path(&self) -> &str {
        &self.path
    }

    #[inline]
    pub fn interface_name(&self) -> Option<&str> {
        self.interface.as_deref()
    }

    #[inline]
    pub fn member(&self) -> &str {
        &self.member
    }

    #[inline]
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Decode the signal payload.
    pub fn args<T: DeserializeOwned>(&self) -> Result<T> {
        MsgPackCodec::decode(&self.body)
    }
}

/// Any message the framework moves around.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Call(CallMessage),
    Return(ReturnMessage),
    Error(ErrorMessage),
    Signal(SignalMessage),
}

impl Message {
    /// Serial of the call this message answers, if it is an answer.
    pub fn reply_serial(&self) -> Option<Serial> {
        match self {
            Message::Return(ret) => Some(ret.reply_serial),
            Message::Error(err) => Some(err.reply_serial),
            Message::Call(_) | Message::Signal(_) => None,
        }
    }

    /// Re-address an answer to a different call.
    ///
    /// Used when a nested completion answers the original caller rather than
    /// the inner request it was computed for. Non-answers are returned as is.
    pub fn with_reply_serial(mut self, serial: Serial) -> Self {
        match &mut self {
            Message::Return(ret) => ret.reply_serial = serial,
            Message::Error(err) => err.reply_serial = serial,
            Message::Call(_) | Message::Signal(_) => {}
        }
        self
    }

    /// Check if this is an error answer.
    #[inline]
    pub fn is_error(&self) -> bool {
        matches!(self, Message::Error(_))
    }

    /// Decode a return value, or surface the carried error.
    pub fn into_result<T: DeserializeOwned>(self) -> std::result::Result<T, MethodError> {
        match self {
            Message::Return(ret) => ret
                .value()
                .map_err(|e| MethodError::invalid_args(e.to_string())),
            Message::Error(err) => Err(MethodError::new(err.name, err.text)),
            Message::Call(call) => Err(MethodError::failed(format!(
                "expected an answer, got call to {}",
                call.member
            ))),
            Message::Signal(sig) => Err(MethodError::failed(format!(
                "expected an answer, got signal {}",
                sig.member
            ))),
        }
    }
}

impl From<ReturnMessage> for Message {
    fn from(ret: ReturnMessage) -> Self {
        Message::Return(ret)
    }
}

impl From<ErrorMessage> for Message {
    fn from(err: ErrorMessage) -> Self {
        Message::Error(err)
    }
}
