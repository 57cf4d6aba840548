//! Codec module - message body serialization.
//!
//! Call arguments, return values and signal payloads travel as MessagePack
//! bodies. [`MsgPackCodec`] is a marker struct with static methods, so the
//! codec is picked at compile time.
//!
//! # Example
//!
//! ```
//! use request_piper::codec::MsgPackCodec;
//!
//! let body = MsgPackCodec::encode_bytes(&("world",)).unwrap();
//! let (name,): (String,) = MsgPackCodec::decode(&body).unwrap();
//! assert_eq!(name, "world");
//! ```

mod msgpack;

pub use msgpack::MsgPackCodec;
