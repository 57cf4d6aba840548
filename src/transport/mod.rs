//! Transport module - self-pipe notification channels.
//!
//! Provides [`Pipe`], a length-framed OS pipe used to wake a polling thread
//! and to carry small correlation payloads (tags) between threads.

mod pipe;

pub use pipe::{Pipe, DEFAULT_MAX_FRAME_SIZE, LEN_PREFIX_SIZE};
