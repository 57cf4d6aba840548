//! Caller side of the bus.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::error::{PiperError, Result};
use crate::protocol::{CallMessage, Message, Serial, SignalMessage};

/// A call on its way to the connection, with the channel for its answer.
pub(crate) struct Envelope {
    pub(crate) call: CallMessage,
    pub(crate) reply: oneshot::Sender<Message>,
}

/// Thread-safe handle for calling methods on a [`Connection`](super::Connection).
///
/// Calls block the calling thread until the answer arrives, so never call
/// from the dispatch thread or from inside an async runtime.
#[derive(Clone)]
pub struct BusClient {
    calls: mpsc::UnboundedSender<Envelope>,
    signals: broadcast::Sender<SignalMessage>,
    serial: Arc<AtomicU32>,
}

impl BusClient {
    pub(crate) fn new(
        calls: mpsc::UnboundedSender<Envelope>,
        signals: broadcast::Sender<SignalMessage>,
    ) -> Self {
        Self {
            calls,
            signals,
            serial: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Call `member` with `args` encoded as the body and wait for the answer.
    ///
    /// ```ignore
    /// let greeting: String = client.call("Hello", &("world",))?.into_result()?;
    /// ```
    pub fn call<T: Serialize + ?Sized>(&self, member: &str, args: &T) -> Result<Message> {
        self.call_message(CallMessage::with_args(member, args)?)
    }

    /// Send a prepared call and wait for the answer.
    ///
    /// The call gets a fresh serial; any serial already set is replaced.
    pub fn call_message(&self, call: CallMessage) -> Result<Message> {
        let call = call.with_serial(self.next_serial());
        let (reply, answer) = oneshot::channel();
        self.calls
            .send(Envelope { call, reply })
            .map_err(|_| PiperError::Disconnected)?;
        answer.blocking_recv().map_err(|_| PiperError::Disconnected)
    }

    /// Receive every signal emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SignalMessage> {
        self.signals.subscribe()
    }

    fn next_serial(&self) -> Serial {
        loop {
            let serial = self.serial.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if serial != 0 {
                return serial;
            }
        }
    }
}

impl std::fmt::Debug for BusClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusClient")
            .field("last_serial", &self.serial.load(Ordering::Relaxed))
            .finish()
    }
}
