//! Object adaptor and simulated wire.
//!
//! Inbound calls arrive from [`BusClient`]s over a channel watched by the
//! dispatcher, are dispatched through the exported [`MethodTable`], and their
//! answers travel back on per-call oneshot channels. Signals are broadcast to
//! subscribers.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc, oneshot};

use super::client::{BusClient, Envelope};
use super::dispatcher::Dispatcher;
use crate::capability::{CompletionSink, SignalSink};
use crate::error::{PiperError, Result};
use crate::handler::{CallContext, MethodTable, Outcome};
use crate::piper::TagId;
use crate::protocol::{error_names, CallMessage, ErrorMessage, Message, Serial, SignalMessage};

/// Capacity of the signal broadcast channel.
pub const SIGNAL_CAPACITY: usize = 1024;

/// The dispatch-thread side of the bus.
pub struct Connection {
    dispatcher: Dispatcher,
    methods: RwLock<MethodTable>,
    /// Calls answered later, by tag.
    suspended: Mutex<HashMap<TagId, CallMessage>>,
    /// Callers waiting for an answer, by call serial.
    waiting: Mutex<HashMap<Serial, oneshot::Sender<Message>>>,
    signals: broadcast::Sender<SignalMessage>,
}

impl Connection {
    /// Open a connection served by `dispatcher`, and a client talking to it.
    pub fn open(dispatcher: &Dispatcher) -> (Arc<Self>, BusClient) {
        let (calls_tx, calls_rx) = mpsc::unbounded_channel::<Envelope>();
        let (signals, _) = broadcast::channel(SIGNAL_CAPACITY);

        let connection = Arc::new(Self {
            dispatcher: dispatcher.clone(),
            methods: RwLock::new(MethodTable::new()),
            suspended: Mutex::new(HashMap::new()),
            waiting: Mutex::new(HashMap::new()),
            signals: signals.clone(),
        });

        let inbound = Arc::downgrade(&connection);
        dispatcher.add_channel(calls_rx, move |envelope: Envelope| {
            match inbound.upgrade() {
                Some(connection) => connection.receive(envelope),
                None => {
                    let reply = ErrorMessage::new(
                        &envelope.call,
                        error_names::DISCONNECTED,
                        "Connection is closed",
                    );
                    let _ = envelope.reply.send(reply.into());
                }
            }
        });

        (connection, BusClient::new(calls_tx, signals))
    }

    /// Serve calls from `table`, replacing whatever was exported before.
    pub fn export(&self, table: MethodTable) {
        tracing::debug!("exporting {:?}", table);
        *self.methods.write() = table;
    }

    /// A copy of the exported table.
    pub fn methods(&self) -> MethodTable {
        self.methods.read().clone()
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Number of calls waiting to be answered later.
    pub fn suspended_calls(&self) -> usize {
        self.suspended.lock().len()
    }

    fn receive(self: &Arc<Self>, envelope: Envelope) {
        let Envelope { call, reply } = envelope;
        self.waiting.lock().insert(call.serial(), reply);
        self.dispatch(call);
    }

    fn dispatch(self: &Arc<Self>, call: CallMessage) {
        let method = self.methods.read().get(call.member());
        let Some(method) = method else {
            tracing::debug!("unknown method {}", call.member());
            let reply = ErrorMessage::new(
                &call,
                error_names::UNKNOWN_METHOD,
                format!("No such method '{}'", call.member()),
            );
            self.send_reply(call.serial(), reply.into());
            return;
        };

        let ctx = CallContext::new(&call, self.clone());
        match method.call(&call, &ctx) {
            Ok(Outcome::Complete(reply)) => self.send_reply(call.serial(), reply),
            Ok(Outcome::Defer(deferral)) => {
                self.answer_later(deferral.id(), call);
                deferral.registered();
            }
            Err(e) => {
                tracing::debug!("{} failed: {}", call.member(), e);
                let reply = e.into_message(&call);
                self.send_reply(call.serial(), reply);
            }
        }
    }

    fn send_reply(&self, serial: Serial, reply: Message) {
        let Some(waiter) = self.waiting.lock().remove(&serial) else {
            tracing::warn!("no caller waiting for serial {}", serial);
            return;
        };
        if waiter.send(reply.with_reply_serial(serial)).is_err() {
            tracing::debug!("caller for serial {} went away", serial);
        }
    }
}

impl CompletionSink for Connection {
    fn answer_later(&self, tag: TagId, call: CallMessage) {
        if let Some(previous) = self.suspended.lock().insert(tag, call) {
            tracing::error!("tag {} reused while {} was suspended", tag, previous.member());
        }
    }

    fn answer_now(&self, tag: TagId, reply: Message) -> Result<()> {
        let call = self
            .suspended
            .lock()
            .remove(&tag)
            .ok_or(PiperError::UnknownTag(tag))?;
        self.send_reply(call.serial(), reply);
        Ok(())
    }
}

impl SignalSink for Connection {
    fn emit_signal(&self, signal: SignalMessage) -> Result<()> {
        if !self.dispatcher.is_dispatch_thread() {
            return Err(PiperError::WrongThread);
        }
        // No subscribers is not an error.
        let _ = self.signals.send(signal);
        Ok(())
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("methods", &*self.methods.read())
            .field("suspended", &self.suspended_calls())
            .finish()
    }
}
