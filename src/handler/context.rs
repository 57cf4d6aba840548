//! Call context for handlers.
//!
//! Provides what a handler may do besides returning a value:
//! - `emit_signal` / `emit` - send a signal (safe from any thread)
//! - `defer` - finish the call later, from another actor
//!
//! # Deferred completion
//!
//! ```ignore
//! table.register_raw("Slow", |call, ctx| {
//!     let (deferral, completer) = ctx.defer().map_err(|e| MethodError::failed(e.to_string()))?;
//!     std::thread::spawn(move || {
//!         let _ = completer.complete_with(&"done");
//!     });
//!     Ok(Outcome::Defer(deferral))
//! });
//! ```
//!
//! The [`Deferral`] goes back to whoever invoked the handler, which registers
//! it and then marks it registered. The [`Completer`] goes to the actor that
//! will finish the work. If that actor finishes before registration, its
//! answer is parked and sent the moment registration happens, so a completion
//! can never get ahead of its registration.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use crate::capability::SignalSink;
use crate::error::{PiperError, Result};
use crate::piper::queue::PendingResponse;
use crate::piper::{Tag, TagId};
use crate::protocol::{error_names, CallMessage, ErrorMessage, Message, MethodError, ReturnMessage, SignalMessage};

/// Where a deferred answer goes once it is ready.
pub(crate) trait ReplyRoute: Send + Sync {
    /// Mint the inner tag of a new deferral.
    fn mint(&self) -> Tag;

    /// Hand a finished answer to the dispatch thread.
    fn complete(&self, response: PendingResponse);
}

/// Context passed to method handlers.
#[derive(Clone)]
pub struct CallContext {
    call: CallMessage,
    signals: Option<Arc<dyn SignalSink>>,
    route: Option<Arc<dyn ReplyRoute>>,
}

impl CallContext {
    /// Create a context for `call` whose signals go to `signals`.
    ///
    /// Such a context cannot defer.
    pub fn new(call: &CallMessage, signals: Arc<dyn SignalSink>) -> Self {
        Self {
            call: call.clone(),
            signals: Some(signals),
            route: None,
        }
    }

    /// Create a context with no signal sink and no deferral support (for testing).
    pub fn detached(call: &CallMessage) -> Self {
        Self {
            call: call.clone(),
            signals: None,
            route: None,
        }
    }

    pub(crate) fn with_route(
        call: &CallMessage,
        signals: Arc<dyn SignalSink>,
        route: Arc<dyn ReplyRoute>,
    ) -> Self {
        Self {
            call: call.clone(),
            signals: Some(signals),
            route: Some(route),
        }
    }

    /// The call being handled.
    #[inline]
    pub fn call(&self) -> &CallMessage {
        &self.call
    }

    /// Whether [`defer`](Self::defer) is available.
    #[inline]
    pub fn can_defer(&self) -> bool {
        self.route.is_some()
    }

    /// Emit a signal.
    pub fn emit_signal(&self, signal: SignalMessage) -> Result<()> {
        match &self.signals {
            Some(sink) => sink.emit_signal(signal),
            None => Err(PiperError::Disconnected),
        }
    }

    /// Emit a signal whose body is `args` encoded as MsgPack.
    pub fn emit<T: Serialize + ?Sized>(&self, member: &str, args: &T) -> Result<()> {
        let mut signal = SignalMessage::with_args(member, args)?.path(self.call.object_path());
        if let Some(interface) = self.call.interface_name() {
            signal = signal.interface(interface);
        }
        self.emit_signal(signal)
    }

    /// Ask to finish this call later.
    ///
    /// Return the [`Deferral`] from the handler as `Outcome::Defer` and give
    /// the [`Completer`] to whoever finishes the work.
    pub fn defer(&self) -> Result<(Deferral, Completer)> {
        let route = self.route.clone().ok_or(PiperError::DeferUnsupported)?;
        let tag = route.mint();
        let rendezvous = Arc::new(Rendezvous {
            state: Mutex::new(State::Unregistered),
            route,
        });

        let deferral = Deferral {
            id: tag.id(),
            rendezvous: Some(rendezvous.clone()),
        };
        let completer = Completer {
            pending: Some((self.call.clone(), tag)),
            rendezvous,
        };
        Ok((deferral, completer))
    }
}

impl fmt::Debug for CallContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallContext")
            .field("member", &self.call.member())
            .field("serial", &self.call.serial())
            .field("can_defer", &self.can_defer())
            .finish()
    }
}

enum State {
    Unregistered,
    Registered,
    /// Completed before registration; sent once registered.
    Parked(PendingResponse),
    Done,
    Abandoned,
}

struct Rendezvous {
    state: Mutex<State>,
    route: Arc<dyn ReplyRoute>,
}

impl Rendezvous {
    fn register(&self) {
        let parked = {
            let mut state = self.state.lock();
            match std::mem::replace(&mut *state, State::Done) {
                State::Unregistered => {
                    *state = State::Registered;
                    None
                }
                State::Parked(response) => Some(response),
                other => {
                    *state = other;
                    None
                }
            }
        };
        if let Some(response) = parked {
            self.route.complete(response);
        }
    }

    fn abandon(&self) {
        let mut state = self.state.lock();
        if let State::Parked(response) = std::mem::replace(&mut *state, State::Abandoned) {
            tracing::warn!(
                "deferral {} dropped before registration, discarding its answer",
                response.tag.id()
            );
        }
    }

    fn complete(&self, response: PendingResponse) -> Result<()> {
        let ready = {
            let mut state = self.state.lock();
            match std::mem::replace(&mut *state, State::Done) {
                State::Registered => Some(response),
                State::Unregistered => {
                    *state = State::Parked(response);
                    None
                }
                State::Abandoned => {
                    *state = State::Abandoned;
                    return Err(PiperError::Abandoned);
                }
                other => {
                    *state = other;
                    tracing::error!("deferred call {} completed twice", response.tag.id());
                    return Ok(());
                }
            }
        };
        if let Some(response) = ready {
            self.route.complete(response);
        }
        Ok(())
    }
}

/// Handle returned by a handler that will answer later.
///
/// Carries the tag the invoker must register the suspended call under.
#[must_use = "a Deferral must be returned as Outcome::Defer"]
pub struct Deferral {
    id: TagId,
    rendezvous: Option<Arc<Rendezvous>>,
}

impl Deferral {
    /// A deferral with no completer waiting on its registration.
    pub(crate) fn detached(id: TagId) -> Self {
        Self {
            id,
            rendezvous: None,
        }
    }

    /// Tag the suspended call must be registered under.
    #[inline]
    pub fn id(&self) -> TagId {
        self.id
    }

    /// Signal that the suspended call is registered and may be completed.
    pub fn registered(mut self) {
        if let Some(rendezvous) = self.rendezvous.take() {
            rendezvous.register();
        }
    }
}

impl fmt::Debug for Deferral {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Deferral").field(&self.id).finish()
    }
}

impl Drop for Deferral {
    fn drop(&mut self) {
        if let Some(rendezvous) = self.rendezvous.take() {
            rendezvous.abandon();
        }
    }
}

/// The finishing end of a deferred call.
///
/// Dropping it unfinished answers the call with `NoReply`.
pub struct Completer {
    pending: Option<(CallMessage, Tag)>,
    rendezvous: Arc<Rendezvous>,
}

impl Completer {
    /// Inner tag this completer answers.
    pub fn id(&self) -> Option<TagId> {
        self.pending.as_ref().map(|(_, tag)| tag.id())
    }

    /// Answer with a prepared message.
    pub fn complete(mut self, response: Message) -> Result<()> {
        self.finish(response)
    }

    /// Answer with `value` encoded as the return body.
    pub fn complete_with<R: Serialize + ?Sized>(mut self, value: &R) -> Result<()> {
        let response = match &self.pending {
            Some((request, _)) => match ReturnMessage::with_value(request, value) {
                Ok(ret) => ret.into(),
                Err(e) => MethodError::failed(e.to_string()).into_message(request),
            },
            None => return Ok(()),
        };
        self.finish(response)
    }

    /// Answer with an application error.
    pub fn fail(mut self, error: MethodError) -> Result<()> {
        let response = match &self.pending {
            Some((request, _)) => error.into_message(request),
            None => return Ok(()),
        };
        self.finish(response)
    }

    fn finish(&mut self, response: Message) -> Result<()> {
        let Some((request, tag)) = self.pending.take() else {
            return Ok(());
        };
        self.rendezvous.complete(PendingResponse {
            request,
            response,
            tag,
        })
    }
}

impl fmt::Debug for Completer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completer").field("id", &self.id()).finish()
    }
}

impl Drop for Completer {
    fn drop(&mut self) {
        let Some((request, _)) = &self.pending else {
            return;
        };
        let response = ErrorMessage::new(
            request,
            error_names::NO_REPLY,
            "deferred call dropped without an answer",
        );
        if let Err(e) = self.finish(response.into()) {
            tracing::debug!("unanswered deferral could not be failed: {}", e);
        }
    }
}
