//! Cross-thread call forwarding.
//!
//! A [`RequestPiper`] lets a single-threaded dispatch loop hand inbound calls
//! to a worker thread and get the answers back, without the worker ever
//! touching the connection.
//!
//! ```text
//!  dispatch thread                          worker thread
//!  ───────────────                          ─────────────
//!  ForwardingStub ──push PendingCall──────▶ request queue
//!        │         └─wake frame──▶ request pipe ──▶ worker_thread()
//!        │                                            │ run handler
//!  answer_later(tag)                                  ▼
//!                                           response queue ◀─ PendingResponse
//!  dispatcher_pipe_handler ◀── tag frame ── response pipe
//!        │                                  signal queue ◀── PendingSignal
//!        ▼                                       (null tag frame)
//!  answer_now(tag) / emit_signal
//! ```
//!
//! Every queue push and the frame announcing it happen under the queue's
//! mutex, so frames and queue entries stay in lockstep and the dispatch
//! thread always pops the entry a frame announces.
//!
//! # Example
//!
//! ```ignore
//! let context = PiperContext::new(Arc::new(table.clone()), conn.clone(), conn.clone());
//! let piper = RequestPiper::builder(context).build()?;
//! conn.export(piper.redirect(&table));
//! piper.start_pipe(&dispatcher);
//!
//! let worker = piper.clone();
//! std::thread::spawn(move || worker.worker_thread());
//! dispatcher.enter()?;
//! ```

pub mod config;
pub mod continuation;
pub mod queue;
pub mod tag;

pub use config::{ForwardMode, PiperConfig};
pub use continuation::{ContinuationEntry, ContinuationTable};
pub use queue::{PendingCall, PendingResponse, PendingSignal, PipeQueue};
pub use tag::{Tag, TagArena, TagId, TAG_FRAME_SIZE};

use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};

use parking_lot::Mutex;

use crate::bus::{Dispatcher, WatchId};
use crate::capability::{CompletionSink, MethodLookup, SignalSink};
use crate::error::{PiperError, Result};
use crate::handler::{CallContext, Deferral, Method, MethodResult, MethodTable, Outcome, ReplyRoute};
use crate::protocol::{error_names, CallMessage, ErrorMessage, MethodError, SignalMessage};
use crate::transport::Pipe;

/// Everything the piper needs from the framework around it.
#[derive(Clone)]
pub struct PiperContext {
    methods: Arc<dyn MethodLookup>,
    completion: Arc<dyn CompletionSink>,
    signals: Arc<dyn SignalSink>,
    dispatch_thread: ThreadId,
}

impl PiperContext {
    /// Create a context whose dispatch thread is the calling thread.
    ///
    /// `methods` must resolve to the real handlers, not the forwarding stubs.
    pub fn new(
        methods: Arc<dyn MethodLookup>,
        completion: Arc<dyn CompletionSink>,
        signals: Arc<dyn SignalSink>,
    ) -> Self {
        Self {
            methods,
            completion,
            signals,
            dispatch_thread: thread::current().id(),
        }
    }

    /// Use `id` as the dispatch thread.
    pub fn with_dispatch_thread(mut self, id: ThreadId) -> Self {
        self.dispatch_thread = id;
        self
    }

    pub fn methods(&self) -> &Arc<dyn MethodLookup> {
        &self.methods
    }

    pub fn completion(&self) -> &Arc<dyn CompletionSink> {
        &self.completion
    }

    pub fn signals(&self) -> &Arc<dyn SignalSink> {
        &self.signals
    }

    /// The only thread allowed to complete calls and emit signals.
    pub fn dispatch_thread(&self) -> ThreadId {
        self.dispatch_thread
    }

    fn on_dispatch_thread(&self) -> bool {
        thread::current().id() == self.dispatch_thread
    }
}

impl std::fmt::Debug for PiperContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PiperContext")
            .field("dispatch_thread", &self.dispatch_thread)
            .finish_non_exhaustive()
    }
}

/// Builder for a [`RequestPiper`].
#[derive(Debug)]
pub struct PiperBuilder {
    context: PiperContext,
    config: PiperConfig,
}

impl PiperBuilder {
    /// Set where forwarded calls run.
    pub fn forward_mode(mut self, mode: ForwardMode) -> Self {
        self.config.forward_mode = mode;
        self
    }

    /// Set the largest frame the piper's pipes accept.
    pub fn max_frame_size(mut self, size: u32) -> Self {
        self.config.max_frame_size = size;
        self
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: PiperConfig) -> Self {
        self.config = config;
        self
    }

    /// Open the pipes and build the piper.
    ///
    /// Fails if the configuration is invalid or a pipe cannot be created.
    pub fn build(self) -> Result<RequestPiper> {
        self.config.validate()?;
        let request_pipe = Pipe::with_max_payload(self.config.max_frame_size)?;
        let response_pipe = Arc::new(Pipe::with_max_payload(self.config.max_frame_size)?);

        tracing::debug!("request piper built ({:?} mode)", self.config.forward_mode);

        Ok(RequestPiper {
            shared: Arc::new(Shared {
                context: self.context,
                config: self.config,
                tags: TagArena::new(),
                requests: PipeQueue::new(),
                responses: PipeQueue::new(),
                signals: PipeQueue::new(),
                continuations: ContinuationTable::new(),
                request_pipe,
                response_pipe,
                watch: Mutex::new(None),
                thread_mismatch_logged: AtomicBool::new(false),
            }),
        })
    }
}

struct Shared {
    context: PiperContext,
    config: PiperConfig,
    tags: TagArena,
    requests: PipeQueue<PendingCall>,
    responses: PipeQueue<PendingResponse>,
    signals: PipeQueue<PendingSignal>,
    continuations: ContinuationTable,
    /// Dispatch thread -> worker. Zero-length wake frames.
    request_pipe: Pipe,
    /// Worker -> dispatch thread. One tag frame per response or signal.
    response_pipe: Arc<Pipe>,
    watch: Mutex<Option<(WatchId, Dispatcher)>>,
    thread_mismatch_logged: AtomicBool,
}

impl Shared {
    /// The running dispatcher decides; the context's thread is the fallback
    /// before the loop is entered.
    fn on_dispatch_thread(&self) -> bool {
        let running = self
            .watch
            .lock()
            .as_ref()
            .and_then(|(_, dispatcher)| dispatcher.thread_id());
        match running {
            Some(id) => id == thread::current().id(),
            None => self.context.on_dispatch_thread(),
        }
    }

    fn check_dispatch_thread(&self) {
        if !self.context.on_dispatch_thread()
            && !self.thread_mismatch_logged.swap(true, Ordering::Relaxed)
        {
            tracing::warn!(
                "dispatcher runs on {:?} but the piper context names {:?}",
                thread::current().id(),
                self.context.dispatch_thread()
            );
        }
    }

    /// Answer every queued call with `DISCONNECTED`.
    fn drain_requests(&self) -> usize {
        let mut drained = 0;
        while let Some(PendingCall { request, tag }) = self.requests.pop() {
            let response = ErrorMessage::new(
                &request,
                error_names::DISCONNECTED,
                "Request piper stopped",
            );
            self.deliver(PendingResponse {
                request,
                response: response.into(),
                tag,
            });
            drained += 1;
        }
        drained
    }

    fn invoke(self: &Arc<Self>, call: &CallMessage) -> MethodResult {
        let Some(method) = self.context.methods.lookup(call.member()) else {
            tracing::debug!("no handler for forwarded call {}", call.member());
            return Err(MethodError::new(
                error_names::UNKNOWN_METHOD,
                format!("No such method '{}'", call.member()),
            ));
        };
        let ctx = CallContext::with_route(call, self.clone(), self.clone());
        method.call(call, &ctx)
    }

    fn forward(self: &Arc<Self>, call: &CallMessage) -> MethodResult {
        if self.config.forward_mode == ForwardMode::Inline && self.on_dispatch_thread() {
            return match self.invoke(call)? {
                Outcome::Defer(deferral) => {
                    let tag = self.tags.mint();
                    let id = tag.id();
                    self.continuations.insert(
                        deferral.id(),
                        ContinuationEntry {
                            request: call.clone(),
                            tag,
                        },
                    );
                    deferral.registered();
                    Ok(Outcome::Defer(Deferral::detached(id)))
                }
                complete => Ok(complete),
            };
        }

        if self.request_pipe.is_closed() {
            return Err(MethodError::new(
                error_names::DISCONNECTED,
                "Request piper is stopped",
            ));
        }

        let tag = self.tags.mint();
        let id = tag.id();
        let pending = PendingCall {
            request: call.clone(),
            tag,
        };
        match self
            .requests
            .push_and_notify(pending, || self.request_pipe.signal())
        {
            Ok(()) => Ok(Outcome::Defer(Deferral::detached(id))),
            Err((_, e)) => {
                tracing::error!("failed to queue call {}: {}", call.member(), e);
                Err(MethodError::failed(format!("Failed to queue call: {}", e)))
            }
        }
    }

    fn execute(self: &Arc<Self>, pending: PendingCall) {
        let PendingCall { request, tag } = pending;
        let response = match self.invoke(&request) {
            Ok(Outcome::Complete(response)) => response,
            Ok(Outcome::Defer(deferral)) => {
                self.continuations
                    .insert(deferral.id(), ContinuationEntry { request, tag });
                deferral.registered();
                return;
            }
            Err(e) => e.into_message(&request),
        };
        self.push_response(PendingResponse {
            request,
            response,
            tag,
        });
    }

    fn push_response(&self, response: PendingResponse) {
        let frame = response.tag.id().to_bytes();
        if let Err((response, e)) = self
            .responses
            .push_and_notify(response, || self.response_pipe.write(&frame))
        {
            tracing::error!(
                "dropping answer to {} ({}): {}",
                response.request.member(),
                response.tag.id(),
                e
            );
        }
    }

    fn deliver(&self, response: PendingResponse) {
        let PendingResponse {
            mut request,
            response,
            mut tag,
        } = response;

        while let Some(entry) = self.continuations.take(tag.id()) {
            request = entry.request;
            tag = entry.tag;
        }

        let completion = &self.context.completion;
        if let Err(e) = completion.answer_now(tag.id(), response) {
            tracing::error!("failed to answer {} ({}): {}", request.member(), tag.id(), e);
            let fallback = ErrorMessage::new(&request, e.name(), e.to_string());
            if let Err(e) = completion.answer_now(tag.id(), fallback.into()) {
                tracing::error!(
                    "failed to send error answer to {} ({}): {}",
                    request.member(),
                    tag.id(),
                    e
                );
            }
        }
    }

    fn handle_frame(&self, frame: &[u8]) {
        let Some(id) = TagId::from_bytes(frame) else {
            tracing::warn!("ignoring {}-byte frame on response pipe", frame.len());
            return;
        };

        if id.is_null() {
            match self.signals.pop() {
                Some(PendingSignal { signal }) => {
                    if let Err(e) = self.context.signals.emit_signal(signal) {
                        tracing::error!("failed to emit queued signal: {}", e);
                    }
                }
                None => tracing::error!("signal frame with empty signal queue"),
            }
            return;
        }

        let Some(response) = self.responses.pop() else {
            tracing::error!("response frame {} with empty response queue", id);
            return;
        };
        if response.tag.id() != id {
            tracing::error!(
                "response frame {} does not match queued response {}",
                id,
                response.tag.id()
            );
        }
        self.deliver(response);
    }
}

impl SignalSink for Shared {
    fn emit_signal(&self, signal: SignalMessage) -> Result<()> {
        if self.on_dispatch_thread() {
            return self.context.signals.emit_signal(signal);
        }
        let frame = TagId::NULL.to_bytes();
        self.signals
            .push_and_notify(PendingSignal { signal }, || self.response_pipe.write(&frame))
            .map_err(|(_, e)| e)
    }
}

impl ReplyRoute for Shared {
    fn mint(&self) -> Tag {
        self.tags.mint()
    }

    fn complete(&self, response: PendingResponse) {
        self.push_response(response);
    }
}

/// Forwards calls from the dispatch thread to a worker.
///
/// Cheap to clone; clones share the same queues and pipes.
#[derive(Clone)]
pub struct RequestPiper {
    shared: Arc<Shared>,
}

impl RequestPiper {
    /// Start building a piper around `context`.
    pub fn builder(context: PiperContext) -> PiperBuilder {
        PiperBuilder {
            context,
            config: PiperConfig::default(),
        }
    }

    /// Build a piper with the default configuration.
    pub fn new(context: PiperContext) -> Result<Self> {
        Self::builder(context).build()
    }

    pub fn context(&self) -> &PiperContext {
        &self.shared.context
    }

    pub fn config(&self) -> &PiperConfig {
        &self.shared.config
    }

    /// The stub handler that forwards any call to the worker.
    pub fn forwarding_stub(&self) -> Arc<dyn Method> {
        Arc::new(ForwardingStub {
            shared: Arc::downgrade(&self.shared),
        })
    }

    /// A copy of `table` with every method replaced by the forwarding stub.
    pub fn redirect(&self, table: &MethodTable) -> MethodTable {
        let stub = self.forwarding_stub();
        let mut redirected = MethodTable::new();
        for name in table.names() {
            redirected.insert(name, stub.clone());
        }
        redirected
    }

    /// A copy of `table` with only `names` replaced by the forwarding stub.
    pub fn redirect_methods(&self, table: &MethodTable, names: &[&str]) -> MethodTable {
        let stub = self.forwarding_stub();
        let mut redirected = table.clone();
        for &name in names {
            if redirected.insert(name, stub.clone()).is_none() {
                tracing::warn!("redirected method {} is not in the table", name);
            }
        }
        redirected
    }

    /// Forward `call` to the worker.
    ///
    /// This is what the forwarding stub runs; call it on the dispatch thread.
    pub fn forward(&self, call: &CallMessage) -> MethodResult {
        self.shared.forward(call)
    }

    /// Run calls until [`stop_pipe`](Self::stop_pipe) is called.
    ///
    /// Blocks the calling thread; meant to be the body of the worker thread.
    pub fn worker_thread(&self) -> Result<()> {
        tracing::debug!("worker thread started");
        loop {
            match self.shared.request_pipe.read_blocking() {
                Ok(_) if self.shared.request_pipe.is_closed() => break,
                Ok(_) => {
                    self.process_pipe_request();
                }
                Err(PiperError::Closed) => break,
                Err(e) => {
                    tracing::error!("worker failed to read request pipe: {}", e);
                    return Err(e);
                }
            }
        }
        tracing::debug!("worker thread stopped");
        Ok(())
    }

    /// Consume one wake frame and run the call it announces, if one is ready.
    ///
    /// Never blocks waiting for a frame. For workers driven by their own poll
    /// loop over [`request_read_fd`](Self::request_read_fd).
    pub fn check_pipe_request(&self) -> Result<bool> {
        match self.shared.request_pipe.read()? {
            Some(_) if self.shared.request_pipe.is_closed() => Ok(false),
            Some(_) => Ok(self.process_pipe_request()),
            None => Ok(false),
        }
    }

    /// Pop and run the oldest queued call. Returns `false` if there was none.
    pub fn process_pipe_request(&self) -> bool {
        match self.shared.requests.pop() {
            Some(pending) => {
                self.shared.execute(pending);
                true
            }
            None => false,
        }
    }

    /// Handle one frame from the response pipe. Dispatch thread only.
    pub fn dispatcher_pipe_handler(&self, frame: &[u8]) {
        self.shared.handle_frame(frame);
    }

    /// Watch the response pipe from `dispatcher`. Repeated calls are no-ops.
    ///
    /// From here on the thread running `dispatcher` is the dispatch thread,
    /// whatever the context says.
    pub fn start_pipe(&self, dispatcher: &Dispatcher) {
        let mut watch = self.shared.watch.lock();
        if watch.is_some() {
            return;
        }
        let shared = Arc::downgrade(&self.shared);
        let id = dispatcher.add_pipe(self.shared.response_pipe.clone(), move |frame| {
            if let Some(shared) = shared.upgrade() {
                shared.check_dispatch_thread();
                shared.handle_frame(&frame);
            }
        });
        *watch = Some((id, dispatcher.clone()));
    }

    /// Stop watching the response pipe and shut the request pipe.
    ///
    /// A blocked worker wakes up and returns. Calls still queued for the
    /// worker are answered with `DISCONNECTED`, and answers already on the
    /// response pipe are delivered. A call the worker is running at that
    /// moment is not answered. Call this on the dispatch thread or after the
    /// dispatcher has left. Repeated calls are no-ops.
    pub fn stop_pipe(&self, dispatcher: &Dispatcher) {
        if let Some((id, _)) = self.shared.watch.lock().take() {
            dispatcher.del_pipe(id);
        }
        if !self.shared.request_pipe.close() {
            return;
        }

        let drained = self.shared.drain_requests();
        loop {
            match self.shared.response_pipe.read() {
                Ok(Some(frame)) => self.shared.handle_frame(&frame),
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("failed to drain response pipe: {}", e);
                    break;
                }
            }
        }
        tracing::debug!("request piper stopped, {} queued calls disconnected", drained);
    }

    /// Read end of the request pipe, or `None` once stopped.
    pub fn request_read_fd(&self) -> Option<RawFd> {
        self.shared.request_pipe.raw_read_fd()
    }

    pub fn pending_requests(&self) -> usize {
        self.shared.requests.len()
    }

    pub fn pending_responses(&self) -> usize {
        self.shared.responses.len()
    }

    pub fn pending_signals(&self) -> usize {
        self.shared.signals.len()
    }

    pub fn continuation_count(&self) -> usize {
        self.shared.continuations.len()
    }

    pub fn contains_continuation(&self, inner: TagId) -> bool {
        self.shared.continuations.contains(inner)
    }

    /// Tags minted and not yet destroyed.
    pub fn live_tags(&self) -> usize {
        self.shared.tags.len()
    }
}

impl SignalSink for RequestPiper {
    /// Emit directly on the dispatch thread, otherwise queue and wake it.
    fn emit_signal(&self, signal: SignalMessage) -> Result<()> {
        self.shared.emit_signal(signal)
    }
}

impl std::fmt::Debug for RequestPiper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestPiper")
            .field("config", &self.shared.config)
            .field("pending_requests", &self.pending_requests())
            .field("pending_responses", &self.pending_responses())
            .field("continuations", &self.continuation_count())
            .finish()
    }
}

/// Handler that hands the call to the worker instead of running it.
struct ForwardingStub {
    shared: Weak<Shared>,
}

impl Method for ForwardingStub {
    fn call(&self, call: &CallMessage, _ctx: &CallContext) -> MethodResult {
        match self.shared.upgrade() {
            Some(shared) => shared.forward(call),
            None => Err(MethodError::new(
                error_names::DISCONNECTED,
                "Request piper is gone",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Message, ReturnMessage};
    use std::collections::HashMap;

    /// Completion sink that records answers by tag.
    #[derive(Default)]
    struct Recorder {
        suspended: Mutex<HashMap<TagId, CallMessage>>,
        answers: Mutex<Vec<(TagId, Message)>>,
        signals: Mutex<Vec<SignalMessage>>,
    }

    impl CompletionSink for Recorder {
        fn answer_later(&self, tag: TagId, call: CallMessage) {
            self.suspended.lock().insert(tag, call);
        }

        fn answer_now(&self, tag: TagId, reply: Message) -> Result<()> {
            let call = self
                .suspended
                .lock()
                .remove(&tag)
                .ok_or(PiperError::UnknownTag(tag))?;
            self.answers
                .lock()
                .push((tag, reply.with_reply_serial(call.serial())));
            Ok(())
        }
    }

    impl SignalSink for Recorder {
        fn emit_signal(&self, signal: SignalMessage) -> Result<()> {
            self.signals.lock().push(signal);
            Ok(())
        }
    }

    fn table() -> MethodTable {
        let mut table = MethodTable::new();
        table.register("Hello", |(name,): (String,), _ctx| {
            Ok(format!("Hello {}!", name))
        });
        table.register_raw("Later", |_call, ctx| {
            let (deferral, completer) = ctx
                .defer()
                .map_err(|e| MethodError::failed(e.to_string()))?;
            completer
                .complete_with(&"later")
                .map_err(|e| MethodError::failed(e.to_string()))?;
            Ok(Outcome::Defer(deferral))
        });
        table.register_raw("Shout", |call, ctx| {
            ctx.emit("Shouted", &()).map_err(|e| MethodError::failed(e.to_string()))?;
            Ok(Outcome::Complete(ReturnMessage::new(call, call.body().clone()).into()))
        });
        table
    }

    fn piper(mode: ForwardMode) -> (RequestPiper, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let context = PiperContext::new(Arc::new(table()), recorder.clone(), recorder.clone());
        let piper = RequestPiper::builder(context)
            .forward_mode(mode)
            .build()
            .unwrap();
        (piper, recorder)
    }

    /// What the framework does with a handler result.
    fn dispatch(piper: &RequestPiper, recorder: &Recorder, call: &CallMessage) -> Option<Message> {
        let stub = piper.forwarding_stub();
        let ctx = CallContext::detached(call);
        match stub.call(call, &ctx) {
            Ok(Outcome::Complete(reply)) => Some(reply),
            Ok(Outcome::Defer(deferral)) => {
                recorder.answer_later(deferral.id(), call.clone());
                deferral.registered();
                None
            }
            Err(e) => Some(e.into_message(call)),
        }
    }

    fn pump(piper: &RequestPiper) -> usize {
        let mut frames = 0;
        while let Some(frame) = piper.shared.response_pipe.read().unwrap() {
            piper.dispatcher_pipe_handler(&frame);
            frames += 1;
        }
        frames
    }

    #[test]
    fn test_forward_queues_and_defers() {
        let (piper, recorder) = piper(ForwardMode::Worker);
        let call = CallMessage::with_args("Hello", &("world",)).unwrap().with_serial(7);

        assert!(dispatch(&piper, &recorder, &call).is_none());
        assert_eq!(piper.pending_requests(), 1);
        assert_eq!(piper.live_tags(), 1);

        assert!(piper.check_pipe_request().unwrap());
        assert_eq!(piper.pending_requests(), 0);
        assert_eq!(piper.pending_responses(), 1);

        assert_eq!(pump(&piper), 1);
        let answers = recorder.answers.lock();
        assert_eq!(answers.len(), 1);
        assert_eq!(answers[0].1.reply_serial(), Some(7));
        assert_eq!(
            answers[0].1.clone().into_result::<String>().unwrap(),
            "Hello world!"
        );
        assert_eq!(piper.live_tags(), 0);
    }

    #[test]
    fn test_check_pipe_request_without_frame() {
        let (piper, _) = piper(ForwardMode::Worker);
        assert!(!piper.check_pipe_request().unwrap());
        assert!(!piper.process_pipe_request());
    }

    #[test]
    fn test_unknown_method_answers_error() {
        let (piper, recorder) = piper(ForwardMode::Worker);
        let call = CallMessage::with_args("Nope", &()).unwrap().with_serial(1);

        dispatch(&piper, &recorder, &call);
        piper.check_pipe_request().unwrap();
        pump(&piper);

        let answers = recorder.answers.lock();
        match &answers[0].1 {
            Message::Error(err) => assert_eq!(err.name(), error_names::UNKNOWN_METHOD),
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[test]
    fn test_nested_defer_resolves_continuation() {
        let (piper, recorder) = piper(ForwardMode::Worker);
        let call = CallMessage::with_args("Later", &()).unwrap().with_serial(3);

        dispatch(&piper, &recorder, &call);
        piper.check_pipe_request().unwrap();
        // The completer answered before registration; the answer was
        // parked and pushed once the continuation was registered.
        assert_eq!(piper.continuation_count(), 1);
        assert_eq!(piper.pending_responses(), 1);

        pump(&piper);
        assert_eq!(piper.continuation_count(), 0);
        assert_eq!(piper.live_tags(), 0);

        let answers = recorder.answers.lock();
        assert_eq!(answers[0].1.reply_serial(), Some(3));
        assert_eq!(answers[0].1.clone().into_result::<String>().unwrap(), "later");
    }

    #[test]
    fn test_inline_mode_answers_synchronously() {
        let (piper, recorder) = piper(ForwardMode::Inline);
        let call = CallMessage::with_args("Hello", &("inline",)).unwrap();

        let reply = dispatch(&piper, &recorder, &call).unwrap();
        assert_eq!(reply.into_result::<String>().unwrap(), "Hello inline!");
        assert_eq!(piper.pending_requests(), 0);
        assert_eq!(piper.live_tags(), 0);
    }

    #[test]
    fn test_inline_mode_nested_defer() {
        let (piper, recorder) = piper(ForwardMode::Inline);
        let call = CallMessage::with_args("Later", &()).unwrap().with_serial(9);

        assert!(dispatch(&piper, &recorder, &call).is_none());
        assert_eq!(piper.pending_requests(), 0);
        assert_eq!(piper.continuation_count(), 1);

        pump(&piper);
        assert_eq!(piper.continuation_count(), 0);
        assert_eq!(recorder.answers.lock()[0].1.reply_serial(), Some(9));
    }

    #[test]
    fn test_signal_on_dispatch_thread_is_direct() {
        let (piper, recorder) = piper(ForwardMode::Worker);
        piper.emit_signal(SignalMessage::new("Now", Default::default())).unwrap();

        assert_eq!(piper.pending_signals(), 0);
        assert_eq!(pump(&piper), 0);
        assert_eq!(recorder.signals.lock().len(), 1);
    }

    #[test]
    fn test_signal_from_worker_is_queued_once() {
        let (piper, recorder) = piper(ForwardMode::Worker);
        let call = CallMessage::with_args("Shout", &()).unwrap();
        dispatch(&piper, &recorder, &call);

        let worker = piper.clone();
        thread::spawn(move || worker.check_pipe_request().unwrap())
            .join()
            .unwrap();

        assert!(recorder.signals.lock().is_empty());
        assert_eq!(piper.pending_signals(), 1);
        assert_eq!(pump(&piper), 2);

        let signals = recorder.signals.lock();
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].member(), "Shouted");
        assert_eq!(recorder.answers.lock().len(), 1);
    }

    /// Completion sink that refuses return answers and accepts errors.
    #[derive(Default)]
    struct RejectReturns {
        answers: Mutex<Vec<Message>>,
    }

    impl CompletionSink for RejectReturns {
        fn answer_later(&self, _tag: TagId, _call: CallMessage) {}

        fn answer_now(&self, _tag: TagId, reply: Message) -> Result<()> {
            if matches!(reply, Message::Return(_)) {
                return Err(PiperError::WrongThread);
            }
            self.answers.lock().push(reply);
            Ok(())
        }
    }

    #[test]
    fn test_failed_answer_falls_back_to_error() {
        let sink = Arc::new(RejectReturns::default());
        let context = PiperContext::new(
            Arc::new(table()),
            sink.clone(),
            Arc::new(Recorder::default()),
        );
        let piper = RequestPiper::new(context).unwrap();
        let call = CallMessage::with_args("Hello", &("x",)).unwrap().with_serial(5);

        let _ = piper.forward(&call).unwrap();
        piper.check_pipe_request().unwrap();
        assert_eq!(pump(&piper), 1);

        let answers = sink.answers.lock();
        assert_eq!(answers.len(), 1);
        match &answers[0] {
            Message::Error(err) => {
                assert_eq!(err.reply_serial(), 5);
                assert_eq!(err.name(), PiperError::WrongThread.name());
                assert_eq!(err.text(), PiperError::WrongThread.to_string());
            }
            other => panic!("expected an error answer, got {:?}", other),
        }
        assert_eq!(piper.live_tags(), 0);
    }

    #[test]
    fn test_second_answer_failure_destroys_tag() {
        let (piper, recorder) = piper(ForwardMode::Worker);
        let call = CallMessage::with_args("Hello", &("x",)).unwrap();

        // Never suspended, so both the answer and the fallback fail.
        let _ = piper.forward(&call).unwrap();
        piper.check_pipe_request().unwrap();
        pump(&piper);

        assert!(recorder.answers.lock().is_empty());
        assert_eq!(piper.live_tags(), 0);
    }

    #[test]
    fn test_build_rejects_frame_size_below_tag() {
        let recorder = Arc::new(Recorder::default());
        let context = PiperContext::new(Arc::new(table()), recorder.clone(), recorder);
        let result = RequestPiper::builder(context)
            .max_frame_size(TAG_FRAME_SIZE as u32 - 1)
            .build();
        assert!(matches!(result, Err(PiperError::Protocol(_))));
    }

    #[test]
    fn test_stop_answers_queued_calls() {
        let (piper, recorder) = piper(ForwardMode::Worker);
        let queued = CallMessage::with_args("Hello", &("queued",)).unwrap().with_serial(1);
        let answered = CallMessage::with_args("Hello", &("answered",)).unwrap().with_serial(2);

        dispatch(&piper, &recorder, &answered);
        piper.check_pipe_request().unwrap();
        dispatch(&piper, &recorder, &queued);
        assert_eq!(piper.pending_requests(), 1);
        assert_eq!(piper.pending_responses(), 1);

        piper.stop_pipe(&Dispatcher::new());

        let answers = recorder.answers.lock();
        assert_eq!(answers.len(), 2);
        let (disconnected, _): (Vec<_>, Vec<_>) =
            answers.iter().partition(|(_, reply)| reply.is_error());
        assert_eq!(disconnected.len(), 1);
        assert_eq!(disconnected[0].1.reply_serial(), Some(1));
        assert_eq!(
            disconnected[0].1.clone().into_result::<()>().unwrap_err().name,
            error_names::DISCONNECTED
        );
        assert!(recorder.suspended.lock().is_empty());
        assert_eq!(piper.pending_requests(), 0);
        assert_eq!(piper.live_tags(), 0);
    }

    #[test]
    fn test_redirect_replaces_every_method() {
        let (piper, _) = piper(ForwardMode::Worker);
        let original = table();
        let redirected = piper.redirect(&original);
        assert_eq!(redirected.len(), original.len());

        let partial = piper.redirect_methods(&original, &["Hello"]);
        let call = CallMessage::with_args("Hello", &("x",)).unwrap();
        let ctx = CallContext::detached(&call);
        assert!(matches!(
            partial.get("Hello").unwrap().call(&call, &ctx),
            Ok(Outcome::Defer(_))
        ));
        assert!(matches!(
            partial.get("Shout").unwrap().call(&call, &ctx),
            Ok(Outcome::Complete(_))
        ));
    }

    #[test]
    fn test_ignores_malformed_frames() {
        let (piper, _) = piper(ForwardMode::Worker);
        piper.dispatcher_pipe_handler(&[1, 2, 3]);
        piper.dispatcher_pipe_handler(&TagId::NULL.to_bytes());
        assert_eq!(piper.pending_signals(), 0);
    }

    #[test]
    fn test_stub_outliving_piper() {
        let (piper, _) = piper(ForwardMode::Worker);
        let stub = piper.forwarding_stub();
        drop(piper);

        let call = CallMessage::with_args("Hello", &("x",)).unwrap();
        let ctx = CallContext::detached(&call);
        match stub.call(&call, &ctx) {
            Err(e) => assert_eq!(e.name, error_names::DISCONNECTED),
            Ok(_) => panic!("expected an error"),
        }
    }

    #[test]
    fn test_forward_after_stop_disconnects() {
        let (piper, recorder) = piper(ForwardMode::Worker);
        piper.stop_pipe(&Dispatcher::new());

        let call = CallMessage::with_args("Hello", &("late",)).unwrap().with_serial(8);
        let reply = dispatch(&piper, &recorder, &call).unwrap();
        assert_eq!(
            reply.into_result::<String>().unwrap_err().name,
            error_names::DISCONNECTED
        );
        assert_eq!(piper.pending_requests(), 0);
        assert_eq!(piper.live_tags(), 0);
    }
}
