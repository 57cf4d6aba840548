//! Single-threaded event loop.
//!
//! [`Dispatcher::enter`] turns the calling thread into the dispatch thread:
//! it runs a current-thread tokio runtime until [`Dispatcher::leave`] is
//! called. Watches can be added from any thread, before or after entering;
//! their callbacks always run on the dispatch thread.

use std::collections::HashMap;
use std::future::Future;
use std::os::fd::{AsRawFd, RawFd};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::sync::mpsc;

use crate::error::{PiperError, Result};
use crate::transport::Pipe;

/// Identifies a watch registered with a [`Dispatcher`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchId(u64);

type WatchTask = Pin<Box<dyn Future<Output = ()> + Send>>;

enum Command {
    Watch { id: WatchId, task: WatchTask },
    Unwatch(WatchId),
    Leave,
}

struct Inner {
    commands_tx: mpsc::UnboundedSender<Command>,
    /// Taken while the loop runs.
    commands_rx: Mutex<Option<mpsc::UnboundedReceiver<Command>>>,
    thread: Mutex<Option<ThreadId>>,
    next_id: AtomicU64,
}

/// Handle to the event loop. Cheap to clone.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    pub fn new() -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                commands_tx,
                commands_rx: Mutex::new(Some(commands_rx)),
                thread: Mutex::new(None),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Run the event loop on the calling thread until [`leave`](Self::leave).
    ///
    /// Leaving drops every watch.
    pub fn enter(&self) -> Result<()> {
        let mut commands = self
            .inner
            .commands_rx
            .lock()
            .take()
            .ok_or_else(|| PiperError::Protocol("dispatcher is already running".into()))?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_io()
            .build()?;

        *self.inner.thread.lock() = Some(thread::current().id());
        tracing::debug!("dispatcher entered on {:?}", thread::current().id());

        runtime.block_on(async {
            let mut watches = HashMap::new();
            while let Some(command) = commands.recv().await {
                match command {
                    Command::Watch { id, task } => {
                        watches.insert(id, tokio::spawn(task));
                    }
                    Command::Unwatch(id) => {
                        if let Some(handle) = watches.remove(&id) {
                            handle.abort();
                        }
                    }
                    Command::Leave => break,
                }
            }
            for (_, handle) in watches.drain() {
                handle.abort();
            }
        });
        drop(runtime);

        *self.inner.thread.lock() = None;
        *self.inner.commands_rx.lock() = Some(commands);
        tracing::debug!("dispatcher left");
        Ok(())
    }

    /// Ask the loop to return from [`enter`](Self::enter).
    pub fn leave(&self) {
        self.send(Command::Leave);
    }

    /// Whether the calling thread is running this dispatcher's loop.
    pub fn is_dispatch_thread(&self) -> bool {
        self.thread_id() == Some(thread::current().id())
    }

    /// The thread running the loop, if it is running.
    pub fn thread_id(&self) -> Option<ThreadId> {
        *self.inner.thread.lock()
    }

    /// Call `handler` with every frame that arrives on `pipe`.
    ///
    /// The watch ends when the pipe reports end of file or is removed with
    /// [`del_pipe`](Self::del_pipe).
    pub fn add_pipe<F>(&self, pipe: Arc<Pipe>, handler: F) -> WatchId
    where
        F: FnMut(Bytes) + Send + 'static,
    {
        let id = self.next_id();
        self.send(Command::Watch {
            id,
            task: Box::pin(watch_pipe(pipe, handler)),
        });
        id
    }

    /// Remove a pipe watch.
    pub fn del_pipe(&self, id: WatchId) {
        self.remove_watch(id);
    }

    /// Call `handler` with every message received on `rx`.
    pub fn add_channel<T, F>(&self, mut rx: mpsc::UnboundedReceiver<T>, mut handler: F) -> WatchId
    where
        T: Send + 'static,
        F: FnMut(T) + Send + 'static,
    {
        let id = self.next_id();
        self.send(Command::Watch {
            id,
            task: Box::pin(async move {
                while let Some(message) = rx.recv().await {
                    handler(message);
                }
            }),
        });
        id
    }

    pub fn remove_watch(&self, id: WatchId) {
        self.send(Command::Unwatch(id));
    }

    fn next_id(&self) -> WatchId {
        WatchId(self.inner.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn send(&self, command: Command) {
        if self.inner.commands_tx.send(command).is_err() {
            tracing::error!("dispatcher command channel closed");
        }
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("thread", &*self.inner.thread.lock())
            .finish()
    }
}

struct PipeReader(Arc<Pipe>);

impl AsRawFd for PipeReader {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

async fn watch_pipe<F>(pipe: Arc<Pipe>, mut handler: F)
where
    F: FnMut(Bytes) + Send + 'static,
{
    let fd = match AsyncFd::with_interest(PipeReader(pipe.clone()), Interest::READABLE) {
        Ok(fd) => fd,
        Err(e) => {
            tracing::error!("cannot watch pipe fd {}: {}", pipe.as_raw_fd(), e);
            return;
        }
    };

    loop {
        let mut guard = match fd.readable().await {
            Ok(guard) => guard,
            Err(e) => {
                tracing::error!("pipe watch failed: {}", e);
                return;
            }
        };

        loop {
            match pipe.read() {
                Ok(Some(frame)) => handler(frame),
                Ok(None) => {
                    guard.clear_ready();
                    break;
                }
                Err(PiperError::Closed) => return,
                Err(e) => {
                    tracing::warn!("dropping unreadable frame: {}", e);
                    guard.clear_ready();
                    break;
                }
            }
        }
    }
}
