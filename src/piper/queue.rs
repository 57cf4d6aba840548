//! FIFO queues paired with pipe notifications.
//!
//! Each queue has its own mutex. A push and the frame announcing it happen
//! under that mutex, so a reader that sees the frame always finds the item,
//! and frames go out in the same order items went in.

use std::collections::VecDeque;

use parking_lot::Mutex;

use super::tag::Tag;
use crate::error::{PiperError, Result};
use crate::protocol::{CallMessage, Message, SignalMessage};

/// A call waiting for the worker.
#[derive(Debug)]
pub struct PendingCall {
    /// Copy of the inbound call.
    pub request: CallMessage,
    /// Ticket the dispatch thread will complete the call with.
    pub tag: Tag,
}

/// An answer waiting for the dispatch thread.
#[derive(Debug)]
pub struct PendingResponse {
    /// The request the answer was computed for.
    pub request: CallMessage,
    /// Return or error message.
    pub response: Message,
    /// Ticket announced by the accompanying pipe frame.
    pub tag: Tag,
}

/// A signal emitted off the dispatch thread.
#[derive(Debug)]
pub struct PendingSignal {
    pub signal: SignalMessage,
}

/// Mutex-guarded FIFO whose pushes are announced on a pipe.
#[derive(Debug)]
pub struct PipeQueue<T> {
    items: Mutex<VecDeque<T>>,
}

impl<T> PipeQueue<T> {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
        }
    }

    /// Notify and push `item` as one step under the queue lock.
    ///
    /// The frame is written first and the item pushed before the lock is
    /// released. Readers pop under the same lock, so a reader woken by the
    /// frame blocks until the push is done and always finds the item. If
    /// `notify` fails the item is never queued and comes back with the
    /// error, so the queue never holds an item no frame announces.
    pub fn push_and_notify<F>(&self, item: T, notify: F) -> std::result::Result<(), (T, PiperError)>
    where
        F: FnOnce() -> Result<()>,
    {
        let mut items = self.items.lock();
        if let Err(e) = notify() {
            return Err((item, e));
        }
        items.push_back(item);
        Ok(())
    }

    /// Take the oldest item.
    pub fn pop(&self) -> Option<T> {
        self.items.lock().pop_front()
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}

impl<T> Default for PipeQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let queue = PipeQueue::new();
        for i in 0..5 {
            queue.push_and_notify(i, || Ok(())).unwrap();
        }
        let drained: Vec<i32> = std::iter::from_fn(|| queue.pop()).collect();
        assert_eq!(drained, vec![0, 1, 2, 3, 4]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_failed_notify_keeps_item_out() {
        let queue = PipeQueue::new();
        queue.push_and_notify("kept", || Ok(())).unwrap();

        let (item, err) = queue
            .push_and_notify("dropped", || Err(PiperError::Closed))
            .unwrap_err();
        assert_eq!(item, "dropped");
        assert!(matches!(err, PiperError::Closed));

        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop(), Some("kept"));
    }

    #[test]
    fn test_reader_woken_by_frame_finds_item() {
        use crate::transport::Pipe;
        use std::sync::Arc;

        let queue = Arc::new(PipeQueue::new());
        let pipe = Arc::new(Pipe::new().unwrap());

        let reader = {
            let queue = queue.clone();
            let pipe = pipe.clone();
            std::thread::spawn(move || {
                (0..100)
                    .map(|_| {
                        pipe.read_blocking().unwrap();
                        queue.pop()
                    })
                    .collect::<Vec<_>>()
            })
        };

        for i in 0..100 {
            queue.push_and_notify(i, || pipe.signal()).unwrap();
        }
        assert_eq!(reader.join().unwrap(), (0..100).map(Some).collect::<Vec<_>>());
    }

    #[test]
    fn test_notify_runs_under_lock() {
        let queue = std::sync::Arc::new(PipeQueue::new());
        let watched = queue.clone();
        queue
            .push_and_notify(1, || {
                assert!(watched.items.try_lock().is_none());
                Ok(())
            })
            .unwrap();
        assert_eq!(queue.len(), 1);
    }
}
