//! A blocking single-producer, single-consumer rendezvous channel.
//!
//! The slot holds at most one value and `send` does not return until the
//! receiver has taken it, so both ends proceed in lockstep. Dropping either
//! end closes the channel; a close handle allows a third thread to close it
//! as well, which wakes any blocked party.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

pub fn connector<T: Send>() -> (Sender<T>, Receiver<T>) {
    let inner = Arc::new(Inner {
        state: Mutex::new(State {
            value: None,
            taken: 0,
            closed: false,
        }),
        send_cv: Condvar::new(),
        recv_cv: Condvar::new(),
    });
    (
        Sender {
            inner: Arc::clone(&inner),
        },
        Receiver { inner },
    )
}

struct State<T> {
    value: Option<T>,
    /// Number of completed handoffs. Senders watch this to learn that *their*
    /// value was taken, as opposed to the slot merely being empty again.
    taken: u64,
    closed: bool,
}

struct Inner<T> {
    state: Mutex<State<T>>,
    send_cv: Condvar,
    recv_cv: Condvar,
}

trait Closable {
    fn close(&self);
}

impl<T: Send> Closable for Inner<T> {
    fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.send_cv.notify_all();
        self.recv_cv.notify_all();
    }
}

/// Type-erased handle that closes the channel it was taken from.
#[derive(Clone)]
pub struct CloseHandle(Arc<dyn Closable + Send + Sync>);

impl CloseHandle {
    pub fn close(&self) {
        self.0.close();
    }
}

pub struct Sender<T> {
    inner: Arc<Inner<T>>,
}

pub struct Receiver<T> {
    inner: Arc<Inner<T>>,
}

/// The channel closed before the value could be handed over; the value is
/// given back.
#[derive(Debug)]
pub struct SendError<T>(pub T);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvError {
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvTimeoutError {
    Timeout,
    Closed,
}

impl<T: Send + 'static> Sender<T> {
    /// Blocks until the receiver has taken the value (a rendezvous), or until
    /// the channel is closed, in which case the value is handed back.
    pub fn send(&mut self, value: T) -> Result<(), SendError<T>> {
        let mut state = self.inner.state.lock();
        while state.value.is_some() && !state.closed {
            self.inner.send_cv.wait(&mut state);
        }
        if state.closed {
            return Err(SendError(value));
        }
        let generation = state.taken;
        state.value = Some(value);
        self.inner.recv_cv.notify_one();
        while state.taken == generation && !state.closed {
            self.inner.send_cv.wait(&mut state);
        }
        if state.taken == generation {
            // Closed before the receiver paired up; reclaim the value. If the
            // slot is already empty the receiver won the race and did take it.
            match state.value.take() {
                Some(value) => Err(SendError(value)),
                None => Ok(()),
            }
        } else {
            Ok(())
        }
    }

    pub fn close_handle(&self) -> CloseHandle {
        CloseHandle(Arc::clone(&self.inner) as _)
    }
}

impl<T: Send + 'static> Receiver<T> {
    /// Blocks until a value arrives. A value already in the slot is delivered
    /// even when the channel has been closed in the meantime.
    pub fn recv(&mut self) -> Result<T, RecvError> {
        let mut state = self.inner.state.lock();
        loop {
            if let Some(value) = state.value.take() {
                state.taken = state.taken.wrapping_add(1);
                self.inner.send_cv.notify_one();
                return Ok(value);
            }
            if state.closed {
                return Err(RecvError::Closed);
            }
            self.inner.recv_cv.wait(&mut state);
        }
    }

    pub fn recv_timeout(&mut self, timeout: Duration) -> Result<T, RecvTimeoutError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        loop {
            if let Some(value) = state.value.take() {
                state.taken = state.taken.wrapping_add(1);
                self.inner.send_cv.notify_one();
                return Ok(value);
            }
            if state.closed {
                return Err(RecvTimeoutError::Closed);
            }
            if self
                .inner
                .recv_cv
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return Err(RecvTimeoutError::Timeout);
            }
        }
    }

    pub fn close_handle(&self) -> CloseHandle {
        CloseHandle(Arc::clone(&self.inner) as _)
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        state.closed = true;
        self.inner.recv_cv.notify_all();
    }
}

impl<T> Drop for Receiver<T> {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        state.closed = true;
        self.inner.send_cv.notify_all();
    }
}
