//! Cancellable one-shot timers backed by named threads.
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{RecvTimeoutError, Sender},
        Mutex,
    },
    time::Duration,
};

use rand::{thread_rng, Rng};

use crate::Result;

/// A one-shot timer running `action` on its own thread once the delay expires.
///
/// Dropping the handle cancels the timer.
#[derive(Debug)]
pub struct Timer {
    join_handle: std::thread::JoinHandle<()>,

    /// Used to send a cancel command to the timer thread.
    cancel_sender: Sender<()>,
}

impl Timer {
    pub fn schedule(
        name: &str,
        delay: Duration,
        action: impl FnOnce() + Send + 'static,
    ) -> Result<Timer> {
        let (cancel_sender, cancel_receiver) = std::sync::mpsc::channel::<()>();
        let join_handle = std::thread::Builder::new()
            .name(format!("attribution-{name}"))
            .spawn(move || match cancel_receiver.recv_timeout(delay) {
                Err(RecvTimeoutError::Timeout) => action(),
                // A cancel command or a dropped handle.
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    log::trace!(target: "attribution", "timer cancelled")
                }
            })?;
        Ok(Timer {
            join_handle,
            cancel_sender,
        })
    }

    /// Cancel the timer. Does nothing if it already fired.
    pub fn cancel(&self) {
        // Error means the timer thread already exited.
        let _ = self.cancel_sender.send(());
    }

    pub fn is_finished(&self) -> bool {
        self.join_handle.is_finished()
    }
}

/// Owner of every pending timer of a client.
#[derive(Debug, Default)]
pub struct Timers {
    timers: Mutex<Vec<Timer>>,
    cancelled: AtomicBool,
}

impl Timers {
    pub fn new() -> Timers {
        Timers::default()
    }

    /// Schedule `action` after `delay`. After [`Timers::cancel_all`] nothing is scheduled.
    pub fn schedule(
        &self,
        name: &str,
        delay: Duration,
        action: impl FnOnce() + Send + 'static,
    ) -> Result<()> {
        if self.cancelled.load(Ordering::Acquire) {
            return Ok(());
        }
        let timer = Timer::schedule(name, delay, action)?;
        let mut timers = self
            .timers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        timers.retain(|it| !it.is_finished());
        timers.push(timer);
        Ok(())
    }

    /// Cancel all pending timers and refuse new ones.
    pub fn cancel_all(&self) {
        self.cancelled.store(true, Ordering::Release);
        let timers = std::mem::take(
            &mut *self
                .timers
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        for timer in &timers {
            timer.cancel();
        }
        log::debug!(target: "attribution", count = timers.len(); "cancelled pending timers");
    }

    pub fn pending(&self) -> usize {
        self.timers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .filter(|it| !it.is_finished())
            .count()
    }
}

/// Apply a random jitter to `interval`.
pub(crate) fn jitter(interval: Duration, jitter: Duration) -> Duration {
    if jitter.is_zero() {
        return interval;
    }
    interval + thread_rng().gen_range(Duration::ZERO..jitter)
}
