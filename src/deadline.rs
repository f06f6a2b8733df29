//! Read/write deadlines for byte streams.
//!
//! A [`Deadlines`] handle is shared between a stream and any number of
//! clones. Changing a deadline wakes the task currently blocked in the
//! matching direction so the new value applies to the call in progress.

use futures::task::AtomicWaker;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Instant;
use tokio::time::Sleep;

#[derive(Debug, Default)]
struct Deadline {
    slot: Mutex<Slot>,
    waker: AtomicWaker,
}

#[derive(Debug, Default, Clone, Copy)]
struct Slot {
    at: Option<Instant>,
    generation: u64,
}

impl Deadline {
    fn set(&self, at: Option<Instant>) {
        {
            let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
            slot.at = at;
            slot.generation = slot.generation.wrapping_add(1);
        }
        self.waker.wake();
    }

    fn get(&self) -> Slot {
        *self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Shared read and write deadlines. `None` disables a timeout.
#[derive(Clone, Debug, Default)]
pub struct Deadlines {
    read: Arc<Deadline>,
    write: Arc<Deadline>,
}

impl Deadlines {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set both deadlines.
    pub fn set_deadline(&self, at: Option<Instant>) {
        self.read.set(at);
        self.write.set(at);
    }

    pub fn set_read_deadline(&self, at: Option<Instant>) {
        self.read.set(at);
    }

    pub fn set_write_deadline(&self, at: Option<Instant>) {
        self.write.set(at);
    }

    pub fn read_deadline(&self) -> Option<Instant> {
        self.read.get().at
    }

    pub fn write_deadline(&self) -> Option<Instant> {
        self.write.get().at
    }
}

/// Timer state owned by the polling side of one direction.
#[derive(Debug, Default)]
pub(crate) struct DeadlineTimer {
    sleep: Option<Pin<Box<Sleep>>>,
    generation: u64,
}

impl DeadlineTimer {
    /// `Ready` once the deadline has passed. Registers `cx` so that both
    /// expiry and a deadline change wake the caller.
    fn poll_expired(&mut self, deadline: &Deadline, cx: &mut Context<'_>) -> Poll<()> {
        deadline.waker.register(cx.waker());
        let slot = deadline.get();
        if slot.generation != self.generation {
            self.sleep = None;
            self.generation = slot.generation;
        }
        let Some(at) = slot.at else {
            return Poll::Pending;
        };
        let sleep = self
            .sleep
            .get_or_insert_with(|| Box::pin(tokio::time::sleep_until(at.into())));
        sleep.as_mut().poll(cx)
    }

    /// `Ready` with a `TimedOut` error once the read deadline has passed.
    pub(crate) fn poll_read(&mut self, deadlines: &Deadlines, cx: &mut Context<'_>) -> Poll<io::Error> {
        self.poll_expired(&deadlines.read, cx)
            .map(|()| io::Error::new(io::ErrorKind::TimedOut, "read deadline exceeded"))
    }

    /// `Ready` with a `TimedOut` error once the write deadline has passed.
    pub(crate) fn poll_write(&mut self, deadlines: &Deadlines, cx: &mut Context<'_>) -> Poll<io::Error> {
        self.poll_expired(&deadlines.write, cx)
            .map(|()| io::Error::new(io::ErrorKind::TimedOut, "write deadline exceeded"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::poll_fn;
    use std::time::Duration;

    #[tokio::test]
    async fn test_no_deadline_never_expires() {
        let deadlines = Deadlines::new();
        let mut timer = DeadlineTimer::default();
        let result = tokio::time::timeout(
            Duration::from_millis(50),
            poll_fn(|cx| timer.poll_read(&deadlines, cx)),
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_past_deadline_expires_immediately() {
        let deadlines = Deadlines::new();
        deadlines.set_read_deadline(Some(Instant::now()));
        let mut timer = DeadlineTimer::default();
        let err = poll_fn(|cx| timer.poll_read(&deadlines, cx)).await;
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn test_deadline_change_applies_to_pending_wait() {
        let deadlines = Deadlines::new();
        deadlines.set_write_deadline(Some(Instant::now() + Duration::from_secs(60)));

        let waiter = tokio::spawn({
            let deadlines = deadlines.clone();
            async move {
                let mut timer = DeadlineTimer::default();
                poll_fn(|cx| timer.poll_write(&deadlines, cx)).await
            }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        deadlines.set_write_deadline(Some(Instant::now() + Duration::from_millis(10)));

        let err = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("shortened deadline should fire")
            .unwrap();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn test_set_deadline_sets_both() {
        let deadlines = Deadlines::new();
        let at = Instant::now();
        deadlines.set_deadline(Some(at));
        assert_eq!(deadlines.read_deadline(), Some(at));
        assert_eq!(deadlines.write_deadline(), Some(at));

        deadlines.set_read_deadline(None);
        assert_eq!(deadlines.read_deadline(), None);
        assert_eq!(deadlines.write_deadline(), Some(at));
    }
}
