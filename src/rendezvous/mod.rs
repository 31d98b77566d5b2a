//! A rendezvous channel: no buffer, every send awaits a matching receive.
//!
//! Producer and consumer handles are both cloneable. Elements are handed
//! from the oldest suspended producer to the oldest suspended consumer, and
//! each element is observed exactly once.

use std::convert::Infallible;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::poll_fn;
use futures::stream::{FusedStream, Stream};
use parking_lot::Mutex;

use crate::error::SendError;

mod machine;

use machine::{Machine, NextAction, PollSendAction, SendAction};

struct Shared<T, E> {
    machine: Mutex<Machine<T, E>>,
    producers: AtomicUsize,
    consumers: AtomicUsize,
}

/// Creates a rendezvous channel.
#[inline]
#[must_use]
pub fn channel<T>() -> (RendezvousProducer<T>, RendezvousConsumer<T>) {
    fallible()
}

/// Creates a rendezvous channel whose termination may carry a failure.
///
/// The failure is delivered to exactly one receive; subsequent receives
/// observe end-of-stream.
#[inline]
#[must_use]
pub fn fallible<T, E>() -> (RendezvousProducer<T, E>, RendezvousConsumer<T, E>) {
    let shared = Arc::new(Shared {
        machine: Mutex::new(Machine::new()),
        producers: AtomicUsize::new(1),
        consumers: AtomicUsize::new(1),
    });

    (
        RendezvousProducer {
            shared: shared.clone(),
        },
        RendezvousConsumer {
            shared,
            waiter: None,
            done: false,
        },
    )
}

/// The sending side of a rendezvous channel.
///
/// Dropping the last producer finishes the channel with no failure.
pub struct RendezvousProducer<T, E = Infallible> {
    shared: Arc<Shared<T, E>>,
}

impl<T, E> RendezvousProducer<T, E> {
    /// Sends an element, waiting until a consumer receives it.
    ///
    /// # Parameters
    /// * `element` - The element to send.
    ///
    /// # Returns
    /// `Ok(())` once the element has been accepted. If the channel finished
    /// before a consumer could take the element, the error hands it back.
    #[inline]
    pub fn send(&self, element: T) -> SendFuture<'_, T, E> {
        SendFuture {
            shared: &self.shared,
            element: Some(element),
            waiter: None,
        }
    }

    /// Terminates the channel. Suspended producers resume successfully and
    /// suspended consumers observe end-of-stream. Idempotent.
    pub fn finish(&self) {
        let action = self.shared.machine.lock().finish(None);

        for waker in action.wakers {
            waker.wake();
        }
    }

    /// Terminates the channel with a failure, delivered to exactly one
    /// subsequent or suspended receive.
    ///
    /// # Parameters
    /// * `failure` - The terminal failure value.
    pub fn fail(&self, failure: E) {
        let action = self.shared.machine.lock().finish(Some(failure));

        for waker in action.wakers {
            waker.wake();
        }
    }

    /// Gets whether the channel has terminated or not.
    #[inline]
    pub fn is_finished(&self) -> bool {
        self.shared.machine.lock().is_terminated()
    }
}

impl<T, E> Clone for RendezvousProducer<T, E> {
    #[inline]
    fn clone(&self) -> Self {
        self.shared.producers.fetch_add(1, Ordering::Relaxed);

        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T, E> Drop for RendezvousProducer<T, E> {
    fn drop(&mut self) {
        if self.shared.producers.fetch_sub(1, Ordering::AcqRel) == 1 {
            let action = self.shared.machine.lock().finish(None);

            for waker in action.wakers {
                waker.wake();
            }
        }
    }
}

impl<T, E> fmt::Debug for RendezvousProducer<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RendezvousProducer").finish_non_exhaustive()
    }
}

/// The future returned by [`RendezvousProducer::send`].
///
/// Dropping it before completion cancels the send; the element is not
/// delivered.
#[must_use = "futures do nothing unless polled"]
pub struct SendFuture<'a, T, E = Infallible> {
    shared: &'a Shared<T, E>,
    element: Option<T>,
    waiter: Option<u64>,
}

/// Safe: the future is not self-referential.
impl<T, E> Unpin for SendFuture<'_, T, E> {}

impl<'a, T, E> Future for SendFuture<'a, T, E> {
    type Output = Result<(), SendError<T>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;

        if let Some(id) = this.waiter {
            return match this.shared.machine.lock().poll_send(id, cx.waker()) {
                | PollSendAction::Pending => Poll::Pending,
                | PollSendAction::Complete => {
                    this.waiter = None;
                    Poll::Ready(Ok(()))
                }
                | PollSendAction::Failed(element) => {
                    this.waiter = None;
                    Poll::Ready(Err(SendError(element)))
                }
            };
        }

        let element = this.element.take().expect("polled after completion");

        // Bind the action so the lock guard is released before any wake.
        let action = this.shared.machine.lock().send(element, cx.waker());

        match action {
            | SendAction::Delivered(consumer) => {
                consumer.wake();
                Poll::Ready(Ok(()))
            }
            | SendAction::Suspended(id) => {
                this.waiter = Some(id);
                Poll::Pending
            }
            | SendAction::Finished(element) => Poll::Ready(Err(SendError(element))),
        }
    }
}

impl<T, E> Drop for SendFuture<'_, T, E> {
    fn drop(&mut self) {
        if let Some(id) = self.waiter {
            self.shared.machine.lock().cancel_send(id);
        }
    }
}

/// The receiving side of a rendezvous channel.
///
/// Dropping the last consumer terminates the channel; suspended producers
/// are failed and get their elements back.
pub struct RendezvousConsumer<T, E = Infallible> {
    shared: Arc<Shared<T, E>>,
    waiter: Option<u64>,
    done: bool,
}

impl<T, E> RendezvousConsumer<T, E> {
    /// Receives the next element.
    ///
    /// # Returns
    /// * `Ok(Some(element))` - The next element in send order.
    /// * `Ok(None)` - The channel finished; no further elements will ever
    ///   be produced.
    /// * `Err(failure)` - The channel was failed. Delivered at most once;
    ///   subsequent receives return `Ok(None)`.
    ///
    /// Cancel safety: dropping the returned future does not lose elements;
    /// a hand-off that raced the drop is picked up by the next receive.
    #[inline]
    pub async fn next(&mut self) -> Result<Option<T>, E> {
        poll_fn(|cx| self.poll_next_inner(cx)).await
    }

    /// Gets whether the channel has terminated or not.
    #[inline]
    pub fn is_finished(&self) -> bool {
        self.shared.machine.lock().is_terminated()
    }

    fn poll_next_inner(&mut self, cx: &mut Context<'_>) -> Poll<Result<Option<T>, E>> {
        if self.done {
            return Poll::Ready(Ok(None));
        }

        let mut machine = self.shared.machine.lock();
        let action = match self.waiter {
            | Some(id) => machine.poll_next(id, cx.waker()),
            | None => machine.next(cx.waker()),
        };
        drop(machine);

        match action {
            | NextAction::Ready { result, producer } => {
                self.waiter = None;
                if !matches!(result, Ok(Some(_))) {
                    self.done = true;
                }
                if let Some(producer) = producer {
                    producer.wake();
                }
                Poll::Ready(result)
            }
            | NextAction::Suspended(id) => {
                self.waiter = Some(id);
                Poll::Pending
            }
            | NextAction::Pending => Poll::Pending,
        }
    }
}

impl<T> RendezvousConsumer<T> {
    /// Receives the next element from an infallible channel.
    #[inline]
    pub async fn recv(&mut self) -> Option<T> {
        match self.next().await {
            | Ok(element) => element,
            | Err(never) => match never {},
        }
    }
}

impl<T, E> Clone for RendezvousConsumer<T, E> {
    #[inline]
    fn clone(&self) -> Self {
        self.shared.consumers.fetch_add(1, Ordering::Relaxed);

        Self {
            shared: self.shared.clone(),
            waiter: None,
            done: false,
        }
    }
}

impl<T, E> Drop for RendezvousConsumer<T, E> {
    fn drop(&mut self) {
        let last = self.shared.consumers.fetch_sub(1, Ordering::AcqRel) == 1;

        let mut machine = self.shared.machine.lock();
        if let Some(id) = self.waiter.take() {
            machine.cancel_next(id);
        }
        let action = if last { Some(machine.close()) } else { None };
        drop(machine);

        if let Some(action) = action {
            for waker in action.wakers {
                waker.wake();
            }
        }
    }
}

impl<T, E> fmt::Debug for RendezvousConsumer<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RendezvousConsumer").finish_non_exhaustive()
    }
}

impl<T, E> Stream for RendezvousConsumer<T, E> {
    type Item = Result<T, E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().poll_next_inner(cx).map(|result| match result {
            | Ok(Some(element)) => Some(Ok(element)),
            | Ok(None) => None,
            | Err(failure) => Some(Err(failure)),
        })
    }
}

impl<T, E> FusedStream for RendezvousConsumer<T, E> {
    #[inline]
    fn is_terminated(&self) -> bool {
        self.done
    }
}
