//! A multi-producer, single-consumer channel with pluggable back-pressure.
//!
//! Producers hold cloneable [`MpscProducer`] handles; the unique
//! [`MpscConsumer`] pulls elements in commit order. A
//! [`BackpressureStrategy`] decides after every send whether producers
//! should keep producing; when demand closes, the synchronous send path
//! hands out a [`CallbackToken`] for an out-of-band produce-more
//! notification, while the async send path suspends until demand returns.

use std::convert::Infallible;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::poll_fn;
use futures::pin_mut;
use futures::stream::{FusedStream, Stream, StreamExt};
use parking_lot::Mutex;

use crate::error::ProduceError;

mod machine;
mod strategy;

pub use strategy::BackpressureStrategy;

use machine::{Batch, Machine, SendOutcome};

struct Shared<T, E> {
    machine: Mutex<Machine<T, E>>,
}

/// An opaque identifier for a pending produce-more notification.
///
/// Minted by [`MpscProducer::send_sync`] when demand closes; pass it to
/// [`MpscProducer::enqueue_callback`] to register the notification or to
/// [`MpscProducer::cancel_callback`] to abandon it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackToken(u64);

/// The result of a successful synchronous send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum SendResult {
    /// Demand is open; keep producing.
    ProduceMore,
    /// Demand is closed; register a notification under the token to learn
    /// when to produce more.
    Enqueue(CallbackToken),
}

/// Creates an MPSC channel with the given back-pressure strategy.
///
/// # Parameters
/// * `strategy` - Decides when producers should produce more.
#[inline]
#[must_use]
pub fn channel<T>(strategy: BackpressureStrategy<T>) -> (MpscProducer<T>, MpscConsumer<T>) {
    fallible(strategy)
}

/// Creates an MPSC channel whose termination may carry a failure.
///
/// # Parameters
/// * `strategy` - Decides when producers should produce more.
#[inline]
#[must_use]
pub fn fallible<T, E>(
    strategy: BackpressureStrategy<T>,
) -> (MpscProducer<T, E>, MpscConsumer<T, E>) {
    let shared = Arc::new(Shared {
        machine: Mutex::new(Machine::new(strategy)),
    });

    (
        MpscProducer {
            shared: shared.clone(),
            source: 0,
        },
        MpscConsumer {
            shared,
            done: false,
        },
    )
}

/// A producer handle (source) of an MPSC channel.
///
/// Cloning creates an additional source. The channel finishes with no
/// failure once every source has been dropped.
pub struct MpscProducer<T, E = Infallible> {
    shared: Arc<Shared<T, E>>,
    source: u64,
}

impl<T, E> MpscProducer<T, E> {
    /// Sends an element without ever suspending.
    ///
    /// The element is committed before the demand decision, so an accepted
    /// send is delivered even when it closes demand.
    ///
    /// # Parameters
    /// * `element` - The element to send.
    ///
    /// # Returns
    /// * [`SendResult::ProduceMore`] - Demand is still open.
    /// * [`SendResult::Enqueue(token)`](SendResult::Enqueue) - Demand
    ///   closed; register a notification under `token`.
    pub fn send_sync(&self, element: T) -> Result<SendResult, ProduceError> {
        let (outcome, action) = self.shared.machine.lock().send(Batch::One(element));
        action.execute();

        outcome.map(SendResult::from)
    }

    /// Sends a batch of elements without ever suspending.
    ///
    /// # Parameters
    /// * `elements` - The elements to send, committed as one batch.
    pub fn send_sync_batch<I>(&self, elements: I) -> Result<SendResult, ProduceError>
    where
        I: IntoIterator<Item = T>,
    {
        let batch = Batch::Many(elements.into_iter().collect());
        let (outcome, action) = self.shared.machine.lock().send(batch);
        action.execute();

        outcome.map(SendResult::from)
    }

    /// Sends an element, suspending until demand returns when the
    /// back-pressure strategy closes it.
    ///
    /// Dropping the returned future after the element was committed does
    /// not revoke the element; it only abandons the demand wait.
    ///
    /// # Parameters
    /// * `element` - The element to send.
    #[inline]
    pub fn send(&self, element: T) -> SendFuture<'_, T, E> {
        SendFuture {
            shared: &self.shared,
            batch: Some(Batch::One(element)),
            token: None,
        }
    }

    /// Sends a batch of elements, suspending until demand returns when the
    /// back-pressure strategy closes it.
    ///
    /// # Parameters
    /// * `elements` - The elements to send, committed as one batch.
    #[inline]
    pub fn send_batch<I>(&self, elements: I) -> SendFuture<'_, T, E>
    where
        I: IntoIterator<Item = T>,
    {
        SendFuture {
            shared: &self.shared,
            batch: Some(Batch::Many(elements.into_iter().collect())),
            token: None,
        }
    }

    /// Forwards every element of a stream through [`MpscProducer::send`].
    ///
    /// # Parameters
    /// * `stream` - The stream of elements to forward.
    pub async fn send_all<S>(&self, stream: S) -> Result<(), ProduceError>
    where
        S: Stream<Item = T>,
    {
        pin_mut!(stream);

        while let Some(element) = stream.next().await {
            self.send(element).await?;
        }

        Ok(())
    }

    /// Registers a produce-more notification for a token minted by
    /// [`MpscProducer::send_sync`].
    ///
    /// The callback is invoked exactly once: with `Ok(())` when demand
    /// returns (immediately if it already has), or with an error when the
    /// notification was cancelled or the channel finished.
    ///
    /// # Parameters
    /// * `token` - The token identifying the pending notification.
    /// * `callback` - The notification callback.
    ///
    /// # Panics
    /// Panics if a notification for `token` is already registered.
    pub fn enqueue_callback<F>(&self, token: CallbackToken, callback: F)
    where
        F: FnOnce(Result<(), ProduceError>) + Send + 'static,
    {
        let action = self
            .shared
            .machine
            .lock()
            .enqueue_callback(token.0, Box::new(callback));
        action.execute();
    }

    /// Cancels a pending produce-more notification.
    ///
    /// A registered callback is invoked with
    /// [`ProduceError::Cancelled`]. Cancelling before the registration is
    /// race-tolerant: the cancellation is remembered and the registration
    /// observes it.
    ///
    /// # Parameters
    /// * `token` - The token identifying the pending notification.
    pub fn cancel_callback(&self, token: CallbackToken) {
        let action = self.shared.machine.lock().cancel_callback(token.0);
        action.execute();
    }

    /// Installs or replaces this source's termination callback, invoked
    /// exactly once when the channel fully finishes (immediately if it
    /// already has).
    ///
    /// # Parameters
    /// * `callback` - The termination callback.
    pub fn set_on_termination<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let action = self
            .shared
            .machine
            .lock()
            .set_on_termination(self.source, Box::new(callback));
        action.execute();
    }

    /// Removes this source's termination callback, if any.
    pub fn clear_on_termination(&self) {
        self.shared.machine.lock().clear_on_termination(self.source);
    }

    /// Terminates the channel, consuming this source. Buffered elements
    /// remain receivable; suspended sends fail with
    /// [`ProduceError::AlreadyFinished`].
    pub fn finish(self) {
        let action = self.shared.machine.lock().finish(None);
        action.execute();
    }

    /// Terminates the channel with a failure, consuming this source. The
    /// failure is observed by exactly one receive once the buffer drained.
    ///
    /// # Parameters
    /// * `failure` - The terminal failure value.
    pub fn fail(self, failure: E) {
        let action = self.shared.machine.lock().finish(Some(failure));
        action.execute();
    }

    /// Gets whether the channel has terminated or not.
    #[inline]
    pub fn is_finished(&self) -> bool {
        self.shared.machine.lock().is_finished()
    }
}

impl<T, E> Clone for MpscProducer<T, E> {
    /// Creates an additional source. A source cloned after the channel
    /// finished is inert: its sends fail with
    /// [`ProduceError::AlreadyFinished`].
    fn clone(&self) -> Self {
        let source = self.shared.machine.lock().source_initialized();

        Self {
            shared: self.shared.clone(),
            source,
        }
    }
}

impl<T, E> Drop for MpscProducer<T, E> {
    fn drop(&mut self) {
        let action = self.shared.machine.lock().source_deinitialized(self.source);
        action.execute();
    }
}

impl<T, E> fmt::Debug for MpscProducer<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MpscProducer")
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

impl From<SendOutcome> for SendResult {
    fn from(outcome: SendOutcome) -> Self {
        match outcome {
            | SendOutcome::ProduceMore => Self::ProduceMore,
            | SendOutcome::Enqueue(token) => Self::Enqueue(CallbackToken(token)),
        }
    }
}

/// The future returned by [`MpscProducer::send`] and
/// [`MpscProducer::send_batch`].
#[must_use = "futures do nothing unless polled"]
pub struct SendFuture<'a, T, E = Infallible> {
    shared: &'a Shared<T, E>,
    batch: Option<Batch<T>>,
    token: Option<u64>,
}

/// Safe: the future is not self-referential.
impl<T, E> Unpin for SendFuture<'_, T, E> {}

impl<'a, T, E> Future for SendFuture<'a, T, E> {
    type Output = Result<(), ProduceError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;

        if let Some(token) = this.token {
            return match this.shared.machine.lock().poll_send(token, cx.waker()) {
                | Some(result) => {
                    this.token = None;
                    Poll::Ready(result)
                }
                | None => Poll::Pending,
            };
        }

        let batch = this.batch.take().expect("polled after completion");

        let mut machine = this.shared.machine.lock();
        let (outcome, action) = machine.send(batch);
        let poll = match outcome {
            | Ok(SendOutcome::ProduceMore) => Poll::Ready(Ok(())),
            | Ok(SendOutcome::Enqueue(token)) => {
                // Same critical section as the send, so demand cannot
                // change in between.
                machine.enqueue_task(token, cx.waker());
                this.token = Some(token);
                Poll::Pending
            }
            | Err(error) => Poll::Ready(Err(error)),
        };
        drop(machine);
        action.execute();

        poll
    }
}

impl<T, E> Drop for SendFuture<'_, T, E> {
    fn drop(&mut self) {
        if let Some(token) = self.token {
            self.shared.machine.lock().cancel_task(token);
        }
    }
}

/// The unique consumer of an MPSC channel.
///
/// Dropping it terminates the channel: suspended sends fail and buffered
/// elements are discarded.
pub struct MpscConsumer<T, E = Infallible> {
    shared: Arc<Shared<T, E>>,
    done: bool,
}

impl<T, E> MpscConsumer<T, E> {
    /// Receives the next element.
    ///
    /// # Returns
    /// * `Ok(Some(element))` - The next element in commit order.
    /// * `Ok(None)` - Every source finished and the buffer drained.
    /// * `Err(failure)` - The channel was failed; delivered at most once
    ///   after the buffer drained.
    ///
    /// Cancel safety: dropping the returned future does not lose elements.
    #[inline]
    pub async fn next(&mut self) -> Result<Option<T>, E> {
        poll_fn(|cx| self.poll_next_inner(cx)).await
    }

    /// Gets whether the channel has terminated or not.
    #[inline]
    pub fn is_finished(&self) -> bool {
        self.shared.machine.lock().is_finished()
    }

    fn poll_next_inner(&mut self, cx: &mut Context<'_>) -> Poll<Result<Option<T>, E>> {
        if self.done {
            return Poll::Ready(Ok(None));
        }

        let mut machine = self.shared.machine.lock();
        let (result, action) = machine.next(cx.waker());
        drop(machine);
        action.execute();

        match result {
            | Some(result) => {
                if !matches!(result, Ok(Some(_))) {
                    self.done = true;
                }
                Poll::Ready(result)
            }
            | None => Poll::Pending,
        }
    }
}

impl<T> MpscConsumer<T> {
    /// Receives the next element from an infallible channel.
    #[inline]
    pub async fn recv(&mut self) -> Option<T> {
        match self.next().await {
            | Ok(element) => element,
            | Err(never) => match never {},
        }
    }
}

impl<T, E> Drop for MpscConsumer<T, E> {
    fn drop(&mut self) {
        let action = self.shared.machine.lock().consumer_dropped();
        action.execute();
    }
}

impl<T, E> fmt::Debug for MpscConsumer<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MpscConsumer").finish_non_exhaustive()
    }
}

impl<T, E> Stream for MpscConsumer<T, E> {
    type Item = Result<T, E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().poll_next_inner(cx).map(|result| match result {
            | Ok(Some(element)) => Some(Ok(element)),
            | Ok(None) => None,
            | Err(failure) => Some(Err(failure)),
        })
    }
}

impl<T, E> FusedStream for MpscConsumer<T, E> {
    #[inline]
    fn is_terminated(&self) -> bool {
        self.done
    }
}
