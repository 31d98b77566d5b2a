use std::collections::{HashMap, VecDeque};
use std::task::Waker;

/// A producer awaiting a matching receive, together with its element.
struct SuspendedProducer<T> {
    id: u64,
    waker: Waker,
    element: T,
}

/// A consumer awaiting an element.
struct SuspendedConsumer {
    id: u64,
    waker: Waker,
}

enum State<T, E> {
    Channeling {
        producers: VecDeque<SuspendedProducer<T>>,
        consumers: VecDeque<SuspendedConsumer>,
    },
    /// Absorbing. The failure, if any, is taken by the first receive that
    /// observes it.
    Terminated { failure: Option<E> },
}

/// The rendezvous channel state machine.
///
/// Every operation is a single mutation returning an action value; wakers
/// are never invoked here. The caller executes the action after releasing
/// the lock guarding this value.
pub(super) struct Machine<T, E> {
    state: State<T, E>,
    /// Results assigned to resumed consumers, taken on their next poll.
    resolved: HashMap<u64, Result<Option<T>, E>>,
    /// Elements handed back to producers whose consumers disappeared.
    failed_sends: HashMap<u64, T>,
    next_id: u64,
}

pub(super) enum SendAction<T> {
    /// The element was handed to the oldest suspended consumer; wake it.
    Delivered(Waker),
    /// No consumer is waiting; the producer is suspended under this id.
    Suspended(u64),
    /// The channel already finished; the element is handed back.
    Finished(T),
}

pub(super) enum PollSendAction<T> {
    Pending,
    /// Delivered, or discarded by termination; both observe success.
    Complete,
    /// The consumer side disappeared; the element is handed back.
    Failed(T),
}

pub(super) enum NextAction<T, E> {
    /// A result is available now. `producer` is the party whose element was
    /// taken; wake it after releasing the lock.
    Ready {
        result: Result<Option<T>, E>,
        producer: Option<Waker>,
    },
    /// No element is available; the consumer is suspended under this id.
    Suspended(u64),
    Pending,
}

pub(super) struct FinishAction {
    pub(super) wakers: Vec<Waker>,
}

#[inline]
fn mint(counter: &mut u64) -> u64 {
    let id = *counter;
    *counter = counter.wrapping_add(1);
    id
}

impl<T, E> Machine<T, E> {
    pub(super) fn new() -> Self {
        Self {
            state: State::Channeling {
                producers: VecDeque::new(),
                consumers: VecDeque::new(),
            },
            resolved: HashMap::new(),
            failed_sends: HashMap::new(),
            next_id: 0,
        }
    }

    pub(super) fn is_terminated(&self) -> bool {
        matches!(self.state, State::Terminated { .. })
    }

    pub(super) fn send(&mut self, element: T, waker: &Waker) -> SendAction<T> {
        let Self {
            state,
            resolved,
            next_id,
            ..
        } = self;

        match state {
            | State::Channeling {
                producers,
                consumers,
            } => {
                if let Some(consumer) = consumers.pop_front() {
                    resolved.insert(consumer.id, Ok(Some(element)));
                    SendAction::Delivered(consumer.waker)
                } else {
                    let id = mint(next_id);
                    producers.push_back(SuspendedProducer {
                        id,
                        waker: waker.clone(),
                        element,
                    });
                    SendAction::Suspended(id)
                }
            }
            | State::Terminated { .. } => SendAction::Finished(element),
        }
    }

    pub(super) fn poll_send(&mut self, id: u64, waker: &Waker) -> PollSendAction<T> {
        let Self {
            state,
            failed_sends,
            ..
        } = self;

        if let State::Channeling { producers, .. } = state {
            if let Some(producer) = producers.iter_mut().find(|p| p.id == id) {
                producer.waker = waker.clone();
                return PollSendAction::Pending;
            }
        }

        match failed_sends.remove(&id) {
            | Some(element) => PollSendAction::Failed(element),
            | None => PollSendAction::Complete,
        }
    }

    /// The producer's send future was dropped; its element is not delivered.
    pub(super) fn cancel_send(&mut self, id: u64) {
        let Self {
            state,
            failed_sends,
            ..
        } = self;

        if let State::Channeling { producers, .. } = state {
            if let Some(pos) = producers.iter().position(|p| p.id == id) {
                producers.remove(pos);
                return;
            }
        }

        failed_sends.remove(&id);
    }

    pub(super) fn next(&mut self, waker: &Waker) -> NextAction<T, E> {
        let Self { state, next_id, .. } = self;

        match state {
            | State::Channeling {
                producers,
                consumers,
            } => {
                if let Some(producer) = producers.pop_front() {
                    NextAction::Ready {
                        result: Ok(Some(producer.element)),
                        producer: Some(producer.waker),
                    }
                } else {
                    let id = mint(next_id);
                    consumers.push_back(SuspendedConsumer {
                        id,
                        waker: waker.clone(),
                    });
                    NextAction::Suspended(id)
                }
            }
            | State::Terminated { failure } => {
                let result = match failure.take() {
                    | Some(failure) => Err(failure),
                    | None => Ok(None),
                };
                NextAction::Ready {
                    result,
                    producer: None,
                }
            }
        }
    }

    pub(super) fn poll_next(&mut self, id: u64, waker: &Waker) -> NextAction<T, E> {
        let Self {
            state, resolved, ..
        } = self;

        if let Some(result) = resolved.remove(&id) {
            return NextAction::Ready {
                result,
                producer: None,
            };
        }

        if let State::Channeling { consumers, .. } = state {
            if let Some(consumer) = consumers.iter_mut().find(|c| c.id == id) {
                consumer.waker = waker.clone();
                return NextAction::Pending;
            }
        }

        // A registered consumer is either queued or resolved; fall back to
        // end-of-stream.
        NextAction::Ready {
            result: Ok(None),
            producer: None,
        }
    }

    /// The consumer handle was dropped while suspended or holding an
    /// untaken result.
    pub(super) fn cancel_next(&mut self, id: u64) {
        let Self {
            state, resolved, ..
        } = self;

        if let State::Channeling { consumers, .. } = state {
            if let Some(pos) = consumers.iter().position(|c| c.id == id) {
                consumers.remove(pos);
                return;
            }
        }

        // A failure assigned to a consumer that never observed it is
        // requeued so a later receive still sees it.
        if let Some(Err(failure)) = resolved.remove(&id) {
            if let State::Terminated { failure: queued } = state {
                if queued.is_none() {
                    *queued = Some(failure);
                }
            }
        }
    }

    /// Terminal transition. Suspended producers resume successfully with
    /// their elements discarded; the oldest suspended consumer carries the
    /// failure if one is given, the rest observe end-of-stream.
    pub(super) fn finish(&mut self, failure: Option<E>) -> FinishAction {
        let Self {
            state, resolved, ..
        } = self;

        match state {
            | State::Channeling {
                producers,
                consumers,
            } => {
                let mut wakers = Vec::with_capacity(producers.len() + consumers.len());
                let mut failure = failure;

                for producer in producers.drain(..) {
                    wakers.push(producer.waker);
                }

                for consumer in consumers.drain(..) {
                    let result = match failure.take() {
                        | Some(failure) => Err(failure),
                        | None => Ok(None),
                    };
                    resolved.insert(consumer.id, result);
                    wakers.push(consumer.waker);
                }

                *state = State::Terminated { failure };
                FinishAction { wakers }
            }
            | State::Terminated { .. } => FinishAction { wakers: Vec::new() },
        }
    }

    /// The last consumer handle was dropped. Suspended producers are failed
    /// and get their elements back; a queued failure becomes undeliverable.
    pub(super) fn close(&mut self) -> FinishAction {
        let Self {
            state,
            resolved,
            failed_sends,
            ..
        } = self;

        match state {
            | State::Channeling {
                producers,
                consumers,
            } => {
                let mut wakers = Vec::with_capacity(producers.len() + consumers.len());

                for producer in producers.drain(..) {
                    failed_sends.insert(producer.id, producer.element);
                    wakers.push(producer.waker);
                }

                for consumer in consumers.drain(..) {
                    resolved.insert(consumer.id, Ok(None));
                    wakers.push(consumer.waker);
                }

                *state = State::Terminated { failure: None };
                FinishAction { wakers }
            }
            | State::Terminated { failure } => {
                *failure = None;
                FinishAction { wakers: Vec::new() }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::task::noop_waker;

    use super::*;

    fn suspended<A>(action: SendAction<A>) -> u64 {
        match action {
            | SendAction::Suspended(id) => id,
            | _ => panic!("expected a suspended send"),
        }
    }

    #[test]
    fn handoff_resumes_suspended_producer() {
        let waker = noop_waker();
        let mut machine = Machine::<u32, ()>::new();

        let id = suspended(machine.send(7, &waker));

        match machine.next(&waker) {
            | NextAction::Ready { result, producer } => {
                assert_eq!(result, Ok(Some(7)));
                assert!(producer.is_some());
            }
            | _ => panic!("expected an element"),
        }

        assert!(matches!(
            machine.poll_send(id, &waker),
            PollSendAction::Complete
        ));
    }

    #[test]
    fn producers_resume_in_send_order() {
        let waker = noop_waker();
        let mut machine = Machine::<u32, ()>::new();

        suspended(machine.send(1, &waker));
        suspended(machine.send(2, &waker));

        for expected in [1, 2] {
            match machine.next(&waker) {
                | NextAction::Ready { result, .. } => {
                    assert_eq!(result, Ok(Some(expected)));
                }
                | _ => panic!("expected an element"),
            }
        }
    }

    #[test]
    fn finish_discards_suspended_elements_with_success() {
        let waker = noop_waker();
        let mut machine = Machine::<u32, ()>::new();

        let id = suspended(machine.send(1, &waker));

        let action = machine.finish(None);
        assert_eq!(action.wakers.len(), 1);

        assert!(matches!(
            machine.poll_send(id, &waker),
            PollSendAction::Complete
        ));
        assert!(matches!(
            machine.next(&waker),
            NextAction::Ready {
                result: Ok(None),
                ..
            }
        ));
    }

    #[test]
    fn queued_failure_is_delivered_exactly_once() {
        let waker = noop_waker();
        let mut machine = Machine::<u32, &str>::new();

        machine.finish(Some("boom"));

        assert!(matches!(
            machine.next(&waker),
            NextAction::Ready {
                result: Err("boom"),
                ..
            }
        ));
        assert!(matches!(
            machine.next(&waker),
            NextAction::Ready {
                result: Ok(None),
                ..
            }
        ));
    }

    #[test]
    fn failure_goes_to_oldest_suspended_consumer() {
        let waker = noop_waker();
        let mut machine = Machine::<u32, &str>::new();

        let first = match machine.next(&waker) {
            | NextAction::Suspended(id) => id,
            | _ => panic!("expected suspension"),
        };
        let second = match machine.next(&waker) {
            | NextAction::Suspended(id) => id,
            | _ => panic!("expected suspension"),
        };

        machine.finish(Some("boom"));

        assert!(matches!(
            machine.poll_next(first, &waker),
            NextAction::Ready {
                result: Err("boom"),
                ..
            }
        ));
        assert!(matches!(
            machine.poll_next(second, &waker),
            NextAction::Ready {
                result: Ok(None),
                ..
            }
        ));
    }

    #[test]
    fn close_hands_elements_back_to_producers() {
        let waker = noop_waker();
        let mut machine = Machine::<u32, ()>::new();

        let id = suspended(machine.send(9, &waker));

        let action = machine.close();
        assert_eq!(action.wakers.len(), 1);

        assert!(matches!(
            machine.poll_send(id, &waker),
            PollSendAction::Failed(9)
        ));
    }

    #[test]
    fn cancelled_send_is_removed() {
        let waker = noop_waker();
        let mut machine = Machine::<u32, ()>::new();

        let id = suspended(machine.send(1, &waker));
        machine.cancel_send(id);

        assert!(matches!(machine.next(&waker), NextAction::Suspended(_)));
    }

    #[test]
    fn cancelled_consumer_requeues_unseen_failure() {
        let waker = noop_waker();
        let mut machine = Machine::<u32, &str>::new();

        let id = match machine.next(&waker) {
            | NextAction::Suspended(id) => id,
            | _ => panic!("expected suspension"),
        };

        machine.finish(Some("boom"));
        machine.cancel_next(id);

        assert!(matches!(
            machine.next(&waker),
            NextAction::Ready {
                result: Err("boom"),
                ..
            }
        ));
    }
}
