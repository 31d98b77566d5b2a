use std::collections::{HashMap, VecDeque};
use std::mem;
use std::task::Waker;

struct SuspendedProducer<T> {
    id: u64,
    waker: Waker,
    element: T,
}

struct SuspendedConsumer {
    id: u64,
    waker: Waker,
}

enum State<T, E> {
    /// Producers suspend only on a full buffer and consumers only on an
    /// empty one, so the two queues are never non-empty at the same time.
    Channeling {
        buffer: VecDeque<T>,
        producers: VecDeque<SuspendedProducer<T>>,
        consumers: VecDeque<SuspendedConsumer>,
    },
    /// Absorbing. Receives drain the buffer first, then observe the
    /// failure at most once, then end-of-stream.
    Finished {
        buffer: VecDeque<T>,
        failure: Option<E>,
    },
}

/// The buffered rendezvous channel state machine.
pub(super) struct Machine<T, E> {
    state: State<T, E>,
    resolved: HashMap<u64, Result<Option<T>, E>>,
    failed_sends: HashMap<u64, T>,
    next_id: u64,
    capacity: usize,
}

pub(super) enum SendAction<T> {
    /// The element was handed to the oldest suspended consumer; wake it.
    Delivered(Waker),
    /// The element was appended to the buffer.
    Buffered,
    /// The buffer is full; the producer is suspended under this id.
    Suspended(u64),
    /// The channel already finished; the element is handed back.
    Finished(T),
}

pub(super) enum PollSendAction<T> {
    Pending,
    Complete,
    Failed(T),
}

pub(super) enum NextAction<T, E> {
    Ready {
        result: Result<Option<T>, E>,
        /// A producer whose element moved into the freed buffer slot.
        producer: Option<Waker>,
    },
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
    pub(super) fn new(capacity: usize) -> Self {
        Self {
            state: State::Channeling {
                buffer: VecDeque::with_capacity(capacity),
                producers: VecDeque::new(),
                consumers: VecDeque::new(),
            },
            resolved: HashMap::new(),
            failed_sends: HashMap::new(),
            next_id: 0,
            capacity,
        }
    }

    pub(super) fn is_terminated(&self) -> bool {
        matches!(self.state, State::Finished { .. })
    }

    pub(super) fn send(&mut self, element: T, waker: &Waker) -> SendAction<T> {
        let Self {
            state,
            resolved,
            next_id,
            capacity,
            ..
        } = self;

        match state {
            | State::Channeling {
                buffer,
                producers,
                consumers,
            } => {
                if let Some(consumer) = consumers.pop_front() {
                    resolved.insert(consumer.id, Ok(Some(element)));
                    SendAction::Delivered(consumer.waker)
                } else if buffer.len() < *capacity {
                    buffer.push_back(element);
                    SendAction::Buffered
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
            | State::Finished { .. } => SendAction::Finished(element),
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
                buffer,
                producers,
                consumers,
            } => {
                if let Some(element) = buffer.pop_front() {
                    // A freed slot admits the oldest suspended producer.
                    let producer = producers.pop_front().map(|producer| {
                        buffer.push_back(producer.element);
                        producer.waker
                    });

                    NextAction::Ready {
                        result: Ok(Some(element)),
                        producer,
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
            | State::Finished { buffer, failure } => {
                let result = match buffer.pop_front() {
                    | Some(element) => Ok(Some(element)),
                    | None => match failure.take() {
                        | Some(failure) => Err(failure),
                        | None => Ok(None),
                    },
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

        NextAction::Ready {
            result: Ok(None),
            producer: None,
        }
    }

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

        if let Some(Err(failure)) = resolved.remove(&id) {
            if let State::Finished { failure: queued, .. } = state {
                if queued.is_none() {
                    *queued = Some(failure);
                }
            }
        }
    }

    /// Terminal transition. Queued producers resume successfully and their
    /// elements are appended to the buffer in send order, still delivered
    /// through subsequent receives.
    pub(super) fn finish(&mut self, failure: Option<E>) -> FinishAction {
        let Self {
            state, resolved, ..
        } = self;

        match state {
            | State::Channeling {
                buffer,
                producers,
                consumers,
            } => {
                let mut wakers = Vec::with_capacity(producers.len() + consumers.len());
                let mut failure = failure;

                for producer in producers.drain(..) {
                    buffer.push_back(producer.element);
                    wakers.push(producer.waker);
                }

                for consumer in consumers.drain(..) {
                    let result = match buffer.pop_front() {
                        | Some(element) => Ok(Some(element)),
                        | None => match failure.take() {
                            | Some(failure) => Err(failure),
                            | None => Ok(None),
                        },
                    };
                    resolved.insert(consumer.id, result);
                    wakers.push(consumer.waker);
                }

                *state = State::Finished {
                    buffer: mem::take(buffer),
                    failure,
                };
                FinishAction { wakers }
            }
            | State::Finished { .. } => FinishAction { wakers: Vec::new() },
        }
    }

    /// The last consumer handle was dropped. Suspended producers are failed
    /// and get their elements back; buffered elements are undeliverable.
    pub(super) fn close(&mut self) -> FinishAction {
        let Self {
            state,
            resolved,
            failed_sends,
            ..
        } = self;

        match state {
            | State::Channeling {
                buffer,
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

                buffer.clear();
                *state = State::Finished {
                    buffer: VecDeque::new(),
                    failure: None,
                };
                FinishAction { wakers }
            }
            | State::Finished { buffer, failure } => {
                buffer.clear();
                *failure = None;
                FinishAction { wakers: Vec::new() }
            }
        }
    }
}
