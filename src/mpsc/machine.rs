use std::collections::{HashMap, HashSet, VecDeque};
use std::mem;
use std::task::Waker;

use crate::error::ProduceError;

use super::strategy::BackpressureStrategy;

pub(super) type SendCallback = Box<dyn FnOnce(Result<(), ProduceError>) + Send>;
pub(super) type TerminationCallback = Box<dyn FnOnce() + Send>;

/// Source id handed out once the channel is already finished; operations
/// performed under it are no-ops.
pub(super) const SENTINEL_SOURCE: u64 = u64::MAX;

/// Elements committed by a single send.
pub(super) enum Batch<T> {
    One(T),
    Many(Vec<T>),
}

enum WaiterKind {
    /// An out-of-band notification registered through a callback token.
    Callback(SendCallback),
    /// A suspended send future.
    Task(Waker),
}

struct SuspendedProducer {
    token: u64,
    kind: WaiterKind,
}

struct Channeling<T> {
    strategy: BackpressureStrategy<T>,
    buffer: VecDeque<T>,
    /// At most one; consumer uniqueness is enforced by ownership upstream.
    consumer: Option<Waker>,
    producers: VecDeque<SuspendedProducer>,
    has_demand: bool,
    active_sources: u64,
    on_terminations: Vec<(u64, TerminationCallback)>,
}

enum State<T, E> {
    Channeling(Channeling<T>),
    /// All sources finished or one called finish; the buffer keeps
    /// draining through subsequent receives.
    SourceFinished {
        buffer: VecDeque<T>,
        failure: Option<E>,
        on_terminations: Vec<(u64, TerminationCallback)>,
    },
    /// Absorbing; termination callbacks have fired.
    Finished,
}

/// The MPSC watermark channel state machine.
pub(super) struct Machine<T, E> {
    state: State<T, E>,
    /// Outcomes of resumed task sends, taken on their next poll.
    resolved_sends: HashMap<u64, Result<(), ProduceError>>,
    /// Tokens cancelled before their callback was registered.
    cancelled_tokens: HashSet<u64>,
    next_token: u64,
    next_source: u64,
}

pub(super) enum SendOutcome {
    /// Demand is open; keep producing.
    ProduceMore,
    /// Demand is closed; a notification for the minted token may be
    /// registered out-of-band.
    Enqueue(u64),
}

/// Resumptions to perform after the state machine lock is released, in
/// FIFO commit order.
pub(super) enum Resumption {
    Task(Waker),
    Send(SendCallback, Result<(), ProduceError>),
    Termination(TerminationCallback),
}

#[derive(Default)]
pub(super) struct Action {
    resumptions: Vec<Resumption>,
}

impl Action {
    fn push_task(&mut self, waker: Waker) {
        self.resumptions.push(Resumption::Task(waker));
    }

    fn push_send(&mut self, callback: SendCallback, result: Result<(), ProduceError>) {
        self.resumptions.push(Resumption::Send(callback, result));
    }

    fn push_termination(&mut self, callback: TerminationCallback) {
        self.resumptions.push(Resumption::Termination(callback));
    }

    /// Executes the resumptions. Must not be called while the machine's
    /// lock is held.
    pub(super) fn execute(self) {
        for resumption in self.resumptions {
            match resumption {
                | Resumption::Task(waker) => waker.wake(),
                | Resumption::Send(callback, result) => callback(result),
                | Resumption::Termination(callback) => callback(),
            }
        }
    }
}

#[inline]
fn mint(counter: &mut u64) -> u64 {
    let id = *counter;
    *counter = counter.wrapping_add(1);
    id
}

impl<T, E> Machine<T, E> {
    pub(super) fn new(strategy: BackpressureStrategy<T>) -> Self {
        Self {
            state: State::Channeling(Channeling {
                strategy,
                buffer: VecDeque::new(),
                consumer: None,
                producers: VecDeque::new(),
                has_demand: true,
                active_sources: 1,
                on_terminations: Vec::new(),
            }),
            resolved_sends: HashMap::new(),
            cancelled_tokens: HashSet::new(),
            next_token: 0,
            next_source: 1,
        }
    }

    pub(super) fn is_finished(&self) -> bool {
        !matches!(self.state, State::Channeling(_))
    }

    /// Registers an additional source.
    ///
    /// # Returns
    /// The new source id, or [`SENTINEL_SOURCE`] when the channel has
    /// already fully finished.
    pub(super) fn source_initialized(&mut self) -> u64 {
        let Self {
            state, next_source, ..
        } = self;

        match state {
            | State::Channeling(channeling) => {
                channeling.active_sources += 1;
                mint(next_source)
            }
            | State::SourceFinished { .. } => mint(next_source),
            | State::Finished => SENTINEL_SOURCE,
        }
    }

    /// Unregisters a source. When the active count reaches zero the channel
    /// finishes with no failure.
    pub(super) fn source_deinitialized(&mut self, source: u64) -> Action {
        if source == SENTINEL_SOURCE {
            return Action::default();
        }

        let finished = match &mut self.state {
            | State::Channeling(channeling) => {
                channeling.active_sources -= 1;
                channeling.active_sources == 0
            }
            | _ => false,
        };

        if finished {
            self.finish(None)
        } else {
            Action::default()
        }
    }

    /// Commits a batch of elements.
    ///
    /// Elements are appended to the buffer before the demand decision, so
    /// an accepted send is delivered even when it closes demand.
    pub(super) fn send(&mut self, batch: Batch<T>) -> (Result<SendOutcome, ProduceError>, Action) {
        let Self {
            state, next_token, ..
        } = self;

        match state {
            | State::Channeling(channeling) => {
                let start = channeling.buffer.len();
                match batch {
                    | Batch::One(element) => channeling.buffer.push_back(element),
                    | Batch::Many(elements) => channeling.buffer.extend(elements),
                }
                channeling.has_demand = channeling
                    .strategy
                    .did_send(channeling.buffer.range(start..));

                let mut action = Action::default();
                if !channeling.buffer.is_empty() {
                    if let Some(waker) = channeling.consumer.take() {
                        action.push_task(waker);
                    }
                }

                let outcome = if channeling.has_demand {
                    SendOutcome::ProduceMore
                } else {
                    SendOutcome::Enqueue(mint(next_token))
                };

                (Ok(outcome), action)
            }
            | _ => (Err(ProduceError::AlreadyFinished), Action::default()),
        }
    }

    /// Suspends the task side of a send on the given token. Must be called
    /// in the same critical section as the [`Machine::send`] that minted
    /// the token.
    pub(super) fn enqueue_task(&mut self, token: u64, waker: &Waker) {
        if let State::Channeling(channeling) = &mut self.state {
            channeling.producers.push_back(SuspendedProducer {
                token,
                kind: WaiterKind::Task(waker.clone()),
            });
        }
    }

    /// Registers a produce-more notification for a token minted by a
    /// synchronous send.
    ///
    /// # Panics
    /// Panics if a notification for the token is already registered.
    pub(super) fn enqueue_callback(&mut self, token: u64, callback: SendCallback) -> Action {
        let Self {
            state,
            cancelled_tokens,
            ..
        } = self;

        let mut action = Action::default();

        if cancelled_tokens.remove(&token) {
            action.push_send(callback, Err(ProduceError::Cancelled));
            return action;
        }

        match state {
            | State::Channeling(channeling) => {
                if channeling.has_demand {
                    // Demand returned between the send and this
                    // registration; resume immediately.
                    action.push_send(callback, Ok(()));
                } else {
                    assert!(
                        channeling.producers.iter().all(|p| p.token != token),
                        "callback token enqueued twice"
                    );
                    channeling.producers.push_back(SuspendedProducer {
                        token,
                        kind: WaiterKind::Callback(callback),
                    });
                }
            }
            | _ => action.push_send(callback, Err(ProduceError::AlreadyFinished)),
        }

        action
    }

    /// Cancels a pending notification. Unknown tokens are remembered so a
    /// registration racing this call still observes the cancellation.
    pub(super) fn cancel_callback(&mut self, token: u64) -> Action {
        let Self {
            state,
            cancelled_tokens,
            resolved_sends,
            ..
        } = self;

        let mut action = Action::default();

        if let State::Channeling(channeling) = state {
            if let Some(pos) = channeling.producers.iter().position(|p| p.token == token) {
                if let Some(producer) = channeling.producers.remove(pos) {
                    match producer.kind {
                        | WaiterKind::Callback(callback) => {
                            action.push_send(callback, Err(ProduceError::Cancelled));
                        }
                        | WaiterKind::Task(waker) => {
                            resolved_sends.insert(token, Err(ProduceError::Cancelled));
                            action.push_task(waker);
                        }
                    }
                }
                return action;
            }

            cancelled_tokens.insert(token);
        }

        action
    }

    /// The send future owning this token was dropped.
    pub(super) fn cancel_task(&mut self, token: u64) {
        let Self {
            state,
            resolved_sends,
            ..
        } = self;

        if let State::Channeling(channeling) = state {
            if let Some(pos) = channeling.producers.iter().position(|p| p.token == token) {
                channeling.producers.remove(pos);
                return;
            }
        }

        resolved_sends.remove(&token);
    }

    /// # Returns
    /// `Some(outcome)` when the send resolved, `None` while it remains
    /// suspended.
    pub(super) fn poll_send(
        &mut self,
        token: u64,
        waker: &Waker,
    ) -> Option<Result<(), ProduceError>> {
        let Self {
            state,
            resolved_sends,
            ..
        } = self;

        if let Some(result) = resolved_sends.remove(&token) {
            return Some(result);
        }

        if let State::Channeling(channeling) = state {
            if let Some(producer) = channeling
                .producers
                .iter_mut()
                .find(|p| p.token == token)
            {
                if let WaiterKind::Task(slot) = &mut producer.kind {
                    *slot = waker.clone();
                }
                return None;
            }
        }

        Some(Ok(()))
    }

    /// The consumer's pull.
    ///
    /// # Returns
    /// The receive result, or `None` when the consumer suspended, plus the
    /// resumptions to perform.
    #[allow(clippy::type_complexity)]
    pub(super) fn next(&mut self, waker: &Waker) -> (Option<Result<Option<T>, E>>, Action) {
        let Self {
            state,
            resolved_sends,
            ..
        } = self;

        let mut action = Action::default();

        match state {
            | State::Channeling(channeling) => {
                if let Some(element) = channeling.buffer.pop_front() {
                    let had_demand = channeling.has_demand;
                    channeling.has_demand = channeling.strategy.did_consume(&element);

                    if channeling.has_demand && !had_demand {
                        // Demand reopened: resume the whole suspended set in
                        // suspension order.
                        for producer in channeling.producers.drain(..) {
                            match producer.kind {
                                | WaiterKind::Callback(callback) => {
                                    action.push_send(callback, Ok(()));
                                }
                                | WaiterKind::Task(task) => {
                                    resolved_sends.insert(producer.token, Ok(()));
                                    action.push_task(task);
                                }
                            }
                        }
                    }

                    (Some(Ok(Some(element))), action)
                } else {
                    channeling.consumer = Some(waker.clone());
                    (None, action)
                }
            }
            | State::SourceFinished {
                buffer,
                failure,
                on_terminations,
            } => {
                if let Some(element) = buffer.pop_front() {
                    (Some(Ok(Some(element))), action)
                } else {
                    let result = match failure.take() {
                        | Some(failure) => Err(failure),
                        | None => Ok(None),
                    };
                    for (_, callback) in mem::take(on_terminations) {
                        action.push_termination(callback);
                    }
                    *state = State::Finished;
                    (Some(result), action)
                }
            }
            | State::Finished => (Some(Ok(None)), action),
        }
    }

    /// Terminal transition. Suspended producers resume with
    /// already-finished; the buffer and failure remain receivable.
    pub(super) fn finish(&mut self, failure: Option<E>) -> Action {
        let Self {
            state,
            resolved_sends,
            ..
        } = self;

        let mut action = Action::default();

        if let State::Channeling(channeling) = state {
            for producer in channeling.producers.drain(..) {
                match producer.kind {
                    | WaiterKind::Callback(callback) => {
                        action.push_send(callback, Err(ProduceError::AlreadyFinished));
                    }
                    | WaiterKind::Task(task) => {
                        resolved_sends.insert(producer.token, Err(ProduceError::AlreadyFinished));
                        action.push_task(task);
                    }
                }
            }

            if let Some(waker) = channeling.consumer.take() {
                action.push_task(waker);
            }

            *state = State::SourceFinished {
                buffer: mem::take(&mut channeling.buffer),
                failure,
                on_terminations: mem::take(&mut channeling.on_terminations),
            };
        }

        action
    }

    /// The consumer handle was dropped. Buffered elements become
    /// undeliverable, suspended producers fail and termination callbacks
    /// fire.
    pub(super) fn consumer_dropped(&mut self) -> Action {
        let Self {
            state,
            resolved_sends,
            ..
        } = self;

        let mut action = Action::default();

        match state {
            | State::Channeling(channeling) => {
                for producer in channeling.producers.drain(..) {
                    match producer.kind {
                        | WaiterKind::Callback(callback) => {
                            action.push_send(callback, Err(ProduceError::AlreadyFinished));
                        }
                        | WaiterKind::Task(task) => {
                            resolved_sends
                                .insert(producer.token, Err(ProduceError::AlreadyFinished));
                            action.push_task(task);
                        }
                    }
                }
                for (_, callback) in mem::take(&mut channeling.on_terminations) {
                    action.push_termination(callback);
                }
                *state = State::Finished;
            }
            | State::SourceFinished { on_terminations, .. } => {
                for (_, callback) in mem::take(on_terminations) {
                    action.push_termination(callback);
                }
                *state = State::Finished;
            }
            | State::Finished => {}
        }

        action
    }

    /// Installs or replaces the termination callback of a source. The
    /// callback fires once when the channel fully finishes, or immediately
    /// (via the returned action) when it already has.
    pub(super) fn set_on_termination(
        &mut self,
        source: u64,
        callback: TerminationCallback,
    ) -> Action {
        let mut action = Action::default();

        let registry = match &mut self.state {
            | State::Channeling(channeling) => Some(&mut channeling.on_terminations),
            | State::SourceFinished { on_terminations, .. } => Some(on_terminations),
            | State::Finished => None,
        };

        match registry {
            | Some(callbacks) => {
                if let Some(entry) = callbacks.iter_mut().find(|(id, _)| *id == source) {
                    entry.1 = callback;
                } else {
                    callbacks.push((source, callback));
                }
            }
            | None => action.push_termination(callback),
        }

        action
    }

    /// Removes the termination callback of a source, if any.
    pub(super) fn clear_on_termination(&mut self, source: u64) {
        match &mut self.state {
            | State::Channeling(channeling) => {
                channeling.on_terminations.retain(|(id, _)| *id != source);
            }
            | State::SourceFinished { on_terminations, .. } => {
                on_terminations.retain(|(id, _)| *id != source);
            }
            | State::Finished => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use futures::task::noop_waker;
    use parking_lot::Mutex;

    use super::*;

    type Log = Arc<Mutex<Vec<String>>>;

    fn logger(log: &Log, tag: &str) -> SendCallback {
        let log = log.clone();
        let tag = tag.to_owned();
        Box::new(move |result| log.lock().push(format!("{tag}:{result:?}")))
    }

    fn machine(low: usize, high: usize) -> Machine<u32, &'static str> {
        Machine::new(BackpressureStrategy::watermark(low, high))
    }

    fn enqueue_token(machine: &mut Machine<u32, &'static str>, element: u32) -> u64 {
        let (outcome, _) = machine.send(Batch::One(element));
        match outcome {
            | Ok(SendOutcome::Enqueue(token)) => token,
            | other => panic!("expected demand to close, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn sends_append_before_the_demand_decision() {
        let waker = noop_waker();
        let mut machine = machine(1, 2);

        assert!(matches!(
            machine.send(Batch::One(1)).0,
            Ok(SendOutcome::ProduceMore)
        ));
        let _token = enqueue_token(&mut machine, 2);

        // Both elements were committed despite demand closing.
        assert!(matches!(machine.next(&waker).0, Some(Ok(Some(1)))));
        assert!(matches!(machine.next(&waker).0, Some(Ok(Some(2)))));
    }

    #[test]
    fn crossing_the_low_watermark_resumes_producers_in_order() {
        let waker = noop_waker();
        let log = Log::default();
        let mut machine = machine(1, 2);

        machine.send(Batch::One(1)).1.execute();
        let first = enqueue_token(&mut machine, 2);
        let second = enqueue_token(&mut machine, 3);

        machine.enqueue_callback(first, logger(&log, "first")).execute();
        machine.enqueue_callback(second, logger(&log, "second")).execute();

        // Draining to 1 does not cross below low = 1.
        machine.next(&waker).1.execute();
        machine.next(&waker).1.execute();
        assert!(log.lock().is_empty());

        machine.next(&waker).1.execute();
        assert_eq!(*log.lock(), vec!["first:Ok(())", "second:Ok(())"]);
    }

    #[test]
    fn registration_after_demand_returned_resumes_immediately() {
        let waker = noop_waker();
        let log = Log::default();
        let mut machine = machine(1, 1);

        let token = enqueue_token(&mut machine, 1);
        machine.next(&waker).1.execute();

        machine.enqueue_callback(token, logger(&log, "cb")).execute();
        assert_eq!(*log.lock(), vec!["cb:Ok(())"]);
    }

    #[test]
    fn cancellation_before_registration_is_sticky() {
        let log = Log::default();
        let mut machine = machine(1, 1);

        let token = enqueue_token(&mut machine, 1);
        machine.cancel_callback(token).execute();
        machine.enqueue_callback(token, logger(&log, "cb")).execute();

        assert_eq!(*log.lock(), vec!["cb:Err(Cancelled)"]);
    }

    #[test]
    fn cancelling_a_registered_callback_resumes_it() {
        let log = Log::default();
        let mut machine = machine(1, 1);

        let token = enqueue_token(&mut machine, 1);
        machine.enqueue_callback(token, logger(&log, "cb")).execute();
        machine.cancel_callback(token).execute();

        assert_eq!(*log.lock(), vec!["cb:Err(Cancelled)"]);
    }

    #[test]
    fn finish_fails_suspended_producers_and_keeps_the_buffer() {
        let waker = noop_waker();
        let log = Log::default();
        let mut machine = machine(1, 1);

        let token = enqueue_token(&mut machine, 1);
        machine.enqueue_callback(token, logger(&log, "cb")).execute();

        machine.finish(Some("boom")).execute();
        assert_eq!(*log.lock(), vec!["cb:Err(AlreadyFinished)"]);

        assert!(matches!(
            machine.send(Batch::One(9)).0,
            Err(ProduceError::AlreadyFinished)
        ));

        assert!(matches!(machine.next(&waker).0, Some(Ok(Some(1)))));
        assert!(matches!(machine.next(&waker).0, Some(Err("boom"))));
        assert!(matches!(machine.next(&waker).0, Some(Ok(None))));
    }

    #[test]
    fn last_source_deinitialization_finishes_without_failure() {
        let waker = noop_waker();
        let mut machine = machine(1, 4);

        let second = machine.source_initialized();
        machine.send(Batch::One(1));

        machine.source_deinitialized(second).execute();
        assert!(!machine.is_finished());

        machine.source_deinitialized(0).execute();
        assert!(machine.is_finished());

        assert!(matches!(machine.next(&waker).0, Some(Ok(Some(1)))));
        assert!(matches!(machine.next(&waker).0, Some(Ok(None))));
    }

    #[test]
    fn termination_callbacks_fire_once_at_the_finished_edge() {
        let waker = noop_waker();
        let log = Log::default();
        let mut machine = machine(1, 4);

        let termination = {
            let log = log.clone();
            Box::new(move || log.lock().push("terminated".to_owned()))
        };
        machine.set_on_termination(0, termination).execute();

        machine.send(Batch::One(1));
        machine.finish(None).execute();
        assert!(log.lock().is_empty());

        machine.next(&waker).1.execute();
        assert!(log.lock().is_empty());

        machine.next(&waker).1.execute();
        assert_eq!(*log.lock(), vec!["terminated"]);

        // Registration on a finished channel fires immediately.
        let immediate = {
            let log = log.clone();
            Box::new(move || log.lock().push("immediate".to_owned()))
        };
        machine.set_on_termination(SENTINEL_SOURCE, immediate).execute();
        assert_eq!(*log.lock(), vec!["terminated", "immediate"]);
    }

    #[test]
    fn consumer_drop_fails_producers_and_fires_terminations() {
        let log = Log::default();
        let mut machine = machine(1, 1);

        let termination = {
            let log = log.clone();
            Box::new(move || log.lock().push("terminated".to_owned()))
        };
        machine.set_on_termination(0, termination).execute();

        let token = enqueue_token(&mut machine, 1);
        machine.enqueue_callback(token, logger(&log, "cb")).execute();

        machine.consumer_dropped().execute();

        assert_eq!(*log.lock(), vec!["cb:Err(AlreadyFinished)", "terminated"]);
        assert!(machine.is_finished());
    }

    #[test]
    fn sources_created_after_finishing_are_inert() {
        let mut machine = machine(1, 4);
        let waker = noop_waker();

        machine.finish(None).execute();
        machine.next(&waker).1.execute();

        let source = machine.source_initialized();
        assert_eq!(source, SENTINEL_SOURCE);

        machine.source_deinitialized(source).execute();
        assert!(machine.is_finished());
    }
}
