//! The promise state machine
//!
//! A `Promise` owns a launch body, retry/timeout policy, ordered
//! callback registries (then/catch/progress/close) and a settlement
//! result written at most once. State transitions are monotonic within
//! one retry cycle: INIT → LAUNCH → {RETRY → LAUNCH}* →
//! {RESOLVE | REJECT} → CLOSE. User code is never invoked while a
//! promise lock is held.

use crate::dispatcher::{stage_defaults, Dispatcher};
use crate::error::{panic_message, PromiseError};
use crate::outcome::{Outcome, Payload, Progress};
use crate::{registry, timer};
use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

type Body = Arc<dyn Fn(&Arc<Promise>) + Send + Sync>;
type ThenHandler = Box<dyn FnOnce(Option<Payload>) -> Result<Option<Payload>, Outcome> + Send>;
type CatchHandler = Box<dyn FnOnce(&Outcome) + Send>;
type ProgressHandler = Arc<dyn Fn(&Progress) + Send + Sync>;
type CloseHandler = Box<dyn FnOnce() + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Init,
    Launch,
    Retry,
    Resolve,
    Reject,
    Close,
}

/// State and registries guarded by the single per-promise lock.
struct Inner {
    state: State,
    retry_limit: u32,
    retry_count: u32,
    timeout: Duration,
    /// Bumped on every timer arm and on close; stale timer entries
    /// carry an older generation and fire as no-ops.
    timer_generation: u64,
    /// True while the body runs inside the launch loop's frame.
    in_body: bool,
    /// Set by resolve/reject during the current launch iteration.
    settled_in_frame: bool,
    /// Body opted out of auto-resolve; completion arrives externally.
    external: bool,
    then_chain: Vec<(Dispatcher, ThenHandler)>,
    catch_chain: Vec<(Dispatcher, CatchHandler)>,
    progress_chain: Vec<(Dispatcher, ProgressHandler)>,
    close_chain: Vec<(Dispatcher, CloseHandler)>,
}

/// FIFO progress queue, decoupled from the state lock so delivery never
/// blocks state transitions.
struct ProgressQueue {
    events: VecDeque<Progress>,
    draining: bool,
}

/// An asynchronous operation with deferred-result semantics: retryable
/// launch, timeout, in-order progress streaming, chained callbacks and
/// cross-thread completion by id.
pub struct Promise {
    id: u32,
    name: String,
    launch_dispatcher: Dispatcher,
    body: Body,
    me: Weak<Promise>,
    inner: Mutex<Inner>,
    settled: Mutex<Option<Outcome>>,
    settled_cv: Condvar,
    progress: Mutex<ProgressQueue>,
    /// Result known at construction; serves blocking waits without
    /// scheduling.
    presettled: bool,
}

impl Promise {
    /// Creates a promise on the default launch dispatcher.
    pub fn new<F>(func: F) -> Arc<Promise>
    where
        F: Fn(&Arc<Promise>) + Send + Sync + 'static,
    {
        Self::with(stage_defaults().launch, "", func)
    }

    /// Creates a named promise on the default launch dispatcher.
    pub fn named<F>(name: &str, func: F) -> Arc<Promise>
    where
        F: Fn(&Arc<Promise>) + Send + Sync + 'static,
    {
        Self::with(stage_defaults().launch, name, func)
    }

    /// Creates a promise with an explicit dispatcher and name. The body
    /// receives the promise itself so it can resolve, reject and report
    /// progress.
    pub fn with<F>(dispatcher: Dispatcher, name: &str, func: F) -> Arc<Promise>
    where
        F: Fn(&Arc<Promise>) + Send + Sync + 'static,
    {
        Self::build(dispatcher, name, Arc::new(func), None)
    }

    /// A promise that is already resolved with no payload.
    pub fn resolved() -> Arc<Promise> {
        let body: Body = Arc::new(|promise: &Arc<Promise>| promise.resolve());
        Self::build(Dispatcher::Unconfined, "", body, Some(Outcome::success()))
    }

    /// A promise that is already resolved with the given payload.
    pub fn resolved_with<T: Any + Send + Sync>(data: T) -> Arc<Promise> {
        let payload: Payload = Arc::new(data);
        let preset = Outcome::success_payload(payload.clone());
        let body: Body = Arc::new(move |promise: &Arc<Promise>| {
            promise.resolve_payload(Some(payload.clone()));
        });
        Self::build(Dispatcher::Unconfined, "", body, Some(preset))
    }

    /// A promise that is already rejected with a generic failure.
    pub fn rejected() -> Arc<Promise> {
        Self::rejected_with(Outcome::failure())
    }

    /// A promise that is already rejected with the given outcome.
    pub fn rejected_with(outcome: Outcome) -> Arc<Promise> {
        let preset = outcome.clone();
        let body: Body = Arc::new(move |promise: &Arc<Promise>| {
            promise.reject_with(outcome.clone());
        });
        Self::build(Dispatcher::Unconfined, "", body, Some(preset))
    }

    fn build(
        dispatcher: Dispatcher,
        name: &str,
        body: Body,
        preset: Option<Outcome>,
    ) -> Arc<Promise> {
        let id = registry::next_id();
        let presettled = preset.is_some();
        Arc::new_cyclic(|me| Promise {
            id,
            name: name.to_string(),
            launch_dispatcher: dispatcher,
            body,
            me: me.clone(),
            inner: Mutex::new(Inner {
                state: State::Init,
                retry_limit: 0,
                retry_count: 0,
                timeout: Duration::ZERO,
                timer_generation: 0,
                in_body: false,
                settled_in_frame: false,
                external: false,
                then_chain: Vec::new(),
                catch_chain: Vec::new(),
                progress_chain: Vec::new(),
                close_chain: Vec::new(),
            }),
            settled: Mutex::new(preset),
            settled_cv: Condvar::new(),
            progress: Mutex::new(ProgressQueue {
                events: VecDeque::new(),
                draining: false,
            }),
            presettled,
        })
    }

    /// Identifier, unique among currently-live promises.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Diagnostic name, possibly empty.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of retries consumed so far.
    pub fn retry_count(&self) -> u32 {
        self.inner.lock().unwrap().retry_count
    }

    /// The settlement result, once written.
    pub fn result(&self) -> Option<Outcome> {
        self.settled.lock().unwrap().clone()
    }

    /// True once the promise reached RESOLVE, REJECT or CLOSE.
    pub fn is_finished(&self) -> bool {
        matches!(
            self.inner.lock().unwrap().state,
            State::Resolve | State::Reject | State::Close
        )
    }

    /// Sets the retry limit. Negative values clamp to 0. Effective only
    /// before launch.
    pub fn retry(self: Arc<Self>, times: i32) -> Arc<Self> {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.state == State::Init {
                inner.retry_limit = times.max(0) as u32;
            }
        }
        self
    }

    /// Sets the per-attempt timeout in milliseconds; 0 disables it.
    /// Effective only before launch.
    pub fn timeout(self: Arc<Self>, millis: u64) -> Arc<Self> {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.state == State::Init {
                inner.timeout = Duration::from_millis(millis);
            }
        }
        self
    }

    /// Marks this promise as externally completed: when the body
    /// returns without settling, the runtime must not auto-resolve but
    /// wait for completion by id through the registry.
    pub fn external(&self) {
        self.inner.lock().unwrap().external = true;
    }

    /// Registers a then-stage on the default then dispatcher.
    ///
    /// The handler receives the current success payload and returns the
    /// payload the next stage observes; `Err(outcome)` abandons the
    /// chain and redirects to rejection with that outcome.
    pub fn on_then<F>(self: Arc<Self>, func: F) -> Arc<Self>
    where
        F: FnOnce(Option<Payload>) -> Result<Option<Payload>, Outcome> + Send + 'static,
    {
        let dispatcher = stage_defaults().then;
        self.on_then_at(dispatcher, func)
    }

    /// Registers a then-stage on an explicit dispatcher.
    pub fn on_then_at<F>(self: Arc<Self>, dispatcher: Dispatcher, func: F) -> Arc<Self>
    where
        F: FnOnce(Option<Payload>) -> Result<Option<Payload>, Outcome> + Send + 'static,
    {
        self.inner
            .lock()
            .unwrap()
            .then_chain
            .push((dispatcher, Box::new(func)));
        self
    }

    /// Registers a catch-stage on the default catch dispatcher. Every
    /// registered catch-stage runs on final rejection, in order.
    pub fn on_catch<F>(self: Arc<Self>, func: F) -> Arc<Self>
    where
        F: FnOnce(&Outcome) + Send + 'static,
    {
        let dispatcher = stage_defaults().catch;
        self.on_catch_at(dispatcher, func)
    }

    /// Registers a catch-stage on an explicit dispatcher.
    pub fn on_catch_at<F>(self: Arc<Self>, dispatcher: Dispatcher, func: F) -> Arc<Self>
    where
        F: FnOnce(&Outcome) + Send + 'static,
    {
        self.inner
            .lock()
            .unwrap()
            .catch_chain
            .push((dispatcher, Box::new(func)));
        self
    }

    /// Diagnostic catch subscriber: when `debug` is set, logs the
    /// rejection through `tracing`.
    pub fn on_catch_log(self: Arc<Self>, debug: bool) -> Arc<Self> {
        if !debug {
            return self;
        }
        let id = self.id;
        let name = if self.name.is_empty() {
            "<empty>".to_string()
        } else {
            self.name.clone()
        };
        self.on_catch(move |outcome| {
            tracing::debug!(
                id,
                name = %name,
                code = %outcome.code(),
                msg = %outcome.msg(),
                "promise rejected"
            );
        })
    }

    /// Registers a progress subscriber on the default progress
    /// dispatcher. Events are delivered in enqueue order, exactly once.
    pub fn on_progress<F>(self: Arc<Self>, func: F) -> Arc<Self>
    where
        F: Fn(&Progress) + Send + Sync + 'static,
    {
        let dispatcher = stage_defaults().progress;
        self.on_progress_at(dispatcher, func)
    }

    /// Registers a progress subscriber on an explicit dispatcher.
    pub fn on_progress_at<F>(self: Arc<Self>, dispatcher: Dispatcher, func: F) -> Arc<Self>
    where
        F: Fn(&Progress) + Send + Sync + 'static,
    {
        self.inner
            .lock()
            .unwrap()
            .progress_chain
            .push((dispatcher, Arc::new(func)));
        self
    }

    /// Registers a close-stage on the default close dispatcher. Close
    /// stages run exactly once, whichever way the promise ends.
    pub fn on_close<F>(self: Arc<Self>, func: F) -> Arc<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let dispatcher = stage_defaults().close;
        self.on_close_at(dispatcher, func)
    }

    /// Registers a close-stage on an explicit dispatcher.
    pub fn on_close_at<F>(self: Arc<Self>, dispatcher: Dispatcher, func: F) -> Arc<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner
            .lock()
            .unwrap()
            .close_chain
            .push((dispatcher, Box::new(func)));
        self
    }

    /// Schedules the body on the launch dispatcher and returns
    /// immediately. Registers the id for external completion; the entry
    /// is removed at close.
    pub fn launch(self: Arc<Self>) -> Result<(), PromiseError> {
        self.start_inner(false).map(|_| ())
    }

    /// Schedules the body and parks the calling thread until
    /// settlement. Returns the success payload or the failure as a
    /// typed error. Forbidden on the unconfined dispatcher.
    pub fn block_on(self: Arc<Self>) -> Result<Option<Payload>, PromiseError> {
        self.start_inner(true)
    }

    fn start_inner(self: Arc<Self>, blocking: bool) -> Result<Option<Payload>, PromiseError> {
        if blocking {
            if self.presettled {
                let result = self.settled.lock().unwrap().clone().ok_or_else(|| {
                    PromiseError::Internal("pre-settled promise lost its result".to_string())
                })?;
                if result.is_success() {
                    return Ok(result.payload());
                }
                return Err(PromiseError::Rejected {
                    promise: Some(self),
                    outcome: result,
                });
            }
            if self.launch_dispatcher.is_unconfined() {
                return Err(PromiseError::AwaitUnconfined);
            }
        }

        {
            let mut inner = self.inner.lock().unwrap();
            if inner.state != State::Init {
                return Err(PromiseError::InvalidState("promise already started"));
            }
            inner.state = State::Launch;
            inner.retry_count = 0;
        }

        if !blocking {
            registry::insert(&self);
        }

        let task = Arc::clone(&self);
        self.launch_dispatcher
            .execute(Box::new(move || task.run_launch_loop()));

        if !blocking {
            return Ok(None);
        }

        let mut settled = self.settled.lock().unwrap();
        let result = loop {
            if let Some(result) = settled.as_ref() {
                break result.clone();
            }
            settled = self.settled_cv.wait(settled).unwrap();
        };
        drop(settled);

        if result.is_success() {
            Ok(result.payload())
        } else {
            Err(PromiseError::Rejected {
                promise: Some(self),
                outcome: result,
            })
        }
    }

    /// One launch iteration per loop pass; repeats while a rejection
    /// flagged a retry inside the body's frame.
    fn run_launch_loop(self: Arc<Self>) {
        loop {
            let (timeout, generation) = {
                let mut inner = self.inner.lock().unwrap();
                if inner.state == State::Close {
                    return;
                }
                inner.state = State::Launch;
                inner.settled_in_frame = false;
                inner.in_body = true;
                inner.timer_generation += 1;
                (inner.timeout, inner.timer_generation)
            };
            if !timeout.is_zero() {
                timer::schedule(Instant::now() + timeout, generation, self.me.clone());
            }

            let body = Arc::clone(&self.body);
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| body(&self))) {
                self.reject_with(Outcome::internal(panic_message(panic)));
            }

            let mut inner = self.inner.lock().unwrap();
            inner.in_body = false;
            if inner.state == State::Retry {
                continue;
            }
            if inner.state == State::Launch && !inner.settled_in_frame && !inner.external {
                // Body returned without settling: auto-resolve with an
                // empty success, skipping the then-chain.
                inner.state = State::Resolve;
                drop(inner);
                self.record_result(Outcome::success());
                self.close();
            }
            return;
        }
    }

    /// Resolves with no payload. No-op unless the state is LAUNCH.
    pub fn resolve(&self) {
        self.resolve_payload(None);
    }

    /// Resolves with a typed payload. No-op unless the state is LAUNCH.
    pub fn resolve_with<T: Any + Send + Sync>(&self, data: T) {
        self.resolve_payload(Some(Arc::new(data)));
    }

    /// Resolves with an already-wrapped payload.
    pub fn resolve_payload(&self, data: Option<Payload>) {
        let stages = {
            let mut inner = self.inner.lock().unwrap();
            if inner.state != State::Launch {
                return;
            }
            inner.settled_in_frame = true;
            inner.state = State::Resolve;
            inner.then_chain.drain(..).collect::<Vec<_>>()
        };
        if let Some(me) = self.me.upgrade() {
            Dispatcher::Default.execute(Box::new(move || me.run_then_chain(data, stages)));
        }
    }

    /// Rejects with a generic failure.
    pub fn reject(&self) {
        self.reject_with(Outcome::failure());
    }

    /// Rejects with an arbitrary code and message.
    pub fn reject_err(&self, code: &str, msg: &str) {
        self.reject_with(Outcome::new(code, msg));
    }

    /// Rejects with the given outcome. No-op unless the state is
    /// LAUNCH. Consumes a retry when any remain; only the final
    /// rejection runs the catch-chain.
    pub fn reject_with(&self, outcome: Outcome) {
        self.reject_guarded(outcome, None);
    }

    /// Rejection core. `armed` carries the timer's arm generation: the
    /// staleness check must share the critical section with the state
    /// transition, or a timer firing between an in-frame retry and its
    /// relaunch could bill the fresh attempt for a timeout it never
    /// had.
    fn reject_guarded(&self, outcome: Outcome, armed: Option<u64>) {
        enum Next {
            Ignore,
            RetryInFrame,
            Relaunch,
            Fail,
        }

        let next = {
            let mut inner = self.inner.lock().unwrap();
            let stale = armed.map_or(false, |generation| inner.timer_generation != generation);
            if stale || inner.state != State::Launch {
                Next::Ignore
            } else {
                inner.settled_in_frame = true;
                if inner.retry_count < inner.retry_limit {
                    inner.retry_count += 1;
                    if inner.in_body {
                        // The launch loop picks the retry up when the
                        // body's frame returns.
                        inner.state = State::Retry;
                        Next::RetryInFrame
                    } else {
                        inner.state = State::Launch;
                        Next::Relaunch
                    }
                } else {
                    inner.state = State::Reject;
                    Next::Fail
                }
            }
        };

        match next {
            Next::Ignore | Next::RetryInFrame => {}
            Next::Relaunch => {
                if let Some(me) = self.me.upgrade() {
                    let task = Arc::clone(&me);
                    self.launch_dispatcher
                        .execute(Box::new(move || task.run_launch_loop()));
                }
            }
            Next::Fail => {
                if let Some(me) = self.me.upgrade() {
                    Dispatcher::Default.execute(Box::new(move || me.run_catch_chain(outcome)));
                }
            }
        }
    }

    /// Emits a bare progress value.
    pub fn progress(&self, value: i32) {
        self.progress_event(Progress::new(value));
    }

    /// Emits a progress value with a detail outcome.
    pub fn progress_with(&self, value: i32, detail: Outcome) {
        self.progress_event(Progress::with_detail(value, detail));
    }

    /// Enqueues a progress event; the first event after an empty queue
    /// starts a drain pass that delivers strictly in enqueue order.
    pub fn progress_event(&self, event: Progress) {
        let start_drain = {
            let mut queue = self.progress.lock().unwrap();
            queue.events.push_back(event);
            if queue.draining {
                false
            } else {
                queue.draining = true;
                true
            }
        };
        if start_drain {
            if let Some(me) = self.me.upgrade() {
                Dispatcher::Default.execute(Box::new(move || me.drain_progress()));
            }
        }
    }

    /// Idempotent teardown: records Abort when unsettled, cancels the
    /// timer and launch effects, unregisters the id and runs the
    /// close-chain exactly once.
    pub fn close(&self) {
        let close_stages = {
            let mut inner = self.inner.lock().unwrap();
            if inner.state == State::Close {
                return;
            }
            inner.state = State::Close;
            inner.timer_generation += 1;
            inner.then_chain.clear();
            inner.catch_chain.clear();
            inner.close_chain.drain(..).collect::<Vec<_>>()
        };
        // First write wins: a force-close before settlement records
        // Abort, otherwise the settled result is already in place.
        self.record_result(Outcome::abort());
        registry::remove(self.id);

        if close_stages.is_empty() {
            return;
        }
        Dispatcher::Default.execute(Box::new(move || {
            for (dispatcher, handler) in close_stages {
                let step = move || {
                    if catch_unwind(AssertUnwindSafe(handler)).is_err() {
                        tracing::warn!("close handler panicked");
                    }
                };
                match dispatcher {
                    Dispatcher::Default | Dispatcher::Unconfined => step(),
                    other => {
                        other.run_sync(step);
                    }
                }
            }
        }));
    }

    /// Called by the shared timer; rejects with Timeout when the arm
    /// generation is still current.
    pub(crate) fn timeout_fired(&self, generation: u64) {
        self.reject_guarded(Outcome::timeout(), Some(generation));
    }

    fn record_result(&self, outcome: Outcome) {
        let mut settled = self.settled.lock().unwrap();
        if settled.is_none() {
            *settled = Some(outcome);
        }
        self.settled_cv.notify_all();
    }

    /// Runs each then-stage on its dispatcher, in registration order,
    /// threading the success value through. A stage failure abandons
    /// the chain and redirects to the catch-chain.
    fn run_then_chain(
        self: Arc<Self>,
        initial: Option<Payload>,
        stages: Vec<(Dispatcher, ThenHandler)>,
    ) {
        let mut value = initial;
        for (dispatcher, handler) in stages {
            let input = value.clone();
            let step = move || {
                catch_unwind(AssertUnwindSafe(|| handler(input)))
                    .unwrap_or_else(|panic| Err(Outcome::internal(panic_message(panic))))
            };
            // Stages on the driver's own context run inline to keep the
            // pool from starving under many concurrent chains.
            let verdict = match dispatcher {
                Dispatcher::Default | Dispatcher::Unconfined => step(),
                other => other
                    .run_sync(step)
                    .unwrap_or_else(|| Err(Outcome::internal("then stage never reported"))),
            };
            match verdict {
                Ok(next) => value = next,
                Err(failure) => {
                    self.redirect_to_catch(failure);
                    return;
                }
            }
        }
        let result = match value {
            Some(payload) => Outcome::success_payload(payload),
            None => Outcome::success(),
        };
        self.record_result(result);
        self.close();
    }

    /// A then-stage failed after the body already succeeded: bypass the
    /// retry budget and reject outright.
    fn redirect_to_catch(self: Arc<Self>, outcome: Outcome) {
        {
            let mut inner = self.inner.lock().unwrap();
            if matches!(inner.state, State::Reject | State::Close) {
                return;
            }
            inner.state = State::Reject;
        }
        self.run_catch_chain(outcome);
    }

    /// Runs every catch-stage in registration order, then records the
    /// failure and closes.
    fn run_catch_chain(self: Arc<Self>, outcome: Outcome) {
        let stages = {
            let mut inner = self.inner.lock().unwrap();
            inner.catch_chain.drain(..).collect::<Vec<_>>()
        };
        for (dispatcher, handler) in stages {
            let failure = outcome.clone();
            let step = move || {
                if catch_unwind(AssertUnwindSafe(|| handler(&failure))).is_err() {
                    tracing::warn!("catch handler panicked");
                }
            };
            match dispatcher {
                Dispatcher::Default | Dispatcher::Unconfined => step(),
                other => {
                    other.run_sync(step);
                }
            }
        }
        self.record_result(outcome);
        self.close();
    }

    /// Pops and delivers queued progress events until the queue is
    /// empty. Only one drain pass runs at a time; every subscriber is
    /// awaited per event, preserving strict enqueue order.
    fn drain_progress(self: Arc<Self>) {
        loop {
            let event = {
                let mut queue = self.progress.lock().unwrap();
                match queue.events.pop_front() {
                    Some(event) => event,
                    None => {
                        queue.draining = false;
                        return;
                    }
                }
            };
            let subscribers = self.inner.lock().unwrap().progress_chain.clone();
            for (dispatcher, handler) in subscribers {
                let item = event.clone();
                let step = move || {
                    if catch_unwind(AssertUnwindSafe(|| handler(&item))).is_err() {
                        tracing::warn!("progress handler panicked");
                    }
                };
                match dispatcher {
                    Dispatcher::Default | Dispatcher::Unconfined => step(),
                    other => {
                        other.run_sync(step);
                    }
                }
            }
        }
    }
}

impl fmt::Debug for Promise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("dispatcher", &self.launch_dispatcher)
            .finish()
    }
}
