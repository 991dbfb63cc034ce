//! Cooperative Scheduler
//!
//! Coroutines are handle-allocated objects holding a state slot and a locals
//! area; suspension is a coroutine returning the reserved `PENDING` word from
//! its poll entry. There is no host event loop and no preemption: a ready
//! coroutine yields to another only at explicit suspension points, and within
//! one scheduler instance wakeups fire in enqueue order.
//!
//! ## Encoded resume targets
//!
//! The state slot stores an *encoded resume target*: the bitwise NOT of the
//! resume instruction index. Encoded targets are strictly negative, so they
//! can never collide with the non-negative logical states (`STATE_START`,
//! `STATE_DONE`).
//!
//! ## Ownership
//!
//! The ready queue and channel waiter sets hold raw handle words without a
//! reference count; the coroutine's owner (spawner or `block_on` caller)
//! keeps it alive until completion. Entries whose owner dropped early fail
//! to resolve at dispatch time and are skipped.

use crate::cancel::CancelToken;
use crate::exceptions::ExceptionData;
use crate::gil::PyToken;
use crate::handle_table::HandleTable;
use crate::object::{Payload, TYPE_GENERATOR};
use molt_core::Value;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

// =============================================================================
// Resume-target encoding
// =============================================================================

/// Initial state: the coroutine has never been polled.
pub const STATE_START: i64 = 0;

/// Terminal state: the coroutine completed and its suspension state is
/// consumed; further polls are a declared error.
pub const STATE_DONE: i64 = 1;

/// Encode a resume instruction index as a state-slot value.
#[inline(always)]
pub fn encode_resume(inst_index: u32) -> i64 {
    !(inst_index as i64)
}

/// Decode a state-slot value back to a resume instruction index, or `None`
/// for the logical states.
#[inline(always)]
pub fn decode_resume(state: i64) -> Option<u32> {
    if state < 0 { Some((!state) as u32) } else { None }
}

// =============================================================================
// Frames and coroutines
// =============================================================================

/// The mutable frame of a coroutine: state slot plus spilled locals.
#[derive(Debug, Default)]
pub struct CoroFrame {
    pub state: i64,
    pub locals: Vec<Value>,
}

impl CoroFrame {
    pub fn new() -> Self {
        CoroFrame {
            state: STATE_START,
            locals: Vec::new(),
        }
    }
}

/// Context handed to a coroutine body for one poll.
pub struct PollCx<'a, 'rt> {
    pub token: &'a mut PyToken<'rt>,
    pub frame: &'a mut CoroFrame,
    pub cancel: &'a CancelToken,
    /// The coroutine's own handle, registered on waiter sets at suspension.
    pub self_handle: Value,
    /// Value delivered by `GenSend` for this resumption.
    pub resume_arg: Option<Value>,
    /// Exception delivered by `GenThrow` for this resumption.
    pub resume_exc: Option<ExceptionData>,
    /// Set when this poll parked on a channel (deadline bookkeeping).
    pub waited_channel: Option<Value>,
}

impl<'a, 'rt> PollCx<'a, 'rt> {
    /// Cooperative cancellation check site.
    pub fn check_cancelled(&self) -> Result<(), ExceptionData> {
        self.cancel.check()
    }

    /// Inline-expanded child poll (`CallAsync`): pending bubbles up.
    pub fn poll_child(&mut self, child: Value) -> Result<Value, ExceptionData> {
        poll_future(self.token, child)
    }

    /// Channel send suspension point. Pending parks this coroutine on the
    /// channel's send waiters and returns the `PENDING` word.
    pub fn chan_send_yield(&mut self, chan: Value, value: Value) -> Result<Value, ExceptionData> {
        use crate::channel::{chan_send, SendResult};
        match chan_send(self.token, chan, value, Some(self.self_handle)) {
            SendResult::Sent => Ok(Value::NONE),
            SendResult::Pending => {
                self.waited_channel = Some(chan);
                Ok(Value::PENDING)
            }
            SendResult::Closed => Err(ExceptionData::value_error("send on closed channel")),
        }
    }

    /// Channel receive suspension point. A closed, drained channel raises
    /// `StopIteration`, which is what terminates an async-for loop.
    pub fn chan_recv_yield(&mut self, chan: Value) -> Result<Value, ExceptionData> {
        use crate::channel::{chan_recv, RecvResult};
        match chan_recv(self.token, chan, Some(self.self_handle)) {
            RecvResult::Received(v) => Ok(v),
            RecvResult::Pending => {
                self.waited_channel = Some(chan);
                Ok(Value::PENDING)
            }
            RecvResult::Closed => Err(ExceptionData::stop_iteration(Value::NONE)),
        }
    }
}

/// A compiled coroutine body. Produced binaries register emitted poll
/// functions; tests and shims use boxed Rust implementations.
pub trait Coroutine: Send {
    /// Run until the next suspension point. Returns the `PENDING` word to
    /// suspend, any other value to complete, or an exception.
    fn poll(&mut self, cx: &mut PollCx<'_, '_>) -> Result<Value, ExceptionData>;
}

impl<F> Coroutine for F
where
    F: FnMut(&mut PollCx<'_, '_>) -> Result<Value, ExceptionData> + Send,
{
    fn poll(&mut self, cx: &mut PollCx<'_, '_>) -> Result<Value, ExceptionData> {
        self(cx)
    }
}

// =============================================================================
// Future and generator payloads
// =============================================================================

/// Future payload: poll target + frame + completion cell.
pub struct FutureState {
    pub coro: Option<Box<dyn Coroutine>>,
    pub frame: CoroFrame,
    pub completed: Option<Result<Value, ExceptionData>>,
    pub cancel: CancelToken,
    /// Channel this future is currently parked on, for deadline expiry.
    pub waiting_on: Option<Value>,
    pub poll_count: u64,
}

impl std::fmt::Debug for FutureState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FutureState")
            .field("state", &self.frame.state)
            .field("completed", &self.completed.is_some())
            .field("poll_count", &self.poll_count)
            .finish()
    }
}

/// Generator payload: resumable frame plus the send/throw channel.
pub struct GeneratorState {
    pub coro: Option<Box<dyn Coroutine>>,
    pub frame: CoroFrame,
    pub sent: Option<Value>,
    pub done: bool,
    pub cancel: CancelToken,
}

impl std::fmt::Debug for GeneratorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeneratorState")
            .field("state", &self.frame.state)
            .field("done", &self.done)
            .finish()
    }
}

/// Allocate a future for a coroutine body.
pub fn future_new(
    token: &mut PyToken<'_>,
    coro: Box<dyn Coroutine>,
    cancel: CancelToken,
) -> Value {
    HandleTable::global().alloc(
        token,
        Payload::Future(FutureState {
            coro: Some(coro),
            frame: CoroFrame::new(),
            completed: None,
            cancel,
            waiting_on: None,
            poll_count: 0,
        }),
        0,
    )
}

/// Allocate a generator object.
pub fn gen_new(token: &mut PyToken<'_>, coro: Box<dyn Coroutine>) -> Value {
    HandleTable::global().alloc(
        token,
        Payload::Generator(GeneratorState {
            coro: Some(coro),
            frame: CoroFrame::new(),
            sent: None,
            done: false,
            cancel: CancelToken::new(),
        }),
        0,
    )
}

/// True when the value is a generator object (`IsGenerator`).
pub fn is_generator(v: Value) -> bool {
    HandleTable::global().slot_type_id(v) == Some(TYPE_GENERATOR)
}

// =============================================================================
// Scheduler state
// =============================================================================

/// Ready queue + lifecycle counters, guarded by the runtime token.
pub struct SchedulerState {
    ready: VecDeque<Value>,
    pub enqueued_total: u64,
    pub polls_total: u64,
    pub completed_total: u64,
}

impl SchedulerState {
    pub fn new() -> Self {
        SchedulerState {
            ready: VecDeque::new(),
            enqueued_total: 0,
            polls_total: 0,
            completed_total: 0,
        }
    }

    /// Append a woken coroutine. Callbacks fire in enqueue order.
    pub fn enqueue(&mut self, w: Value) {
        self.enqueued_total += 1;
        self.ready.push_back(w);
    }

    pub fn dequeue(&mut self) -> Option<Value> {
        self.ready.pop_front()
    }

    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }
}

impl Default for SchedulerState {
    fn default() -> Self {
        SchedulerState::new()
    }
}

// =============================================================================
// Polling
// =============================================================================

thread_local! {
    /// Cancel token of the coroutine currently being polled on this thread,
    /// so the `cancel.check` intrinsic can find it without plumbing.
    static CURRENT_CANCEL: std::cell::RefCell<Option<CancelToken>> =
        const { std::cell::RefCell::new(None) };
}

/// The cancel token of the coroutine currently being polled, if any.
pub fn current_cancel_token() -> Option<CancelToken> {
    CURRENT_CANCEL.with(|c| c.borrow().clone())
}

/// Scope guard installing a poll's cancel token into the thread-local.
struct CancelScope {
    prev: Option<CancelToken>,
}

impl CancelScope {
    fn enter(token: &CancelToken) -> CancelScope {
        let prev = CURRENT_CANCEL.with(|c| c.borrow_mut().replace(token.clone()));
        CancelScope { prev }
    }
}

impl Drop for CancelScope {
    fn drop(&mut self) {
        let prev = self.prev.take();
        CURRENT_CANCEL.with(|c| *c.borrow_mut() = prev);
    }
}

/// Poll a future once. Returns the `PENDING` word, the completion value, or
/// the exception that terminated the coroutine.
///
/// Polling a completed future is a declared error: the suspension state was
/// consumed by the completing poll.
pub fn poll_future(token: &mut PyToken<'_>, fut: Value) -> Result<Value, ExceptionData> {
    let table = HandleTable::global();
    let Some(obj) = table.resolve(fut) else {
        panic!("{}", crate::exceptions::RuntimeFault::StaleHandle);
    };

    let (mut coro, mut frame, cancel) = {
        let Payload::Future(st) = obj.payload_mut(token) else {
            return Err(ExceptionData::type_error("object is not awaitable"));
        };
        if st.completed.is_some() {
            return Err(ExceptionData::value_error("future polled after completion"));
        }
        let Some(coro) = st.coro.take() else {
            return Err(ExceptionData::value_error("future poll re-entered"));
        };
        (coro, std::mem::take(&mut st.frame), st.cancel.clone())
    };
    drop(obj);
    token.sched.polls_total += 1;

    let scope = CancelScope::enter(&cancel);
    let mut cx = PollCx {
        token: &mut *token,
        frame: &mut frame,
        cancel: &cancel,
        self_handle: fut,
        resume_arg: None,
        resume_exc: None,
        waited_channel: None,
    };
    let result = coro.poll(&mut cx);
    let waited = cx.waited_channel;
    drop(cx);
    drop(scope);

    let finished = !matches!(&result, Ok(v) if v.is_pending());
    let Some(obj) = table.resolve(fut) else {
        panic!("{}", crate::exceptions::RuntimeFault::StaleHandle);
    };
    {
        let Payload::Future(st) = obj.payload_mut(token) else {
            unreachable!("future payload replaced during poll");
        };
        st.frame = frame;
        st.poll_count += 1;
        if finished {
            st.frame.state = STATE_DONE;
            st.waiting_on = None;
            st.completed = Some(result.clone());
        } else {
            st.coro = Some(coro);
            st.waiting_on = waited;
        }
    }
    drop(obj);
    if finished {
        token.sched.completed_total += 1;
    }
    result
}

/// Poll a ready-queue entry if it is still a pollable future. Stale and
/// completed entries are skipped. Returns true when a poll ran.
fn poll_ready_task(token: &mut PyToken<'_>, w: Value) -> bool {
    let table = HandleTable::global();
    let Some(obj) = table.resolve(w) else {
        return false;
    };
    let pollable = matches!(
        obj.payload(token),
        Payload::Future(st) if st.completed.is_none() && st.coro.is_some()
    );
    drop(obj);
    if !pollable {
        return false;
    }
    // A spawned task's exception is recorded in its completion cell; the
    // owner observes it there.
    let _ = poll_future(token, w);
    true
}

// =============================================================================
// block_on
// =============================================================================

/// Drive a future to completion, cooperatively running whatever the ready
/// queue holds in enqueue order while the root is suspended.
///
/// # Panics
/// A pending root with an empty ready queue is a deadlock; the scheduler
/// aborts with a `ScheduleInvariantViolation` rather than spin forever.
pub fn block_on(token: &mut PyToken<'_>, root: Value) -> Result<Value, ExceptionData> {
    loop {
        let r = poll_future(token, root)?;
        if !r.is_pending() {
            return Ok(r);
        }
        let mut progressed = false;
        while let Some(w) = token.sched.dequeue() {
            if w.same_bits(root) {
                progressed = true;
                break;
            }
            if poll_ready_task(token, w) {
                progressed = true;
                break;
            }
        }
        if !progressed {
            panic!(
                "{}",
                crate::exceptions::RuntimeFault::ScheduleInvariantViolation(
                    "pending root with an empty ready queue".into()
                )
            );
        }
    }
}

/// Outcome of a deadline-bounded wait.
#[derive(Debug)]
pub enum WaitOutcome {
    Completed(Result<Value, ExceptionData>),
    /// Deadline expired; the waiter was removed from any waiter set.
    TimedOut,
}

/// Drive a future with an optional deadline. A timeout wakes the waiter with
/// `TimedOut` and removes it from the channel waiter set it was parked on.
pub fn block_on_deadline(
    token: &mut PyToken<'_>,
    root: Value,
    timeout: Option<Duration>,
) -> WaitOutcome {
    let deadline = timeout.map(|d| Instant::now() + d);
    loop {
        match poll_future(token, root) {
            Ok(v) if v.is_pending() => {}
            other => return WaitOutcome::Completed(other),
        }

        if let Some(deadline) = deadline
            && Instant::now() >= deadline
        {
            // Leave no dangling waiter registration behind.
            let waited = {
                let table = HandleTable::global();
                let parked = table.resolve(root).and_then(|obj| {
                    if let Payload::Future(st) = obj.payload(token) {
                        st.waiting_on
                    } else {
                        None
                    }
                });
                parked
            };
            if let Some(chan) = waited {
                crate::channel::chan_remove_waiter(token, chan, root);
            }
            return WaitOutcome::TimedOut;
        }

        let mut progressed = false;
        while let Some(w) = token.sched.dequeue() {
            if w.same_bits(root) {
                progressed = true;
                break;
            }
            if poll_ready_task(token, w) {
                progressed = true;
                break;
            }
        }
        if !progressed {
            if deadline.is_some() {
                // Nothing runnable; wait out the deadline.
                std::thread::sleep(Duration::from_millis(1));
            } else {
                panic!(
                    "{}",
                    crate::exceptions::RuntimeFault::ScheduleInvariantViolation(
                        "pending root with an empty ready queue".into()
                    )
                );
            }
        }
    }
}

// =============================================================================
// Generators
// =============================================================================

/// Resume a generator with a sent value (`GenSend`). Yields come back as
/// `Ok`; completion raises `StopIteration` carrying the return value.
pub fn gen_send(token: &mut PyToken<'_>, g: Value, arg: Value) -> Result<Value, ExceptionData> {
    gen_resume(token, g, Some(arg), None)
}

/// Resume a generator with an exception (`GenThrow`).
pub fn gen_throw(
    token: &mut PyToken<'_>,
    g: Value,
    exc: ExceptionData,
) -> Result<Value, ExceptionData> {
    gen_resume(token, g, None, Some(exc))
}

/// Close a generator (`GenClose`): drops the frame and marks it done.
pub fn gen_close(token: &mut PyToken<'_>, g: Value) {
    let table = HandleTable::global();
    let Some(obj) = table.resolve(g) else {
        panic!("{}", crate::exceptions::RuntimeFault::StaleHandle);
    };
    if let Payload::Generator(st) = obj.payload_mut(token) {
        st.done = true;
        st.coro = None;
        st.frame.state = STATE_DONE;
    }
}

fn gen_resume(
    token: &mut PyToken<'_>,
    g: Value,
    arg: Option<Value>,
    exc: Option<ExceptionData>,
) -> Result<Value, ExceptionData> {
    let table = HandleTable::global();
    let Some(obj) = table.resolve(g) else {
        panic!("{}", crate::exceptions::RuntimeFault::StaleHandle);
    };

    let (mut coro, mut frame, cancel) = {
        let Payload::Generator(st) = obj.payload_mut(token) else {
            return Err(ExceptionData::type_error("object is not a generator"));
        };
        if st.done {
            return Err(ExceptionData::stop_iteration(Value::NONE));
        }
        let Some(coro) = st.coro.take() else {
            return Err(ExceptionData::value_error("generator already executing"));
        };
        (coro, std::mem::take(&mut st.frame), st.cancel.clone())
    };
    drop(obj);

    let scope = CancelScope::enter(&cancel);
    let mut cx = PollCx {
        token: &mut *token,
        frame: &mut frame,
        cancel: &cancel,
        self_handle: g,
        resume_arg: arg,
        resume_exc: exc,
        waited_channel: None,
    };
    let result = coro.poll(&mut cx);
    drop(cx);
    drop(scope);

    let finished = frame.state == STATE_DONE || result.is_err();
    let Some(obj) = table.resolve(g) else {
        panic!("{}", crate::exceptions::RuntimeFault::StaleHandle);
    };
    {
        let Payload::Generator(st) = obj.payload_mut(token) else {
            unreachable!("generator payload replaced during resume");
        };
        st.frame = frame;
        if finished {
            st.done = true;
            st.frame.state = STATE_DONE;
        } else {
            st.coro = Some(coro);
        }
    }
    drop(obj);

    match result {
        Ok(v) if finished => Err(ExceptionData::stop_iteration(v)),
        other => other,
    }
}
