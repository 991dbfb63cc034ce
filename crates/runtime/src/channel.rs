//! Channels
//!
//! Cooperative channels connecting coroutines: a value queue plus waiter
//! sets. Send and receive are non-blocking at the OS level; a full or empty
//! channel registers the calling coroutine as a waiter and reports pending,
//! and the peer operation re-enqueues one waiter on the scheduler's ready
//! queue. Delivery order equals send order, and waiters wake in registration
//! order, which together give the scheduler's enqueue-order == resume-order
//! guarantee.
//!
//! ## Ownership
//!
//! Queued values are owned by the channel: a send transfers the sender's
//! reference into the queue and a receive transfers it out. Waiter entries
//! are raw handle words without a count; a waiter that died early simply
//! fails to resolve at wake time and is skipped.
//!
//! ## Close semantics
//!
//! Closing wakes every waiter. Subsequent sends observe `Closed`; receives
//! drain the remaining queue first and then observe `Closed`.

use crate::gil::PyToken;
use crate::handle_table::HandleTable;
use crate::object::Payload;
use molt_core::Value;
use std::collections::VecDeque;

/// Channel payload: queue + waiter sets.
#[derive(Debug, Default)]
pub struct ChannelState {
    queue: VecDeque<Value>,
    /// `None` means unbounded.
    capacity: Option<usize>,
    closed: bool,
    recv_waiters: VecDeque<Value>,
    send_waiters: VecDeque<Value>,
    /// Lifetime count of accepted sends (monotonic).
    pub send_count: u64,
    /// Lifetime count of completed receives (monotonic).
    pub recv_count: u64,
}

impl ChannelState {
    pub fn new(capacity: Option<usize>) -> Self {
        ChannelState {
            capacity,
            ..ChannelState::default()
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Queued values, send order. The cycle collector traverses these as
    /// owned edges.
    pub fn queued(&self) -> impl Iterator<Item = &Value> {
        self.queue.iter()
    }

    fn register_recv_waiter(&mut self, waiter: Value) {
        if !self.recv_waiters.iter().any(|w| w.same_bits(waiter)) {
            self.recv_waiters.push_back(waiter);
        }
    }

    fn register_send_waiter(&mut self, waiter: Value) {
        if !self.send_waiters.iter().any(|w| w.same_bits(waiter)) {
            self.send_waiters.push_back(waiter);
        }
    }

    /// Drop a waiter from both sets (deadline expiry).
    pub fn remove_waiter(&mut self, waiter: Value) {
        self.recv_waiters.retain(|w| !w.same_bits(waiter));
        self.send_waiters.retain(|w| !w.same_bits(waiter));
    }
}

/// Outcome of a send attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendResult {
    /// Value queued; ownership transferred to the channel.
    Sent,
    /// Channel full; caller registered as a waiter (when one was given).
    Pending,
    /// Channel closed; the value was not taken.
    Closed,
}

/// Outcome of a receive attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum RecvResult {
    /// Ownership of the value transferred to the caller.
    Received(Value),
    /// Queue empty; caller registered as a waiter (when one was given).
    Pending,
    /// Channel closed and drained.
    Closed,
}

/// Allocate a channel object. `capacity` of `None` is unbounded; `Some(0)`
/// is rejected (a rendezvous channel is expressed as capacity 1 plus the
/// waiter handshake).
pub fn chan_new(token: &mut PyToken<'_>, capacity: Option<usize>) -> Result<Value, String> {
    if capacity == Some(0) {
        return Err("channel capacity must be at least 1".into());
    }
    Ok(HandleTable::global().alloc(token, Payload::Channel(ChannelState::new(capacity)), 0))
}

/// Send a value. On success one receive waiter (if any) is moved to the
/// ready queue. When full, `waiter` (the sending coroutine's handle) is
/// parked on the channel.
pub fn chan_send(
    token: &mut PyToken<'_>,
    chan: Value,
    value: Value,
    waiter: Option<Value>,
) -> SendResult {
    let table = HandleTable::global();
    let Some(obj) = table.resolve(chan) else {
        panic!("{}", crate::exceptions::RuntimeFault::StaleHandle);
    };

    let (result, wake) = {
        let Payload::Channel(state) = obj.payload_mut(token) else {
            panic!("chan_send on a non-channel object");
        };
        if state.closed {
            (SendResult::Closed, None)
        } else if state.capacity.is_some_and(|cap| state.queue.len() >= cap) {
            if let Some(w) = waiter {
                state.register_send_waiter(w);
            }
            (SendResult::Pending, None)
        } else {
            state.queue.push_back(value);
            state.send_count += 1;
            (SendResult::Sent, state.recv_waiters.pop_front())
        }
    };
    drop(obj);

    if let Some(w) = wake {
        token.sched.enqueue(w);
    }
    result
}

/// Receive a value. On success one send waiter (if any) is moved to the
/// ready queue. When empty, `waiter` is parked on the channel.
pub fn chan_recv(token: &mut PyToken<'_>, chan: Value, waiter: Option<Value>) -> RecvResult {
    let table = HandleTable::global();
    let Some(obj) = table.resolve(chan) else {
        panic!("{}", crate::exceptions::RuntimeFault::StaleHandle);
    };

    let (result, wake) = {
        let Payload::Channel(state) = obj.payload_mut(token) else {
            panic!("chan_recv on a non-channel object");
        };
        if let Some(v) = state.queue.pop_front() {
            state.recv_count += 1;
            (RecvResult::Received(v), state.send_waiters.pop_front())
        } else if state.closed {
            (RecvResult::Closed, None)
        } else {
            if let Some(w) = waiter {
                state.register_recv_waiter(w);
            }
            (RecvResult::Pending, None)
        }
    };
    drop(obj);

    if let Some(w) = wake {
        token.sched.enqueue(w);
    }
    result
}

/// Close a channel and wake every waiter. Idempotent.
pub fn chan_close(token: &mut PyToken<'_>, chan: Value) {
    let table = HandleTable::global();
    let Some(obj) = table.resolve(chan) else {
        panic!("{}", crate::exceptions::RuntimeFault::StaleHandle);
    };

    let woken: Vec<Value> = {
        let Payload::Channel(state) = obj.payload_mut(token) else {
            panic!("chan_close on a non-channel object");
        };
        state.closed = true;
        state
            .recv_waiters
            .drain(..)
            .chain(state.send_waiters.drain(..))
            .collect()
    };
    drop(obj);

    for w in woken {
        token.sched.enqueue(w);
    }
}

/// Remove a coroutine from a channel's waiter sets (deadline expiry).
pub fn chan_remove_waiter(token: &mut PyToken<'_>, chan: Value, waiter: Value) {
    let table = HandleTable::global();
    let Some(obj) = table.resolve(chan) else {
        return; // channel already reclaimed: nothing to leave
    };
    if let Payload::Channel(state) = obj.payload_mut(token) {
        state.remove_waiter(waiter);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gil::with_gil;
    use crate::rc::dec_ref;
    use molt_core::Handle;
    use serial_test::serial;

    fn fake_waiter(n: u32) -> Value {
        Value::from_handle(Handle::new(n, 1))
    }

    #[test]
    #[serial]
    fn test_send_recv_preserves_order() {
        with_gil(|token| {
            let ch = chan_new(token, None).unwrap();
            for n in [1i64, 2, 3] {
                assert_eq!(
                    chan_send(token, ch, Value::from_int(n), None),
                    SendResult::Sent
                );
            }
            for n in [1i64, 2, 3] {
                match chan_recv(token, ch, None) {
                    RecvResult::Received(v) => assert_eq!(v.as_int(), n),
                    other => panic!("expected value, got {:?}", other),
                }
            }
            assert_eq!(chan_recv(token, ch, None), RecvResult::Pending);
            dec_ref(token, ch);
        });
    }

    #[test]
    #[serial]
    fn test_bounded_channel_parks_sender() {
        with_gil(|token| {
            let ch = chan_new(token, Some(1)).unwrap();
            assert_eq!(
                chan_send(token, ch, Value::from_int(1), None),
                SendResult::Sent
            );
            let sender = fake_waiter(42);
            assert_eq!(
                chan_send(token, ch, Value::from_int(2), Some(sender)),
                SendResult::Pending
            );
            // Receiving frees a slot and wakes the parked sender.
            let before = token.sched.ready_len();
            match chan_recv(token, ch, None) {
                RecvResult::Received(v) => assert_eq!(v.as_int(), 1),
                other => panic!("expected value, got {:?}", other),
            }
            assert_eq!(token.sched.ready_len(), before + 1);
            dec_ref(token, ch);
        });
    }

    #[test]
    #[serial]
    fn test_close_drains_then_reports_closed() {
        with_gil(|token| {
            let ch = chan_new(token, None).unwrap();
            chan_send(token, ch, Value::from_int(7), None);
            chan_close(token, ch);
            assert_eq!(
                chan_send(token, ch, Value::from_int(8), None),
                SendResult::Closed
            );
            match chan_recv(token, ch, None) {
                RecvResult::Received(v) => assert_eq!(v.as_int(), 7),
                other => panic!("expected drained value, got {:?}", other),
            }
            assert_eq!(chan_recv(token, ch, None), RecvResult::Closed);
            dec_ref(token, ch);
        });
    }

    #[test]
    #[serial]
    fn test_close_wakes_all_waiters() {
        with_gil(|token| {
            let ch = chan_new(token, None).unwrap();
            chan_recv(token, ch, Some(fake_waiter(1)));
            chan_recv(token, ch, Some(fake_waiter(2)));
            let before = token.sched.ready_len();
            chan_close(token, ch);
            assert_eq!(token.sched.ready_len(), before + 2);
            dec_ref(token, ch);
        });
    }

    #[test]
    #[serial]
    fn test_waiter_registration_dedupes() {
        with_gil(|token| {
            let ch = chan_new(token, None).unwrap();
            let w = fake_waiter(9);
            chan_recv(token, ch, Some(w));
            chan_recv(token, ch, Some(w));
            let before = token.sched.ready_len();
            chan_close(token, ch);
            assert_eq!(token.sched.ready_len(), before + 1, "one wake per waiter");
            dec_ref(token, ch);
        });
    }

    #[test]
    #[serial]
    fn test_zero_capacity_rejected() {
        with_gil(|token| {
            assert!(chan_new(token, Some(0)).is_err());
        });
    }
}
