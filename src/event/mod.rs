// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Event-loop interface for periodic ticks and delayed callbacks.
//!
//! The PubSub layer never owns a thread. All periodic work (subscribe
//! ticks, receive-timeout monitors) and all deferred teardown (delayed
//! frees after channel closure) is scheduled through this trait. A
//! connection may carry its own loop; otherwise the stack-wide default is
//! used.
//!
//! [`ManualEventLoop`] is the bundled implementation: single-threaded,
//! virtual-time, driven explicitly via [`ManualEventLoop::run_iterate`]
//! and [`ManualEventLoop::advance`]. Production embeddings that already
//! run a reactor implement [`EventLoop`] on top of it.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

/// Identifier of a registered cyclic or timed callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(pub u64);

/// Repeatedly invocable callback (cyclic and timed registrations).
pub type LoopCallback = Box<dyn FnMut() + Send>;

/// One-shot callback queued for the next loop iteration.
pub type DelayedCallback = Box<dyn FnOnce() + Send>;

/// Scheduling surface the PubSub entities program against.
///
/// Implementations must tolerate re-entrant registration: a callback
/// running on the loop may add or remove other callbacks. A removed
/// callback that is currently executing completes its invocation; it is
/// simply never fired again.
pub trait EventLoop: Send + Sync {
    /// Register a callback fired every `interval_ms` milliseconds.
    fn add_cyclic_callback(&self, interval_ms: u64, cb: LoopCallback) -> CallbackId;

    /// Register a one-shot callback fired once after `delay_ms`.
    fn add_timed_callback(&self, delay_ms: u64, cb: LoopCallback) -> CallbackId;

    /// Queue a callback for the next loop iteration. Used for deferred
    /// frees: by the time the callback runs, no other loop callback can
    /// still reference the entity being torn down.
    fn add_delayed_callback(&self, cb: DelayedCallback);

    /// Cancel a cyclic or timed callback. Unknown ids are ignored.
    fn remove_callback(&self, id: CallbackId);
}

struct TimerEntry {
    id: CallbackId,
    due_ms: u64,
    /// Re-arm interval; `None` for one-shot timed callbacks.
    interval_ms: Option<u64>,
    cb: Arc<Mutex<LoopCallback>>,
}

struct LoopState {
    now_ms: u64,
    next_id: u64,
    timers: Vec<TimerEntry>,
    delayed: VecDeque<DelayedCallback>,
}

/// Deterministic, explicitly driven event loop.
///
/// Time only moves when [`advance`](ManualEventLoop::advance) is called,
/// which makes interval behavior exactly reproducible in tests. Callbacks
/// run on the caller's thread; the internal lock is never held while a
/// callback executes, so callbacks may freely re-enter the loop API.
pub struct ManualEventLoop {
    state: Mutex<LoopState>,
}

impl ManualEventLoop {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(ManualEventLoop {
            state: Mutex::new(LoopState {
                now_ms: 0,
                next_id: 1,
                timers: Vec::new(),
                delayed: VecDeque::new(),
            }),
        })
    }

    /// Current virtual time in milliseconds.
    #[must_use]
    pub fn now_ms(&self) -> u64 {
        self.state.lock().now_ms
    }

    /// Run the delayed-callback queue and any timer already due at the
    /// current virtual time. Callbacks queued *during* this iteration run
    /// on the next one.
    pub fn run_iterate(&self) {
        let (delayed, due) = {
            let mut st = self.state.lock();
            let delayed: Vec<DelayedCallback> = st.delayed.drain(..).collect();
            let due = Self::collect_due(&mut st);
            (delayed, due)
        };
        for cb in delayed {
            cb();
        }
        for cb in due {
            let mut f = cb.lock();
            (*f)();
        }
    }

    /// Advance virtual time by `ms`, firing timers in deadline order and
    /// draining the delayed queue at each step. A cyclic callback whose
    /// deadline is missed fires with the current time (miss-tolerant).
    pub fn advance(&self, ms: u64) {
        let target = self.state.lock().now_ms + ms;
        loop {
            self.run_iterate();
            let next = {
                let mut st = self.state.lock();
                match st.timers.iter().map(|t| t.due_ms).min() {
                    Some(due) if due <= target => {
                        st.now_ms = due.max(st.now_ms);
                        true
                    }
                    _ => {
                        st.now_ms = target;
                        false
                    }
                }
            };
            if !next {
                break;
            }
        }
        // Timers landing exactly on the target plus any delayed work they queued.
        self.run_iterate();
        self.run_iterate();
    }

    /// True when no delayed callback is pending. Timers are not counted.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.state.lock().delayed.is_empty()
    }

    fn collect_due(st: &mut LoopState) -> Vec<Arc<Mutex<LoopCallback>>> {
        let now = st.now_ms;
        let mut due: Vec<(u64, Arc<Mutex<LoopCallback>>)> = Vec::new();
        st.timers.retain_mut(|t| {
            if t.due_ms > now {
                return true;
            }
            due.push((t.due_ms, Arc::clone(&t.cb)));
            match t.interval_ms {
                Some(iv) => {
                    // Miss-tolerant: fire once now, re-arm from now.
                    t.due_ms = now + iv.max(1);
                    true
                }
                None => false,
            }
        });
        due.sort_by_key(|(deadline, _)| *deadline);
        due.into_iter().map(|(_, cb)| cb).collect()
    }
}

impl EventLoop for ManualEventLoop {
    fn add_cyclic_callback(&self, interval_ms: u64, cb: LoopCallback) -> CallbackId {
        let mut st = self.state.lock();
        let id = CallbackId(st.next_id);
        st.next_id += 1;
        let due = st.now_ms + interval_ms.max(1);
        st.timers.push(TimerEntry {
            id,
            due_ms: due,
            interval_ms: Some(interval_ms.max(1)),
            cb: Arc::new(Mutex::new(cb)),
        });
        id
    }

    fn add_timed_callback(&self, delay_ms: u64, cb: LoopCallback) -> CallbackId {
        let mut st = self.state.lock();
        let id = CallbackId(st.next_id);
        st.next_id += 1;
        let due = st.now_ms + delay_ms;
        st.timers.push(TimerEntry {
            id,
            due_ms: due,
            interval_ms: None,
            cb: Arc::new(Mutex::new(cb)),
        });
        id
    }

    fn add_delayed_callback(&self, cb: DelayedCallback) {
        self.state.lock().delayed.push_back(cb);
    }

    fn remove_callback(&self, id: CallbackId) {
        self.state.lock().timers.retain(|t| t.id != id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_delayed_runs_on_next_iterate() {
        let el = ManualEventLoop::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        el.add_delayed_callback(Box::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        el.run_iterate();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        el.run_iterate();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cyclic_fires_per_interval() {
        let el = ManualEventLoop::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        el.add_cyclic_callback(
            10,
            Box::new(move || {
                h.fetch_add(1, Ordering::SeqCst);
            }),
        );
        el.advance(35);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_timed_fires_once() {
        let el = ManualEventLoop::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        el.add_timed_callback(
            5,
            Box::new(move || {
                h.fetch_add(1, Ordering::SeqCst);
            }),
        );
        el.advance(100);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_remove_cancels() {
        let el = ManualEventLoop::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let id = el.add_cyclic_callback(
            10,
            Box::new(move || {
                h.fetch_add(1, Ordering::SeqCst);
            }),
        );
        el.advance(25);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        el.remove_callback(id);
        el.advance(50);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_callback_may_reenter_loop() {
        let el = ManualEventLoop::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let el2 = Arc::clone(&el);
        el.add_timed_callback(
            1,
            Box::new(move || {
                let h = Arc::clone(&h);
                el2.add_delayed_callback(Box::new(move || {
                    h.fetch_add(1, Ordering::SeqCst);
                }));
            }),
        );
        el.advance(10);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
