//! A single-shot deferred result with chained success/error handlers.
//!
//! This is the transport's sole asynchronous synchronisation primitive:
//! every outgoing call's eventual result, every deferred dispatch result, and
//! every write-completion signal is represented as a [`Future`]. Unlike
//! `std::future::Future`, handlers are added imperatively
//! (`add_success`/`add_error`/`add_both`) and are guaranteed to run in the
//! order they were added, exactly once each, even if added after the
//! `Future` has already fired — see the module tests for the exact ordering
//! contract. `Future` also implements `std::future::Future<Output = Variant>`
//! so it composes with `async`/`.await`, but the handler-chain API is the
//! primitive's ground truth: the endpoint's pause/resume discipline and the
//! streaming-write path both depend on its precise activation ordering.

use std::{
    collections::VecDeque,
    fmt,
    sync::{Arc, Mutex, PoisonError},
    task::{Context, Poll, Waker},
};

use crate::variant::Variant;

/// What a handler does with the value it was given.
pub enum Outcome {
    /// Produce the next value directly.
    Value(Variant),
    /// Splice another `Future` into the chain; processing suspends until it
    /// fires, then its value becomes the chain's next value.
    Chain(Future),
}

impl From<Variant> for Outcome {
    fn from(v: Variant) -> Self { Self::Value(v) }
}

impl From<Future> for Outcome {
    fn from(f: Future) -> Self { Self::Chain(f) }
}

type SuccessFn = Box<dyn FnOnce(Variant) -> Outcome + Send>;
type ErrorFn = Box<dyn FnOnce(Variant) -> Outcome + Send>;

struct HandlerPair {
    success: Option<SuccessFn>,
    error: Option<ErrorFn>,
}

struct Shared {
    /// The chain's current value. `None` until the `Future` is fired.
    value: Option<Variant>,
    /// Whether the *original* promise has been fired (`fire_success`/
    /// `fire_error`); guards the at-most-once contract on the public API.
    fired: bool,
    handlers: VecDeque<HandlerPair>,
    /// `true` while a handler-returned `Future` is being awaited; new
    /// handlers still queue but are not run until it resolves.
    suspended: bool,
    /// Wakers for `std::future::Future` consumers, woken once the chain has
    /// no more pending handlers and is not suspended.
    wakers: Vec<Waker>,
}

fn lock(inner: &Mutex<Shared>) -> std::sync::MutexGuard<'_, Shared> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A single-shot deferred [`Variant`] result with chained handlers.
///
/// Cloning a `Future` shares the same underlying state (it is reference
/// counted); all clones observe the same activation and the same chain.
pub struct Future {
    inner: Arc<Mutex<Shared>>,
}

impl Clone for Future {
    fn clone(&self) -> Self { Self { inner: self.inner.clone() } }
}

impl fmt::Debug for Future {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let guard = lock(&self.inner);
        f.debug_struct("Future")
            .field("fired", &guard.fired)
            .field(
                "settled",
                &(guard.value.is_some() && guard.handlers.is_empty() && !guard.suspended),
            )
            .finish()
    }
}

impl Default for Future {
    fn default() -> Self { Self::new() }
}

impl Future {
    /// Create an unfired `Future`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Shared {
                value: None,
                fired: false,
                handlers: VecDeque::new(),
                suspended: false,
                wakers: Vec::new(),
            })),
        }
    }

    /// Create an already-fired `Future` carrying `v`.
    #[must_use]
    pub fn ready(v: Variant) -> Self {
        let f = Self::new();
        f.fire(v);
        f
    }

    /// Returns `true` if `self` and `other` refer to the same underlying
    /// deferred result.
    #[must_use]
    pub fn is_same(&self, other: &Self) -> bool { Arc::ptr_eq(&self.inner, &other.inner) }

    fn fire(&self, v: Variant) {
        {
            let mut guard = lock(&self.inner);
            if guard.fired {
                return;
            }
            guard.fired = true;
            guard.value = Some(v);
        }
        drain(&self.inner);
    }

    /// Fire the `Future` with a successful value. A no-op if already fired.
    pub fn fire_success(&self, v: Variant) { self.fire(v); }

    /// Fire the `Future` with an [`Variant::Exception`]. A no-op if already
    /// fired.
    pub fn fire_error(&self, e: Variant) {
        debug_assert!(e.is_exception(), "fire_error expects an Exception Variant");
        self.fire(e);
    }

    /// Add a success handler. Runs immediately if the chain is already
    /// settled on a non-exception value and not suspended; otherwise queues.
    pub fn add_success<F>(&self, f: F)
    where
        F: FnOnce(Variant) -> Outcome + Send + 'static,
    {
        self.push(Some(Box::new(f)), None);
    }

    /// Add an error handler. Runs immediately if the chain is already
    /// settled on an exception and not suspended; otherwise queues.
    pub fn add_error<F>(&self, g: F)
    where
        F: FnOnce(Variant) -> Outcome + Send + 'static,
    {
        self.push(None, Some(Box::new(g)));
    }

    /// Add a success/error pair, run as a single handler slot.
    pub fn add_both<F, G>(&self, f: F, g: G)
    where
        F: FnOnce(Variant) -> Outcome + Send + 'static,
        G: FnOnce(Variant) -> Outcome + Send + 'static,
    {
        self.push(Some(Box::new(f)), Some(Box::new(g)));
    }

    fn push(&self, success: Option<SuccessFn>, error: Option<ErrorFn>) {
        {
            let mut guard = lock(&self.inner);
            guard.handlers.push_back(HandlerPair { success, error });
        }
        drain(&self.inner);
    }
}

/// Run every handler that can currently make progress, in FIFO order,
/// stopping at the first suspension or once the queue is empty.
///
/// Handlers are invoked with no lock held (they are arbitrary user code that
/// may itself call back into this or another `Future`); the chain's state is
/// re-locked only to read the next pending pair and to store each handler's
/// result.
fn drain(inner: &Arc<Mutex<Shared>>) {
    loop {
        let (value, pair) = {
            let mut guard = lock(inner);
            if guard.suspended {
                return;
            }
            let Some(value) = guard.value.clone() else {
                return;
            };
            match guard.handlers.pop_front() {
                Some(pair) => (value, pair),
                None => {
                    for waker in guard.wakers.drain(..) {
                        waker.wake();
                    }
                    return;
                }
            }
        };

        let is_exc = value.is_exception();
        let handler = if is_exc { pair.error } else { pair.success };
        let Some(handler) = handler else {
            // This pair had no handler of the applicable kind; the value
            // passes through unchanged and the next pair gets a turn.
            continue;
        };

        let outcome = handler(value);
        let mut guard = lock(inner);
        match outcome {
            Outcome::Value(v) => guard.value = Some(v),
            Outcome::Chain(nested) => {
                guard.suspended = true;
                drop(guard);
                let resume_inner = inner.clone();
                let resume_inner2 = inner.clone();
                nested.add_both(
                    move |v| {
                        resume(&resume_inner, v);
                        Outcome::Value(Variant::Null)
                    },
                    move |e| {
                        resume(&resume_inner2, e);
                        Outcome::Value(Variant::Null)
                    },
                );
                return;
            }
        }
    }
}

/// Resume a suspended chain once its spliced-in nested `Future` has fired.
fn resume(inner: &Arc<Mutex<Shared>>, v: Variant) {
    {
        let mut guard = lock(inner);
        guard.value = Some(v);
        guard.suspended = false;
    }
    drain(inner);
}

impl std::future::Future for Future {
    type Output = Variant;

    fn poll(self: std::pin::Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Variant> {
        let mut guard = lock(&self.inner);
        let settled = guard.value.is_some() && guard.handlers.is_empty() && !guard.suspended;
        if settled {
            #[expect(clippy::unwrap_used, reason = "settled implies value.is_some()")]
            Poll::Ready(guard.value.clone().unwrap())
        } else {
            guard.wakers.push(cx.waker().clone());
            Poll::Pending
        }
    }
}

/// Accepts N [`Future`]s and fires its own `Future` with a
/// [`Variant::Array`] of their results once every input has fired, in input
/// order (the `FutureResultList::join` primitive of the original).
#[must_use]
pub fn join(futures: Vec<Future>) -> Future {
    let total = futures.len();
    let out = Future::new();
    if total == 0 {
        out.fire_success(Variant::Array(Vec::new()));
        return out;
    }
    let results: Arc<Mutex<Vec<Variant>>> = Arc::new(Mutex::new(vec![Variant::Null; total]));
    let remaining = Arc::new(Mutex::new(total));
    for (idx, f) in futures.into_iter().enumerate() {
        let out_success = out.clone();
        let results_success = results.clone();
        let remaining_success = remaining.clone();
        let out_error = out.clone();
        let results_error = results.clone();
        let remaining_error = remaining.clone();
        f.add_both(
            move |v: Variant| -> Outcome {
                complete_one(&results_success, &remaining_success, &out_success, idx, v);
                Outcome::Value(Variant::Null)
            },
            move |e: Variant| -> Outcome {
                complete_one(&results_error, &remaining_error, &out_error, idx, e);
                Outcome::Value(Variant::Null)
            },
        );
    }
    out
}

fn complete_one(
    results: &Arc<Mutex<Vec<Variant>>>,
    remaining: &Arc<Mutex<usize>>,
    out: &Future,
    idx: usize,
    v: Variant,
) {
    {
        let mut results = lock_vec(results);
        if let Some(slot) = results.get_mut(idx) {
            *slot = v;
        }
    }
    let mut remaining = remaining.lock().unwrap_or_else(PoisonError::into_inner);
    *remaining = remaining.saturating_sub(1);
    if *remaining == 0 {
        let results = lock_vec(results).clone();
        out.fire_success(Variant::Array(results));
    }
}

fn lock_vec(m: &Arc<Mutex<Vec<Variant>>>) -> std::sync::MutexGuard<'_, Vec<Variant>> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn unwrap_lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
        m.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[test]
    fn fires_at_most_once() {
        let f = Future::new();
        f.fire_success(Variant::Int(1));
        f.fire_success(Variant::Int(2));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        f.add_success(move |v| {
            unwrap_lock(&seen2).push(v);
            Outcome::Value(Variant::Null)
        });
        assert_eq!(unwrap_lock(&seen).len(), 1);
        assert_eq!(unwrap_lock(&seen)[0], Variant::Int(1));
    }

    #[test]
    fn handlers_added_after_activation_run_immediately_in_fifo_order() {
        let f = Future::new();
        f.fire_success(Variant::Int(1));
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            f.add_success(move |v| {
                unwrap_lock(&order).push(i);
                Outcome::Value(v)
            });
        }
        assert_eq!(*unwrap_lock(&order), vec![0, 1, 2]);
    }

    #[test]
    fn exception_skips_success_handlers_until_error_handler() {
        let f = Future::new();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        f.add_success(move |v| {
            ran2.fetch_add(1, Ordering::SeqCst);
            Outcome::Value(v)
        });
        let caught = Arc::new(Mutex::new(None));
        let caught2 = caught.clone();
        f.add_error(move |e| {
            *unwrap_lock(&caught2) = Some(e.clone());
            Outcome::Value(Variant::string("recovered"))
        });
        let after = Arc::new(Mutex::new(None));
        let after2 = after.clone();
        f.add_success(move |v| {
            *unwrap_lock(&after2) = Some(v.clone());
            Outcome::Value(v)
        });
        f.fire_error(Variant::exception("boom"));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(*unwrap_lock(&caught), Some(Variant::exception("boom")));
        assert_eq!(*unwrap_lock(&after), Some(Variant::string("recovered")));
    }

    #[test]
    fn handler_throwing_converts_to_exception() {
        let f = Future::new();
        f.add_success(|_v| Outcome::Value(Variant::exception("bad input")));
        let result = Arc::new(Mutex::new(None));
        let result2 = result.clone();
        f.add_error(move |e| {
            *unwrap_lock(&result2) = Some(e.clone());
            Outcome::Value(e)
        });
        f.fire_success(Variant::Int(1));
        assert_eq!(*unwrap_lock(&result), Some(Variant::exception("bad input")));
    }

    #[test]
    fn chained_future_splices_and_suspends_until_nested_fires() {
        let outer = Future::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let nested_slot: Arc<Mutex<Option<Future>>> = Arc::new(Mutex::new(None));
        let nested_slot2 = nested_slot.clone();
        let order2 = order.clone();
        outer.add_success(move |_v| {
            unwrap_lock(&order2).push("first");
            let nested = Future::new();
            *unwrap_lock(&nested_slot2) = Some(nested.clone());
            Outcome::Chain(nested)
        });
        let order3 = order.clone();
        outer.add_success(move |v| {
            unwrap_lock(&order3).push("second");
            Outcome::Value(v)
        });
        outer.fire_success(Variant::Int(1));
        // Only the first handler has run so far; the chain is suspended.
        assert_eq!(*unwrap_lock(&order), vec!["first"]);
        let nested = unwrap_lock(&nested_slot).clone().expect("nested set");
        nested.fire_success(Variant::Int(42));
        assert_eq!(*unwrap_lock(&order), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn implements_std_future_for_await() {
        let f = Future::new();
        f.fire_success(Variant::Int(9));
        assert_eq!(f.await, Variant::Int(9));
    }

    #[tokio::test]
    async fn join_collects_results_in_order() {
        let a = Future::new();
        let b = Future::new();
        let c = Future::new();
        let joined = join(vec![a.clone(), b.clone(), c.clone()]);
        b.fire_success(Variant::Int(2));
        c.fire_success(Variant::Int(3));
        a.fire_success(Variant::Int(1));
        let result = joined.await;
        assert_eq!(
            result,
            Variant::Array(vec![Variant::Int(1), Variant::Int(2), Variant::Int(3)])
        );
    }

    #[test]
    fn join_of_empty_list_fires_immediately() {
        let joined = join(Vec::new());
        let got = Arc::new(Mutex::new(None));
        let got2 = got.clone();
        joined.add_success(move |v| {
            *unwrap_lock(&got2) = Some(v.clone());
            Outcome::Value(v)
        });
        assert_eq!(*unwrap_lock(&got), Some(Variant::Array(Vec::new())));
    }
}
