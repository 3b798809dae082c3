//! Single-threaded reactor: timers, immediates and descriptor readiness.
//!
//! # How the loop works (for beginners)
//!
//! A reactor is a loop that waits for "something to happen" and then calls the
//! code that registered interest in it.  Here, three kinds of things can
//! happen:
//!
//! - a **timer** reaches its deadline (`once`, `schedule`),
//! - the loop starts a new pass (`immediately`),
//! - a file descriptor becomes readable or writable (`on_readable`,
//!   `on_writable`), optionally racing against a timeout.
//!
//! Each call to [`Reactor::tick`] performs one pass:
//!
//! ```text
//! tick()
//!  ├─ compute how long to wait (0 if immediates are queued,
//!  │  else until the nearest deadline, else forever)
//!  ├─ poll(2) the enabled descriptor watches
//!  ├─ collect work due *now*:
//!  │    immediates → ready descriptors → due timers / timeouts
//!  └─ run each callback once, re-checking that it is still
//!     registered and enabled right before it runs
//! ```
//!
//! Callbacks run to completion one at a time.  Because the reactor state is
//! not borrowed while a callback runs, a callback may freely register new
//! subscriptions or enable/disable/cancel any subscription, itself included.
//!
//! # Failure semantics
//!
//! A callback error is never absorbed: it aborts the pass and is returned
//! unchanged from [`Reactor::tick`] / [`Reactor::run`] as
//! [`ReactorError::Callback`].
//!
//! # Readiness vs. timeout
//!
//! When a descriptor is ready and its timeout is due in the same pass,
//! readiness wins and the timeout is re-armed from the dispatch.

pub mod subscription;

mod poller;
mod timer;

use std::cell::RefCell;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, trace};

pub use subscription::{Interest, Subscription, SubscriptionId, Trigger};

use poller::Watch;
use subscription::{Callback, Entry, Kind};
use timer::{Deadline, TimerQueue};

/// Granularity of the readiness backend's timeout argument.
pub const RESOLUTION: Duration = Duration::from_millis(1);

/// Errors that terminate a [`Reactor::tick`] or [`Reactor::run`] call.
#[derive(Debug, Error)]
pub enum ReactorError {
    /// A callback returned an error.  Display, source chain and downcasting
    /// are those of the original error.
    #[error(transparent)]
    Callback(anyhow::Error),

    /// The readiness backend itself failed.
    #[error("readiness poll failed: {0}")]
    Poll(#[from] std::io::Error),
}

/// Upper bound on how far ahead a deadline is placed.  Longer delays
/// saturate here instead of overflowing `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

fn deadline_after(now: Instant, delay: Duration) -> Instant {
    now.checked_add(delay.min(FAR_FUTURE))
        .or_else(|| now.checked_add(Duration::from_secs(24 * 60 * 60)))
        .unwrap_or(now)
}

// ── Reactor state ─────────────────────────────────────────────────────────────

/// One unit of work collected for the current pass.
#[derive(Debug, Clone, Copy)]
struct Due {
    id: SubscriptionId,
    trigger: Trigger,
    /// Timer slots only fire if the entry was not re-armed since collection.
    generation: Option<u64>,
}

#[derive(Default)]
pub(crate) struct Core {
    next_id: u64,
    entries: BTreeMap<SubscriptionId, Entry>,
    timers: TimerQueue,
    immediates: VecDeque<SubscriptionId>,
    stop_requested: bool,
}

impl Core {
    fn register(&mut self, kind: Kind, callback: Callback, now: Instant) -> SubscriptionId {
        self.next_id += 1;
        let id = SubscriptionId(self.next_id);
        self.entries.insert(
            id,
            Entry {
                kind,
                callback: Some(callback),
                enabled: true,
                generation: 0,
            },
        );
        self.arm(id, now);
        debug!(%id, kind = kind.label(), "subscription registered");
        id
    }

    /// (Re-)arms the entry's deadline or immediate slot from `now`.
    fn arm(&mut self, id: SubscriptionId, now: Instant) {
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };
        entry.generation += 1;
        if let Kind::Immediate = entry.kind {
            self.immediates.push_back(id);
        } else if let Some(delay) = entry.kind.arm_delay() {
            self.timers.push(Deadline {
                at: deadline_after(now, delay),
                id,
                generation: entry.generation,
            });
        }
    }

    pub(crate) fn enable(&mut self, id: SubscriptionId) {
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };
        if entry.enabled {
            return;
        }
        entry.enabled = true;
        self.arm(id, Instant::now());
        trace!(%id, "subscription enabled");
    }

    pub(crate) fn disable(&mut self, id: SubscriptionId) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.enabled = false;
            entry.generation += 1;
            trace!(%id, "subscription disabled");
        }
    }

    pub(crate) fn remove(&mut self, id: SubscriptionId) -> Option<Entry> {
        let removed = self.entries.remove(&id);
        if removed.is_some() {
            debug!(%id, "subscription cancelled");
        }
        removed
    }

    pub(crate) fn contains(&self, id: SubscriptionId) -> bool {
        self.entries.contains_key(&id)
    }

    pub(crate) fn is_enabled(&self, id: SubscriptionId) -> bool {
        self.entries.get(&id).map(|e| e.enabled).unwrap_or(false)
    }

    fn active_count(&self) -> usize {
        self.entries.values().filter(|e| e.enabled).count()
    }

    fn is_live(entries: &BTreeMap<SubscriptionId, Entry>, slot: &Deadline) -> bool {
        entries
            .get(&slot.id)
            .map(|e| e.enabled && e.generation == slot.generation)
            .unwrap_or(false)
    }

    fn has_live_immediate(&self) -> bool {
        self.immediates.iter().any(|id| self.is_enabled(*id))
    }

    /// How long the next wait may block.  `None` means "until a descriptor is
    /// ready".
    fn wait_timeout(&mut self, now: Instant) -> Option<Duration> {
        if self.has_live_immediate() {
            return Some(Duration::ZERO);
        }
        let entries = &self.entries;
        self.timers
            .peek_live(|slot| Self::is_live(entries, slot))
            .map(|at| at.saturating_duration_since(now))
    }

    fn watches(&self) -> Vec<Watch> {
        self.entries
            .iter()
            .filter(|(_, e)| e.enabled)
            .filter_map(|(id, e)| match e.kind {
                Kind::Io { fd, interest, .. } => Some(Watch {
                    id: *id,
                    fd,
                    interest,
                }),
                _ => None,
            })
            .collect()
    }

    /// Snapshot of everything due in this pass, in dispatch order.
    fn collect_due(&mut self, now: Instant, ready: Vec<SubscriptionId>) -> Vec<Due> {
        let mut due = Vec::new();

        let queued: Vec<SubscriptionId> = self.immediates.drain(..).collect();
        for id in queued {
            if self.is_enabled(id) {
                due.push(Due {
                    id,
                    trigger: Trigger::Immediate,
                    generation: None,
                });
            }
        }

        let mut ready_set = HashSet::with_capacity(ready.len());
        for id in ready {
            if let Some(Entry {
                kind: Kind::Io { interest, .. },
                ..
            }) = self.entries.get(&id)
            {
                ready_set.insert(id);
                due.push(Due {
                    id,
                    trigger: interest.trigger(),
                    generation: None,
                });
            }
        }

        for slot in self.timers.pop_due(now) {
            if !Self::is_live(&self.entries, &slot) {
                continue;
            }
            let trigger = match self.entries.get(&slot.id).map(|e| e.kind) {
                Some(Kind::Io { .. }) if ready_set.contains(&slot.id) => continue,
                Some(Kind::Io { .. }) => Trigger::Timeout,
                _ => Trigger::Timer,
            };
            due.push(Due {
                id: slot.id,
                trigger,
                generation: Some(slot.generation),
            });
        }

        due
    }

    /// Takes the callback out for dispatch if the work is still valid.
    fn begin_dispatch(&mut self, due: &Due) -> Option<Callback> {
        let entry = self.entries.get_mut(&due.id)?;
        if !entry.enabled {
            return None;
        }
        if let Some(generation) = due.generation {
            if entry.generation != generation {
                return None;
            }
        }
        entry.callback.take()
    }

    /// Puts the callback back and applies the post-fire lifecycle rules.
    ///
    /// Returns anything that must be dropped after the state borrow ends.
    fn finish_dispatch(
        &mut self,
        id: SubscriptionId,
        callback: Callback,
        now: Instant,
    ) -> Option<Callback> {
        let Some(entry) = self.entries.get_mut(&id) else {
            // Cancelled from inside its own callback.
            return Some(callback);
        };
        entry.callback = Some(callback);

        let exhausted = match &mut entry.kind {
            Kind::Once { .. } | Kind::Immediate => true,
            Kind::Repeat { remaining, .. } => match remaining {
                Some(left) => {
                    *left = left.saturating_sub(1);
                    *left == 0
                }
                None => false,
            },
            Kind::Io { .. } => false,
        };

        if exhausted {
            debug!(%id, "subscription exhausted");
            return self.entries.remove(&id).and_then(|e| e.callback);
        }

        let rearm = entry.enabled && entry.kind.arm_delay().is_some();
        if rearm {
            self.arm(id, now);
        }
        None
    }
}

// ── Public handle ─────────────────────────────────────────────────────────────

/// Handle to a single-threaded event loop.
///
/// Cloning a `Reactor` yields another handle to the same loop; there is no
/// process-wide instance.  The loop is `!Send` and must be driven from the
/// thread that created it.
#[derive(Clone, Default)]
pub struct Reactor {
    core: Rc<RefCell<Core>>,
}

impl Reactor {
    /// Creates an empty reactor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Clock granularity used when converting wall-clock durations into
    /// reactor deadlines.
    pub fn resolution(&self) -> Duration {
        RESOLUTION
    }

    /// Fires `callback` once after `delay`, then auto-cancels.
    pub fn once<F>(&self, delay: Duration, callback: F) -> Subscription
    where
        F: FnMut(&Subscription, Trigger) -> anyhow::Result<()> + 'static,
    {
        self.register(Kind::Once { delay }, Box::new(callback))
    }

    /// Fires `callback` every `interval` until cancelled.
    pub fn schedule<F>(&self, interval: Duration, callback: F) -> Subscription
    where
        F: FnMut(&Subscription, Trigger) -> anyhow::Result<()> + 'static,
    {
        self.register(
            Kind::Repeat {
                interval,
                remaining: None,
            },
            Box::new(callback),
        )
    }

    /// Fires `callback` every `interval`, auto-cancelling after `iterations`
    /// firings.  Zero iterations yields an already-cancelled subscription.
    pub fn schedule_n<F>(&self, interval: Duration, iterations: u64, callback: F) -> Subscription
    where
        F: FnMut(&Subscription, Trigger) -> anyhow::Result<()> + 'static,
    {
        let sub = self.register(
            Kind::Repeat {
                interval,
                remaining: Some(iterations),
            },
            Box::new(callback),
        );
        if iterations == 0 {
            sub.cancel();
        }
        sub
    }

    /// Fires `callback` once on the next loop pass, before timers are
    /// evaluated.
    pub fn immediately<F>(&self, callback: F) -> Subscription
    where
        F: FnMut(&Subscription, Trigger) -> anyhow::Result<()> + 'static,
    {
        self.register(Kind::Immediate, Box::new(callback))
    }

    /// Fires `callback` with [`Trigger::Readable`] whenever `fd` is readable.
    ///
    /// With a `timeout`, the callback instead fires with
    /// [`Trigger::Timeout`] when no readiness occurred within `timeout` of the
    /// last occurrence.  A timeout does not cancel the subscription.
    ///
    /// The caller keeps ownership of `fd` and must cancel the subscription
    /// before closing it.
    pub fn on_readable<F>(&self, fd: RawFd, timeout: Option<Duration>, callback: F) -> Subscription
    where
        F: FnMut(&Subscription, Trigger) -> anyhow::Result<()> + 'static,
    {
        self.register(
            Kind::Io {
                fd,
                interest: Interest::Readable,
                timeout,
            },
            Box::new(callback),
        )
    }

    /// Writable counterpart of [`on_readable`](Self::on_readable).
    pub fn on_writable<F>(&self, fd: RawFd, timeout: Option<Duration>, callback: F) -> Subscription
    where
        F: FnMut(&Subscription, Trigger) -> anyhow::Result<()> + 'static,
    {
        self.register(
            Kind::Io {
                fd,
                interest: Interest::Writable,
                timeout,
            },
            Box::new(callback),
        )
    }

    fn register(&self, kind: Kind, callback: Callback) -> Subscription {
        let id = self.core.borrow_mut().register(kind, callback, Instant::now());
        Subscription {
            id,
            core: Rc::downgrade(&self.core),
        }
    }

    /// Number of registered, enabled subscriptions.
    pub fn active_count(&self) -> usize {
        self.core.borrow().active_count()
    }

    /// Requests [`run`](Self::run) to return once the current tick completes.
    pub fn stop(&self) {
        self.core.borrow_mut().stop_requested = true;
    }

    /// Executes one pass: waits as needed, then runs every callback that is
    /// due or ready at the start of the pass exactly once.
    ///
    /// # Errors
    ///
    /// Returns [`ReactorError::Callback`] with the first callback error (the
    /// rest of the pass is abandoned) or [`ReactorError::Poll`] if the
    /// readiness backend fails.
    pub fn tick(&self) -> Result<(), ReactorError> {
        let (timeout, watches) = {
            let mut core = self.core.borrow_mut();
            (core.wait_timeout(Instant::now()), core.watches())
        };

        if watches.is_empty() && timeout.is_none() {
            trace!("tick with nothing to wait for");
            return Ok(());
        }

        let ready = poller::wait(&watches, timeout)?;
        let batch = self.core.borrow_mut().collect_due(Instant::now(), ready);
        trace!(count = batch.len(), "dispatching pass");

        for due in batch {
            self.dispatch(due)?;
        }
        Ok(())
    }

    fn dispatch(&self, due: Due) -> Result<(), ReactorError> {
        let Some(mut callback) = self.core.borrow_mut().begin_dispatch(&due) else {
            return Ok(());
        };

        let handle = Subscription {
            id: due.id,
            core: Rc::downgrade(&self.core),
        };
        trace!(id = %due.id, trigger = ?due.trigger, "invoking callback");
        let result = callback(&handle, due.trigger);

        let leftover = self
            .core
            .borrow_mut()
            .finish_dispatch(due.id, callback, Instant::now());
        drop(leftover);

        result.map_err(ReactorError::Callback)
    }

    /// Ticks until [`stop`](Self::stop) is requested or no enabled
    /// subscriptions remain.  A stop requested before `run` is called is
    /// discarded.
    ///
    /// # Errors
    ///
    /// Propagates the first error returned by [`tick`](Self::tick).
    pub fn run(&self) -> Result<(), ReactorError> {
        self.core.borrow_mut().stop_requested = false;
        debug!("reactor running");

        loop {
            if self.active_count() == 0 {
                debug!("reactor idle, no active subscriptions");
                break;
            }
            self.tick()?;
            let stop = std::mem::take(&mut self.core.borrow_mut().stop_requested);
            if stop {
                debug!("reactor stopped");
                break;
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let core = self.core.borrow();
        f.debug_struct("Reactor")
            .field("subscriptions", &core.entries.len())
            .field("queued_timers", &core.timers.len())
            .finish()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
