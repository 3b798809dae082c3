//! Subscription handles and the per-subscription bookkeeping owned by the reactor.
//!
//! A [`Subscription`] is the only way user code touches a registered unit of
//! work after registration.  It holds a weak reference to the reactor state, so
//! keeping a handle alive never keeps the reactor alive, and every operation on
//! a handle whose reactor is gone is a no-op.

use std::cell::RefCell;
use std::fmt;
use std::os::unix::io::RawFd;
use std::rc::Weak;
use std::time::Duration;

use super::Core;

// ── Identity and triggers ─────────────────────────────────────────────────────

/// Unique identity of a subscription within one reactor.
///
/// Identities are allocated from a monotonically increasing counter and are
/// never reused, so a stale handle can never address a newer subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub(crate) u64);

impl SubscriptionId {
    /// Returns the raw counter value (for logging).
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub#{}", self.0)
    }
}

/// Why a callback is being invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// A `once` or `schedule` timer reached its deadline.
    Timer,
    /// An `immediately` subscription ran on the next loop pass.
    Immediate,
    /// The watched descriptor is readable (or in an error/hangup state).
    Readable,
    /// The watched descriptor is writable (or in an error/hangup state).
    Writable,
    /// The descriptor timeout elapsed before the descriptor became ready.
    Timeout,
}

/// Readiness direction of a descriptor watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Readable,
    Writable,
}

impl Interest {
    pub(crate) fn trigger(self) -> Trigger {
        match self {
            Interest::Readable => Trigger::Readable,
            Interest::Writable => Trigger::Writable,
        }
    }
}

// ── Reactor-side entry ────────────────────────────────────────────────────────

pub(crate) type Callback = Box<dyn FnMut(&Subscription, Trigger) -> anyhow::Result<()>>;

/// What a subscription is waiting for.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Kind {
    Once {
        delay: Duration,
    },
    Repeat {
        interval: Duration,
        /// `None` means the subscription repeats until cancelled.
        remaining: Option<u64>,
    },
    Immediate,
    Io {
        fd: RawFd,
        interest: Interest,
        timeout: Option<Duration>,
    },
}

impl Kind {
    /// The delay to arm when the subscription is (re-)armed, if it is timed.
    pub(crate) fn arm_delay(&self) -> Option<Duration> {
        match *self {
            Kind::Once { delay } => Some(delay),
            Kind::Repeat { interval, .. } => Some(interval),
            Kind::Immediate => None,
            Kind::Io { timeout, .. } => timeout,
        }
    }

    pub(crate) fn label(&self) -> &'static str {
        match self {
            Kind::Once { .. } => "timer-once",
            Kind::Repeat { .. } => "timer-repeating",
            Kind::Immediate => "immediate",
            Kind::Io {
                interest: Interest::Readable,
                ..
            } => "io-readable",
            Kind::Io {
                interest: Interest::Writable,
                ..
            } => "io-writable",
        }
    }
}

/// Reactor-owned state of one subscription.
pub(crate) struct Entry {
    pub(crate) kind: Kind,
    /// `None` only while the callback is running.
    pub(crate) callback: Option<Callback>,
    pub(crate) enabled: bool,
    /// Bumped on every (re-)arm and disable; stale timer-queue slots carry an
    /// older generation and are skipped.
    pub(crate) generation: u64,
}

// ── Public handle ─────────────────────────────────────────────────────────────

/// Handle to one registered unit of scheduled work.
///
/// Handles are cheap to clone; all clones address the same subscription.
/// `enable`, `disable` and `cancel` may be called from anywhere on the reactor
/// thread, including from inside the subscription's own callback.
#[derive(Clone)]
pub struct Subscription {
    pub(crate) id: SubscriptionId,
    pub(crate) core: Weak<RefCell<Core>>,
}

impl Subscription {
    /// Returns this subscription's identity.
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Re-enables a disabled subscription.
    ///
    /// The delay (or descriptor timeout) baseline restarts from the moment of
    /// enabling.  Enabling an already-enabled or cancelled subscription has no
    /// effect.
    pub fn enable(&self) {
        if let Some(core) = self.core.upgrade() {
            core.borrow_mut().enable(self.id);
        }
    }

    /// Keeps the subscription registered but suppresses all invocations until
    /// [`enable`](Self::enable) is called.
    pub fn disable(&self) {
        if let Some(core) = self.core.upgrade() {
            core.borrow_mut().disable(self.id);
        }
    }

    /// Permanently removes the subscription.  Idempotent.
    ///
    /// A subscription that is already due in the current tick does not fire
    /// once cancelled.
    pub fn cancel(&self) {
        if let Some(core) = self.core.upgrade() {
            // Drop the removed entry after the borrow ends: its callback may own
            // values whose destructors touch the reactor.
            let removed = core.borrow_mut().remove(self.id);
            drop(removed);
        }
    }

    /// Returns `true` while the subscription is registered and enabled.
    pub fn is_enabled(&self) -> bool {
        self.core
            .upgrade()
            .map(|core| core.borrow().is_enabled(self.id))
            .unwrap_or(false)
    }

    /// Returns `true` once the subscription was cancelled, exhausted its
    /// iterations, or its reactor was dropped.
    pub fn is_cancelled(&self) -> bool {
        self.core
            .upgrade()
            .map(|core| !core.borrow().contains(self.id))
            .unwrap_or(true)
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscription_id_display_includes_counter() {
        assert_eq!(SubscriptionId(7).to_string(), "sub#7");
    }

    #[test]
    fn test_interest_maps_to_matching_trigger() {
        assert_eq!(Interest::Readable.trigger(), Trigger::Readable);
        assert_eq!(Interest::Writable.trigger(), Trigger::Writable);
    }

    #[test]
    fn test_kind_arm_delay_for_untimed_io_is_none() {
        // Arrange
        let kind = Kind::Io {
            fd: 0,
            interest: Interest::Readable,
            timeout: None,
        };

        // Assert
        assert_eq!(kind.arm_delay(), None);
        assert_eq!(kind.label(), "io-readable");
    }

    #[test]
    fn test_detached_handle_reports_cancelled() {
        // Arrange – a handle whose reactor never existed
        let sub = Subscription {
            id: SubscriptionId(1),
            core: Weak::new(),
        };

        // Act – operations on a dead reactor are no-ops
        sub.enable();
        sub.disable();
        sub.cancel();

        // Assert
        assert!(sub.is_cancelled());
        assert!(!sub.is_enabled());
    }
}
