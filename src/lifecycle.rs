//! When a source subscribes to its producers.
//!
//! [`LifecycleGate`] is a pure state machine: it counts structural observers,
//! tracks whether the owning source is subscribed, and remembers a deferred
//! clear. Each event returns a [`Transition`] that the owner executes after
//! releasing whatever lock guards the gate, in the order
//! unsubscribe, clear, subscribe.
//!
//! ```text
//!                 first observer (Implicit, clear if pending)
//!   Unsubscribed ---------------------------------------------> Subscribed
//!        ^  <-------------------------------------------------      |
//!        |                    last observer                         |
//!        |                                                          |
//!        +---- invalidate (sets pending clear) <--------------------+
//!
//!   refresh: any state -> unsubscribe, subscribe(Refresh)
//!   reload:  any state -> unsubscribe, clear, subscribe(Reload)
//! ```

use crate::data::LoadType;

/// Subscription state of a source.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GateState {
    /// No producer subscriptions are active.
    Unsubscribed,
    /// Producer subscriptions are active.
    Subscribed,
}

/// Work the owner of a [`LifecycleGate`] must carry out, in field order.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Transition {
    /// Dispose every active subscription.
    pub unsubscribe: bool,
    /// Clear the materialized contents.
    pub clear: bool,
    /// Start new subscriptions with this load type.
    pub subscribe: Option<LoadType>,
}

impl Transition {
    /// Whether there is nothing to do.
    pub fn is_none(&self) -> bool {
        !self.unsubscribe && !self.clear && self.subscribe.is_none()
    }
}

/// Observer reference count plus subscription state machine.
#[derive(Debug)]
pub struct LifecycleGate {
    state: GateState,
    observers: usize,
    pending_clear: bool,
}

impl Default for LifecycleGate {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleGate {
    /// A gate with no observers, unsubscribed, with no pending clear.
    pub fn new() -> Self {
        Self {
            state: GateState::Unsubscribed,
            observers: 0,
            pending_clear: false,
        }
    }

    /// Current subscription state.
    pub fn state(&self) -> GateState {
        self.state
    }

    /// Number of structural observers counted so far.
    pub fn observer_count(&self) -> usize {
        self.observers
    }

    /// Whether an invalidation is waiting for the next subscription.
    pub fn is_clear_pending(&self) -> bool {
        self.pending_clear
    }

    /// A structural observer was registered.
    pub fn observer_added(&mut self) -> Transition {
        self.observers += 1;
        if self.observers == 1 {
            self.subscribe(LoadType::Implicit)
        } else {
            Transition::default()
        }
    }

    /// A structural observer was unregistered.
    pub fn observer_removed(&mut self) -> Transition {
        self.observers = self.observers.saturating_sub(1);
        if self.observers == 0 {
            self.unsubscribe()
        } else {
            Transition::default()
        }
    }

    /// Resubscribe, keeping the contents.
    pub fn refresh(&mut self) -> Transition {
        let unsubscribe = self.unsubscribe().unsubscribe;
        Transition {
            unsubscribe,
            ..self.subscribe(LoadType::Refresh)
        }
    }

    /// Resubscribe after clearing the contents.
    pub fn reload(&mut self) -> Transition {
        let unsubscribe = self.unsubscribe().unsubscribe;
        self.pending_clear = true;
        Transition {
            unsubscribe,
            ..self.subscribe(LoadType::Reload)
        }
    }

    /// Unsubscribe and clear lazily on the next subscription.
    pub fn invalidate(&mut self) -> Transition {
        self.pending_clear = true;
        self.unsubscribe()
    }

    fn subscribe(&mut self, load_type: LoadType) -> Transition {
        if self.state == GateState::Subscribed {
            cov_mark::hit!(gate_already_subscribed);
            return Transition::default();
        }
        self.state = GateState::Subscribed;
        tracing::debug!(?load_type, observers = self.observers, "subscribing");
        Transition {
            unsubscribe: false,
            clear: std::mem::take(&mut self.pending_clear),
            subscribe: Some(load_type),
        }
    }

    fn unsubscribe(&mut self) -> Transition {
        if self.state == GateState::Unsubscribed {
            return Transition::default();
        }
        self.state = GateState::Unsubscribed;
        tracing::debug!(observers = self.observers, "unsubscribing");
        Transition {
            unsubscribe: true,
            ..Transition::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_and_last_observer_drive_the_subscription() {
        let mut gate = LifecycleGate::new();
        assert_eq!(
            gate.observer_added(),
            Transition {
                subscribe: Some(LoadType::Implicit),
                ..Transition::default()
            }
        );
        assert!(gate.observer_added().is_none());
        assert!(gate.observer_removed().is_none());
        assert_eq!(gate.state(), GateState::Subscribed);

        let transition = gate.observer_removed();
        assert!(transition.unsubscribe);
        assert_eq!(gate.state(), GateState::Unsubscribed);
        assert_eq!(gate.observer_count(), 0);
    }

    #[test]
    fn refresh_resubscribes_without_observers() {
        let mut gate = LifecycleGate::new();
        assert_eq!(
            gate.refresh(),
            Transition {
                subscribe: Some(LoadType::Refresh),
                ..Transition::default()
            }
        );
        let again = gate.refresh();
        assert!(again.unsubscribe);
        assert!(!again.clear);
        assert_eq!(again.subscribe, Some(LoadType::Refresh));
    }

    #[test]
    fn reload_clears_between_unsubscribe_and_subscribe() {
        let mut gate = LifecycleGate::new();
        gate.observer_added();
        assert_eq!(
            gate.reload(),
            Transition {
                unsubscribe: true,
                clear: true,
                subscribe: Some(LoadType::Reload),
            }
        );
        assert!(!gate.is_clear_pending());
    }

    #[test]
    fn invalidate_defers_the_clear_to_the_next_observer() {
        let mut gate = LifecycleGate::new();
        gate.observer_added();
        let transition = gate.invalidate();
        assert!(transition.unsubscribe);
        assert!(!transition.clear);
        assert!(gate.is_clear_pending());

        gate.observer_removed();
        let transition = gate.observer_added();
        assert!(transition.clear);
        assert_eq!(transition.subscribe, Some(LoadType::Implicit));
    }

    #[test]
    fn subscribing_twice_is_a_no_op() {
        cov_mark::check!(gate_already_subscribed);
        let mut gate = LifecycleGate::new();
        gate.refresh();
        assert!(gate.observer_added().is_none());
    }
}
