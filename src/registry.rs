//! Stores subscriptions and freezes them into resolved dispatch orders.
//!
//! The registry is a two-phase object: while open, gameplay subsystems add
//! and remove subscriptions freely; locking resolves the before/after
//! constraints of every event type once and rejects all further mutation.
//! There is no transition back except [`Registry::clear`], which resets the
//! whole registry for test isolation and hot reload.

use std::any::Any;
use std::rc::Rc;

use indexmap::{IndexMap, IndexSet};
use itertools::Itertools;
use thiserror::Error;

use crate::comp::CompIdx;
use crate::entity::EntityId;
use crate::event::EventId;
use crate::order::{self, Constraints};

/// Type-erased entity-directed handler.
/// The typed wrapper is created by [`EventBus`](crate::EventBus) at subscribe time.
pub(crate) type DirectedHandler<C> = Rc<dyn Fn(EntityId, &C, &dyn Any)>;

/// Type-erased bus-wide handler.
pub(crate) type BroadcastHandler = Rc<dyn Fn(&dyn Any)>;

/// A rejected subscription table mutation.
///
/// Both variants indicate a programming error in a subsystem's setup code and
/// should abort setup rather than be retried.
#[derive(Debug, Error)]
pub enum SubscribeError {
    /// A subscription already exists for this `(component type, event type)` key.
    #[error("duplicate subscription for {comp} on event {event}")]
    DuplicateSubscription {
        /// The component type of the colliding subscription.
        comp:  CompIdx,
        /// The event type of the colliding subscription.
        event: EventId,
    },

    /// The registry is already locked; subscriptions can no longer change.
    #[error("subscriptions are locked")]
    RegistryLocked,
}

/// A rejected [`Registry::lock`].
#[derive(Debug, Error)]
pub enum LockError {
    /// The before/after constraints declared for one event type contradict
    /// each other. The registry stays open so the offending subscription can
    /// be removed, but dispatch must not proceed with an arbitrary order.
    #[error("ordering constraints for event {event} form a cycle: {}", participants.iter().join(" -> "))]
    OrderingCycle {
        /// The event type whose constraint graph is cyclic.
        event:        EventId,
        /// The component types participating in one detected cycle.
        participants: Vec<CompIdx>,
    },
}

pub(crate) struct DirectedSub<C> {
    pub(crate) handler:     DirectedHandler<C>,
    pub(crate) constraints: Option<Constraints>,
    /// Position in the resolved order of the event type; assigned at lock time.
    pub(crate) rank:        usize,
}

pub(crate) struct BroadcastSub {
    pub(crate) handler:     BroadcastHandler,
    pub(crate) constraints: Option<Constraints>,
    pub(crate) rank:        usize,
}

/// Per-event-type bookkeeping: the inverse subscription index, the broadcast
/// table and the metadata produced at lock time.
#[derive(Default)]
pub(crate) struct EventData {
    /// Component types with a directed subscription, in subscription order.
    /// This order is the tie-break source for the resolver.
    comps:           IndexSet<CompIdx>,
    /// Bus-wide subscriptions keyed by their owner component type.
    broadcast:       IndexMap<CompIdx, BroadcastSub>,
    /// Whether any subscription for this event type declared constraints.
    /// Unordered event types dispatch in plain list order.
    pub(crate) ordered: bool,
    /// Broadcast owners sorted by resolved order; populated at lock time.
    broadcast_order: Vec<CompIdx>,
}

pub(crate) struct Registry<C> {
    /// Directed subscriptions, slot-addressed by component type index.
    comp_subs: Vec<IndexMap<EventId, DirectedSub<C>>>,
    /// Per-event-type data, in first-subscription order.
    events:    IndexMap<EventId, EventData>,
    locked:    bool,
}

impl<C> Default for Registry<C> {
    fn default() -> Self { Self { comp_subs: Vec::new(), events: IndexMap::new(), locked: false } }
}

impl<C> Registry<C> {
    pub(crate) fn is_locked(&self) -> bool { self.locked }

    fn comp_slot(&mut self, comp: CompIdx) -> &mut IndexMap<EventId, DirectedSub<C>> {
        if self.comp_subs.len() <= comp.usize() {
            self.comp_subs.resize_with(comp.usize() + 1, IndexMap::new);
        }
        self.comp_subs.get_mut(comp.usize()).expect("just resized")
    }

    pub(crate) fn subscribe_directed(
        &mut self,
        comp: CompIdx,
        event: EventId,
        handler: DirectedHandler<C>,
        constraints: Option<Constraints>,
    ) -> Result<(), SubscribeError> {
        if self.locked {
            return Err(SubscribeError::RegistryLocked);
        }

        let slot = self.comp_slot(comp);
        if slot.contains_key(&event) {
            return Err(SubscribeError::DuplicateSubscription { comp, event });
        }
        let ordered = constraints.is_some();
        slot.insert(event, DirectedSub { handler, constraints, rank: 0 });

        let data = self.events.entry(event).or_default();
        data.comps.insert(comp);
        data.ordered |= ordered;

        log::trace!("subscribed {comp} to {event}");
        Ok(())
    }

    pub(crate) fn subscribe_broadcast(
        &mut self,
        owner: CompIdx,
        event: EventId,
        handler: BroadcastHandler,
        constraints: Option<Constraints>,
    ) -> Result<(), SubscribeError> {
        if self.locked {
            return Err(SubscribeError::RegistryLocked);
        }

        let data = self.events.entry(event).or_default();
        if data.broadcast.contains_key(&owner) {
            return Err(SubscribeError::DuplicateSubscription { comp: owner, event });
        }
        data.ordered |= constraints.is_some();
        data.broadcast.insert(owner, BroadcastSub { handler, constraints, rank: 0 });

        log::trace!("subscribed {owner} to {event} bus-wide");
        Ok(())
    }

    pub(crate) fn unsubscribe_directed(
        &mut self,
        comp: CompIdx,
        event: EventId,
    ) -> Result<(), SubscribeError> {
        if self.locked {
            return Err(SubscribeError::RegistryLocked);
        }

        let removed = match self.comp_subs.get_mut(comp.usize()) {
            Some(slot) => slot.shift_remove(&event).is_some(),
            None => false,
        };
        if removed {
            let data = self.events.get_mut(&event).expect("subscription implies event data");
            data.comps.shift_remove(&comp);
        }
        Ok(())
    }

    pub(crate) fn unsubscribe_broadcast(
        &mut self,
        owner: CompIdx,
        event: EventId,
    ) -> Result<(), SubscribeError> {
        if self.locked {
            return Err(SubscribeError::RegistryLocked);
        }

        if let Some(data) = self.events.get_mut(&event) {
            data.broadcast.shift_remove(&owner);
        }
        Ok(())
    }

    /// Resolves every event type's constraints and freezes the registry.
    ///
    /// Idempotent: calls after the first successful lock are no-ops, so
    /// repeated setup phases in tests do not error. A constraint cycle fails
    /// the whole lock and leaves the registry open.
    pub(crate) fn lock(&mut self) -> Result<(), LockError> {
        if self.locked {
            return Ok(());
        }

        // Resolve everything before mutating any rank, so a cycle in one
        // event type leaves the registry untouched.
        let mut orders = Vec::with_capacity(self.events.len());
        for (&event, data) in &self.events {
            let nodes = self.constraint_nodes(event, data);
            match order::resolve(&nodes) {
                Ok(order) => orders.push((event, order)),
                Err(participants) => return Err(LockError::OrderingCycle { event, participants }),
            }
        }

        for (event, order) in orders {
            for (rank, &comp) in order.iter().enumerate() {
                if let Some(sub) =
                    self.comp_subs.get_mut(comp.usize()).and_then(|slot| slot.get_mut(&event))
                {
                    sub.rank = rank;
                }
                let data = self.events.get_mut(&event).expect("order computed from this event");
                if let Some(sub) = data.broadcast.get_mut(&comp) {
                    sub.rank = rank;
                }
            }
            let data = self.events.get_mut(&event).expect("order computed from this event");
            data.broadcast_order =
                order.iter().copied().filter(|comp| data.broadcast.contains_key(comp)).collect();
            log::trace!("resolved {} handlers for {event}", order.len());
        }

        self.locked = true;
        log::debug!("subscription registry locked with {} event types", self.events.len());
        Ok(())
    }

    /// Builds the resolver input for one event type: directed component types
    /// in subscription order, then broadcast-only owners, with constraints
    /// merged where a type holds both kinds of subscription.
    fn constraint_nodes(&self, event: EventId, data: &EventData) -> Vec<(CompIdx, Constraints)> {
        let mut nodes: IndexMap<CompIdx, Constraints> = IndexMap::new();
        for &comp in &data.comps {
            let sub = self
                .comp_subs
                .get(comp.usize())
                .and_then(|slot| slot.get(&event))
                .expect("inverse index entry implies subscription");
            let node = nodes.entry(comp).or_default();
            if let Some(constraints) = &sub.constraints {
                node.merge_from(constraints);
            }
        }
        for (&owner, sub) in &data.broadcast {
            let node = nodes.entry(owner).or_default();
            if let Some(constraints) = &sub.constraints {
                node.merge_from(constraints);
            }
        }
        nodes.into_iter().collect()
    }

    /// Discards all subscriptions and resolved orders, reopening the registry.
    pub(crate) fn clear(&mut self) {
        self.comp_subs.clear();
        self.events.clear();
        self.locked = false;
        log::debug!("subscription registry cleared");
    }

    pub(crate) fn directed(&self, comp: CompIdx, event: EventId) -> Option<&DirectedSub<C>> {
        self.comp_subs.get(comp.usize())?.get(&event)
    }

    pub(crate) fn event_data(&self, event: EventId) -> Option<&EventData> {
        self.events.get(&event)
    }

    /// Event types with a directed subscription keyed to `comp`.
    pub(crate) fn events_for_comp(&self, comp: CompIdx) -> impl Iterator<Item = EventId> + '_ {
        self.comp_subs.get(comp.usize()).into_iter().flat_map(|slot| slot.keys().copied())
    }

    /// Snapshots the bus-wide handlers for `event` in dispatch order.
    pub(crate) fn broadcast_handlers(&self, event: EventId) -> Vec<BroadcastHandler> {
        let Some(data) = self.events.get(&event) else { return Vec::new() };
        if self.locked {
            data.broadcast_order
                .iter()
                .map(|owner| {
                    let sub = data.broadcast.get(owner).expect("broadcast_order built from keys");
                    Rc::clone(&sub.handler)
                })
                .collect()
        } else {
            data.broadcast.values().map(|sub| Rc::clone(&sub.handler)).collect()
        }
    }
}
