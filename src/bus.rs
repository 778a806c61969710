//! The event bus façade.
//!
//! This is the single entry point gameplay code talks to: subscriptions and
//! the lock during setup, lifecycle notifications from the component storage
//! collaborator, and raises during simulation.
//!
//! All runtime entry points take `&self`; interior state lives behind
//! [`RefCell`]s and every borrow is released before a handler runs. Handlers
//! may therefore re-enter the bus freely: attach or detach components of the
//! entity currently being dispatched, raise further events, even for the
//! same entity and event type. The bus stays structurally valid throughout;
//! the price is that delivery under such mutation is bounded rather than
//! strictly exact, see the dispatch contract below.
//!
//! # Dispatch contract
//!
//! A raise snapshots the component membership of the entity's dispatch list
//! up front, then re-checks each entry's liveness immediately before calling
//! its handler. Consequently:
//!
//! - a handler that detaches its own component does not disturb the rest of
//!   the raise;
//! - entries detached before their turn are skipped;
//! - entries attached during the raise are linked at the front of the list
//!   and are not visited by the ongoing raise;
//! - a component detached and re-attached during the raise is invoked with
//!   its fresh instance, and its list entry now sits at the front regardless
//!   of the resolved order.
//!
//! Under adversarial detach/re-attach cycles every originally attached
//! handler runs at least once and at most twice per raise, and the raise
//! always terminates.

use std::any::Any;
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::mem;
use std::rc::Rc;

use crate::comp::CompIdx;
use crate::entity::EntityId;
use crate::event::EventId;
use crate::order::Constraints;
use crate::registry::{LockError, Registry, SubscribeError};
use crate::table::EventTable;

/// The entity-component event dispatch core.
///
/// `C` is the component instance handle chosen by the storage collaborator,
/// e.g. `Rc<RefCell<dyn Any>>`. The bus stores one handle per live dispatch
/// entry and passes `&C` to handlers; it never inspects the handle itself.
///
/// The bus is single-threaded by design (`!Sync`); reentrancy, not
/// concurrency, is the hazard it defends against.
pub struct EventBus<C> {
    registry: RefCell<Registry<C>>,
    tables:   RefCell<HashMap<EntityId, EventTable<C>>>,
    queue:    RefCell<VecDeque<(EventId, Box<dyn Any>)>>,
    /// Reusable snapshot buffer. Taken for the duration of a raise; nested
    /// raises fall back to a fresh allocation.
    scratch:  RefCell<Vec<CompIdx>>,
}

impl<C: 'static> Default for EventBus<C> {
    fn default() -> Self { Self::new() }
}

impl<C: 'static> EventBus<C> {
    /// Creates an empty, open bus.
    pub fn new() -> Self {
        Self {
            registry: RefCell::new(Registry::default()),
            tables:   RefCell::new(HashMap::new()),
            queue:    RefCell::new(VecDeque::new()),
            scratch:  RefCell::new(Vec::new()),
        }
    }

    /// Subscribes `handler` to event `E` raised at entities carrying `comp`.
    ///
    /// At most one subscription may exist per `(comp, E)` key.
    pub fn subscribe<E, F>(&self, comp: CompIdx, handler: F) -> Result<(), SubscribeError>
    where
        E: Any,
        F: Fn(EntityId, &C, &E) + 'static,
    {
        self.registry.borrow_mut().subscribe_directed(
            comp,
            EventId::of::<E>(),
            erase_directed(handler),
            None,
        )
    }

    /// Like [`subscribe`](Self::subscribe), additionally declaring ordering
    /// constraints against other component types subscribed to `E`.
    pub fn subscribe_ordered<E, F>(
        &self,
        comp: CompIdx,
        constraints: Constraints,
        handler: F,
    ) -> Result<(), SubscribeError>
    where
        E: Any,
        F: Fn(EntityId, &C, &E) + 'static,
    {
        self.registry.borrow_mut().subscribe_directed(
            comp,
            EventId::of::<E>(),
            erase_directed(handler),
            Some(constraints),
        )
    }

    /// Subscribes a bus-wide handler for `E`, keyed by the owning component
    /// type `owner` for identity and ordering.
    ///
    /// Bus-wide handlers run when `E` is raised with the broadcast flag or
    /// via [`raise_broadcast`](Self::raise_broadcast); they are not tied to
    /// any entity.
    pub fn subscribe_broadcast<E, F>(&self, owner: CompIdx, handler: F) -> Result<(), SubscribeError>
    where
        E: Any,
        F: Fn(&E) + 'static,
    {
        self.registry.borrow_mut().subscribe_broadcast(
            owner,
            EventId::of::<E>(),
            erase_broadcast(handler),
            None,
        )
    }

    /// Like [`subscribe_broadcast`](Self::subscribe_broadcast) with ordering
    /// constraints. The constraints share the per-event graph with directed
    /// subscriptions.
    pub fn subscribe_broadcast_ordered<E, F>(
        &self,
        owner: CompIdx,
        constraints: Constraints,
        handler: F,
    ) -> Result<(), SubscribeError>
    where
        E: Any,
        F: Fn(&E) + 'static,
    {
        self.registry.borrow_mut().subscribe_broadcast(
            owner,
            EventId::of::<E>(),
            erase_broadcast(handler),
            Some(constraints),
        )
    }

    /// Removes the subscription for `(comp, E)` if present; no-op otherwise.
    pub fn unsubscribe<E: Any>(&self, comp: CompIdx) -> Result<(), SubscribeError> {
        self.registry.borrow_mut().unsubscribe_directed(comp, EventId::of::<E>())
    }

    /// Removes the bus-wide subscription for `(owner, E)` if present.
    pub fn unsubscribe_broadcast<E: Any>(&self, owner: CompIdx) -> Result<(), SubscribeError> {
        self.registry.borrow_mut().unsubscribe_broadcast(owner, EventId::of::<E>())
    }

    /// Resolves all ordering constraints and freezes the subscription tables.
    ///
    /// Further `subscribe`/`unsubscribe` calls fail with
    /// [`SubscribeError::RegistryLocked`]. Idempotent: repeated calls after a
    /// successful lock are no-ops. A constraint cycle fails the lock and
    /// leaves the bus open.
    pub fn lock(&self) -> Result<(), LockError> { self.registry.borrow_mut().lock() }

    /// Whether [`lock`](Self::lock) has completed successfully.
    pub fn is_locked(&self) -> bool { self.registry.borrow().is_locked() }

    /// Resets the bus to its initial open state: all subscriptions, resolved
    /// orders, dispatch lists and queued events are discarded.
    ///
    /// Intended for test isolation and hot reload.
    pub fn clear(&self) {
        self.registry.borrow_mut().clear();
        self.tables.borrow_mut().clear();
        self.queue.borrow_mut().clear();
    }

    /// Notifies the bus that `entity` became live. Allocates its (empty)
    /// dispatch lists; the storage collaborator must call this before any
    /// component notification for the entity.
    pub fn on_entity_added(&self, entity: EntityId) {
        let prev = self.tables.borrow_mut().insert(entity, EventTable::default());
        debug_assert!(prev.is_none(), "{entity} added to the bus twice");
        log::trace!("{entity} added to the bus");
    }

    /// Notifies the bus that `entity` was destroyed. Discards all its
    /// dispatch lists without invoking any handler.
    pub fn on_entity_removed(&self, entity: EntityId) {
        self.tables.borrow_mut().remove(&entity);
        log::trace!("{entity} removed from the bus");
    }

    /// Notifies the bus that `comp` was detached from `entity`. Unlinks the
    /// matching dispatch entries synchronously; after this call returns, no
    /// raise will reach the detached instance again.
    ///
    /// # Panics
    /// Panics if `entity` was never announced via
    /// [`on_entity_added`](Self::on_entity_added).
    pub fn on_component_removed(&self, entity: EntityId, comp: CompIdx) {
        let events = self.subscribed_events(comp);
        if events.is_empty() {
            return;
        }

        let mut tables = self.tables.borrow_mut();
        let table =
            tables.get_mut(&entity).expect("component removed from an entity unknown to the bus");
        for event in events {
            table.remove(event, comp);
        }
    }

    fn subscribed_events(&self, comp: CompIdx) -> Vec<EventId> {
        let registry = self.registry.borrow();
        debug_assert!(registry.is_locked(), "component lifecycle notified before lock");
        registry.events_for_comp(comp).collect()
    }

    fn take_scratch(&self) -> Vec<CompIdx> { mem::take(&mut *self.scratch.borrow_mut()) }

    fn put_scratch(&self, mut buf: Vec<CompIdx>) {
        buf.clear();
        *self.scratch.borrow_mut() = buf;
    }
}

impl<C: Clone + 'static> EventBus<C> {
    /// Notifies the bus that `instance` of component type `comp` was attached
    /// to `entity`. For every event type with a locked subscription keyed to
    /// `comp`, a dispatch entry is linked at the front of the entity's list.
    ///
    /// # Panics
    /// Panics if `entity` was never announced via
    /// [`on_entity_added`](Self::on_entity_added).
    pub fn on_component_added(&self, entity: EntityId, comp: CompIdx, instance: C) {
        let events = self.subscribed_events(comp);
        if events.is_empty() {
            return;
        }

        let mut tables = self.tables.borrow_mut();
        let table =
            tables.get_mut(&entity).expect("component added to an entity unknown to the bus");
        for event in events {
            table.push_front(event, comp, instance.clone());
        }
    }

    /// Raises `event` at `entity`, invoking the handler of every subscribed
    /// component the entity currently carries, per the dispatch contract in
    /// the [module docs](self).
    ///
    /// Event types with ordering constraints dispatch in resolved order;
    /// unconstrained event types dispatch in list order (most recently
    /// attached first). If the entity has no applicable list, this is a
    /// no-op. With `broadcast`, bus-wide handlers for `E` additionally run
    /// afterwards, in resolved order, exactly once each, unaffected by
    /// per-entity mutation.
    ///
    /// A panicking handler propagates to the caller and aborts the remainder
    /// of this raise; the bus remains valid for subsequent calls.
    pub fn raise_local_event<E: Any>(&self, entity: EntityId, event: &E, broadcast: bool) {
        let id = EventId::of::<E>();
        self.raise_local_erased(entity, id, event);
        if broadcast {
            self.raise_broadcast_erased(id, event);
        }
    }

    fn raise_local_erased(&self, entity: EntityId, id: EventId, event: &dyn Any) {
        let mut snapshot = self.take_scratch();
        {
            let tables = self.tables.borrow();
            if let Some(table) = tables.get(&entity) {
                table.snapshot_into(id, &mut snapshot);
            }
        }

        if !snapshot.is_empty() {
            {
                let registry = self.registry.borrow();
                if registry.event_data(id).is_some_and(|data| data.ordered) {
                    snapshot.sort_by_key(|&comp| {
                        registry.directed(comp, id).map_or(usize::MAX, |sub| sub.rank)
                    });
                }
            }

            for &comp in &snapshot {
                // An earlier handler may have detached this component; skip
                // it then. A re-attached component resolves to its fresh
                // instance.
                let instance = {
                    let tables = self.tables.borrow();
                    tables.get(&entity).and_then(|table| table.instance(id, comp).cloned())
                };
                let Some(instance) = instance else { continue };

                let handler = {
                    let registry = self.registry.borrow();
                    registry.directed(comp, id).map(|sub| Rc::clone(&sub.handler))
                };
                let Some(handler) = handler else { continue };

                handler(entity, &instance, event);
            }
        }

        self.put_scratch(snapshot);
    }

    /// Raises `event` directly at a single component instance, bypassing the
    /// dispatch lists.
    ///
    /// This invokes the one subscription for `(comp, E)` if present, whether
    /// or not `instance` is linked into any list yet. It exists for lifecycle
    /// events fired the instant a component is constructed.
    pub fn raise_component_event<E: Any>(
        &self,
        entity: EntityId,
        comp: CompIdx,
        instance: &C,
        event: &E,
    ) {
        let handler = {
            let registry = self.registry.borrow();
            registry.directed(comp, EventId::of::<E>()).map(|sub| Rc::clone(&sub.handler))
        };
        if let Some(handler) = handler {
            handler(entity, instance, event);
        }
    }

    /// Raises `event` to bus-wide handlers only, in resolved order.
    pub fn raise_broadcast<E: Any>(&self, event: &E) {
        self.raise_broadcast_erased(EventId::of::<E>(), event);
    }

    fn raise_broadcast_erased(&self, id: EventId, event: &dyn Any) {
        // Snapshot the handler list so per-entity or subscription mutation
        // mid-dispatch cannot affect this raise.
        let handlers = self.registry.borrow().broadcast_handlers(id);
        for handler in handlers {
            handler(event);
        }
    }

    /// Enqueues `event` for a later [`process_event_queue`](Self::process_event_queue).
    ///
    /// Queued events are dispatched as broadcasts, in FIFO order.
    pub fn queue_event<E: Any>(&self, event: E) {
        self.queue.borrow_mut().push_back((EventId::of::<E>(), Box::new(event)));
    }

    /// Drains the event queue, raising each entry as a broadcast.
    ///
    /// Events queued by handlers during the drain are processed in the same
    /// call.
    pub fn process_event_queue(&self) {
        loop {
            let next = self.queue.borrow_mut().pop_front();
            match next {
                Some((id, event)) => self.raise_broadcast_erased(id, &*event),
                None => break,
            }
        }
    }
}

fn erase_directed<C, E, F>(handler: F) -> Rc<dyn Fn(EntityId, &C, &dyn Any)>
where
    C: 'static,
    E: Any,
    F: Fn(EntityId, &C, &E) + 'static,
{
    Rc::new(move |entity: EntityId, instance: &C, event: &dyn Any| {
        let event = event.downcast_ref::<E>().expect("event payload keyed by its type id");
        handler(entity, instance, event);
    })
}

fn erase_broadcast<E, F>(handler: F) -> Rc<dyn Fn(&dyn Any)>
where
    E: Any,
    F: Fn(&E) + 'static,
{
    Rc::new(move |event: &dyn Any| {
        let event = event.downcast_ref::<E>().expect("event payload keyed by its type id");
        handler(event);
    })
}

#[cfg(test)]
mod tests;
