//! Constraint-ordered event dispatch for entity-component engines.
//!
//! entbus is the call-multiplexing core that sits between a component storage
//! system and gameplay code: component types subscribe handlers for event
//! types during setup, and at runtime events are raised at entities and
//! delivered to the handlers of whatever subscribed components each entity
//! currently carries. It is deliberately small and deliberately fast, because
//! it fires many times per simulated entity per tick.
//!
//! # Two-phase lifecycle
//! The bus is a two-phase object. While *open*, subsystems register
//! subscriptions, each optionally declaring that it runs before or after
//! other component types' subscriptions for the same event type. [`lock`ing]
//! resolves these local declarations into one fixed order per event type
//! (topological sort, deterministic tie-break by subscription order) and
//! freezes the tables; contradictory constraints fail the lock immediately
//! instead of producing a nondeterministic runtime order. There is no way
//! back to the open state except [`clear`], which resets everything and
//! exists for test isolation and hot reload.
//!
//! [`lock`ing]: EventBus::lock
//! [`clear`]: EventBus::clear
//!
//! # Type-indexed, not reflective
//! Component types are identified by a dense integer index ([`CompIdx`])
//! assigned once at startup by the storage collaborator, so every dispatch
//! structure is a plain slot lookup. Event types are ordinary Rust types;
//! the bus is generic over the payload and erases it internally.
//!
//! # Reentrancy, not concurrency
//! Everything runs synchronously on one thread. The hazard is that a handler
//! may mutate the very dispatch list it is being delivered from, by
//! attaching or detaching components of the entity mid-raise. The per-entity
//! lists are arena-backed linked lists rather than snapshot arrays, new
//! entries always link at the *front* of their list, and a raise re-checks
//! entry liveness just before each call. Delivery under self-referential
//! mutation is therefore bounded (at least once, at most twice per
//! originally attached handler) rather than strictly exact; this is a
//! documented property of the design, not an accident, and the tests pin it
//! down.

#![cfg_attr(not(debug_assertions), deny(missing_docs))]
#![cfg_attr(doc, warn(missing_docs))]

pub mod bus;
pub use bus::EventBus;

pub mod comp;
pub use comp::CompIdx;

pub mod entity;
pub use entity::EntityId;

pub mod event;
pub use event::EventId;

pub mod order;
pub use order::Constraints;

mod registry;
pub use registry::{LockError, SubscribeError};

mod table;

#[cfg(any(test, feature = "internal-bench"))]
pub mod test_util;
