#![allow(missing_docs)]

//! Utilities shared by tests and internal benchmarks.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::rc::Rc;
use std::sync::Once;

use indexmap::IndexSet;

pub fn init() {
    static SET_LOGGER_ONCE: Once = Once::new();
    SET_LOGGER_ONCE.call_once(env_logger::init);
}

/// A cheaply cloneable stand-in for a component instance handle.
///
/// Tests compare handles by identity (`Rc::ptr_eq`) to assert that the bus
/// delivers the instance that is actually attached.
pub type Handle = Rc<Cell<i32>>;

pub fn handle(value: i32) -> Handle { Rc::new(Cell::new(value)) }

/// Records events and ensures that they are in the correct order.
pub struct EventTracer<T: fmt::Debug + Eq + Hash> {
    dependencies: HashMap<T, Vec<T>>,
    seen:         RefCell<IndexSet<T>>,
}

impl<T: fmt::Debug + Eq + Hash> EventTracer<T> {
    /// Creates a new event tracer that ensures `before` has been traced
    /// earlier than `after` for each `(before, after)` input.
    pub fn new(orders: impl IntoIterator<Item = (T, T)>) -> Self {
        let mut dependencies: HashMap<T, Vec<T>> = HashMap::new();
        for (before, after) in orders {
            dependencies.entry(after).or_default().push(before);
        }
        let seen = RefCell::new(IndexSet::new());

        Self { dependencies, seen }
    }

    /// Records that `event` has happened.
    ///
    /// # Panics
    /// Panics if the same `event` was traced twice or a dependency is not
    /// satisfied.
    pub fn trace(&self, event: T) {
        let mut seen = self.seen.borrow_mut();

        if let Some(deps) = self.dependencies.get(&event) {
            for dep in deps {
                assert!(seen.contains(dep), "{:?} should happen after {:?}", event, dep);
            }
        }

        let (index, new) = seen.insert_full(event);
        assert!(
            new,
            "{:?} is traced twice",
            seen.get_index(index).expect("insert_full should return valid index")
        );
    }

    /// Returns the events observed so far, in trace order.
    pub fn get_events(&self) -> Vec<T>
    where
        T: Clone,
    {
        self.seen.borrow().iter().cloned().collect()
    }
}
