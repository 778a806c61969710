//! Arena-backed per-entity dispatch lists.
//!
//! Each live entity owns one [`EventTable`]: for every event type with at
//! least one applicable subscription, a singly linked list of the entity's
//! currently attached, subscribed components. All lists of one entity share
//! a single node arena; unlinked nodes go onto an intrusive free list and are
//! recycled by later attachments, so steady-state lifecycle churn does not
//! allocate.
//!
//! New entries are always linked at the *front* of their list, not at the
//! position the resolved order would suggest. Ordered event types compensate
//! by sorting at dispatch time; for unordered event types the list order
//! (most recently attached first) is the dispatch order. This front-insertion
//! policy is deliberate and observable, see the crate-level docs.

use std::collections::HashMap;

use crate::comp::CompIdx;
use crate::event::EventId;

struct Node<C> {
    comp:     CompIdx,
    /// `None` while the node sits on the free list.
    instance: Option<C>,
    next:     Option<usize>,
}

#[derive(Clone, Copy)]
struct ListHead {
    start: usize,
    len:   usize,
}

/// All dispatch lists of one entity.
pub(crate) struct EventTable<C> {
    heads: HashMap<EventId, ListHead>,
    nodes: Vec<Node<C>>,
    free:  Option<usize>,
}

impl<C> Default for EventTable<C> {
    fn default() -> Self { Self { heads: HashMap::new(), nodes: Vec::new(), free: None } }
}

impl<C> EventTable<C> {
    /// Links a new entry for `comp` at the front of the list for `event`.
    pub(crate) fn push_front(&mut self, event: EventId, comp: CompIdx, instance: C) {
        let next = self.heads.get(&event).map(|head| head.start);
        let index = match self.free {
            Some(index) => {
                let node = self.nodes.get_mut(index).expect("free list points into the arena");
                self.free = node.next;
                node.comp = comp;
                node.instance = Some(instance);
                node.next = next;
                index
            }
            None => {
                self.nodes.push(Node { comp, instance: Some(instance), next });
                self.nodes.len() - 1
            }
        };

        let head = self.heads.entry(event).or_insert(ListHead { start: index, len: 0 });
        head.start = index;
        head.len += 1;
    }

    /// Unlinks the entry for `comp` from the list for `event`, if present,
    /// and recycles its node. Returns the instance the entry held.
    pub(crate) fn remove(&mut self, event: EventId, comp: CompIdx) -> Option<C> {
        let head = *self.heads.get(&event)?;

        // Walk the chain remembering where the incoming link lives.
        let mut index = head.start;
        let mut prev: Option<usize> = None;
        loop {
            let node = self.nodes.get(index).expect("list links point into the arena");
            if node.comp == comp {
                break;
            }
            prev = Some(index);
            index = node.next?;
        }

        let next = self.nodes.get(index).expect("found above").next;
        match prev {
            Some(prev) => {
                self.nodes.get_mut(prev).expect("visited above").next = next;
            }
            None => {
                // Removing the list head.
                let head = self.heads.get_mut(&event).expect("fetched above");
                if let Some(next) = next {
                    head.start = next;
                }
            }
        }

        if head.len == 1 {
            self.heads.remove(&event);
        } else {
            let head = self.heads.get_mut(&event).expect("fetched above");
            head.len -= 1;
        }

        let node = self.nodes.get_mut(index).expect("found above");
        let instance = node.instance.take();
        node.next = self.free;
        self.free = Some(index);
        Some(instance.expect("linked node holds an instance"))
    }

    /// Returns the instance currently linked for `comp` in the list for
    /// `event`, or `None` if no such entry is live.
    pub(crate) fn instance(&self, event: EventId, comp: CompIdx) -> Option<&C> {
        let head = self.heads.get(&event)?;
        let mut index = Some(head.start);
        while let Some(current) = index {
            let node = self.nodes.get(current).expect("list links point into the arena");
            if node.comp == comp {
                return Some(node.instance.as_ref().expect("linked node holds an instance"));
            }
            index = node.next;
        }
        None
    }

    /// Appends the component membership of the list for `event` to `buf`,
    /// in list order (most recently attached first).
    pub(crate) fn snapshot_into(&self, event: EventId, buf: &mut Vec<CompIdx>) {
        let Some(head) = self.heads.get(&event) else { return };
        buf.reserve(head.len);
        let mut index = Some(head.start);
        while let Some(current) = index {
            let node = self.nodes.get(current).expect("list links point into the arena");
            buf.push(node.comp);
            index = node.next;
        }
    }

    #[cfg(test)]
    pub(crate) fn list_len(&self, event: EventId) -> usize {
        self.heads.get(&event).map_or(0, |head| head.len)
    }

    #[cfg(test)]
    pub(crate) fn arena_len(&self) -> usize { self.nodes.len() }
}
