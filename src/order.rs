//! Resolves before/after constraints into one fixed dispatch order.
//!
//! Subscriptions for the same event type may each declare that they run
//! before or after other component types' subscriptions. The resolver turns
//! these local declarations into a single linear order per event type,
//! computed once at lock time and immutable afterwards. Unrelated subsystems
//! never need to agree on a global priority scheme.

use std::collections::HashMap;

use crate::comp::CompIdx;

/// Ordering constraints declared by one subscription.
///
/// `before`/`after` reference *other component types' subscriptions for the
/// same event type*. References to component types without a subscription for
/// that event type are ignored; only mutual constraints matter.
#[derive(Debug, Clone, Default)]
pub struct Constraints {
    pub(crate) before: Vec<CompIdx>,
    pub(crate) after:  Vec<CompIdx>,
}

impl Constraints {
    /// Creates an empty constraint set.
    ///
    /// A subscription registered with empty constraints still participates in
    /// the resolved order of its event type; it is merely unconstrained.
    pub fn new() -> Self { Self::default() }

    /// Declares that this subscription's handler runs before `comp`'s.
    pub fn before(mut self, comp: CompIdx) -> Self {
        self.before.push(comp);
        self
    }

    /// Declares that this subscription's handler runs after `comp`'s.
    pub fn after(mut self, comp: CompIdx) -> Self {
        self.after.push(comp);
        self
    }

    pub(crate) fn merge_from(&mut self, other: &Constraints) {
        self.before.extend_from_slice(&other.before);
        self.after.extend_from_slice(&other.after);
    }
}

/// Computes the dispatch order for one event type.
///
/// `nodes` lists every subscribed component type in subscription order, each
/// with its merged constraints. The result is a topological order of the
/// constraint graph; component types with no remaining constraint are emitted
/// in subscription order, so the output is deterministic for a fixed
/// subscription sequence.
///
/// Fails with the participants of one constraint cycle if the graph is not a
/// DAG. This is surfaced at lock time, never at dispatch.
pub(crate) fn resolve(nodes: &[(CompIdx, Constraints)]) -> Result<Vec<CompIdx>, Vec<CompIdx>> {
    let index_of: HashMap<CompIdx, usize> =
        nodes.iter().enumerate().map(|(index, &(comp, _))| (comp, index)).collect();

    // If `dependents[a].contains(b)`, `b` runs after `a`.
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    let mut dependency_counts: Vec<usize> = vec![0; nodes.len()];

    for (index, (_, constraints)) in nodes.iter().enumerate() {
        for target in &constraints.before {
            if let Some(&target) = index_of.get(target) {
                dependents[index].push(target);
                dependency_counts[target] += 1;
            }
        }
        for target in &constraints.after {
            if let Some(&target) = index_of.get(target) {
                dependents[target].push(index);
                dependency_counts[index] += 1;
            }
        }
    }

    let mut resolved = Vec::with_capacity(nodes.len());
    let mut emitted = vec![false; nodes.len()];

    loop {
        // Scan in subscription order so ties break deterministically.
        // n is small (the component types subscribed to one event type),
        // and this runs once per event type at lock time.
        let next = (0..nodes.len()).find(|&index| !emitted[index] && dependency_counts[index] == 0);
        let Some(next) = next else { break };

        emitted[next] = true;
        resolved.push(nodes[next].0);
        for &dependent in &dependents[next] {
            dependency_counts[dependent] = dependency_counts[dependent]
                .checked_sub(1)
                .expect("dependency count underflow for a non-emitted node");
        }
    }

    if resolved.len() < nodes.len() {
        return Err(find_cycle(nodes, &dependents, &emitted));
    }

    Ok(resolved)
}

/// Extracts one concrete cycle from the nodes left over by [`resolve`].
///
/// Every leftover node has at least one unmet dependency that is itself
/// leftover, so walking dependencies within the leftover set must eventually
/// revisit a node on the walk stack.
fn find_cycle(
    nodes: &[(CompIdx, Constraints)],
    dependents: &[Vec<usize>],
    emitted: &[bool],
) -> Vec<CompIdx> {
    // Invert the edges restricted to leftover nodes.
    let mut dependencies: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    for (index, targets) in dependents.iter().enumerate() {
        if emitted[index] {
            continue;
        }
        for &target in targets {
            if !emitted[target] {
                dependencies[target].push(index);
            }
        }
    }

    let start = emitted.iter().position(|&done| !done).expect("resolve reported leftover nodes");

    let mut stack: Vec<usize> = Vec::new();
    let mut position_of: HashMap<usize, usize> = HashMap::new();
    let mut node = start;
    loop {
        if let Some(&position) = position_of.get(&node) {
            let mut cycle: Vec<CompIdx> =
                stack[position..].iter().map(|&index| nodes[index].0).collect();
            // The walk followed dependencies backwards; report the cycle in
            // "runs before" direction.
            cycle.reverse();
            return cycle;
        }

        position_of.insert(node, stack.len());
        stack.push(node);
        node = *dependencies[node]
            .first()
            .expect("leftover node must have a leftover dependency");
    }
}
