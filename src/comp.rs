//! Component type indices.
//!
//! Every distinct component type is assigned a small dense integer once at
//! process startup by the component storage collaborator. The bus keys all
//! per-component structures by this index instead of any form of runtime type
//! inspection, so lookups are plain array/map accesses.

use std::fmt;

/// The dense index assigned to one component type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CompIdx(usize);

impl CompIdx {
    /// Wraps a raw component type index assigned by the storage collaborator.
    pub const fn new(index: usize) -> Self { Self(index) }

    /// Returns the index as a `usize` for direct slot addressing.
    pub const fn usize(self) -> usize { self.0 }
}

impl fmt::Display for CompIdx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "component #{}", self.0) }
}

#[cfg(test)]
mod tests {
    use static_assertions::assert_impl_all;

    use super::CompIdx;

    assert_impl_all!(CompIdx: Copy, Ord, std::hash::Hash);

    #[test]
    fn test_display() {
        assert_eq!(CompIdx::new(3).to_string(), "component #3");
    }
}
