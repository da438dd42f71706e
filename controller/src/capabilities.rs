use std::collections::BTreeSet;

/// Linux capability set for the consumer container.
///
/// Deduplication is part of the contract, not a loop at render time: union is
/// the only mutation, and rendering yields a sorted list so pod specs stay
/// deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilitySet(BTreeSet<String>);

impl CapabilitySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn union_with<I>(mut self, caps: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        self.0.extend(caps);
        self
    }

    pub fn contains(&self, cap: &str) -> bool {
        self.0.contains(cap)
    }

    /// Renders the set as a `capabilities.add` list.
    pub fn into_add_list(self) -> Vec<String> {
        self.0.into_iter().collect()
    }
}

impl FromIterator<String> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        CapabilitySet(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn union_deduplicates() {
        let caps = CapabilitySet::new()
            .union_with(["SYS_CHROOT".to_string()])
            .union_with(["NET_ADMIN".to_string(), "SYS_CHROOT".to_string()]);
        assert_eq!(caps.into_add_list(), vec!["NET_ADMIN", "SYS_CHROOT"]);
    }

    #[test]
    fn render_is_sorted_regardless_of_insertion_order() {
        let a = CapabilitySet::new().union_with(["B".to_string(), "A".to_string()]);
        let b = CapabilitySet::new().union_with(["A".to_string(), "B".to_string()]);
        assert_eq!(a.into_add_list(), b.into_add_list());
    }
}
