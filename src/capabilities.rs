use std::collections::HashSet;

use caps::{CapSet, Capability};

use crate::error::Result;

// `caps::set` can't add bits back into the bounding set once dropped, so
// shrinking it means reading the full set and dropping each unwanted bit.
pub fn apply_bounding_set(retained: &HashSet<Capability>) -> Result<()> {
    let current = caps::read(None, CapSet::Bounding)?;
    for cap in current.difference(retained) {
        caps::drop(None, CapSet::Bounding, *cap)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_set_union_extra_is_superset_of_defaults() {
        let defaults = crate::config::default_capabilities();
        let mut retained = defaults.clone();
        retained.insert(Capability::CAP_NET_ADMIN);
        assert!(retained.is_superset(&defaults));
        assert!(retained.contains(&Capability::CAP_NET_ADMIN));
    }

    #[test]
    fn union_is_idempotent_and_deduplicates() {
        let mut set: HashSet<Capability> = crate::config::default_capabilities();
        let before = set.len();
        set.insert(Capability::CAP_CHOWN);
        assert_eq!(set.len(), before);
    }
}
