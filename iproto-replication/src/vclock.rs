//! Vector clock.

use iproto_protocol::query::VclockMap;
use std::collections::BTreeMap;
use std::fmt;

/// Highest LSN consumed per instance id.
///
/// An id missing from the clock is at LSN 0. Cloning copies the map, so a
/// clone never observes later updates to the original.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VectorClock {
    lsns: BTreeMap<u32, u64>,
}

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the LSN recorded for `id`.
    pub fn get(&self, id: u32) -> u64 {
        self.lsns.get(&id).copied().unwrap_or(0)
    }

    /// Advances `id` to `lsn`.
    ///
    /// Returns false and leaves the clock untouched unless `lsn` is strictly
    /// greater than the recorded LSN.
    pub fn follow(&mut self, id: u32, lsn: u64) -> bool {
        if lsn <= self.get(id) {
            return false;
        }
        self.lsns.insert(id, lsn);
        true
    }

    /// Sum of all components; grows by one per applied row.
    pub fn signature(&self) -> u64 {
        self.lsns.values().sum()
    }

    pub fn len(&self) -> usize {
        self.lsns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lsns.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, u64)> + '_ {
        self.lsns.iter().map(|(id, lsn)| (*id, *lsn))
    }

    pub fn as_map(&self) -> &VclockMap {
        &self.lsns
    }
}

impl From<VclockMap> for VectorClock {
    fn from(lsns: VclockMap) -> Self {
        Self { lsns }
    }
}

impl FromIterator<(u32, u64)> for VectorClock {
    fn from_iter<I: IntoIterator<Item = (u32, u64)>>(iter: I) -> Self {
        Self {
            lsns: iter.into_iter().collect(),
        }
    }
}

impl fmt::Display for VectorClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (id, lsn)) in self.lsns.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}: {}", id, lsn)?;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_follow_advances_only_forward() {
        let mut clock = VectorClock::new();
        assert!(clock.follow(1, 5));
        assert!(!clock.follow(1, 5));
        assert!(!clock.follow(1, 4));
        assert!(clock.follow(1, 6));
        assert!(clock.follow(2, 1));
        assert_eq!(clock.get(1), 6);
        assert_eq!(clock.get(2), 1);
        assert_eq!(clock.get(3), 0);
        assert_eq!(clock.signature(), 7);
    }

    #[test]
    fn test_zero_lsn_is_not_progress() {
        let mut clock = VectorClock::new();
        assert!(!clock.follow(1, 0));
        assert!(clock.is_empty());
    }

    #[test]
    fn test_clone_is_deep() {
        let mut clock: VectorClock = [(1, 5), (2, 7)].into_iter().collect();
        let snapshot = clock.clone();
        clock.follow(1, 9);
        clock.follow(3, 1);
        assert_eq!(snapshot.get(1), 5);
        assert_eq!(snapshot.len(), 2);
        assert_eq!(clock.to_string(), "{1: 9, 2: 7, 3: 1}");
    }

    proptest! {
        #[test]
        fn prop_increasing_lsns_are_followed(
            steps in proptest::collection::vec((1u32..4, 1u64..100), 1..50)
        ) {
            let mut clock = VectorClock::new();
            let mut expected: BTreeMap<u32, u64> = BTreeMap::new();
            for (id, delta) in steps {
                let lsn = expected.get(&id).copied().unwrap_or(0) + delta;
                prop_assert!(clock.follow(id, lsn));
                expected.insert(id, lsn);
                prop_assert_eq!(clock.get(id), lsn);
            }
            prop_assert_eq!(clock.as_map(), &expected);
        }

        #[test]
        fn prop_non_increasing_lsn_is_rejected(
            id in 1u32..8,
            lsn in 1u64..1000,
            back in 0u64..1000,
        ) {
            let mut clock = VectorClock::new();
            prop_assert!(clock.follow(id, lsn));
            let before = clock.clone();
            prop_assert!(!clock.follow(id, lsn.saturating_sub(back)));
            prop_assert_eq!(clock, before);
        }
    }
}
