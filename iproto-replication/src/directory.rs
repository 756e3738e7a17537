//! Replica set identity.

use crate::error::ReplicationError;
use std::collections::BTreeMap;
use uuid::Uuid;

/// The replica set UUID and the instance id to UUID map.
///
/// Once the replica set UUID is known, a different value asserted later is
/// an identity mismatch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Directory {
    replicaset_uuid: Option<Uuid>,
    instances: BTreeMap<u32, Uuid>,
}

impl Directory {
    /// Creates a directory, optionally seeded with a known replica set UUID.
    /// The nil UUID counts as unknown.
    pub fn new(replicaset_uuid: Option<Uuid>) -> Self {
        Self {
            replicaset_uuid: replicaset_uuid.filter(|uuid| !uuid.is_nil()),
            instances: BTreeMap::new(),
        }
    }

    pub fn replicaset_uuid(&self) -> Option<Uuid> {
        self.replicaset_uuid
    }

    /// Checks `asserted` against the known replica set UUID, adopting it
    /// when none is known yet. A nil assertion is ignored.
    pub fn assert_replicaset(&mut self, asserted: Uuid) -> Result<(), ReplicationError> {
        if asserted.is_nil() {
            return Ok(());
        }
        match self.replicaset_uuid {
            Some(known) if known != asserted => Err(ReplicationError::IdentityMismatch {
                expected: known,
                actual: asserted,
            }),
            Some(_) => Ok(()),
            None => {
                tracing::debug!("Learned replica set UUID {}", asserted);
                self.replicaset_uuid = Some(asserted);
                Ok(())
            }
        }
    }

    /// Records the UUID of instance `id`, returning the previous one.
    pub fn insert_instance(&mut self, id: u32, uuid: Uuid) -> Option<Uuid> {
        self.instances.insert(id, uuid)
    }

    pub fn instance(&self, id: u32) -> Option<Uuid> {
        self.instances.get(&id).copied()
    }

    /// Looks up the id assigned to `uuid`.
    pub fn instance_id(&self, uuid: &Uuid) -> Option<u32> {
        self.instances
            .iter()
            .find(|(_, u)| *u == uuid)
            .map(|(id, _)| *id)
    }

    pub fn instances(&self) -> &BTreeMap<u32, Uuid> {
        &self.instances
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const U1: Uuid = Uuid::from_u128(0x11);
    const U2: Uuid = Uuid::from_u128(0x22);

    #[test]
    fn test_adopts_first_assertion() {
        let mut dir = Directory::new(None);
        dir.assert_replicaset(U1).unwrap();
        assert_eq!(dir.replicaset_uuid(), Some(U1));
        dir.assert_replicaset(U1).unwrap();
    }

    #[test]
    fn test_conflicting_assertion_is_mismatch() {
        let mut dir = Directory::new(Some(U1));
        match dir.assert_replicaset(U2) {
            Err(ReplicationError::IdentityMismatch { expected, actual }) => {
                assert_eq!(expected, U1);
                assert_eq!(actual, U2);
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(dir.replicaset_uuid(), Some(U1));
    }

    #[test]
    fn test_nil_is_unknown() {
        let mut dir = Directory::new(Some(Uuid::nil()));
        assert_eq!(dir.replicaset_uuid(), None);
        dir.assert_replicaset(Uuid::nil()).unwrap();
        assert_eq!(dir.replicaset_uuid(), None);
    }

    #[test]
    fn test_instances() {
        let mut dir = Directory::default();
        assert_eq!(dir.insert_instance(1, U1), None);
        assert_eq!(dir.insert_instance(2, U2), None);
        assert_eq!(dir.insert_instance(2, U2), Some(U2));
        assert_eq!(dir.instance(1), Some(U1));
        assert_eq!(dir.instance_id(&U2), Some(2));
        assert_eq!(dir.instances().len(), 2);
    }
}
