//! Vote response.

use crate::vclock::VectorClock;
use iproto_protocol::keys::{ballot, body};
use iproto_protocol::query::{decode_vclock, vclock_value};
use iproto_protocol::value::{self, Map};
use iproto_protocol::{ProtocolError, Value};

/// An instance's answer to `VOTE`, describing its role and position.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ballot {
    /// Configured read-only.
    pub is_ro_cfg: bool,
    /// Currently read-only.
    pub is_ro: bool,
    pub is_anon: bool,
    pub is_booted: bool,
    pub can_lead: bool,
    pub vclock: VectorClock,
    /// Oldest position still kept in the instance's logs.
    pub gc_vclock: VectorClock,
}

impl Ballot {
    /// Decodes the `{BALLOT: {...}}` body of a vote response.
    pub fn from_body(map: &Map) -> Result<Self, ProtocolError> {
        let fields = value::opt_map(map, body::BALLOT)?
            .ok_or(ProtocolError::MissingField(body::BALLOT))?;
        let flag = |key| value::opt_bool(fields, key).map(|v| v.unwrap_or(false));
        let vclock = |key| {
            value::get(fields, key)
                .map(|v| decode_vclock(v, key))
                .transpose()
                .map(|v| VectorClock::from(v.unwrap_or_default()))
        };
        Ok(Self {
            is_ro_cfg: flag(ballot::IS_RO_CFG)?,
            is_ro: flag(ballot::IS_RO)?,
            is_anon: flag(ballot::IS_ANON)?,
            is_booted: flag(ballot::IS_BOOTED)?,
            can_lead: flag(ballot::CAN_LEAD)?,
            vclock: vclock(ballot::VCLOCK)?,
            gc_vclock: vclock(ballot::GC_VCLOCK)?,
        })
    }

    /// Encodes the ballot as a vote response body.
    pub fn to_body(&self) -> Value {
        value::map_value(vec![(
            body::BALLOT,
            value::map_value(vec![
                (ballot::IS_RO_CFG, Value::from(self.is_ro_cfg)),
                (ballot::VCLOCK, vclock_value(self.vclock.as_map())),
                (ballot::GC_VCLOCK, vclock_value(self.gc_vclock.as_map())),
                (ballot::IS_RO, Value::from(self.is_ro)),
                (ballot::IS_ANON, Value::from(self.is_anon)),
                (ballot::IS_BOOTED, Value::from(self.is_booted)),
                (ballot::CAN_LEAD, Value::from(self.can_lead)),
            ]),
        )])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_then_decode() {
        let ballot = Ballot {
            is_ro: true,
            is_booted: true,
            vclock: [(1, 10), (2, 3)].into_iter().collect(),
            gc_vclock: [(1, 2)].into_iter().collect(),
            ..Ballot::default()
        };
        let map = match ballot.to_body() {
            Value::Map(map) => map,
            _ => unreachable!(),
        };
        assert_eq!(Ballot::from_body(&map).unwrap(), ballot);
    }

    #[test]
    fn test_missing_fields_default() {
        let map = match value::map_value(vec![(body::BALLOT, Value::Map(vec![]))]) {
            Value::Map(map) => map,
            _ => unreachable!(),
        };
        assert_eq!(Ballot::from_body(&map).unwrap(), Ballot::default());
    }

    #[test]
    fn test_missing_ballot() {
        assert!(matches!(
            Ballot::from_body(&Vec::new()),
            Err(ProtocolError::MissingField(body::BALLOT))
        ));
    }
}
