// 📦 Rated entities
// The aggregate side of the system: one AggregateState per rating dimension,
// attached to the entity's own record.

use crate::aggregate::AggregateState;
use crate::field::RatingField;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Polymorphic pointer to an application object (type id + object id)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityRef {
    pub entity_type: i64,
    pub object_id: i64,
}

impl EntityRef {
    pub fn new(entity_type: i64, object_id: i64) -> Self {
        EntityRef {
            entity_type,
            object_id,
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.entity_type, self.object_id)
    }
}

/// Entity record as far as ratings are concerned
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RatedEntity {
    pub entity: EntityRef,
    /// Dimension name → aggregate
    pub ratings: BTreeMap<String, AggregateState>,
}

impl RatedEntity {
    pub fn new(entity: EntityRef) -> Self {
        RatedEntity {
            entity,
            ratings: BTreeMap::new(),
        }
    }

    pub fn rating(&self, field: &str) -> Option<&AggregateState> {
        self.ratings.get(field)
    }

    /// Aggregate for `field`, created zeroed on first touch
    pub fn rating_mut(&mut self, field: &RatingField) -> &mut AggregateState {
        let buckets = field.range().len();
        let state = self
            .ratings
            .entry(field.name().to_string())
            .or_insert_with(|| AggregateState::zeroed(buckets));
        state.fit_to(buckets);
        state
    }
}
