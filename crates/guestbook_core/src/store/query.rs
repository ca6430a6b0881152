//! Kind-scoped queries shared by every store implementation.
//!
//! # Invariants
//! - Results contain only entities of `Query::kind`.
//! - Ordering is total: ties on the order property fall back to the entity
//!   key, in the same direction.
//! - Without an explicit order, results are sorted by key ascending.

use crate::model::entity::{Entity, Kind, PropertyValue};
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    Descending,
}

/// Equality predicate on one property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    pub property: String,
    pub value: PropertyValue,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    pub property: String,
    pub direction: SortDirection,
}

/// Query over one kind with optional filter, order and limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub kind: Kind,
    pub filter: Option<Filter>,
    pub order: Option<Order>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn kind(kind: Kind) -> Self {
        Self {
            kind,
            filter: None,
            order: None,
            limit: None,
        }
    }

    pub fn filter_eq(mut self, property: &str, value: impl Into<PropertyValue>) -> Self {
        self.filter = Some(Filter {
            property: property.to_string(),
            value: value.into(),
        });
        self
    }

    pub fn order_by(mut self, property: &str, direction: SortDirection) -> Self {
        self.order = Some(Order {
            property: property.to_string(),
            direction,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether `entity` satisfies kind and filter.
    pub fn matches(&self, entity: &Entity) -> bool {
        if entity.key.kind != self.kind {
            return false;
        }
        match &self.filter {
            Some(filter) => entity
                .get(&filter.property)
                .is_some_and(|value| value.matches_equality(&filter.value)),
            None => true,
        }
    }

    /// Filters, sorts and truncates a candidate set.
    pub fn apply<I>(&self, candidates: I) -> Vec<Entity>
    where
        I: IntoIterator<Item = Entity>,
    {
        let mut matched = candidates
            .into_iter()
            .filter(|entity| self.matches(entity))
            .collect::<Vec<_>>();
        matched.sort_by(|left, right| self.compare(left, right));
        if let Some(limit) = self.limit {
            matched.truncate(limit);
        }
        matched
    }

    fn compare(&self, left: &Entity, right: &Entity) -> Ordering {
        match &self.order {
            Some(order) => {
                let ordering = left
                    .get(&order.property)
                    .cmp(&right.get(&order.property))
                    .then_with(|| left.key.cmp(&right.key));
                match order.direction {
                    SortDirection::Ascending => ordering,
                    SortDirection::Descending => ordering.reverse(),
                }
            }
            None => left.key.cmp(&right.key),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Query, SortDirection};
    use crate::model::entity::{Entity, EntityKey, Kind, PropertyValue};

    fn greeting(id: i64, book_id: i64, timestamp: i64) -> Entity {
        Entity::new(EntityKey::numeric(Kind::Greeting, id))
            .with("book_id", book_id)
            .with("timestamp", timestamp)
    }

    #[test]
    fn descending_order_breaks_ties_by_key_descending() {
        let query = Query::kind(Kind::Greeting)
            .filter_eq("book_id", 1)
            .order_by("timestamp", SortDirection::Descending);
        let result = query.apply(vec![
            greeting(1, 1, 100),
            greeting(2, 1, 100),
            greeting(3, 2, 500),
            greeting(4, 1, 50),
        ]);
        let ids = result
            .iter()
            .filter_map(|entity| entity.key.numeric_id())
            .collect::<Vec<_>>();
        assert_eq!(ids, vec![2, 1, 4]);
    }

    #[test]
    fn limit_applies_after_sorting() {
        let query = Query::kind(Kind::Greeting)
            .order_by("timestamp", SortDirection::Ascending)
            .limit(1);
        let result = query.apply(vec![greeting(1, 1, 9), greeting(2, 1, 3)]);
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].key.numeric_id(), Some(2));
    }

    #[test]
    fn filter_excludes_other_kinds_and_missing_properties() {
        let tag_key = EntityKey::named(Kind::Tag, "fiction");
        let tagged = Entity::new(EntityKey::numeric(Kind::Book, 1)).with(
            "tags",
            PropertyValue::List(vec![PropertyValue::Key(tag_key.clone())]),
        );
        let untagged = Entity::new(EntityKey::numeric(Kind::Book, 2));
        let other_kind = Entity::new(EntityKey::named(Kind::Tag, "fiction"));

        let query = Query::kind(Kind::Book).filter_eq("tags", tag_key);
        let result = query.apply(vec![tagged.clone(), untagged, other_kind]);
        assert_eq!(result, vec![tagged]);
    }
}
