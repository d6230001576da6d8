//! Static mapping from relationship labels to the attribute names an entry's output
//! view exposes for them.

use std::collections::BTreeMap;

use serde::Serialize;

use super::entry::{OntologyEntry, OntologyEntryLabel};
use super::lifecycle::LifecyclePhase;
use super::relationship::{OntologyRelationship, OntologyRelationshipLabel};
use crate::ids::EntryId;

#[derive(Debug, Clone, Copy, Serialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// The entry is the relationship source.
    Outgoing,
    /// The entry is the relationship target.
    Incoming,
}

#[derive(Debug, Clone, Copy, Serialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Cardinality {
    One,
    Many,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct RelationshipAttribute {
    pub relationship: OntologyRelationshipLabel,
    pub direction: Direction,
    /// Label of the entry on the other end, when the attribute depends on it.
    pub counterpart: Option<OntologyEntryLabel>,
    pub name: &'static str,
    pub cardinality: Cardinality,
}

const fn attr(
    relationship: OntologyRelationshipLabel,
    direction: Direction,
    counterpart: Option<OntologyEntryLabel>,
    name: &'static str,
    cardinality: Cardinality,
) -> RelationshipAttribute {
    RelationshipAttribute { relationship, direction, counterpart, name, cardinality }
}

use Cardinality::{Many, One};
use Direction::{Incoming, Outgoing};
use OntologyEntryLabel as L;
use OntologyRelationshipLabel as R;

pub const RELATIONSHIP_ATTRIBUTES: &[RelationshipAttribute] = &[
    attr(R::ParentOf, Outgoing, None, "children", Many),
    attr(R::ParentOf, Incoming, None, "parents", Many),
    attr(R::HasTerm, Outgoing, None, "terms", Many),
    attr(R::HasTerm, Incoming, Some(L::Subject), "subjects", Many),
    attr(R::HasTerm, Incoming, Some(L::Trait), "traits", Many),
    attr(R::HasTerm, Incoming, Some(L::Condition), "conditions", Many),
    attr(R::HasTerm, Incoming, Some(L::Exposure), "exposures", Many),
    attr(R::HasTerm, Incoming, Some(L::Scale), "scales", Many),
    attr(R::HasTerm, Incoming, Some(L::Category), "categories", Many),
    attr(R::HasTerm, Incoming, Some(L::ObservationMethod), "observation_methods", Many),
    attr(R::HasTerm, Incoming, Some(L::ControlMethod), "control_methods", Many),
    attr(R::HasTerm, Incoming, Some(L::Variable), "variables", Many),
    attr(R::HasTerm, Incoming, Some(L::Factor), "factors", Many),
    attr(R::HasTerm, Incoming, Some(L::Event), "events", Many),
    attr(R::HasTerm, Incoming, Some(L::LocationType), "location_types", Many),
    attr(R::HasTerm, Incoming, Some(L::LayoutType), "layout_types", Many),
    attr(R::HasTerm, Incoming, Some(L::Design), "designs", Many),
    attr(R::HasTerm, Incoming, Some(L::Role), "roles", Many),
    attr(R::HasTerm, Incoming, Some(L::Title), "titles", Many),
    attr(R::HasTerm, Incoming, Some(L::GermplasmMethod), "germplasm_methods", Many),
    attr(R::HasCategory, Outgoing, None, "categories", Many),
    attr(R::HasCategory, Incoming, None, "scales", Many),
    attr(R::DescribesSubject, Outgoing, None, "subjects", Many),
    attr(R::DescribesSubject, Incoming, Some(L::Trait), "traits", Many),
    attr(R::DescribesSubject, Incoming, Some(L::Condition), "conditions", Many),
    attr(R::DescribesSubject, Incoming, Some(L::Exposure), "exposures", Many),
    attr(R::DescribesTrait, Outgoing, None, "trait", One),
    attr(R::DescribesTrait, Incoming, None, "variables", Many),
    attr(R::DescribesCondition, Outgoing, None, "condition", One),
    attr(R::DescribesCondition, Incoming, None, "factors", Many),
    attr(R::DescribesExposure, Outgoing, None, "exposures", Many),
    attr(R::DescribesExposure, Incoming, None, "events", Many),
    attr(R::UsesObservationMethod, Outgoing, None, "observation_method", One),
    attr(R::UsesObservationMethod, Incoming, None, "variables", Many),
    attr(R::UsesControlMethod, Outgoing, None, "control_method", One),
    attr(R::UsesControlMethod, Incoming, None, "factors", Many),
    attr(R::UsesScale, Outgoing, None, "scale", One),
    attr(R::UsesScale, Incoming, Some(L::Variable), "variables", Many),
    attr(R::UsesScale, Incoming, Some(L::Factor), "factors", Many),
    attr(R::DescribesFactor, Outgoing, None, "factors", Many),
    attr(R::DescribesFactor, Incoming, None, "events", Many),
    attr(R::DescribesVariable, Outgoing, None, "variables", Many),
    attr(R::DescribesVariable, Incoming, None, "events", Many),
];

/// Attribute under which an entry sees `relationship` from `direction`, given the
/// label of the entry on the other end.
#[must_use]
pub fn attribute_for(
    relationship: OntologyRelationshipLabel,
    direction: Direction,
    counterpart: OntologyEntryLabel,
) -> Option<&'static RelationshipAttribute> {
    RELATIONSHIP_ATTRIBUTES.iter().find(|row| {
        row.relationship == relationship
            && row.direction == direction
            && row.counterpart.map_or(true, |label| label == counterpart)
    })
}

/// Ids in an output attribute.
#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
#[serde(untagged)]
pub enum RelatedIds {
    One(EntryId),
    Many(Vec<EntryId>),
}

impl RelatedIds {
    #[must_use]
    pub fn ids(&self) -> Vec<EntryId> {
        match self {
            Self::One(id) => vec![*id],
            Self::Many(ids) => ids.clone(),
        }
    }
}

/// Entry plus its phase and related entries, keyed by attribute name.
#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct OntologyEntryOutput {
    #[serde(flatten)]
    pub entry: OntologyEntry,
    pub phase: Option<LifecyclePhase>,
    #[serde(flatten)]
    pub related: BTreeMap<&'static str, RelatedIds>,
}

impl OntologyEntryOutput {
    /// Build the view from the relationships touching `entry`.
    ///
    /// `labels` supplies the label of every entry on the other end; relationships
    /// whose counterpart is missing from it are skipped. HAS_CATEGORY targets are
    /// ordered by rank, everything else by id.
    #[must_use]
    pub fn build(
        entry: OntologyEntry,
        phase: Option<LifecyclePhase>,
        relationships: &[OntologyRelationship],
        labels: &BTreeMap<EntryId, OntologyEntryLabel>,
    ) -> Self {
        let mut grouped: BTreeMap<&'static str, (Cardinality, Vec<(u32, EntryId)>)> =
            BTreeMap::new();
        for relationship in relationships {
            let (direction, other) = if relationship.source_id == entry.id {
                (Outgoing, relationship.target_id)
            } else if relationship.target_id == entry.id {
                (Incoming, relationship.source_id)
            } else {
                continue;
            };
            let Some(other_label) = labels.get(&other) else {
                continue;
            };
            let Some(attribute) = attribute_for(relationship.label, direction, *other_label)
            else {
                continue;
            };
            let sort_key = if relationship.label == R::HasCategory && direction == Outgoing {
                relationship.rank.unwrap_or(u32::MAX)
            } else {
                0
            };
            grouped
                .entry(attribute.name)
                .or_insert_with(|| (attribute.cardinality, Vec::new()))
                .1
                .push((sort_key, other));
        }

        let related = grouped
            .into_iter()
            .filter_map(|(name, (cardinality, mut ids))| {
                ids.sort_unstable();
                let ids: Vec<EntryId> = ids.into_iter().map(|(_, id)| id).collect();
                let value = match cardinality {
                    One => RelatedIds::One(*ids.first()?),
                    Many => RelatedIds::Many(ids),
                };
                Some((name, value))
            })
            .collect();
        Self { entry, phase, related }
    }

    #[must_use]
    pub fn get(&self, attribute: &str) -> Option<&RelatedIds> {
        self.related.get(attribute)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::RelationshipId;
    use crate::ontology::entry::{EntryFields, EntryKind, ScaleType};

    fn stored(id: i64, kind: EntryKind, name: &str) -> OntologyEntry {
        OntologyEntry { id: EntryId(id), fields: EntryFields::named(name), kind }
    }

    fn edge(id: i64, source: i64, target: i64, label: R, rank: Option<u32>) -> OntologyRelationship {
        OntologyRelationship {
            id: RelationshipId(id),
            source_id: EntryId(source),
            target_id: EntryId(target),
            label,
            rank,
        }
    }

    #[test]
    fn every_relationship_has_both_directions() {
        for label in R::ALL {
            for direction in [Outgoing, Incoming] {
                assert!(
                    RELATIONSHIP_ATTRIBUTES
                        .iter()
                        .any(|row| row.relationship == *label && row.direction == direction),
                    "{label} has no {direction:?} attribute"
                );
            }
        }
    }

    #[test]
    fn has_term_incoming_is_named_after_the_source_label() {
        let attribute = attribute_for(R::HasTerm, Incoming, L::Trait);
        assert_eq!(attribute.map(|row| row.name), Some("traits"));
        let attribute = attribute_for(R::UsesScale, Incoming, L::Factor);
        assert_eq!(attribute.map(|row| row.name), Some("factors"));
    }

    #[test]
    fn variable_view_has_single_valued_links() {
        let variable = stored(10, EntryKind::Variable, "VH");
        let relationships = [
            edge(1, 10, 1, R::DescribesTrait, None),
            edge(2, 10, 2, R::UsesObservationMethod, None),
            edge(3, 10, 3, R::UsesScale, None),
            edge(4, 20, 10, R::DescribesVariable, None),
        ];
        let labels = BTreeMap::from([
            (EntryId(1), L::Trait),
            (EntryId(2), L::ObservationMethod),
            (EntryId(3), L::Scale),
            (EntryId(20), L::Event),
        ]);
        let output = OntologyEntryOutput::build(
            variable,
            Some(LifecyclePhase::Draft),
            &relationships,
            &labels,
        );
        assert_eq!(output.get("trait"), Some(&RelatedIds::One(EntryId(1))));
        assert_eq!(output.get("scale"), Some(&RelatedIds::One(EntryId(3))));
        assert_eq!(output.get("events"), Some(&RelatedIds::Many(vec![EntryId(20)])));
    }

    #[test]
    fn categories_are_ordered_by_rank() {
        let scale = stored(1, EntryKind::Scale { scale_type: ScaleType::Ordinal }, "s");
        let relationships = [
            edge(1, 1, 5, R::HasCategory, Some(2)),
            edge(2, 1, 6, R::HasCategory, Some(0)),
            edge(3, 1, 4, R::HasCategory, Some(1)),
        ];
        let labels = BTreeMap::from([
            (EntryId(4), L::Category),
            (EntryId(5), L::Category),
            (EntryId(6), L::Category),
        ]);
        let output = OntologyEntryOutput::build(scale, None, &relationships, &labels);
        assert_eq!(
            output.get("categories"),
            Some(&RelatedIds::Many(vec![EntryId(6), EntryId(4), EntryId(5)]))
        );
    }
}
