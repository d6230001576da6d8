use serde::{Deserialize, Serialize};

use super::entry::{string_enum, OntologyEntryLabel};
use crate::ids::{EntityId, EntryId, RelationshipId};
use crate::DomainError;

string_enum!(
    /// The kinds of directed edge between ontology entries.
    OntologyRelationshipLabel {
        ParentOf => "PARENT_OF",
        HasTerm => "HAS_TERM",
        HasCategory => "HAS_CATEGORY",
        DescribesSubject => "DESCRIBES_SUBJECT",
        DescribesTrait => "DESCRIBES_TRAIT",
        DescribesCondition => "DESCRIBES_CONDITION",
        DescribesExposure => "DESCRIBES_EXPOSURE",
        UsesObservationMethod => "USES_OBSERVATION_METHOD",
        UsesControlMethod => "USES_CONTROL_METHOD",
        UsesScale => "USES_SCALE",
        DescribesFactor => "DESCRIBES_FACTOR",
        DescribesVariable => "DESCRIBES_VARIABLE",
    }
);

impl OntologyRelationshipLabel {
    /// Whether an edge of this label may run from `source` to `target`.
    #[must_use]
    pub fn allows(self, source: OntologyEntryLabel, target: OntologyEntryLabel) -> bool {
        use OntologyEntryLabel as L;
        match self {
            Self::ParentOf => source == target,
            Self::HasTerm => source != L::Term && target == L::Term,
            Self::HasCategory => source == L::Scale && target == L::Category,
            Self::DescribesSubject => {
                matches!(source, L::Trait | L::Condition | L::Exposure) && target == L::Subject
            }
            Self::DescribesTrait => source == L::Variable && target == L::Trait,
            Self::DescribesCondition => source == L::Factor && target == L::Condition,
            Self::DescribesExposure => source == L::Event && target == L::Exposure,
            Self::UsesObservationMethod => {
                source == L::Variable && target == L::ObservationMethod
            }
            Self::UsesControlMethod => source == L::Factor && target == L::ControlMethod,
            Self::UsesScale => matches!(source, L::Variable | L::Factor) && target == L::Scale,
            Self::DescribesFactor => source == L::Event && target == L::Factor,
            Self::DescribesVariable => source == L::Event && target == L::Variable,
        }
    }

    /// # Errors
    /// Returns [`DomainError::IllegalOperation`] when the endpoint labels do not fit.
    pub fn check(
        self,
        source: OntologyEntryLabel,
        target: OntologyEntryLabel,
    ) -> Result<(), DomainError> {
        if self.allows(source, target) {
            Ok(())
        } else {
            Err(DomainError::IllegalOperation(format!(
                "{self} cannot connect {source} to {target}"
            )))
        }
    }
}

/// A relationship not yet stored.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct OntologyRelationshipInput {
    pub source_id: EntryId,
    pub target_id: EntryId,
    pub label: OntologyRelationshipLabel,
    #[serde(default)]
    pub rank: Option<u32>,
}

impl OntologyRelationshipInput {
    /// Validate a relationship between entries of the given labels.
    ///
    /// # Errors
    /// Returns [`DomainError::IllegalOperation`] for self-references, label mismatches
    /// and ranks on anything but HAS_CATEGORY.
    pub fn build(
        source: (EntryId, OntologyEntryLabel),
        target: (EntryId, OntologyEntryLabel),
        label: OntologyRelationshipLabel,
        rank: Option<u32>,
    ) -> Result<Self, DomainError> {
        if source.0 == target.0 {
            return Err(DomainError::IllegalOperation(format!(
                "entry {} cannot relate to itself",
                source.0
            )));
        }
        label.check(source.1, target.1)?;
        if rank.is_some() && label != OntologyRelationshipLabel::HasCategory {
            return Err(DomainError::IllegalOperation(format!("{label} does not take a rank")));
        }
        Ok(Self { source_id: source.0, target_id: target.0, label, rank })
    }

    #[must_use]
    pub fn into_stored(self, id: RelationshipId) -> OntologyRelationship {
        OntologyRelationship {
            id,
            source_id: self.source_id,
            target_id: self.target_id,
            label: self.label,
            rank: self.rank,
        }
    }
}

/// A stored relationship.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct OntologyRelationship {
    pub id: RelationshipId,
    pub source_id: EntryId,
    pub target_id: EntryId,
    pub label: OntologyRelationshipLabel,
    pub rank: Option<u32>,
}

impl OntologyRelationship {
    /// # Errors
    /// Returns [`DomainError::Validation`] for transient ids and otherwise the checks
    /// of [`OntologyRelationshipInput::build`].
    pub fn load(
        id: RelationshipId,
        source: (EntryId, OntologyEntryLabel),
        target: (EntryId, OntologyEntryLabel),
        label: OntologyRelationshipLabel,
        rank: Option<u32>,
    ) -> Result<Self, DomainError> {
        if id.is_transient() {
            return Err(DomainError::Validation(format!(
                "stored relationship id {id} must be positive"
            )));
        }
        Ok(OntologyRelationshipInput::build(source, target, label, rank)?.into_stored(id))
    }

    /// Same (source, target, label) triple.
    #[must_use]
    pub fn same_triple(
        &self,
        source: EntryId,
        target: EntryId,
        label: OntologyRelationshipLabel,
    ) -> bool {
        self.source_id == source && self.target_id == target && self.label == label
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use OntologyEntryLabel as L;
    use OntologyRelationshipLabel as R;

    #[test]
    fn compatibility_table_is_enforced() {
        assert!(R::ParentOf.allows(L::Trait, L::Trait));
        assert!(!R::ParentOf.allows(L::Trait, L::Subject));
        assert!(R::HasTerm.allows(L::Scale, L::Term));
        assert!(!R::HasTerm.allows(L::Term, L::Term));
        assert!(R::DescribesSubject.allows(L::Exposure, L::Subject));
        assert!(R::UsesScale.allows(L::Factor, L::Scale));
        assert!(!R::UsesScale.allows(L::Event, L::Scale));
        assert!(R::DescribesVariable.allows(L::Event, L::Variable));
        assert!(!R::HasCategory.allows(L::Variable, L::Category));
    }

    #[test]
    fn every_label_admits_some_pair() {
        for label in R::ALL {
            let admits = L::ALL
                .iter()
                .any(|source| L::ALL.iter().any(|target| label.allows(*source, *target)));
            assert!(admits, "{label} admits no pair");
        }
    }

    #[test]
    fn build_rejects_self_reference_and_stray_ranks() {
        let trait_a = (EntryId(1), L::Trait);
        let result = OntologyRelationshipInput::build(trait_a, trait_a, R::ParentOf, None);
        assert!(matches!(result, Err(DomainError::IllegalOperation(_))));

        let trait_b = (EntryId(2), L::Trait);
        assert!(OntologyRelationshipInput::build(trait_a, trait_b, R::ParentOf, Some(0)).is_err());

        let scale = (EntryId(3), L::Scale);
        let category = (EntryId(4), L::Category);
        assert!(OntologyRelationshipInput::build(scale, category, R::HasCategory, Some(0)).is_ok());
    }

    #[test]
    fn load_rechecks_labels() {
        let loaded = OntologyRelationship::load(
            RelationshipId(9),
            (EntryId(1), L::Variable),
            (EntryId(2), L::Subject),
            R::DescribesTrait,
            None,
        );
        assert!(loaded.is_err());
    }
}
