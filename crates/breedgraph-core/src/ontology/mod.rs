mod attributes;
mod entry;
mod lifecycle;
mod relationship;

pub use attributes::{
    attribute_for, Cardinality, Direction, OntologyEntryOutput, RelatedIds, RelationshipAttribute,
    RELATIONSHIP_ATTRIBUTES,
};
pub use entry::{
    AxisType, EntryFields, EntryKind, ObservationType, OntologyEntry, OntologyEntryInput,
    OntologyEntryLabel, ScaleType,
};
pub use lifecycle::{Lifecycle, LifecyclePhase, PhaseAudit, PhaseVersions};
pub use relationship::{OntologyRelationship, OntologyRelationshipInput, OntologyRelationshipLabel};
