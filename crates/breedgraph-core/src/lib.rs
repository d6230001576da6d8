//! Domain model for BreedGraph: the versioned breeding ontology, team-scoped access
//! control, and the change tracking that keeps persistence minimal.
//!
//! Nothing in this crate performs I/O.

pub mod account;
pub mod commands;
pub mod controls;
pub mod error;
pub mod events;
pub mod graph;
pub mod ids;
pub mod ontology;
pub mod organisation;
pub mod tracking;
pub mod version;

pub use account::{Account, OntologyRole, User, UserInput, UserUpdate};
pub use commands::{
    AccountCommand, Command, FactorLinks, NewEntry, OntologyCommand, OrganisationCommand,
    VariableLinks,
};
pub use controls::{
    Access, AccessTeams, Affiliation, Authorisation, Control, ControlledAggregate,
    ControlledLabel, ControlledRef, Controller, Release, WriteStamp,
};
pub use error::{DomainError, DomainResult};
pub use events::DomainEvent;
pub use graph::{DiGraph, RootedGraph, Tree};
pub use ids::{EntityId, EntryId, Identified, RelationshipId, TeamId, TransientIds, UserId};
pub use organisation::{AffiliationChange, Organisation, Team, TeamInput, REDACTED_TEAM_NAME};
pub use tracking::{
    ChangeNotifier, Tracked, TrackedGraph, TrackedList, TrackedMap, TrackedSet, TrackedValue,
};
pub use version::{Version, VersionChange, VersionCommit};
