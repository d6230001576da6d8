//! Command payloads accepted by the message bus.
//!
//! The acting user travels beside the command, not inside it, so the same payload
//! can be replayed by a system handler.

use serde::{Deserialize, Serialize};

use crate::account::OntologyRole;
use crate::controls::{Access, Release};
use crate::ids::{EntryId, TeamId, UserId};
use crate::ontology::{
    AxisType, EntryFields, ObservationType, OntologyRelationshipLabel, ScaleType,
};
use crate::version::VersionChange;
use crate::DomainError;

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "domain", content = "command", rename_all = "snake_case")]
pub enum Command {
    Account(AccountCommand),
    Organisation(OrganisationCommand),
    Ontology(OntologyCommand),
}

impl Command {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Account(command) => command.name(),
            Self::Organisation(command) => command.name(),
            Self::Ontology(command) => command.name(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "type")]
pub enum AccountCommand {
    Create {
        name: String,
        #[serde(default)]
        fullname: Option<String>,
        email: String,
        password_hash: String,
    },
    Update {
        user_id: UserId,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        fullname: Option<String>,
        #[serde(default)]
        password_hash: Option<String>,
    },
    VerifyEmail { user_id: UserId },
    Login { name_or_email: String, password_hash: String },
    AddEmail { user_id: UserId, email: String },
    RemoveEmail { user_id: UserId, email: String },
    SetOntologyRole { user_id: UserId, role: OntologyRole },
    RequestAffiliation {
        team_id: TeamId,
        user_id: UserId,
        access: Access,
        #[serde(default)]
        heritable: bool,
    },
    ApproveAffiliation {
        team_id: TeamId,
        user_id: UserId,
        access: Access,
        #[serde(default)]
        heritable: bool,
    },
    RemoveAffiliation { team_id: TeamId, user_id: UserId, access: Access },
    RevokeAffiliation { team_id: TeamId, user_id: UserId, access: Access },
}

impl AccountCommand {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Create { .. } => "Create",
            Self::Update { .. } => "Update",
            Self::VerifyEmail { .. } => "VerifyEmail",
            Self::Login { .. } => "Login",
            Self::AddEmail { .. } => "AddEmail",
            Self::RemoveEmail { .. } => "RemoveEmail",
            Self::SetOntologyRole { .. } => "SetOntologyRole",
            Self::RequestAffiliation { .. } => "RequestAffiliation",
            Self::ApproveAffiliation { .. } => "ApproveAffiliation",
            Self::RemoveAffiliation { .. } => "RemoveAffiliation",
            Self::RevokeAffiliation { .. } => "RevokeAffiliation",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "type")]
pub enum OrganisationCommand {
    /// Without a parent, creates a new organisation rooted at this team.
    CreateTeam {
        name: String,
        #[serde(default)]
        fullname: Option<String>,
        #[serde(default)]
        parent_id: Option<TeamId>,
        #[serde(default)]
        release: Option<Release>,
    },
    RemoveTeam { team_id: TeamId },
    SplitTeam { team_id: TeamId },
    DenyAffiliation { team_id: TeamId, user_id: UserId, access: Access },
}

impl OrganisationCommand {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::CreateTeam { .. } => "CreateTeam",
            Self::RemoveTeam { .. } => "RemoveTeam",
            Self::SplitTeam { .. } => "SplitTeam",
            Self::DenyAffiliation { .. } => "DenyAffiliation",
        }
    }
}

/// Common payload of every typed entry creator.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct NewEntry {
    #[serde(flatten)]
    pub fields: EntryFields,
    #[serde(default)]
    pub parents: Vec<EntryId>,
    #[serde(default)]
    pub children: Vec<EntryId>,
    #[serde(default)]
    pub terms: Vec<EntryId>,
}

impl NewEntry {
    #[must_use]
    pub fn named(name: &str) -> Self {
        Self { fields: EntryFields::named(name), ..Self::default() }
    }

    #[must_use]
    pub fn with_parents(mut self, parents: &[EntryId]) -> Self {
        self.parents = parents.to_vec();
        self
    }

    #[must_use]
    pub fn with_abbreviation(mut self, abbreviation: &str) -> Self {
        self.fields.abbreviation = Some(abbreviation.to_string());
        self
    }
}

/// The three required links of a variable.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct VariableLinks {
    #[serde(default)]
    pub trait_id: Option<EntryId>,
    #[serde(default)]
    pub observation_method_id: Option<EntryId>,
    #[serde(default)]
    pub scale_id: Option<EntryId>,
}

impl VariableLinks {
    #[must_use]
    pub fn new(trait_id: EntryId, observation_method_id: EntryId, scale_id: EntryId) -> Self {
        Self {
            trait_id: Some(trait_id),
            observation_method_id: Some(observation_method_id),
            scale_id: Some(scale_id),
        }
    }

    /// # Errors
    /// Returns [`DomainError::Validation`] naming the first missing link.
    pub fn require(self) -> Result<(EntryId, EntryId, EntryId), DomainError> {
        Ok((
            required(self.trait_id, "trait_id")?,
            required(self.observation_method_id, "observation_method_id")?,
            required(self.scale_id, "scale_id")?,
        ))
    }
}

/// The three required links of a factor.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct FactorLinks {
    #[serde(default)]
    pub condition_id: Option<EntryId>,
    #[serde(default)]
    pub control_method_id: Option<EntryId>,
    #[serde(default)]
    pub scale_id: Option<EntryId>,
}

impl FactorLinks {
    #[must_use]
    pub fn new(condition_id: EntryId, control_method_id: EntryId, scale_id: EntryId) -> Self {
        Self {
            condition_id: Some(condition_id),
            control_method_id: Some(control_method_id),
            scale_id: Some(scale_id),
        }
    }

    /// # Errors
    /// Returns [`DomainError::Validation`] naming the first missing link.
    pub fn require(self) -> Result<(EntryId, EntryId, EntryId), DomainError> {
        Ok((
            required(self.condition_id, "condition_id")?,
            required(self.control_method_id, "control_method_id")?,
            required(self.scale_id, "scale_id")?,
        ))
    }
}

fn required(id: Option<EntryId>, field: &str) -> Result<EntryId, DomainError> {
    id.ok_or_else(|| DomainError::Validation(format!("{field} is required")))
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "type")]
pub enum OntologyCommand {
    CommitVersion {
        version_change: VersionChange,
        #[serde(default)]
        comment: Option<String>,
        #[serde(default)]
        licence: Option<i64>,
        #[serde(default)]
        copyright: Option<i64>,
    },
    CreateTerm {
        #[serde(flatten)]
        entry: NewEntry,
    },
    CreateSubject {
        #[serde(flatten)]
        entry: NewEntry,
        #[serde(default)]
        traits: Vec<EntryId>,
        #[serde(default)]
        conditions: Vec<EntryId>,
        #[serde(default)]
        exposures: Vec<EntryId>,
    },
    CreateTrait {
        #[serde(flatten)]
        entry: NewEntry,
        #[serde(default)]
        subjects: Vec<EntryId>,
    },
    CreateCondition {
        #[serde(flatten)]
        entry: NewEntry,
        #[serde(default)]
        subjects: Vec<EntryId>,
    },
    CreateExposure {
        #[serde(flatten)]
        entry: NewEntry,
        #[serde(default)]
        subjects: Vec<EntryId>,
    },
    CreateScale {
        #[serde(flatten)]
        entry: NewEntry,
        scale_type: ScaleType,
        #[serde(default)]
        categories: Vec<EntryId>,
    },
    CreateScaleCategory {
        #[serde(flatten)]
        entry: NewEntry,
        #[serde(default)]
        scales: Vec<EntryId>,
    },
    CreateObservationMethod {
        #[serde(flatten)]
        entry: NewEntry,
        observation_type: ObservationType,
    },
    CreateControlMethod {
        #[serde(flatten)]
        entry: NewEntry,
    },
    CreateVariable {
        #[serde(flatten)]
        entry: NewEntry,
        #[serde(flatten)]
        links: VariableLinks,
    },
    CreateFactor {
        #[serde(flatten)]
        entry: NewEntry,
        #[serde(flatten)]
        links: FactorLinks,
    },
    CreateEventType {
        #[serde(flatten)]
        entry: NewEntry,
        #[serde(default)]
        variables: Vec<EntryId>,
        #[serde(default)]
        factors: Vec<EntryId>,
        #[serde(default)]
        exposures: Vec<EntryId>,
    },
    CreateLocationType {
        #[serde(flatten)]
        entry: NewEntry,
    },
    CreateLayoutType {
        #[serde(flatten)]
        entry: NewEntry,
        axes: Vec<AxisType>,
    },
    CreateDesign {
        #[serde(flatten)]
        entry: NewEntry,
    },
    CreateRole {
        #[serde(flatten)]
        entry: NewEntry,
    },
    CreateTitle {
        #[serde(flatten)]
        entry: NewEntry,
    },
    CreateGermplasmMethod {
        #[serde(flatten)]
        entry: NewEntry,
    },
    UpdateEntry {
        entry_id: EntryId,
        #[serde(flatten)]
        fields: EntryFields,
    },
    CreateRelationship {
        source_id: EntryId,
        target_id: EntryId,
        label: OntologyRelationshipLabel,
        #[serde(default)]
        rank: Option<u32>,
    },
    AddScaleCategories {
        scale_id: EntryId,
        categories: Vec<EntryId>,
        #[serde(default)]
        ranks: Option<Vec<u32>>,
    },
    RemoveScaleCategories { scale_id: EntryId, categories: Vec<EntryId> },
    ActivateEntries { entry_ids: Vec<EntryId> },
    DeprecateEntries { entry_ids: Vec<EntryId> },
    RemoveEntries { entry_ids: Vec<EntryId> },
}

impl OntologyCommand {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::CommitVersion { .. } => "CommitVersion",
            Self::CreateTerm { .. } => "CreateTerm",
            Self::CreateSubject { .. } => "CreateSubject",
            Self::CreateTrait { .. } => "CreateTrait",
            Self::CreateCondition { .. } => "CreateCondition",
            Self::CreateExposure { .. } => "CreateExposure",
            Self::CreateScale { .. } => "CreateScale",
            Self::CreateScaleCategory { .. } => "CreateScaleCategory",
            Self::CreateObservationMethod { .. } => "CreateObservationMethod",
            Self::CreateControlMethod { .. } => "CreateControlMethod",
            Self::CreateVariable { .. } => "CreateVariable",
            Self::CreateFactor { .. } => "CreateFactor",
            Self::CreateEventType { .. } => "CreateEventType",
            Self::CreateLocationType { .. } => "CreateLocationType",
            Self::CreateLayoutType { .. } => "CreateLayoutType",
            Self::CreateDesign { .. } => "CreateDesign",
            Self::CreateRole { .. } => "CreateRole",
            Self::CreateTitle { .. } => "CreateTitle",
            Self::CreateGermplasmMethod { .. } => "CreateGermplasmMethod",
            Self::UpdateEntry { .. } => "UpdateEntry",
            Self::CreateRelationship { .. } => "CreateRelationship",
            Self::AddScaleCategories { .. } => "AddScaleCategories",
            Self::RemoveScaleCategories { .. } => "RemoveScaleCategories",
            Self::ActivateEntries { .. } => "ActivateEntries",
            Self::DeprecateEntries { .. } => "DeprecateEntries",
            Self::RemoveEntries { .. } => "RemoveEntries",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variable_links_report_the_missing_field() {
        let links = VariableLinks {
            scale_id: None,
            ..VariableLinks::new(EntryId(1), EntryId(2), EntryId(3))
        };
        let error = links.require().err();
        assert_eq!(error, Some(DomainError::Validation("scale_id is required".to_string())));
    }

    #[test]
    fn commands_parse_from_flat_json() -> Result<(), serde_json::Error> {
        let command: Command = serde_json::from_value(serde_json::json!({
            "domain": "ontology",
            "command": {
                "type": "CreateVariable",
                "name": "VH",
                "trait_id": 1,
                "observation_method_id": 2,
                "scale_id": 3
            }
        }))?;
        let Command::Ontology(OntologyCommand::CreateVariable { entry, links }) = &command else {
            panic!("unexpected command {command:?}");
        };
        assert_eq!(entry.fields.name, "VH");
        assert_eq!(links.require().ok(), Some((EntryId(1), EntryId(2), EntryId(3))));
        assert_eq!(command.name(), "CreateVariable");
        Ok(())
    }

    #[test]
    fn account_commands_default_optional_fields() -> Result<(), serde_json::Error> {
        let command: AccountCommand = serde_json::from_value(serde_json::json!({
            "type": "RequestAffiliation",
            "team_id": 4,
            "user_id": 2,
            "access": "READ"
        }))?;
        assert_eq!(
            command,
            AccountCommand::RequestAffiliation {
                team_id: TeamId(4),
                user_id: UserId(2),
                access: Access::Read,
                heritable: false
            }
        );
        Ok(())
    }
}
