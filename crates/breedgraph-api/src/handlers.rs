//! Routes each [`Command`] to the repository or service that owns it.

use anyhow::Result;
use breedgraph_core::ontology::{OntologyEntry, OntologyEntryLabel, OntologyRelationship};
use breedgraph_core::{
    Account, AccountCommand, Command, OntologyCommand, Organisation, OrganisationCommand, Team,
    TeamId, TeamInput, UserInput, UserUpdate, VersionCommit,
};
use serde::Serialize;
use tracing::info;

use crate::uow::UnitOfWork;

/// What a handled command hands back to the caller.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "output", content = "value", rename_all = "snake_case")]
pub enum CommandOutput {
    Account(Account),
    Team { team_id: TeamId },
    Organisation { root_id: TeamId, teams: Vec<TeamView> },
    Entry(OntologyEntry),
    Relationship(OntologyRelationship),
    Relationships(Vec<OntologyRelationship>),
    Commit(VersionCommit),
    Done,
}

/// A team with its place in the organisation tree.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TeamView {
    #[serde(flatten)]
    pub team: Team,
    pub parent_id: Option<TeamId>,
}

impl CommandOutput {
    #[must_use]
    pub fn organisation(organisation: &Organisation) -> Self {
        let teams = organisation
            .teams()
            .map(|team| TeamView { team: team.clone(), parent_id: organisation.parent(team.id) })
            .collect();
        Self::Organisation { root_id: organisation.root_id(), teams }
    }
}

/// Handle one command inside `uow`. The caller commits or drops the unit of work.
///
/// # Errors
/// Propagates the domain error raised by the handling repository or service.
pub fn dispatch(uow: &mut UnitOfWork<'_>, command: Command) -> Result<CommandOutput> {
    info!(command = command.name(), user = ?uow.user().map(|id| id.0), "handling command");
    match command {
        Command::Account(command) => account(uow, command),
        Command::Organisation(command) => organisation(uow, command),
        Command::Ontology(command) => ontology(uow, command),
    }
}

fn account(uow: &mut UnitOfWork<'_>, command: AccountCommand) -> Result<CommandOutput> {
    let account = match command {
        AccountCommand::Create { name, fullname, email, password_hash } => {
            uow.accounts().create(UserInput { name, fullname, email, password_hash })?
        }
        AccountCommand::Update { user_id, name, fullname, password_hash } => uow
            .accounts()
            .update_details(user_id, UserUpdate { name, fullname, password_hash })?,
        AccountCommand::VerifyEmail { user_id } => uow.accounts().verify_email(user_id)?,
        AccountCommand::Login { name_or_email, password_hash } => {
            uow.accounts().login(&name_or_email, &password_hash)?
        }
        AccountCommand::AddEmail { user_id, email } => {
            uow.accounts().edit(user_id, |account| account.allow_email(&email))?
        }
        AccountCommand::RemoveEmail { user_id, email } => {
            uow.accounts().edit(user_id, |account| account.remove_email(&email))?
        }
        AccountCommand::SetOntologyRole { user_id, role } => {
            uow.accounts().set_ontology_role(user_id, role)?
        }
        AccountCommand::RequestAffiliation { team_id, user_id, access, heritable } => {
            let agent = uow.access().require_user()?;
            uow.organisations().change_affiliation(team_id, |organisation| {
                organisation.request_affiliation(agent, team_id, user_id, access, heritable)
            })?;
            return Ok(CommandOutput::Done);
        }
        AccountCommand::ApproveAffiliation { team_id, user_id, access, heritable } => {
            let agent = uow.access().require_user()?;
            uow.organisations().change_affiliation(team_id, |organisation| {
                organisation.authorise_affiliation(agent, team_id, user_id, access, heritable)
            })?;
            return Ok(CommandOutput::Done);
        }
        AccountCommand::RemoveAffiliation { team_id, user_id, access } => {
            let agent = uow.access().require_user()?;
            uow.organisations().change_affiliation(team_id, |organisation| {
                organisation.remove_affiliation(agent, team_id, user_id, access)
            })?;
            return Ok(CommandOutput::Done);
        }
        AccountCommand::RevokeAffiliation { team_id, user_id, access } => {
            let agent = uow.access().require_user()?;
            uow.organisations().change_affiliation(team_id, |organisation| {
                organisation.revoke_affiliation(agent, team_id, user_id, access)
            })?;
            return Ok(CommandOutput::Done);
        }
    };
    Ok(CommandOutput::Account(account))
}

fn organisation(uow: &mut UnitOfWork<'_>, command: OrganisationCommand) -> Result<CommandOutput> {
    match command {
        OrganisationCommand::CreateTeam { name, fullname, parent_id, release } => {
            let input = TeamInput { name, fullname };
            let mut organisations = uow.organisations();
            if let Some(release) = release {
                organisations = organisations.with_release(release);
            }
            let team_id = match parent_id {
                Some(parent) => organisations.add_team(input, parent)?,
                None => organisations.create(input)?.root_id(),
            };
            Ok(CommandOutput::Team { team_id })
        }
        OrganisationCommand::RemoveTeam { team_id } => {
            uow.organisations().remove_team(team_id)?;
            Ok(CommandOutput::Done)
        }
        OrganisationCommand::SplitTeam { team_id } => {
            let detached = uow.organisations().split(team_id)?;
            Ok(CommandOutput::organisation(&detached))
        }
        OrganisationCommand::DenyAffiliation { team_id, user_id, access } => {
            let agent = uow.access().require_user()?;
            uow.organisations().change_affiliation(team_id, |organisation| {
                organisation.deny_affiliation(agent, team_id, user_id, access)
            })?;
            Ok(CommandOutput::Done)
        }
    }
}

fn ontology(uow: &mut UnitOfWork<'_>, command: OntologyCommand) -> Result<CommandOutput> {
    let mut service = uow.ontology();
    let entry = match command {
        OntologyCommand::CommitVersion { version_change, comment, licence, copyright } => {
            let commit = service.commit_version(version_change, comment, licence, copyright)?;
            return Ok(CommandOutput::Commit(commit));
        }
        OntologyCommand::CreateTerm { entry } => service.create_term(entry)?,
        OntologyCommand::CreateSubject { entry, traits, conditions, exposures } => {
            service.create_subject(entry, &traits, &conditions, &exposures)?
        }
        OntologyCommand::CreateTrait { entry, subjects } => {
            service.create_trait(entry, &subjects)?
        }
        OntologyCommand::CreateCondition { entry, subjects } => {
            service.create_condition(entry, &subjects)?
        }
        OntologyCommand::CreateExposure { entry, subjects } => {
            service.create_exposure(entry, &subjects)?
        }
        OntologyCommand::CreateScale { entry, scale_type, categories } => {
            service.create_scale(entry, scale_type, &categories)?
        }
        OntologyCommand::CreateScaleCategory { entry, scales } => {
            service.create_category(entry, &scales)?
        }
        OntologyCommand::CreateObservationMethod { entry, observation_type } => {
            service.create_observation_method(entry, observation_type)?
        }
        OntologyCommand::CreateControlMethod { entry } => service.create_control_method(entry)?,
        OntologyCommand::CreateVariable { entry, links } => service.create_variable(entry, links)?,
        OntologyCommand::CreateFactor { entry, links } => service.create_factor(entry, links)?,
        OntologyCommand::CreateEventType { entry, variables, factors, exposures } => {
            service.create_event_type(entry, &variables, &factors, &exposures)?
        }
        OntologyCommand::CreateLocationType { entry } => {
            service.create_plain(entry, OntologyEntryLabel::LocationType)?
        }
        OntologyCommand::CreateLayoutType { entry, axes } => {
            service.create_layout_type(entry, axes)?
        }
        OntologyCommand::CreateDesign { entry } => {
            service.create_plain(entry, OntologyEntryLabel::Design)?
        }
        OntologyCommand::CreateRole { entry } => service.create_plain(entry, OntologyEntryLabel::Role)?,
        OntologyCommand::CreateTitle { entry } => {
            service.create_plain(entry, OntologyEntryLabel::Title)?
        }
        OntologyCommand::CreateGermplasmMethod { entry } => {
            service.create_plain(entry, OntologyEntryLabel::GermplasmMethod)?
        }
        OntologyCommand::UpdateEntry { entry_id, fields } => service.update_entry(entry_id, fields)?,
        OntologyCommand::CreateRelationship { source_id, target_id, label, rank } => {
            let relationship = service.create_relationship(source_id, target_id, label, rank)?;
            return Ok(CommandOutput::Relationship(relationship));
        }
        OntologyCommand::AddScaleCategories { scale_id, categories, ranks } => {
            let created = service.add_scale_categories(scale_id, &categories, ranks.as_deref())?;
            return Ok(CommandOutput::Relationships(created));
        }
        OntologyCommand::RemoveScaleCategories { scale_id, categories } => {
            service.remove_scale_categories(scale_id, &categories)?;
            return Ok(CommandOutput::Done);
        }
        OntologyCommand::ActivateEntries { entry_ids } => {
            service.activate_entries(&entry_ids)?;
            return Ok(CommandOutput::Done);
        }
        OntologyCommand::DeprecateEntries { entry_ids } => {
            service.deprecate_entries(&entry_ids)?;
            return Ok(CommandOutput::Done);
        }
        OntologyCommand::RemoveEntries { entry_ids } => {
            service.remove_entries(&entry_ids)?;
            return Ok(CommandOutput::Done);
        }
    };
    Ok(CommandOutput::Entry(entry))
}
