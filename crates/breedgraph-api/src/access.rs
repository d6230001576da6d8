//! Per-caller team access and the controllers guarding stored models.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;
use breedgraph_core::{
    AccessTeams, ControlledLabel, ControlledRef, Controller, DomainError, Release, TeamId, UserId,
};
use breedgraph_store_sqlite::{ControlStore, OrganisationStore};
use rusqlite::Connection;
use tracing::debug;

/// Resolve the four access sets of `user` across every organisation they are
/// affiliated with.
///
/// # Errors
/// Returns an error when organisations cannot be loaded.
pub fn resolve_access_teams(conn: &Connection, user: Option<UserId>) -> Result<AccessTeams> {
    let mut teams = AccessTeams::default();
    let Some(user) = user else {
        return Ok(teams);
    };
    let organisations = OrganisationStore::new(conn);
    for root in organisations.roots_for_user(user)? {
        if let Some(organisation) = organisations.get(root)? {
            teams.merge(organisation.access_teams(user));
        }
    }
    debug!(
        user = %user,
        read = teams.read.len(),
        write = teams.write.len(),
        curate = teams.curate.len(),
        admin = teams.admin.len(),
        "resolved access teams"
    );
    Ok(teams)
}

/// The caller's access context over one transaction.
pub struct AccessControlService<'a> {
    conn: &'a Connection,
    user: Option<UserId>,
    teams: &'a mut AccessTeams,
}

impl<'a> AccessControlService<'a> {
    pub fn new(conn: &'a Connection, user: Option<UserId>, teams: &'a mut AccessTeams) -> Self {
        Self { conn, user, teams }
    }

    /// Reload the caller's team sets; needed after changes that grant the caller
    /// new affiliations.
    ///
    /// # Errors
    /// Returns an error when organisations cannot be loaded.
    pub fn initialize_user_context(&mut self) -> Result<()> {
        *self.teams = resolve_access_teams(self.conn, self.user)?;
        Ok(())
    }

    #[must_use]
    pub fn user(&self) -> Option<UserId> {
        self.user
    }

    /// # Errors
    /// Returns [`DomainError::UnauthorisedOperation`] for anonymous callers.
    pub fn require_user(&self) -> Result<UserId> {
        self.user.ok_or_else(|| {
            DomainError::UnauthorisedOperation("this operation needs a signed-in user".to_string())
                .into()
        })
    }

    #[must_use]
    pub fn teams(&self) -> &AccessTeams {
        self.teams
    }

    /// # Errors
    /// Returns an error when a control cannot be written.
    pub fn set_controls(
        &self,
        models: &[ControlledRef],
        teams: &BTreeSet<TeamId>,
        release: Release,
    ) -> Result<()> {
        ControlStore::new(self.conn).set_controls(models, teams, release)
    }

    /// Stamp each model as written by the caller now.
    ///
    /// # Errors
    /// Returns [`DomainError::UnauthorisedOperation`] for anonymous callers.
    pub fn record_writes(&self, models: &[ControlledRef]) -> Result<()> {
        if models.is_empty() {
            return Ok(());
        }
        let user = self.require_user()?;
        ControlStore::new(self.conn).record_writes(models, user)
    }

    /// # Errors
    /// Returns an error when controls cannot be read.
    pub fn get_controllers(
        &self,
        label: ControlledLabel,
        ids: &[i64],
    ) -> Result<BTreeMap<i64, Controller>> {
        ControlStore::new(self.conn).get_controllers(label, ids)
    }

    /// Controllers of mixed-label models, keyed by model.
    ///
    /// # Errors
    /// Returns an error when controls cannot be read.
    pub fn controllers_for(
        &self,
        models: &[ControlledRef],
    ) -> Result<BTreeMap<ControlledRef, Controller>> {
        let mut by_label: BTreeMap<ControlledLabel, Vec<i64>> = BTreeMap::new();
        for model in models {
            by_label.entry(model.label).or_default().push(model.id);
        }
        let mut controllers = BTreeMap::new();
        for (label, ids) in by_label {
            for (id, controller) in self.get_controllers(label, &ids)? {
                controllers.insert(ControlledRef { label, id }, controller);
            }
        }
        Ok(controllers)
    }

    /// # Errors
    /// Returns an error when controls cannot be deleted.
    pub fn remove_controls(
        &self,
        label: ControlledLabel,
        ids: &[i64],
        teams: &BTreeSet<TeamId>,
    ) -> Result<()> {
        ControlStore::new(self.conn).remove_controls(label, ids, teams)
    }

    #[must_use]
    pub fn can_read(&self, controller: &Controller) -> bool {
        controller.is_readable(&self.teams.read, self.user.is_some())
    }

    /// Editing or removing a member needs CURATE on one of its controlling teams.
    ///
    /// # Errors
    /// Returns [`DomainError::UnauthorisedOperation`] otherwise.
    pub fn require_curate_any(
        &self,
        model: ControlledRef,
        controller: Option<&Controller>,
    ) -> Result<()> {
        if controller.is_some_and(|controller| controller.controlled_by_any(&self.teams.curate)) {
            return Ok(());
        }
        Err(DomainError::UnauthorisedOperation(format!(
            "curate access is required on a team controlling {} {}",
            model.label.as_str(),
            model.id
        ))
        .into())
    }

    /// Removing a whole aggregate needs CURATE on every controlling team.
    ///
    /// # Errors
    /// Returns [`DomainError::UnauthorisedOperation`] otherwise.
    pub fn require_curate_all(
        &self,
        model: ControlledRef,
        controller: Option<&Controller>,
    ) -> Result<()> {
        if controller.is_some_and(|controller| controller.controlled_only_by(&self.teams.curate)) {
            return Ok(());
        }
        Err(DomainError::UnauthorisedOperation(format!(
            "curate access is required on every team controlling {} {}",
            model.label.as_str(),
            model.id
        ))
        .into())
    }
}

#[cfg(test)]
mod tests {
    use anyhow::anyhow;
    use breedgraph_core::{Access, Control, Organisation};
    use time::OffsetDateTime;

    use super::*;
    use crate::test_support::{memory_store, team, user};

    #[test]
    fn heritable_affiliations_reach_descendant_teams() -> Result<()> {
        let store = memory_store()?;
        let alice = user(store.conn(), "alice")?;
        let bob = user(store.conn(), "bob")?;
        let organisations = OrganisationStore::new(store.conn());
        let mut organisation = Organisation::create(team("Root"), alice)?;
        organisation.add_team(team("Child"), organisation.root_id())?;
        let stored = organisations.save(&mut organisation)?;
        let child = stored.last().copied().ok_or_else(|| anyhow!("child not stored"))?;

        let teams = resolve_access_teams(store.conn(), Some(alice))?;
        assert!(teams.for_access(Access::Admin).contains(&child));
        assert!(teams.read.contains(&organisation.root_id()));
        assert!(resolve_access_teams(store.conn(), Some(bob))?.read.is_empty());
        assert_eq!(resolve_access_teams(store.conn(), None)?, AccessTeams::default());
        Ok(())
    }

    #[test]
    fn curate_rules_distinguish_any_and_all() -> Result<()> {
        let store = memory_store()?;
        let mut teams = AccessTeams::default();
        teams.grant(Access::Curate, TeamId(1));
        let access = AccessControlService::new(store.conn(), Some(UserId(1)), &mut teams);

        let mut controller = Controller::default();
        for team in [TeamId(1), TeamId(2)] {
            controller
                .controls
                .insert(team, Control { release: Release::Private, time: OffsetDateTime::now_utc() });
        }
        let model = ControlledRef::team(TeamId(1));
        assert!(access.require_curate_any(model, Some(&controller)).is_ok());
        assert!(access.require_curate_all(model, Some(&controller)).is_err());
        assert!(access.require_curate_any(model, None).is_err());
        assert!(!access.can_read(&controller));
        Ok(())
    }
}
