use anyhow::Result;
use breedgraph_core::{
    Access, ControlledRef, DomainError, DomainEvent, Organisation, TeamId, TeamInput, UserId,
};
use breedgraph_store_sqlite::OrganisationStore;
use rusqlite::Connection;
use tracing::info;

use crate::repository::{AggregatePersistence, ControlledRepository};

pub struct OrganisationPersistence<'a> {
    store: OrganisationStore<'a>,
}

impl<'a> OrganisationPersistence<'a> {
    #[must_use]
    pub fn new(conn: &'a Connection) -> Self {
        Self { store: OrganisationStore::new(conn) }
    }

    #[must_use]
    pub fn store(&self) -> &OrganisationStore<'a> {
        &self.store
    }
}

impl AggregatePersistence for OrganisationPersistence<'_> {
    type Aggregate = Organisation;
    type Input = TeamInput;

    fn build(&self, input: TeamInput, user: UserId) -> Result<Organisation> {
        Ok(Organisation::create(input, user)?)
    }

    fn save(&self, organisation: &mut Organisation) -> Result<Vec<ControlledRef>> {
        Ok(self.store.save(organisation)?.into_iter().map(ControlledRef::team).collect())
    }

    fn load(&self, root: i64) -> Result<Option<Organisation>> {
        self.store.get(TeamId(root))
    }

    fn root_ids(&self) -> Result<Vec<i64>> {
        Ok(self.store.root_ids()?.into_iter().map(|id| id.0).collect())
    }

    fn delete(&self, organisation: &Organisation) -> Result<()> {
        self.store.remove(organisation)
    }

    fn take_events(&self, organisation: &mut Organisation) -> Vec<DomainEvent> {
        organisation.drain_events()
    }
}

pub type OrganisationRepository<'a> = ControlledRepository<'a, OrganisationPersistence<'a>>;

impl OrganisationRepository<'_> {
    /// The organisation containing `team`, as the caller may see it.
    ///
    /// # Errors
    /// Returns [`DomainError::NoResultFound`] for unknown or unreadable teams.
    pub fn get_containing(&self, team: TeamId) -> Result<Organisation> {
        let root = self.root_of(team)?;
        self.get(root.0)?
            .ok_or_else(|| DomainError::NoResultFound(format!("organisation of team {team}")).into())
    }

    /// Add a team under `parent`; the caller must administer the parent.
    ///
    /// # Errors
    /// Returns [`DomainError::UnauthorisedOperation`] for non-admins and
    /// [`DomainError::IdentityExists`] for clashing sibling names.
    pub fn add_team(&mut self, input: TeamInput, parent: TeamId) -> Result<TeamId> {
        let user = self.access().require_user()?;
        let mut organisation = self.load_for_update(parent)?;
        if !organisation.has_access(user, parent, Access::Admin) {
            return Err(DomainError::UnauthorisedOperation(format!(
                "admin access on team {parent} is required to add teams"
            ))
            .into());
        }
        organisation.add_team(input, parent)?;
        let stored = self.update(&mut organisation)?;
        let team = stored
            .first()
            .map(|model| TeamId(model.id))
            .ok_or_else(|| DomainError::NoResultFound(format!("new team under {parent}")))?;
        info!(team = %team, parent = %parent, "added team");
        Ok(team)
    }

    /// Remove a leaf team, or a whole single-team organisation.
    ///
    /// # Errors
    /// Returns [`DomainError::ProtectedNode`] for teams with children.
    pub fn remove_team(&mut self, team: TeamId) -> Result<()> {
        let mut organisation = self.load_for_update(team)?;
        if organisation.root_id() == team {
            return self.remove(organisation);
        }
        organisation.remove_team(team)?;
        self.update(&mut organisation)?;
        Ok(())
    }

    /// Apply an affiliation state change to the organisation containing `team`.
    ///
    /// The organisation enforces who may make each transition.
    ///
    /// # Errors
    /// Propagates the organisation's state-machine and authorisation errors.
    pub fn change_affiliation(
        &mut self,
        team: TeamId,
        change: impl FnOnce(&mut Organisation) -> Result<(), DomainError>,
    ) -> Result<()> {
        self.access().require_user()?;
        let mut organisation = self.load_for_update(team)?;
        change(&mut organisation)?;
        self.update(&mut organisation)?;
        Ok(())
    }

    /// Detach the subtree at `team` into its own organisation and persist both.
    ///
    /// # Errors
    /// Returns [`DomainError::UnauthorisedOperation`] unless the caller administers
    /// `team`, and [`DomainError::IdentityExists`] when the detached root name is
    /// already used by another root.
    pub fn split(&mut self, team: TeamId) -> Result<Organisation> {
        let user = self.access().require_user()?;
        let mut organisation = self.load_for_update(team)?;
        let mut detached = organisation.split(user, team)?;
        self.save_unchecked(&mut organisation)?;
        self.save_unchecked(&mut detached)?;
        info!(team = %team, from = %organisation.root_id(), "split organisation");
        Ok(detached)
    }

    fn root_of(&self, team: TeamId) -> Result<TeamId> {
        self.persistence()
            .store()
            .root_of(team)?
            .ok_or_else(|| DomainError::NoResultFound(format!("team {team}")).into())
    }

    /// Mutations load the full organisation; the organisation and the controller
    /// checks in `update` decide what the caller may change.
    fn load_for_update(&self, team: TeamId) -> Result<Organisation> {
        let root = self.root_of(team)?;
        self.persistence()
            .load(root.0)?
            .ok_or_else(|| DomainError::NoResultFound(format!("organisation of team {team}")).into())
    }
}
