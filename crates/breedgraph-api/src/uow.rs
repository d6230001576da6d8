//! Units of work: one connection, one `BEGIN IMMEDIATE` transaction.

use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Result;
use breedgraph_core::{AccessTeams, DomainError, DomainEvent, OntologyRole, Release, UserId};
use breedgraph_store_sqlite::{AccountStore, SqliteOntologyPersistence, SqliteStore};
use tracing::{debug, warn};

use crate::access::{resolve_access_teams, AccessControlService};
use crate::accounts::AccountRepository;
use crate::config::BreedGraphConfig;
use crate::ontology::{OntologyService, OntologySession};
use crate::organisations::{OrganisationPersistence, OrganisationRepository};
use crate::repository::ControlledRepository;

/// Opens units of work against one database and queues the events they publish.
pub struct UnitOfWorkFactory {
    config: Arc<BreedGraphConfig>,
    queue: Mutex<Vec<DomainEvent>>,
}

impl UnitOfWorkFactory {
    /// Open the database once to install the schema.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or migrated.
    pub fn new(config: Arc<BreedGraphConfig>) -> Result<Self> {
        config.validate()?;
        let mut store = SqliteStore::open_with_timeout(&config.db_path, config.busy_timeout_ms)?;
        store.migrate()?;
        Ok(Self { config, queue: Mutex::new(Vec::new()) })
    }

    #[must_use]
    pub fn config(&self) -> &BreedGraphConfig {
        &self.config
    }

    /// Start a unit of work whose repository reads are redacted for `user`.
    ///
    /// # Errors
    /// Returns [`DomainError::TooManyRetries`] while the database stays locked and
    /// [`DomainError::UnauthorisedOperation`] for unknown users.
    pub fn begin(&self, user: Option<UserId>) -> Result<UnitOfWork<'_>> {
        self.open(user, true)
    }

    /// Start a unit of work that reads aggregates unredacted, for system handlers.
    ///
    /// # Errors
    /// See [`UnitOfWorkFactory::begin`].
    pub fn begin_unredacted(&self, user: Option<UserId>) -> Result<UnitOfWork<'_>> {
        self.open(user, false)
    }

    /// Events published by committed units of work, oldest first.
    pub fn drain_events(&self) -> Vec<DomainEvent> {
        std::mem::take(&mut *self.queue.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn enqueue(&self, events: Vec<DomainEvent>) {
        if events.is_empty() {
            return;
        }
        self.queue.lock().unwrap_or_else(PoisonError::into_inner).extend(events);
    }

    fn open(&self, user: Option<UserId>, redacted: bool) -> Result<UnitOfWork<'_>> {
        let store =
            SqliteStore::open_with_timeout(&self.config.db_path, self.config.busy_timeout_ms)?;
        store.begin_immediate(self.config.begin_retries)?;
        let role = match user {
            Some(id) => AccountStore::new(store.conn())
                .get(id)?
                .map(|account| account.user().ontology_role)
                .ok_or_else(|| DomainError::UnauthorisedOperation(format!("unknown user {id}")))?,
            None => OntologyRole::Viewer,
        };
        let teams = resolve_access_teams(store.conn(), user)?;
        debug!(user = ?user.map(|id| id.0), redacted, "began unit of work");
        Ok(UnitOfWork {
            factory: self,
            store,
            user,
            role,
            teams,
            release: self.config.default_release,
            redacted,
            ontology: OntologySession::default(),
            events: Vec::new(),
            committed: false,
        })
    }
}

/// One transaction plus the services that act inside it.
///
/// Dropping a unit of work without calling [`UnitOfWork::commit`] rolls it back.
pub struct UnitOfWork<'f> {
    factory: &'f UnitOfWorkFactory,
    store: SqliteStore,
    user: Option<UserId>,
    role: OntologyRole,
    teams: AccessTeams,
    release: Release,
    redacted: bool,
    ontology: OntologySession,
    events: Vec<DomainEvent>,
    committed: bool,
}

impl UnitOfWork<'_> {
    #[must_use]
    pub fn user(&self) -> Option<UserId> {
        self.user
    }

    #[must_use]
    pub fn role(&self) -> OntologyRole {
        self.role
    }

    #[must_use]
    pub fn store(&self) -> &SqliteStore {
        &self.store
    }

    pub fn access(&mut self) -> AccessControlService<'_> {
        AccessControlService::new(self.store.conn(), self.user, &mut self.teams)
    }

    pub fn accounts(&mut self) -> AccountRepository<'_> {
        AccountRepository::new(self.store.conn(), self.user, &mut self.events)
    }

    pub fn organisations(&mut self) -> OrganisationRepository<'_> {
        let conn = self.store.conn();
        ControlledRepository::new(
            OrganisationPersistence::new(conn),
            AccessControlService::new(conn, self.user, &mut self.teams),
            self.release,
            self.redacted,
            &mut self.events,
        )
    }

    pub fn ontology(&mut self) -> OntologyService<'_, SqliteOntologyPersistence<'_>> {
        OntologyService::new(
            SqliteOntologyPersistence::new(self.store.conn()),
            self.user,
            self.role,
            &mut self.ontology,
        )
    }

    /// Flush pending lifecycles, commit, and hand published events to the factory.
    ///
    /// # Errors
    /// Returns an error when flushing or the commit fails; the transaction is then
    /// rolled back on drop.
    pub fn commit(mut self) -> Result<()> {
        self.ontology().flush()?;
        self.store.commit()?;
        self.committed = true;
        let mut events = std::mem::take(&mut self.events);
        events.extend(self.ontology.drain_events());
        debug!(events = events.len(), "committed unit of work");
        self.factory.enqueue(events);
        Ok(())
    }

    /// # Errors
    /// Returns an error when the rollback fails.
    pub fn rollback(mut self) -> Result<()> {
        self.committed = true;
        self.store.rollback()?;
        debug!("rolled back unit of work");
        Ok(())
    }
}

impl Drop for UnitOfWork<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        match self.store.rollback() {
            Ok(()) => debug!("rolled back uncommitted unit of work"),
            Err(err) => warn!(error = %err, "failed to roll back unit of work"),
        }
    }
}
