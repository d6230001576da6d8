//! Orchestration for BreedGraph: per-caller access control, controlled
//! repositories, the ontology service, units of work and the message bus.

pub mod access;
pub mod accounts;
pub mod bus;
pub mod config;
pub mod handlers;
pub mod ontology;
pub mod organisations;
pub mod repository;
pub mod uow;

pub use access::{resolve_access_teams, AccessControlService};
pub use accounts::AccountRepository;
pub use bus::{EventHandler, LoggingEventHandler, MessageBus};
pub use config::BreedGraphConfig;
pub use handlers::{dispatch, CommandOutput, TeamView};
pub use ontology::{OntologyService, OntologySession};
pub use organisations::{OrganisationPersistence, OrganisationRepository};
pub use repository::{AggregatePersistence, ControlledRepository};
pub use uow::{UnitOfWork, UnitOfWorkFactory};

#[cfg(test)]
pub(crate) mod test_support {
    use std::path::{Path, PathBuf};
    use std::sync::Arc;

    use anyhow::Result;
    use breedgraph_core::{Account, DomainError, OntologyRole, TeamInput, UserId, UserInput};
    use breedgraph_store_sqlite::{AccountStore, SqliteStore};
    use rusqlite::Connection;
    use ulid::Ulid;

    use crate::config::BreedGraphConfig;
    use crate::uow::UnitOfWorkFactory;

    pub fn memory_store() -> Result<SqliteStore> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        store.migrate()?;
        Ok(store)
    }

    pub fn input(name: &str, email: &str) -> UserInput {
        UserInput {
            name: name.to_string(),
            fullname: None,
            email: email.to_string(),
            password_hash: "h".to_string(),
        }
    }

    /// Store a viewer account straight through the store.
    pub fn user(conn: &Connection, name: &str) -> Result<UserId> {
        let mut account = Account::create(input(name, &format!("{name}@x")), OntologyRole::Viewer)?;
        AccountStore::new(conn).insert(&mut account)?;
        Ok(account.id())
    }

    pub fn team(name: &str) -> TeamInput {
        TeamInput { name: name.to_string(), fullname: None }
    }

    pub fn domain_error(error: Option<&anyhow::Error>) -> Option<&DomainError> {
        error.and_then(|error| error.downcast_ref::<DomainError>())
    }

    /// A database file that is deleted, with its WAL files, on drop.
    pub struct TempDb {
        pub path: PathBuf,
    }

    impl TempDb {
        pub fn new() -> Self {
            Self { path: std::env::temp_dir().join(format!("breedgraph-{}.sqlite3", Ulid::new())) }
        }

        pub fn factory(&self) -> Result<Arc<UnitOfWorkFactory>> {
            let config = BreedGraphConfig::for_db(&self.path);
            Ok(Arc::new(UnitOfWorkFactory::new(Arc::new(config))?))
        }
    }

    impl Drop for TempDb {
        fn drop(&mut self) {
            for suffix in ["", "-wal", "-shm"] {
                let mut path = self.path.clone().into_os_string();
                path.push(suffix);
                let _ = std::fs::remove_file(path);
            }
        }
    }
}
