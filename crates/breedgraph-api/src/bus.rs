//! Async message bus: commands run one at a time, events fan out to workers.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use breedgraph_core::{Command, DomainEvent, UserId};
use tokio::sync::{mpsc, Mutex};
use tokio::task::{self, JoinHandle};
use tracing::{debug, error, info, warn};

use crate::handlers::{dispatch, CommandOutput};
use crate::uow::UnitOfWorkFactory;

/// Reacts to events published by committed units of work.
///
/// Delivery is at-least-once; handlers must tolerate repeats.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &DomainEvent) -> Result<()>;
}

/// Logs every event at info.
pub struct LoggingEventHandler;

#[async_trait]
impl EventHandler for LoggingEventHandler {
    async fn handle(&self, event: &DomainEvent) -> Result<()> {
        info!(event = event.name(), "domain event");
        Ok(())
    }
}

pub struct MessageBus {
    factory: Arc<UnitOfWorkFactory>,
    commands: Mutex<()>,
    sender: Option<mpsc::UnboundedSender<DomainEvent>>,
    workers: Vec<JoinHandle<()>>,
}

impl MessageBus {
    /// Spawn `event_workers` tasks sharing one event queue. Must be called from
    /// within a tokio runtime.
    #[must_use]
    pub fn start(factory: Arc<UnitOfWorkFactory>, handlers: Vec<Arc<dyn EventHandler>>) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel::<DomainEvent>();
        let receiver = Arc::new(Mutex::new(receiver));
        let handlers: Arc<[Arc<dyn EventHandler>]> = handlers.into();
        let workers = (0..factory.config().event_workers)
            .map(|worker| {
                let receiver = Arc::clone(&receiver);
                let handlers = Arc::clone(&handlers);
                tokio::spawn(async move {
                    loop {
                        let next = receiver.lock().await.recv().await;
                        let Some(event) = next else {
                            break;
                        };
                        for handler in handlers.iter() {
                            if let Err(err) = handler.handle(&event).await {
                                warn!(
                                    worker,
                                    event = event.name(),
                                    error = %err,
                                    "event handler failed"
                                );
                            }
                        }
                    }
                    debug!(worker, "event worker stopped");
                })
            })
            .collect();
        Self { factory, commands: Mutex::new(()), sender: Some(sender), workers }
    }

    #[must_use]
    pub fn factory(&self) -> &Arc<UnitOfWorkFactory> {
        &self.factory
    }

    /// Run `command` for `user` in its own unit of work, then queue the events it
    /// published.
    ///
    /// # Errors
    /// Logs and returns the error that aborted the command; nothing is committed.
    pub async fn handle(&self, user: Option<UserId>, command: Command) -> Result<CommandOutput> {
        let name = command.name();
        let _serial = self.commands.lock().await;
        let factory = Arc::clone(&self.factory);
        let outcome = task::spawn_blocking(move || -> Result<CommandOutput> {
            let mut uow = factory.begin(user)?;
            let output = dispatch(&mut uow, command)?;
            uow.commit()?;
            Ok(output)
        })
        .await
        .map_err(anyhow::Error::from)
        .and_then(|outcome| outcome);
        self.publish();
        if let Err(err) = &outcome {
            error!(command = name, user = ?user.map(|id| id.0), error = %err, "command failed");
        }
        outcome
    }

    fn publish(&self) {
        let Some(sender) = &self.sender else {
            return;
        };
        for event in self.factory.drain_events() {
            if sender.send(event).is_err() {
                warn!("event queue closed; dropping event");
            }
        }
    }

    /// Close the queue and wait for the workers to drain it.
    ///
    /// # Errors
    /// Returns an error when a worker task panicked.
    pub async fn shutdown(mut self) -> Result<()> {
        self.sender.take();
        for worker in std::mem::take(&mut self.workers) {
            worker.await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use breedgraph_core::{
        Access, AccountCommand, DomainError, OntologyRole, OrganisationCommand, TeamId,
    };

    use super::*;
    use crate::test_support::{domain_error, TempDb};

    #[derive(Default)]
    struct Recorder {
        seen: StdMutex<Vec<&'static str>>,
    }

    #[async_trait]
    impl EventHandler for Recorder {
        async fn handle(&self, event: &DomainEvent) -> Result<()> {
            self.seen.lock().map_err(|_| anyhow::anyhow!("poisoned"))?.push(event.name());
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl EventHandler for Failing {
        async fn handle(&self, _event: &DomainEvent) -> Result<()> {
            anyhow::bail!("smtp unavailable")
        }
    }

    fn create(name: &str, email: &str) -> Command {
        Command::Account(AccountCommand::Create {
            name: name.to_string(),
            fullname: None,
            email: email.to_string(),
            password_hash: "h".to_string(),
        })
    }

    fn team_of(output: &CommandOutput) -> Result<TeamId> {
        match output {
            CommandOutput::Team { team_id } => Ok(*team_id),
            other => anyhow::bail!("unexpected output {other:?}"),
        }
    }

    #[tokio::test]
    async fn registration_assigns_admin_first_and_rejects_reused_email() -> Result<()> {
        let db = TempDb::new();
        let recorder = Arc::new(Recorder::default());
        let handlers: Vec<Arc<dyn EventHandler>> =
            vec![Arc::clone(&recorder) as Arc<dyn EventHandler>, Arc::new(Failing)];
        let bus = MessageBus::start(db.factory()?, handlers);

        let CommandOutput::Account(first) = bus.handle(None, create("alice", "a@x")).await? else {
            anyhow::bail!("expected an account");
        };
        let CommandOutput::Account(second) = bus.handle(None, create("bob", "b@x")).await? else {
            anyhow::bail!("expected an account");
        };
        assert_eq!(first.user().ontology_role, OntologyRole::Admin);
        assert_eq!(second.user().ontology_role, OntologyRole::Viewer);

        let reused = bus.handle(None, create("carol", "A@x")).await.err();
        assert!(matches!(domain_error(reused.as_ref()), Some(DomainError::IdentityExists(_))));

        let factory = Arc::clone(bus.factory());
        bus.shutdown().await?;
        let seen = recorder.seen.lock().map_err(|_| anyhow::anyhow!("poisoned"))?.clone();
        assert_eq!(seen, vec!["AccountCreated", "AccountCreated"]);

        let mut uow = factory.begin(None)?;
        assert_eq!(uow.accounts().get_all()?.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn splitting_a_team_keeps_admins_but_drops_inherited_reads() -> Result<()> {
        let db = TempDb::new();
        let handlers: Vec<Arc<dyn EventHandler>> = vec![Arc::new(LoggingEventHandler)];
        let bus = MessageBus::start(db.factory()?, handlers);
        let CommandOutput::Account(user) = bus.handle(None, create("una", "u@x")).await? else {
            anyhow::bail!("expected an account");
        };
        let user = Some(user.id());

        let root = team_of(
            &bus.handle(
                user,
                Command::Organisation(OrganisationCommand::CreateTeam {
                    name: "Root".to_string(),
                    fullname: None,
                    parent_id: None,
                    release: None,
                }),
            )
            .await?,
        )?;
        let child = team_of(
            &bus.handle(
                user,
                Command::Organisation(OrganisationCommand::CreateTeam {
                    name: "Child".to_string(),
                    fullname: None,
                    parent_id: Some(root),
                    release: None,
                }),
            )
            .await?,
        )?;

        let output = bus
            .handle(user, Command::Organisation(OrganisationCommand::SplitTeam { team_id: child }))
            .await?;
        let CommandOutput::Organisation { root_id, teams } = output else {
            anyhow::bail!("expected an organisation");
        };
        assert_eq!(root_id, child);
        assert_eq!(teams.len(), 1);
        assert_eq!(teams[0].parent_id, None);

        let factory = Arc::clone(bus.factory());
        bus.shutdown().await?;

        let mut uow = factory.begin_unredacted(user)?;
        let detached = uow.organisations().get_containing(child)?;
        let Some(una) = user else {
            anyhow::bail!("expected a user");
        };
        let access = detached.effective_access(una);
        let granted = access.get(&child).map(|set| set.iter().copied().collect::<Vec<_>>());
        assert_eq!(granted, Some(vec![Access::Admin]));
        let original = uow.organisations().get_containing(root)?;
        assert!(original.team(child).is_none());
        drop(uow);

        let mut uow = factory.begin(user)?;
        assert!(uow.access().teams().read.contains(&root));
        assert!(!uow.access().teams().read.contains(&child));
        let hidden = uow.organisations().get_containing(child).err();
        assert!(matches!(domain_error(hidden.as_ref()), Some(DomainError::NoResultFound(_))));
        Ok(())
    }
}
