use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use breedgraph_api::{
    BreedGraphConfig, CommandOutput, EventHandler, LoggingEventHandler, MessageBus,
    UnitOfWorkFactory,
};
use breedgraph_core::ontology::{LifecyclePhase, OntologyEntryLabel};
use breedgraph_core::{Command as DomainCommand, UserId};
use breedgraph_store_sqlite::{EntryQuery, SqliteStore};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "bg.v1";

#[derive(Debug, Parser)]
#[command(name = "bg")]
#[command(about = "BreedGraph ontology and organisation engine")]
struct Cli {
    /// YAML settings file; flags and environment override it.
    #[arg(long, env = "BREEDGRAPH_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, env = "BREEDGRAPH_DB")]
    db: Option<PathBuf>,

    #[arg(long, env = "BREEDGRAPH_EVENT_WORKERS")]
    event_workers: Option<usize>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    /// Run one command document through the message bus.
    Run(RunArgs),
    Ontology {
        #[command(subcommand)]
        command: OntologyQuery,
    },
    Organisation {
        #[command(subcommand)]
        command: OrganisationQuery,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    Backup(DbBackupArgs),
    Restore(DbRestoreArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DbBackupArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
struct DbRestoreArgs {
    #[arg(long = "in")]
    input: PathBuf,
}

#[derive(Debug, Args)]
struct RunArgs {
    #[command(flatten)]
    caller: CallerArgs,
    /// Command JSON; `-` reads it from stdin.
    command: String,
}

#[derive(Debug, Args)]
struct CallerArgs {
    #[arg(long)]
    user: Option<i64>,
}

impl CallerArgs {
    fn user(&self) -> Option<UserId> {
        self.user.map(UserId)
    }
}

#[derive(Debug, Subcommand)]
enum OntologyQuery {
    Entries(EntriesArgs),
    Commits(CommitsArgs),
}

#[derive(Debug, Args)]
struct EntriesArgs {
    #[command(flatten)]
    caller: CallerArgs,
    #[arg(long = "label")]
    labels: Vec<String>,
    #[arg(long = "name")]
    names: Vec<String>,
    /// Include drafted, deprecated and removed entries.
    #[arg(long, default_value_t = false)]
    all_phases: bool,
}

#[derive(Debug, Args)]
struct CommitsArgs {
    #[command(flatten)]
    caller: CallerArgs,
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Debug, Subcommand)]
enum OrganisationQuery {
    List(CallerArgs),
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn load_config(cli: &Cli) -> Result<BreedGraphConfig> {
    let mut config = match &cli.config {
        Some(path) => BreedGraphConfig::from_yaml_file(path)?,
        None => BreedGraphConfig::default(),
    };
    if let Some(db) = &cli.db {
        config.db_path.clone_from(db);
    }
    if let Some(workers) = cli.event_workers {
        config.event_workers = workers;
    }
    config.validate()?;
    Ok(config)
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    match cli.command {
        Command::Db { command } => {
            let mut store =
                SqliteStore::open_with_timeout(&config.db_path, config.busy_timeout_ms)?;
            run_db(command, &mut store)
        }
        Command::Run(args) => run_command(config, &args),
        Command::Ontology { command } => run_ontology_query(config, &command),
        Command::Organisation { command } => run_organisation_query(config, &command),
    }
}

fn run_db(command: DbCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = store.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty(),
                "empty": store.db_is_empty()?
            }))
        }
        DbCommand::Migrate(args) => run_db_migrate(&args, store),
        DbCommand::Backup(args) => {
            store.migrate()?;
            store.backup_database(&args.out)?;
            emit_json(serde_json::json!({
                "backup_path": args.out,
                "status": "ok"
            }))
        }
        DbCommand::Restore(args) => {
            store.restore_database(&args.input)?;
            let status = store.schema_status()?;
            emit_json(serde_json::json!({
                "restored_from": args.input,
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions
            }))
        }
        DbCommand::IntegrityCheck => {
            let report = store.integrity_check()?;
            emit_json(serde_json::to_value(&report).context("failed to serialize integrity report")?)
        }
    }
}

fn run_db_migrate(args: &DbMigrateArgs, store: &mut SqliteStore) -> Result<()> {
    let before = store.schema_status()?;
    if args.dry_run {
        return emit_json(serde_json::json!({
            "dry_run": true,
            "current_version": before.current_version,
            "target_version": before.target_version,
            "would_apply_versions": before.pending_versions
        }));
    }

    store.migrate()?;
    let after = store.schema_status()?;
    emit_json(serde_json::json!({
        "dry_run": false,
        "before_version": before.current_version,
        "applied_versions": before.pending_versions,
        "after_version": after.current_version,
        "target_version": after.target_version,
        "up_to_date": after.pending_versions.is_empty()
    }))
}

fn read_command(source: &str) -> Result<DomainCommand> {
    let body = if source == "-" {
        let mut body = String::new();
        std::io::stdin().read_to_string(&mut body).context("failed to read command from stdin")?;
        body
    } else {
        source.to_string()
    };
    serde_json::from_str(&body).context("invalid command document")
}

fn run_command(config: BreedGraphConfig, args: &RunArgs) -> Result<()> {
    let command = read_command(&args.command)?;
    let factory = Arc::new(UnitOfWorkFactory::new(Arc::new(config))?);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    let output = runtime.block_on(async {
        let handlers: Vec<Arc<dyn EventHandler>> = vec![Arc::new(LoggingEventHandler)];
        let bus = MessageBus::start(factory, handlers);
        let output = bus.handle(args.caller.user(), command).await;
        bus.shutdown().await?;
        output
    })?;
    emit_json(serde_json::to_value(&output).context("failed to serialize command output")?)
}

fn run_ontology_query(config: BreedGraphConfig, query: &OntologyQuery) -> Result<()> {
    let factory = UnitOfWorkFactory::new(Arc::new(config))?;
    match query {
        OntologyQuery::Entries(args) => {
            let mut uow = factory.begin(args.caller.user())?;
            let mut entry_query = EntryQuery {
                labels: parse_labels(&args.labels)?,
                names: args.names.clone(),
                ..EntryQuery::default()
            };
            if args.all_phases {
                entry_query.phases = LifecyclePhase::ALL.to_vec();
            }
            let entries = uow.ontology().get_entry_outputs(&entry_query)?;
            emit_json(serde_json::json!({ "entries": entries }))
        }
        OntologyQuery::Commits(args) => {
            let mut uow = factory.begin(args.caller.user())?;
            let service = uow.ontology();
            let current = service.current_version()?;
            let commits = service.get_commit_history(args.limit)?;
            emit_json(serde_json::json!({
                "current_version": current.to_string(),
                "commits": commits
            }))
        }
    }
}

fn run_organisation_query(config: BreedGraphConfig, query: &OrganisationQuery) -> Result<()> {
    let factory = UnitOfWorkFactory::new(Arc::new(config))?;
    match query {
        OrganisationQuery::List(caller) => {
            let mut uow = factory.begin(caller.user())?;
            let organisations: Vec<CommandOutput> = uow
                .organisations()
                .get_all()?
                .iter()
                .map(CommandOutput::organisation)
                .collect();
            emit_json(serde_json::json!({ "organisations": organisations }))
        }
    }
}

fn parse_labels(labels: &[String]) -> Result<Vec<OntologyEntryLabel>> {
    labels
        .iter()
        .map(|label| {
            OntologyEntryLabel::parse(label).ok_or_else(|| anyhow!("unknown entry label {label}"))
        })
        .collect()
}
