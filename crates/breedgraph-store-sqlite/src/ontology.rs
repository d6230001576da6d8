//! Ontology entries, relationships, lifecycles and version commits.
//!
//! Lifecycle phases are stored as the packed version at which each phase was
//! entered; "phase at version V" is evaluated in Rust so that stored rows stay
//! free of derived state.

use std::cell::Cell;
use std::collections::{BTreeMap, BTreeSet};

use anyhow::{anyhow, Context, Result};
use breedgraph_core::ontology::{
    EntryFields, EntryKind, Lifecycle, LifecyclePhase, OntologyEntry, OntologyEntryInput,
    OntologyEntryLabel, OntologyEntryOutput, OntologyRelationship, OntologyRelationshipInput,
    OntologyRelationshipLabel, PhaseAudit, PhaseVersions,
};
use breedgraph_core::{
    DiGraph, DomainError, EntryId, RelationshipId, UserId, Version, VersionChange, VersionCommit,
    WriteStamp,
};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, Row};
use time::OffsetDateTime;

use crate::{next_id, parse_rfc3339, rfc3339, unique_violation, Counter};

/// Phases listed when a query names none.
pub const DEFAULT_PHASES: [LifecyclePhase; 3] =
    [LifecyclePhase::Draft, LifecyclePhase::Active, LifecyclePhase::Deprecated];

/// Entry selection; empty lists do not filter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryQuery {
    /// Version at which phases are evaluated; defaults to the current version.
    pub version: Option<Version>,
    pub phases: Vec<LifecyclePhase>,
    pub entry_ids: Vec<EntryId>,
    pub labels: Vec<OntologyEntryLabel>,
    /// Matched case-insensitively against name, synonyms and abbreviation.
    pub names: Vec<String>,
}

impl EntryQuery {
    #[must_use]
    pub fn ids(entry_ids: &[EntryId]) -> Self {
        Self { entry_ids: entry_ids.to_vec(), ..Self::default() }
    }

    #[must_use]
    pub fn label(label: OntologyEntryLabel) -> Self {
        Self { labels: vec![label], ..Self::default() }
    }

    #[must_use]
    pub fn in_any_phase(mut self) -> Self {
        self.phases = LifecyclePhase::ALL.to_vec();
        self
    }
}

/// Relationship selection; empty lists do not filter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelationshipQuery {
    pub version: Option<Version>,
    pub phases: Vec<LifecyclePhase>,
    pub relationship_ids: Vec<RelationshipId>,
    pub source_ids: Vec<EntryId>,
    pub target_ids: Vec<EntryId>,
    /// Relationships with either endpoint in this list.
    pub endpoint_ids: Vec<EntryId>,
    pub labels: Vec<OntologyRelationshipLabel>,
}

impl RelationshipQuery {
    #[must_use]
    pub fn from_source(source: EntryId, label: OntologyRelationshipLabel) -> Self {
        Self { source_ids: vec![source], labels: vec![label], ..Self::default() }
    }

    #[must_use]
    pub fn in_any_phase(mut self) -> Self {
        self.phases = LifecyclePhase::ALL.to_vec();
        self
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum LifecycleKind {
    Entry,
    Relationship,
}

impl LifecycleKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Entry => "entry",
            Self::Relationship => "relationship",
        }
    }
}

/// Storage operations the ontology service runs inside its unit of work.
///
/// Write attribution for entries and relationships travels on their lifecycles,
/// so entity writes themselves take no user.
pub trait OntologyPersistence {
    /// Highest committed version, or 0.0.0 before the first commit.
    ///
    /// # Errors
    /// Returns an error when the commit table cannot be read.
    fn get_current_version(&self) -> Result<Version>;

    /// # Errors
    /// Returns [`DomainError::IdentityExists`] when the name or abbreviation is
    /// already used by an entry of the same label.
    fn create_entry(&self, input: OntologyEntryInput) -> Result<OntologyEntry>;

    /// # Errors
    /// Returns [`DomainError::NoResultFound`] for unknown entries and
    /// [`DomainError::IdentityExists`] for clashing names.
    fn update_entry(&self, entry: &OntologyEntry) -> Result<()>;

    /// # Errors
    /// Returns [`DomainError::RelationshipExists`] when the (source, target, label)
    /// triple is already stored.
    fn create_relationship(&self, input: OntologyRelationshipInput)
        -> Result<OntologyRelationship>;

    /// Persist the rank of a stored relationship.
    ///
    /// # Errors
    /// Returns [`DomainError::NoResultFound`] for unknown relationships.
    fn update_relationship(&self, relationship: &OntologyRelationship) -> Result<()>;

    /// # Errors
    /// Returns an error when queries fail or stored rows are malformed.
    fn get_entries(&self, query: &EntryQuery) -> Result<Vec<OntologyEntry>>;

    /// Entries with their phase and related ids, per the attribute table.
    ///
    /// # Errors
    /// Returns an error when queries fail or stored rows are malformed.
    fn get_entry_outputs(&self, query: &EntryQuery) -> Result<Vec<OntologyEntryOutput>>;

    /// # Errors
    /// Returns an error when queries fail or stored rows are malformed.
    fn get_relationships(&self, query: &RelationshipQuery) -> Result<Vec<OntologyRelationship>>;

    /// # Errors
    /// Returns an error when the query fails.
    fn entries_exist(&self, ids: &[EntryId]) -> Result<bool>;

    /// # Errors
    /// Returns an error when the query fails.
    fn entries_exist_for_label(&self, ids: &[EntryId], label: OntologyEntryLabel) -> Result<bool>;

    /// # Errors
    /// Returns an error when the query fails.
    fn entry_labels(&self, ids: &[EntryId]) -> Result<BTreeMap<EntryId, OntologyEntryLabel>>;

    /// # Errors
    /// Returns an error when the query fails.
    fn name_in_use(
        &self,
        label: OntologyEntryLabel,
        name: &str,
        exclude: Option<EntryId>,
    ) -> Result<bool>;

    /// # Errors
    /// Returns an error when the query fails.
    fn abbreviation_in_use(
        &self,
        label: OntologyEntryLabel,
        abbreviation: &str,
        exclude: Option<EntryId>,
    ) -> Result<bool>;

    /// Whether `target` is reachable from `source` over non-removed edges of `label`.
    ///
    /// # Errors
    /// Returns an error when the edges cannot be loaded.
    fn has_path_between_entries(
        &self,
        source: EntryId,
        target: EntryId,
        label: OntologyRelationshipLabel,
    ) -> Result<bool>;

    /// # Errors
    /// Returns an error when lifecycle rows cannot be read.
    fn get_entry_lifecycles(&self, ids: &[EntryId]) -> Result<BTreeMap<EntryId, Lifecycle>>;

    /// # Errors
    /// Returns an error when lifecycle rows cannot be read.
    fn get_relationship_lifecycles(
        &self,
        ids: &[RelationshipId],
    ) -> Result<BTreeMap<RelationshipId, Lifecycle>>;

    /// Upsert changed lifecycles and append their new write and audit rows.
    ///
    /// # Errors
    /// Returns [`DomainError::IllegalOperation`] without a user.
    fn save_entry_lifecycles(
        &self,
        lifecycles: &mut BTreeMap<EntryId, Lifecycle>,
        user: Option<UserId>,
    ) -> Result<()>;

    /// # Errors
    /// Returns [`DomainError::IllegalOperation`] without a user.
    fn save_relationship_lifecycles(
        &self,
        lifecycles: &mut BTreeMap<RelationshipId, Lifecycle>,
        user: Option<UserId>,
    ) -> Result<()>;

    /// Activate every current draft at `version`; returns how many advanced.
    ///
    /// # Errors
    /// Returns an error when the bulk update fails.
    fn activate_drafts(&self, version: Version, user: UserId) -> Result<usize>;

    /// Remove everything currently deprecated at `version`.
    ///
    /// # Errors
    /// Returns an error when the bulk update fails.
    fn remove_deprecated(&self, version: Version, user: UserId) -> Result<usize>;

    /// Bump the current version by `change` and store the commit.
    ///
    /// # Errors
    /// Returns [`DomainError::IllegalOperation`] when the version overflows.
    fn commit_version(
        &self,
        user: UserId,
        change: VersionChange,
        comment: Option<String>,
        licence: Option<i64>,
        copyright: Option<i64>,
    ) -> Result<VersionCommit>;

    /// The latest `limit` commits (all when `None`), oldest first.
    ///
    /// # Errors
    /// Returns an error when commits cannot be read.
    fn get_commit_history(&self, limit: Option<usize>) -> Result<Vec<VersionCommit>>;

    /// Commits between `min` and `max` inclusive, oldest first.
    ///
    /// # Errors
    /// Returns an error when commits cannot be read.
    fn get_commits(&self, min: Option<Version>, max: Option<Version>) -> Result<Vec<VersionCommit>>;
}

pub struct SqliteOntologyPersistence<'a> {
    conn: &'a Connection,
    current_version: Cell<Option<Version>>,
}

const ENTRY_COLUMNS: &str = "id, label, name, abbreviation, description, synonyms_json, \
                             authors_json, references_json, kind_json";

const RELATIONSHIP_SELECT: &str = "SELECT r.id, r.source_id, s.label, r.target_id, t.label, \
     r.label, r.rank FROM ontology_relationships r \
     JOIN ontology_entries s ON s.id = r.source_id \
     JOIN ontology_entries t ON t.id = r.target_id";

const COMMIT_COLUMNS: &str = "version, comment, licence, copyright, time, user_id";

impl<'a> SqliteOntologyPersistence<'a> {
    #[must_use]
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn, current_version: Cell::new(None) }
    }

    fn load_lifecycles(
        &self,
        kind: LifecycleKind,
        ids: Option<&[i64]>,
    ) -> Result<BTreeMap<i64, Lifecycle>> {
        let mut filter = Filter::default();
        filter.equals("kind", Value::from(kind.as_str().to_string()));
        if let Some(ids) = ids {
            if ids.is_empty() {
                return Ok(BTreeMap::new());
            }
            filter.any_of("entity_id", ids.iter().map(|id| Value::from(*id)));
        }
        let where_clause = filter.sql();

        let mut stmt = self.conn.prepare(&format!(
            "SELECT entity_id, drafted, activated, deprecated, removed FROM lifecycles{where_clause}"
        ))?;
        let rows = stmt
            .query_map(params_from_iter(filter.values.iter()), |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    [
                        row.get::<_, Option<i64>>(1)?,
                        row.get::<_, Option<i64>>(2)?,
                        row.get::<_, Option<i64>>(3)?,
                        row.get::<_, Option<i64>>(4)?,
                    ],
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .with_context(|| format!("failed to load {} lifecycles", kind.as_str()))?;

        let mut versions = BTreeMap::new();
        for (id, [drafted, activated, deprecated, removed]) in rows {
            versions.insert(
                id,
                PhaseVersions {
                    drafted: stored_version(drafted)?,
                    activated: stored_version(activated)?,
                    deprecated: stored_version(deprecated)?,
                    removed: stored_version(removed)?,
                },
            );
        }

        let mut writes: BTreeMap<i64, Vec<WriteStamp>> = BTreeMap::new();
        let mut stmt = self.conn.prepare(&format!(
            "SELECT entity_id, user_id, time FROM lifecycle_writes{where_clause} ORDER BY id"
        ))?;
        let rows = stmt
            .query_map(params_from_iter(filter.values.iter()), |row| {
                Ok((row.get::<_, i64>(0)?, UserId(row.get(1)?), row.get::<_, String>(2)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("failed to load lifecycle writes")?;
        for (id, user, time) in rows {
            writes.entry(id).or_default().push(WriteStamp { user, time: parse_rfc3339(&time)? });
        }

        let mut audit: BTreeMap<i64, Vec<PhaseAudit>> = BTreeMap::new();
        let mut stmt = self.conn.prepare(&format!(
            "SELECT entity_id, user_id, phase, version, time FROM lifecycle_audit{where_clause} \
             ORDER BY id"
        ))?;
        let rows = stmt
            .query_map(params_from_iter(filter.values.iter()), |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    UserId(row.get(1)?),
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("failed to load lifecycle audit")?;
        for (id, user, phase, version, time) in rows {
            let phase =
                LifecyclePhase::parse(&phase).ok_or_else(|| anyhow!("invalid phase {phase}"))?;
            audit.entry(id).or_default().push(PhaseAudit {
                user,
                phase,
                version: Version::from_stored(version)?,
                time: parse_rfc3339(&time)?,
            });
        }

        Ok(versions
            .into_iter()
            .map(|(id, versions)| {
                let lifecycle = Lifecycle::load(
                    versions,
                    writes.remove(&id).unwrap_or_default(),
                    audit.remove(&id).unwrap_or_default(),
                );
                (id, lifecycle)
            })
            .collect())
    }

    fn save_lifecycles<'l>(
        &self,
        kind: LifecycleKind,
        lifecycles: impl Iterator<Item = (i64, &'l mut Lifecycle)>,
        user: Option<UserId>,
    ) -> Result<()> {
        let user = user.ok_or_else(|| {
            DomainError::IllegalOperation(format!(
                "{} lifecycles can only be saved for a known user",
                kind.as_str()
            ))
        })?;
        for (id, lifecycle) in lifecycles {
            if !lifecycle.is_changed() {
                continue;
            }
            let versions = lifecycle.versions;
            if lifecycle.versions_changed() {
                self.conn
                    .execute(
                        "INSERT INTO lifecycles(kind, entity_id, drafted, activated, deprecated, removed)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                         ON CONFLICT(kind, entity_id) DO UPDATE SET
                           drafted = excluded.drafted,
                           activated = excluded.activated,
                           deprecated = excluded.deprecated,
                           removed = excluded.removed",
                        params![
                            kind.as_str(),
                            id,
                            versions.drafted.map(Version::to_stored).transpose()?,
                            versions.activated.map(Version::to_stored).transpose()?,
                            versions.deprecated.map(Version::to_stored).transpose()?,
                            versions.removed.map(Version::to_stored).transpose()?,
                        ],
                    )
                    .with_context(|| format!("failed to save lifecycle of {} {id}", kind.as_str()))?;
                if lifecycle.writes.added().is_empty() {
                    lifecycle.record_write(user);
                }
            }
            for write in lifecycle.writes.added() {
                self.insert_write(kind, id, write)?;
            }
            for audit in lifecycle.audit.added() {
                self.insert_audit(kind, id, audit)?;
            }
            lifecycle.reset_tracking();
        }
        Ok(())
    }

    fn insert_write(&self, kind: LifecycleKind, id: i64, write: WriteStamp) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO lifecycle_writes(kind, entity_id, user_id, time) VALUES (?1, ?2, ?3, ?4)",
                params![kind.as_str(), id, write.user.0, rfc3339(write.time)?],
            )
            .with_context(|| format!("failed to record write on {} {id}", kind.as_str()))?;
        Ok(())
    }

    fn insert_audit(&self, kind: LifecycleKind, id: i64, audit: PhaseAudit) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO lifecycle_audit(kind, entity_id, user_id, phase, version, time)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    kind.as_str(),
                    id,
                    audit.user.0,
                    audit.phase.as_str(),
                    audit.version.to_stored()?,
                    rfc3339(audit.time)?,
                ],
            )
            .with_context(|| format!("failed to audit {} {id}", kind.as_str()))?;
        Ok(())
    }

    /// Run a bulk phase advance and audit every advanced entity.
    fn advance_all(
        &self,
        sql: &str,
        phase: LifecyclePhase,
        version: Version,
        user: UserId,
    ) -> Result<usize> {
        let stored = version.to_stored()?;
        let mut stmt = self.conn.prepare(sql)?;
        let advanced = stmt
            .query_map(params![stored], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .with_context(|| format!("failed to advance lifecycles to {}", phase.as_str()))?;
        let time = OffsetDateTime::now_utc();
        for (kind, id) in &advanced {
            let kind = if kind == LifecycleKind::Entry.as_str() {
                LifecycleKind::Entry
            } else {
                LifecycleKind::Relationship
            };
            self.insert_audit(kind, *id, PhaseAudit { user, phase, version, time })?;
            self.insert_write(kind, *id, WriteStamp { user, time })?;
        }
        Ok(advanced.len())
    }

    fn in_use(
        &self,
        column: &str,
        label: OntologyEntryLabel,
        value: &str,
        exclude: Option<EntryId>,
    ) -> Result<bool> {
        let exists: i64 = self
            .conn
            .query_row(
                &format!(
                    "SELECT EXISTS(SELECT 1 FROM ontology_entries
                     WHERE label = ?1 AND {column} = ?2 AND id <> ?3)"
                ),
                params![label.as_str(), value.trim().to_lowercase(), exclude.map_or(0, |id| id.0)],
                |row| row.get(0),
            )
            .with_context(|| format!("failed to check {column} of {label}"))?;
        Ok(exists == 1)
    }

    fn count_existing(&self, ids: &[EntryId], label: Option<OntologyEntryLabel>) -> Result<bool> {
        let unique: BTreeSet<i64> = ids.iter().map(|id| id.0).collect();
        if unique.is_empty() {
            return Ok(true);
        }
        let mut filter = Filter::default();
        filter.any_of("id", unique.iter().map(|id| Value::from(*id)));
        if let Some(label) = label {
            filter.equals("label", Value::from(label.as_str().to_string()));
        }
        let count: i64 = self
            .conn
            .query_row(
                &format!("SELECT COUNT(*) FROM ontology_entries{}", filter.sql()),
                params_from_iter(filter.values.iter()),
                |row| row.get(0),
            )
            .context("failed to check entry existence")?;
        Ok(usize::try_from(count).unwrap_or(0) == unique.len())
    }

    fn commits_where(&self, clause: &str, values: &[Value]) -> Result<Vec<VersionCommit>> {
        let mut stmt =
            self.conn.prepare(&format!("SELECT {COMMIT_COLUMNS} FROM ontology_commits {clause}"))?;
        let rows = stmt
            .query_map(params_from_iter(values.iter()), |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, Option<i64>>(2)?,
                    row.get::<_, Option<i64>>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, i64>(5)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("failed to load ontology commits")?;
        rows.into_iter()
            .map(|(version, comment, licence, copyright, time, user)| {
                Ok(VersionCommit {
                    version: Version::from_stored(version)?,
                    comment,
                    licence,
                    copyright,
                    time: parse_rfc3339(&time)?,
                    user: UserId(user),
                })
            })
            .collect()
    }

    fn query_version(&self, version: Option<Version>) -> Result<Version> {
        version.map_or_else(|| self.get_current_version(), Ok)
    }
}

impl OntologyPersistence for SqliteOntologyPersistence<'_> {
    fn get_current_version(&self) -> Result<Version> {
        if let Some(version) = self.current_version.get() {
            return Ok(version);
        }
        let stored: Option<i64> = self
            .conn
            .query_row("SELECT MAX(version) FROM ontology_commits", [], |row| row.get(0))
            .context("failed to read current ontology version")?;
        let version = stored.map(Version::from_stored).transpose()?.unwrap_or(Version::ZERO);
        self.current_version.set(Some(version));
        Ok(version)
    }

    fn create_entry(&self, input: OntologyEntryInput) -> Result<OntologyEntry> {
        let id = EntryId(next_id(self.conn, Counter::OntologyEntry)?);
        let entry = input.into_stored(id);
        let fields = &entry.fields;
        self.conn
            .execute(
                &format!(
                    "INSERT INTO ontology_entries({ENTRY_COLUMNS}, name_lower, abbreviation_lower)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
                ),
                params![
                    id.0,
                    entry.label().as_str(),
                    fields.name.trim(),
                    fields.abbreviation.as_deref().map(str::trim),
                    fields.description,
                    serde_json::to_string(&fields.synonyms)?,
                    serde_json::to_string(&fields.authors)?,
                    serde_json::to_string(&fields.references)?,
                    serde_json::to_string(&entry.kind)?,
                    fields.name.trim().to_lowercase(),
                    fields.abbreviation.as_deref().map(|a| a.trim().to_lowercase()),
                ],
            )
            .map_err(|err| {
                unique_violation(err, format!("{} name or abbreviation in use", entry.label()))
            })?;
        Ok(entry)
    }

    fn update_entry(&self, entry: &OntologyEntry) -> Result<()> {
        let fields = &entry.fields;
        let updated = self
            .conn
            .execute(
                "UPDATE ontology_entries SET
                    name = ?2, name_lower = ?3, abbreviation = ?4, abbreviation_lower = ?5,
                    description = ?6, synonyms_json = ?7, authors_json = ?8,
                    references_json = ?9, kind_json = ?10
                 WHERE id = ?1 AND label = ?11",
                params![
                    entry.id.0,
                    fields.name.trim(),
                    fields.name.trim().to_lowercase(),
                    fields.abbreviation.as_deref().map(str::trim),
                    fields.abbreviation.as_deref().map(|a| a.trim().to_lowercase()),
                    fields.description,
                    serde_json::to_string(&fields.synonyms)?,
                    serde_json::to_string(&fields.authors)?,
                    serde_json::to_string(&fields.references)?,
                    serde_json::to_string(&entry.kind)?,
                    entry.label().as_str(),
                ],
            )
            .map_err(|err| {
                unique_violation(err, format!("{} name or abbreviation in use", entry.label()))
            })?;
        if updated == 0 {
            return Err(DomainError::NoResultFound(format!(
                "{} entry {}",
                entry.label(),
                entry.id
            ))
            .into());
        }
        Ok(())
    }

    fn create_relationship(
        &self,
        input: OntologyRelationshipInput,
    ) -> Result<OntologyRelationship> {
        let exists: i64 = self
            .conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM ontology_relationships
                 WHERE source_id = ?1 AND target_id = ?2 AND label = ?3)",
                params![input.source_id.0, input.target_id.0, input.label.as_str()],
                |row| row.get(0),
            )
            .context("failed to check relationship triple")?;
        if exists == 1 {
            return Err(DomainError::RelationshipExists(format!(
                "{} from {} to {}",
                input.label, input.source_id, input.target_id
            ))
            .into());
        }
        let id = RelationshipId(next_id(self.conn, Counter::OntologyRelationship)?);
        self.conn
            .execute(
                "INSERT INTO ontology_relationships(id, source_id, target_id, label, rank)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    id.0,
                    input.source_id.0,
                    input.target_id.0,
                    input.label.as_str(),
                    input.rank,
                ],
            )
            .with_context(|| format!("failed to store {} relationship", input.label))?;
        Ok(input.into_stored(id))
    }

    fn update_relationship(&self, relationship: &OntologyRelationship) -> Result<()> {
        let updated = self
            .conn
            .execute(
                "UPDATE ontology_relationships SET rank = ?2 WHERE id = ?1",
                params![relationship.id.0, relationship.rank],
            )
            .with_context(|| format!("failed to update relationship {}", relationship.id))?;
        if updated == 0 {
            return Err(
                DomainError::NoResultFound(format!("relationship {}", relationship.id)).into()
            );
        }
        Ok(())
    }

    fn get_entries(&self, query: &EntryQuery) -> Result<Vec<OntologyEntry>> {
        Ok(self.phased_entries(query)?.into_iter().map(|(entry, _)| entry).collect())
    }

    fn get_entry_outputs(&self, query: &EntryQuery) -> Result<Vec<OntologyEntryOutput>> {
        let entries = self.phased_entries(query)?;
        if entries.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<EntryId> = entries.iter().map(|(entry, _)| entry.id).collect();
        let relationships = self.get_relationships(&RelationshipQuery {
            version: query.version,
            endpoint_ids: ids,
            ..RelationshipQuery::default()
        })?;
        let counterparts: Vec<EntryId> = relationships
            .iter()
            .flat_map(|relationship| [relationship.source_id, relationship.target_id])
            .collect();
        let labels = self.entry_labels(&counterparts)?;
        Ok(entries
            .into_iter()
            .map(|(entry, phase)| OntologyEntryOutput::build(entry, phase, &relationships, &labels))
            .collect())
    }

    fn get_relationships(&self, query: &RelationshipQuery) -> Result<Vec<OntologyRelationship>> {
        let mut filter = Filter::default();
        filter.any_of("r.id", query.relationship_ids.iter().map(|id| Value::from(id.0)));
        filter.any_of("r.source_id", query.source_ids.iter().map(|id| Value::from(id.0)));
        filter.any_of("r.target_id", query.target_ids.iter().map(|id| Value::from(id.0)));
        filter.any_of(
            "r.label",
            query.labels.iter().map(|label| Value::from(label.as_str().to_string())),
        );
        if !query.endpoint_ids.is_empty() {
            let values: Vec<Value> = query.endpoint_ids.iter().map(|id| Value::from(id.0)).collect();
            let sources = filter.bind(values.clone());
            let targets = filter.bind(values);
            filter.clauses.push(format!("(r.source_id IN ({sources}) OR r.target_id IN ({targets}))"));
        }

        let mut stmt =
            self.conn.prepare(&format!("{RELATIONSHIP_SELECT}{} ORDER BY r.id", filter.sql()))?;
        let rows = stmt
            .query_map(params_from_iter(filter.values.iter()), relationship_row)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("failed to load ontology relationships")?;
        let relationships =
            rows.into_iter().map(RelationshipRow::into_relationship).collect::<Result<Vec<_>>>()?;

        let version = self.query_version(query.version)?;
        let phases = effective_phases(&query.phases);
        let ids: Vec<i64> = relationships.iter().map(|relationship| relationship.id.0).collect();
        let lifecycles = self.load_lifecycles(LifecycleKind::Relationship, Some(&ids))?;
        Ok(relationships
            .into_iter()
            .filter(|relationship| {
                lifecycles
                    .get(&relationship.id.0)
                    .and_then(|lifecycle| lifecycle.phase_at(version))
                    .is_some_and(|phase| phases.contains(&phase))
            })
            .collect())
    }

    fn entries_exist(&self, ids: &[EntryId]) -> Result<bool> {
        self.count_existing(ids, None)
    }

    fn entries_exist_for_label(&self, ids: &[EntryId], label: OntologyEntryLabel) -> Result<bool> {
        self.count_existing(ids, Some(label))
    }

    fn entry_labels(&self, ids: &[EntryId]) -> Result<BTreeMap<EntryId, OntologyEntryLabel>> {
        let unique: BTreeSet<i64> = ids.iter().map(|id| id.0).collect();
        if unique.is_empty() {
            return Ok(BTreeMap::new());
        }
        let mut filter = Filter::default();
        filter.any_of("id", unique.into_iter().map(Value::from));
        let mut stmt =
            self.conn.prepare(&format!("SELECT id, label FROM ontology_entries{}", filter.sql()))?;
        let rows = stmt
            .query_map(params_from_iter(filter.values.iter()), |row| {
                Ok((EntryId(row.get(0)?), row.get::<_, String>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("failed to load entry labels")?;
        rows.into_iter()
            .map(|(id, label)| Ok((id, parse_entry_label(&label)?)))
            .collect()
    }

    fn name_in_use(
        &self,
        label: OntologyEntryLabel,
        name: &str,
        exclude: Option<EntryId>,
    ) -> Result<bool> {
        self.in_use("name_lower", label, name, exclude)
    }

    fn abbreviation_in_use(
        &self,
        label: OntologyEntryLabel,
        abbreviation: &str,
        exclude: Option<EntryId>,
    ) -> Result<bool> {
        self.in_use("abbreviation_lower", label, abbreviation, exclude)
    }

    fn has_path_between_entries(
        &self,
        source: EntryId,
        target: EntryId,
        label: OntologyRelationshipLabel,
    ) -> Result<bool> {
        let mut stmt = self.conn.prepare(
            "SELECT r.id, r.source_id, r.target_id FROM ontology_relationships r
             LEFT JOIN lifecycles l ON l.kind = 'relationship' AND l.entity_id = r.id
             WHERE r.label = ?1 AND (l.removed IS NULL)",
        )?;
        let edges = stmt
            .query_map(params![label.as_str()], |row| {
                Ok((EntryId(row.get(1)?), EntryId(row.get(2)?), RelationshipId(row.get(0)?)))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .with_context(|| format!("failed to load {label} edges"))?;

        let mut nodes: BTreeSet<EntryId> =
            edges.iter().flat_map(|(from, to, _)| [*from, *to]).collect();
        nodes.insert(source);
        nodes.insert(target);
        let graph: DiGraph<EntryId, RelationshipId> = DiGraph::from_parts(nodes, edges)?;
        Ok(graph.has_path(source, target))
    }

    fn get_entry_lifecycles(&self, ids: &[EntryId]) -> Result<BTreeMap<EntryId, Lifecycle>> {
        let raw: Vec<i64> = ids.iter().map(|id| id.0).collect();
        Ok(self
            .load_lifecycles(LifecycleKind::Entry, Some(&raw))?
            .into_iter()
            .map(|(id, lifecycle)| (EntryId(id), lifecycle))
            .collect())
    }

    fn get_relationship_lifecycles(
        &self,
        ids: &[RelationshipId],
    ) -> Result<BTreeMap<RelationshipId, Lifecycle>> {
        let raw: Vec<i64> = ids.iter().map(|id| id.0).collect();
        Ok(self
            .load_lifecycles(LifecycleKind::Relationship, Some(&raw))?
            .into_iter()
            .map(|(id, lifecycle)| (RelationshipId(id), lifecycle))
            .collect())
    }

    fn save_entry_lifecycles(
        &self,
        lifecycles: &mut BTreeMap<EntryId, Lifecycle>,
        user: Option<UserId>,
    ) -> Result<()> {
        self.save_lifecycles(
            LifecycleKind::Entry,
            lifecycles.iter_mut().map(|(id, lifecycle)| (id.0, lifecycle)),
            user,
        )
    }

    fn save_relationship_lifecycles(
        &self,
        lifecycles: &mut BTreeMap<RelationshipId, Lifecycle>,
        user: Option<UserId>,
    ) -> Result<()> {
        self.save_lifecycles(
            LifecycleKind::Relationship,
            lifecycles.iter_mut().map(|(id, lifecycle)| (id.0, lifecycle)),
            user,
        )
    }

    fn activate_drafts(&self, version: Version, user: UserId) -> Result<usize> {
        self.advance_all(
            "UPDATE lifecycles SET activated = ?1
             WHERE drafted IS NOT NULL AND drafted <= ?1
               AND activated IS NULL AND deprecated IS NULL AND removed IS NULL
             RETURNING kind, entity_id",
            LifecyclePhase::Active,
            version,
            user,
        )
    }

    fn remove_deprecated(&self, version: Version, user: UserId) -> Result<usize> {
        self.advance_all(
            "UPDATE lifecycles SET removed = ?1
             WHERE deprecated IS NOT NULL AND deprecated <= ?1 AND removed IS NULL
             RETURNING kind, entity_id",
            LifecyclePhase::Removed,
            version,
            user,
        )
    }

    fn commit_version(
        &self,
        user: UserId,
        change: VersionChange,
        comment: Option<String>,
        licence: Option<i64>,
        copyright: Option<i64>,
    ) -> Result<VersionCommit> {
        let version = self.get_current_version()?.bump(change)?;
        let time = OffsetDateTime::now_utc();
        self.conn
            .execute(
                &format!(
                    "INSERT INTO ontology_commits({COMMIT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)"
                ),
                params![version.to_stored()?, comment, licence, copyright, rfc3339(time)?, user.0],
            )
            .map_err(|err| unique_violation(err, format!("ontology version {version}")))?;
        self.current_version.set(Some(version));
        Ok(VersionCommit { version, comment, licence, copyright, time, user })
    }

    fn get_commit_history(&self, limit: Option<usize>) -> Result<Vec<VersionCommit>> {
        let mut commits = match limit {
            Some(limit) => {
                let limit = i64::try_from(limit).unwrap_or(i64::MAX);
                self.commits_where("ORDER BY version DESC LIMIT ?1", &[Value::from(limit)])?
            }
            None => self.commits_where("ORDER BY version DESC", &[])?,
        };
        commits.reverse();
        Ok(commits)
    }

    fn get_commits(&self, min: Option<Version>, max: Option<Version>) -> Result<Vec<VersionCommit>> {
        let min = min.unwrap_or(Version::ZERO).to_stored()?;
        let max = max.map(Version::to_stored).transpose()?.unwrap_or(i64::MAX);
        self.commits_where(
            "WHERE version >= ?1 AND version <= ?2 ORDER BY version",
            &[Value::from(min), Value::from(max)],
        )
    }
}

impl SqliteOntologyPersistence<'_> {
    fn phased_entries(
        &self,
        query: &EntryQuery,
    ) -> Result<Vec<(OntologyEntry, Option<LifecyclePhase>)>> {
        let mut filter = Filter::default();
        filter.any_of("id", query.entry_ids.iter().map(|id| Value::from(id.0)));
        filter.any_of(
            "label",
            query.labels.iter().map(|label| Value::from(label.as_str().to_string())),
        );
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {ENTRY_COLUMNS} FROM ontology_entries{} ORDER BY id", filter.sql()))?;
        let rows = stmt
            .query_map(params_from_iter(filter.values.iter()), entry_row)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("failed to load ontology entries")?;

        let names: BTreeSet<String> =
            query.names.iter().map(|name| name.trim().to_lowercase()).collect();
        let mut entries = Vec::new();
        for row in rows {
            let entry = row.into_entry()?;
            if names.is_empty() || entry.names().iter().any(|name| names.contains(&name.to_lowercase()))
            {
                entries.push(entry);
            }
        }

        let version = self.query_version(query.version)?;
        let phases = effective_phases(&query.phases);
        let lifecycles = if query.entry_ids.is_empty() {
            self.load_lifecycles(LifecycleKind::Entry, None)?
        } else {
            let ids: Vec<i64> = entries.iter().map(|entry| entry.id.0).collect();
            self.load_lifecycles(LifecycleKind::Entry, Some(&ids))?
        };
        Ok(entries
            .into_iter()
            .filter_map(|entry| {
                let phase = lifecycles.get(&entry.id.0).and_then(|l| l.phase_at(version))?;
                phases.contains(&phase).then_some((entry, Some(phase)))
            })
            .collect())
    }
}

fn effective_phases(phases: &[LifecyclePhase]) -> BTreeSet<LifecyclePhase> {
    if phases.is_empty() {
        DEFAULT_PHASES.into_iter().collect()
    } else {
        phases.iter().copied().collect()
    }
}

fn stored_version(value: Option<i64>) -> Result<Option<Version>> {
    Ok(value.map(Version::from_stored).transpose()?)
}

fn parse_entry_label(value: &str) -> Result<OntologyEntryLabel> {
    OntologyEntryLabel::parse(value).ok_or_else(|| anyhow!("invalid entry label {value}"))
}

/// `WHERE` clause assembled from optional filters with numbered parameters.
#[derive(Default)]
struct Filter {
    clauses: Vec<String>,
    values: Vec<Value>,
}

impl Filter {
    fn bind(&mut self, values: Vec<Value>) -> String {
        let first = self.values.len() + 1;
        let list = crate::placeholders_from(first, values.len());
        self.values.extend(values);
        list
    }

    fn equals(&mut self, column: &str, value: Value) {
        let placeholder = self.bind(vec![value]);
        self.clauses.push(format!("{column} = {placeholder}"));
    }

    fn any_of(&mut self, column: &str, values: impl IntoIterator<Item = Value>) {
        let values: Vec<Value> = values.into_iter().collect();
        if values.is_empty() {
            return;
        }
        let list = self.bind(values);
        self.clauses.push(format!("{column} IN ({list})"));
    }

    fn sql(&self) -> String {
        if self.clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", self.clauses.join(" AND "))
        }
    }
}

struct EntryRow {
    id: i64,
    label: String,
    name: String,
    abbreviation: Option<String>,
    description: Option<String>,
    synonyms: String,
    authors: String,
    references: String,
    kind: String,
}

impl EntryRow {
    fn into_entry(self) -> Result<OntologyEntry> {
        let kind: EntryKind = serde_json::from_str(&self.kind)
            .with_context(|| format!("invalid kind of entry {}", self.id))?;
        let label = parse_entry_label(&self.label)?;
        if kind.label() != label {
            return Err(anyhow!("entry {} is stored as {label} but holds {}", self.id, kind.label()));
        }
        let fields = EntryFields {
            name: self.name,
            abbreviation: self.abbreviation,
            description: self.description,
            synonyms: serde_json::from_str(&self.synonyms)
                .with_context(|| format!("invalid synonyms of entry {}", self.id))?,
            authors: serde_json::from_str(&self.authors)
                .with_context(|| format!("invalid authors of entry {}", self.id))?,
            references: serde_json::from_str(&self.references)
                .with_context(|| format!("invalid references of entry {}", self.id))?,
        };
        Ok(OntologyEntry::load(EntryId(self.id), kind, fields)?)
    }
}

fn entry_row(row: &Row<'_>) -> rusqlite::Result<EntryRow> {
    Ok(EntryRow {
        id: row.get(0)?,
        label: row.get(1)?,
        name: row.get(2)?,
        abbreviation: row.get(3)?,
        description: row.get(4)?,
        synonyms: row.get(5)?,
        authors: row.get(6)?,
        references: row.get(7)?,
        kind: row.get(8)?,
    })
}

struct RelationshipRow {
    id: i64,
    source: (i64, String),
    target: (i64, String),
    label: String,
    rank: Option<u32>,
}

impl RelationshipRow {
    fn into_relationship(self) -> Result<OntologyRelationship> {
        let label = OntologyRelationshipLabel::parse(&self.label)
            .ok_or_else(|| anyhow!("invalid relationship label {}", self.label))?;
        Ok(OntologyRelationship::load(
            RelationshipId(self.id),
            (EntryId(self.source.0), parse_entry_label(&self.source.1)?),
            (EntryId(self.target.0), parse_entry_label(&self.target.1)?),
            label,
            self.rank,
        )?)
    }
}

fn relationship_row(row: &Row<'_>) -> rusqlite::Result<RelationshipRow> {
    Ok(RelationshipRow {
        id: row.get(0)?,
        source: (row.get(1)?, row.get(2)?),
        target: (row.get(3)?, row.get(4)?),
        label: row.get(5)?,
        rank: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use breedgraph_core::ontology::ScaleType;

    use super::*;
    use crate::test_support::memory_store;

    const ALICE: UserId = UserId(1);

    fn draft_entry(
        ontology: &SqliteOntologyPersistence<'_>,
        input: OntologyEntryInput,
    ) -> Result<OntologyEntry> {
        let entry = ontology.create_entry(input)?;
        let version = ontology.get_current_version()?;
        let mut lifecycles = BTreeMap::from([(entry.id, Lifecycle::drafted(version, ALICE))]);
        ontology.save_entry_lifecycles(&mut lifecycles, Some(ALICE))?;
        Ok(entry)
    }

    fn parent_of(
        ontology: &SqliteOntologyPersistence<'_>,
        source: &OntologyEntry,
        target: &OntologyEntry,
    ) -> Result<OntologyRelationship> {
        let input = OntologyRelationshipInput::build(
            (source.id, source.label()),
            (target.id, target.label()),
            OntologyRelationshipLabel::ParentOf,
            None,
        )?;
        let relationship = ontology.create_relationship(input)?;
        let mut lifecycles = BTreeMap::from([(
            relationship.id,
            Lifecycle::drafted(ontology.get_current_version()?, ALICE),
        )]);
        ontology.save_relationship_lifecycles(&mut lifecycles, Some(ALICE))?;
        Ok(relationship)
    }

    #[test]
    fn entries_round_trip_with_kind_specific_fields() -> Result<()> {
        let store = memory_store()?;
        let ontology = SqliteOntologyPersistence::new(store.conn());
        let scale = draft_entry(
            &ontology,
            OntologyEntryInput::scale("Score", ScaleType::Ordinal)?
                .with_abbreviation("SC")
                .with_synonyms(&["Rating"]),
        )?;
        assert_eq!(scale.id, EntryId(1));

        let loaded = ontology.get_entries(&EntryQuery::ids(&[scale.id]))?;
        assert_eq!(loaded, vec![scale.clone()]);
        let by_synonym = ontology.get_entries(&EntryQuery {
            names: vec!["rating".to_string()],
            ..EntryQuery::default()
        })?;
        assert_eq!(by_synonym.len(), 1);
        Ok(())
    }

    #[test]
    fn names_and_abbreviations_are_unique_per_label_case_insensitively() -> Result<()> {
        let store = memory_store()?;
        let ontology = SqliteOntologyPersistence::new(store.conn());
        let height = draft_entry(&ontology, OntologyEntryInput::trait_("Height")?.with_abbreviation("HT"))?;

        assert!(ontology.name_in_use(OntologyEntryLabel::Trait, "HEIGHT", None)?);
        assert!(!ontology.name_in_use(OntologyEntryLabel::Trait, "height", Some(height.id))?);
        assert!(!ontology.name_in_use(OntologyEntryLabel::Subject, "height", None)?);
        assert!(ontology.abbreviation_in_use(OntologyEntryLabel::Trait, "ht", None)?);

        let err = ontology
            .create_entry(OntologyEntryInput::trait_("height")?)
            .err()
            .ok_or_else(|| anyhow!("duplicate name accepted"))?;
        assert!(matches!(err.downcast_ref::<DomainError>(), Some(DomainError::IdentityExists(_))));
        ontology.create_entry(OntologyEntryInput::subject("Height")?)?;
        Ok(())
    }

    #[test]
    fn duplicate_triples_raise_relationship_exists() -> Result<()> {
        let store = memory_store()?;
        let ontology = SqliteOntologyPersistence::new(store.conn());
        let a = draft_entry(&ontology, OntologyEntryInput::subject("A")?)?;
        let b = draft_entry(&ontology, OntologyEntryInput::subject("B")?)?;
        parent_of(&ontology, &a, &b)?;
        let err = parent_of(&ontology, &a, &b).err().ok_or_else(|| anyhow!("duplicate stored"))?;
        assert!(matches!(
            err.downcast_ref::<DomainError>(),
            Some(DomainError::RelationshipExists(_))
        ));
        Ok(())
    }

    #[test]
    fn paths_only_follow_edges_of_the_given_label() -> Result<()> {
        let store = memory_store()?;
        let ontology = SqliteOntologyPersistence::new(store.conn());
        let s1 = draft_entry(&ontology, OntologyEntryInput::subject("S1")?)?;
        let s2 = draft_entry(&ontology, OntologyEntryInput::subject("S2")?)?;
        let s3 = draft_entry(&ontology, OntologyEntryInput::subject("S3")?)?;
        parent_of(&ontology, &s1, &s2)?;
        parent_of(&ontology, &s2, &s3)?;

        let label = OntologyRelationshipLabel::ParentOf;
        assert!(ontology.has_path_between_entries(s1.id, s3.id, label)?);
        assert!(!ontology.has_path_between_entries(s3.id, s1.id, label)?);
        assert!(!ontology.has_path_between_entries(s1.id, s3.id, OntologyRelationshipLabel::HasTerm)?);
        Ok(())
    }

    #[test]
    fn commits_bump_versions_and_advance_lifecycles() -> Result<()> {
        let store = memory_store()?;
        let ontology = SqliteOntologyPersistence::new(store.conn());
        assert_eq!(ontology.get_current_version()?, Version::ZERO);
        let term = draft_entry(&ontology, OntologyEntryInput::term("Leaf")?)?;

        let commit = ontology.commit_version(ALICE, VersionChange::Major, None, None, None)?;
        assert_eq!(commit.version, Version::new(1, 0, 0));
        assert_eq!(ontology.activate_drafts(commit.version, ALICE)?, 1);
        assert_eq!(ontology.remove_deprecated(commit.version, ALICE)?, 0);

        let lifecycles = ontology.get_entry_lifecycles(&[term.id])?;
        let lifecycle = lifecycles.get(&term.id).ok_or_else(|| anyhow!("lifecycle missing"))?;
        assert_eq!(lifecycle.current_phase(), Some(LifecyclePhase::Active));
        assert_eq!(lifecycle.phase_at(Version::ZERO), Some(LifecyclePhase::Draft));
        assert_eq!(lifecycle.audit.len(), 2);

        let drafts_at_zero = ontology.get_entries(&EntryQuery {
            version: Some(Version::ZERO),
            phases: vec![LifecyclePhase::Draft],
            ..EntryQuery::default()
        })?;
        assert_eq!(drafts_at_zero.len(), 1);
        let drafts_now = ontology.get_entries(&EntryQuery {
            phases: vec![LifecyclePhase::Draft],
            ..EntryQuery::default()
        })?;
        assert!(drafts_now.is_empty());
        Ok(())
    }

    #[test]
    fn commit_history_is_in_version_order() -> Result<()> {
        let store = memory_store()?;
        let ontology = SqliteOntologyPersistence::new(store.conn());
        ontology.commit_version(ALICE, VersionChange::Minor, Some("a".to_string()), None, None)?;
        ontology.commit_version(ALICE, VersionChange::Patch, None, Some(3), None)?;
        ontology.commit_version(ALICE, VersionChange::Major, None, None, None)?;

        let versions = |commits: Vec<VersionCommit>| -> Vec<Version> {
            commits.into_iter().map(|commit| commit.version).collect()
        };
        assert_eq!(
            versions(ontology.get_commit_history(None)?),
            vec![Version::new(0, 1, 0), Version::new(0, 1, 1), Version::new(1, 0, 0)]
        );
        assert_eq!(
            versions(ontology.get_commit_history(Some(2))?),
            vec![Version::new(0, 1, 1), Version::new(1, 0, 0)]
        );
        assert_eq!(
            versions(ontology.get_commits(Some(Version::new(0, 1, 1)), None)?),
            vec![Version::new(0, 1, 1), Version::new(1, 0, 0)]
        );
        Ok(())
    }

    #[test]
    fn saving_lifecycles_requires_a_user() -> Result<()> {
        let store = memory_store()?;
        let ontology = SqliteOntologyPersistence::new(store.conn());
        let mut lifecycles = BTreeMap::from([(EntryId(1), Lifecycle::drafted(Version::ZERO, ALICE))]);
        let err = ontology
            .save_entry_lifecycles(&mut lifecycles, None)
            .err()
            .ok_or_else(|| anyhow!("saved without a user"))?;
        assert!(matches!(err.downcast_ref::<DomainError>(), Some(DomainError::IllegalOperation(_))));
        Ok(())
    }

    #[test]
    fn outputs_group_related_ids_by_attribute() -> Result<()> {
        let store = memory_store()?;
        let ontology = SqliteOntologyPersistence::new(store.conn());
        let parent = draft_entry(&ontology, OntologyEntryInput::subject("Plant")?)?;
        let child = draft_entry(&ontology, OntologyEntryInput::subject("Leaf")?)?;
        parent_of(&ontology, &parent, &child)?;

        let outputs = ontology.get_entry_outputs(&EntryQuery::ids(&[parent.id]))?;
        let output = outputs.first().ok_or_else(|| anyhow!("output missing"))?;
        assert_eq!(output.phase, Some(LifecyclePhase::Draft));
        let children = output.get("children").map(|related| related.ids());
        assert_eq!(children, Some(vec![child.id]));
        Ok(())
    }
}
