//! The ontology application service.
//!
//! One service value lives per unit of work. Lifecycles touched by the service are
//! cached in the [`OntologySession`] and written back by [`OntologyService::flush`],
//! which every mutating operation calls before returning.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;
use breedgraph_core::ontology::{
    AxisType, EntryFields, EntryKind, Lifecycle, LifecyclePhase, ObservationType, OntologyEntry,
    OntologyEntryInput, OntologyEntryLabel, OntologyEntryOutput, OntologyRelationship,
    OntologyRelationshipInput, OntologyRelationshipLabel, ScaleType,
};
use breedgraph_core::{
    DomainError, DomainEvent, EntryId, FactorLinks, NewEntry, OntologyRole, RelationshipId,
    UserId, Version, VersionChange, VersionCommit, VariableLinks,
};
use breedgraph_store_sqlite::{EntryQuery, OntologyPersistence, RelationshipQuery};
use tracing::{debug, info};

use OntologyEntryLabel as L;
use OntologyRelationshipLabel as R;

/// Lifecycles and events gathered by the ontology service within one unit of work.
#[derive(Debug, Default)]
pub struct OntologySession {
    entry_lifecycles: BTreeMap<EntryId, Lifecycle>,
    relationship_lifecycles: BTreeMap<RelationshipId, Lifecycle>,
    events: Vec<DomainEvent>,
}

impl OntologySession {
    #[must_use]
    pub fn has_pending_lifecycles(&self) -> bool {
        self.entry_lifecycles.values().any(Lifecycle::is_changed)
            || self.relationship_lifecycles.values().any(Lifecycle::is_changed)
    }

    pub fn drain_events(&mut self) -> Vec<DomainEvent> {
        std::mem::take(&mut self.events)
    }

    fn forget_lifecycles(&mut self) {
        self.entry_lifecycles.clear();
        self.relationship_lifecycles.clear();
    }
}

pub struct OntologyService<'a, P> {
    persistence: P,
    user: Option<UserId>,
    role: OntologyRole,
    session: &'a mut OntologySession,
}

impl<'a, P: OntologyPersistence> OntologyService<'a, P> {
    pub fn new(
        persistence: P,
        user: Option<UserId>,
        role: OntologyRole,
        session: &'a mut OntologySession,
    ) -> Self {
        Self { persistence, user, role, session }
    }

    #[must_use]
    pub fn role(&self) -> OntologyRole {
        self.role
    }

    /// # Errors
    /// Returns an error when the commit table cannot be read.
    pub fn current_version(&self) -> Result<Version> {
        self.persistence.get_current_version()
    }

    // Reads

    /// # Errors
    /// Returns an error when the query fails.
    pub fn get_entries(&self, query: &EntryQuery) -> Result<Vec<OntologyEntry>> {
        self.persistence.get_entries(query)
    }

    /// # Errors
    /// Returns an error when the query fails.
    pub fn get_entry_outputs(&self, query: &EntryQuery) -> Result<Vec<OntologyEntryOutput>> {
        self.persistence.get_entry_outputs(query)
    }

    /// # Errors
    /// Returns [`DomainError::NoResultFound`] for unknown or removed entries.
    pub fn get_entry(&self, id: EntryId) -> Result<OntologyEntry> {
        self.persistence
            .get_entries(&EntryQuery::ids(&[id]))?
            .into_iter()
            .next()
            .ok_or_else(|| DomainError::NoResultFound(format!("ontology entry {id}")).into())
    }

    /// # Errors
    /// Returns an error when the query fails.
    pub fn get_relationships(&self, query: &RelationshipQuery) -> Result<Vec<OntologyRelationship>> {
        self.persistence.get_relationships(query)
    }

    /// The lifecycle of `id` including changes not yet flushed.
    ///
    /// # Errors
    /// Returns an error when lifecycle rows cannot be read.
    pub fn get_entry_lifecycle(&self, id: EntryId) -> Result<Option<Lifecycle>> {
        if let Some(lifecycle) = self.session.entry_lifecycles.get(&id) {
            return Ok(Some(lifecycle.clone()));
        }
        Ok(self.persistence.get_entry_lifecycles(&[id])?.remove(&id))
    }

    /// # Errors
    /// Returns an error when lifecycle rows cannot be read.
    pub fn get_relationship_lifecycle(&self, id: RelationshipId) -> Result<Option<Lifecycle>> {
        if let Some(lifecycle) = self.session.relationship_lifecycles.get(&id) {
            return Ok(Some(lifecycle.clone()));
        }
        Ok(self.persistence.get_relationship_lifecycles(&[id])?.remove(&id))
    }

    /// # Errors
    /// Returns an error when commits cannot be read.
    pub fn get_commit_history(&self, limit: Option<usize>) -> Result<Vec<VersionCommit>> {
        self.persistence.get_commit_history(limit)
    }

    /// # Errors
    /// Returns an error when commits cannot be read.
    pub fn get_commits(&self, min: Option<Version>, max: Option<Version>) -> Result<Vec<VersionCommit>> {
        self.persistence.get_commits(min, max)
    }

    // Typed creators

    /// # Errors
    /// See [`OntologyService::create_entry`].
    pub fn create_term(&mut self, entry: NewEntry) -> Result<OntologyEntry> {
        self.create_entry(entry, EntryKind::Term)
    }

    /// # Errors
    /// See [`OntologyService::create_entry`].
    pub fn create_subject(
        &mut self,
        entry: NewEntry,
        traits: &[EntryId],
        conditions: &[EntryId],
        exposures: &[EntryId],
    ) -> Result<OntologyEntry> {
        self.create_with(entry, EntryKind::Subject, |service, subject| {
            for source in dedup(traits.iter().chain(conditions).chain(exposures)) {
                service.relate(source, subject, R::DescribesSubject, None)?;
            }
            Ok(())
        })
    }

    /// # Errors
    /// See [`OntologyService::create_entry`].
    pub fn create_trait(&mut self, entry: NewEntry, subjects: &[EntryId]) -> Result<OntologyEntry> {
        self.create_describing_subjects(entry, EntryKind::Trait, subjects)
    }

    /// # Errors
    /// See [`OntologyService::create_entry`].
    pub fn create_condition(
        &mut self,
        entry: NewEntry,
        subjects: &[EntryId],
    ) -> Result<OntologyEntry> {
        self.create_describing_subjects(entry, EntryKind::Condition, subjects)
    }

    /// # Errors
    /// See [`OntologyService::create_entry`].
    pub fn create_exposure(&mut self, entry: NewEntry, subjects: &[EntryId]) -> Result<OntologyEntry> {
        self.create_describing_subjects(entry, EntryKind::Exposure, subjects)
    }

    /// Categories are only accepted for NOMINAL and ORDINAL scales; ordinal ranks
    /// follow the supplied order.
    ///
    /// # Errors
    /// Returns [`DomainError::IllegalOperation`] for categories on other scale types.
    pub fn create_scale(
        &mut self,
        entry: NewEntry,
        scale_type: ScaleType,
        categories: &[EntryId],
    ) -> Result<OntologyEntry> {
        if !categories.is_empty() && !has_categories(scale_type) {
            return Err(DomainError::IllegalOperation(format!(
                "{scale_type} scales do not take categories"
            ))
            .into());
        }
        self.create_with(entry, EntryKind::Scale { scale_type }, |service, scale| {
            if !categories.is_empty() {
                service.add_categories(scale, &dedup(categories), None)?;
            }
            Ok(())
        })
    }

    /// A category, appended to each of `scales`.
    ///
    /// # Errors
    /// See [`OntologyService::create_entry`].
    pub fn create_category(&mut self, entry: NewEntry, scales: &[EntryId]) -> Result<OntologyEntry> {
        self.create_with(entry, EntryKind::Category, |service, category| {
            for scale in dedup(scales) {
                service.add_categories(scale, &[category], None)?;
            }
            Ok(())
        })
    }

    /// # Errors
    /// See [`OntologyService::create_entry`].
    pub fn create_observation_method(
        &mut self,
        entry: NewEntry,
        observation_type: ObservationType,
    ) -> Result<OntologyEntry> {
        self.create_entry(entry, EntryKind::ObservationMethod { observation_type })
    }

    /// # Errors
    /// See [`OntologyService::create_entry`].
    pub fn create_control_method(&mut self, entry: NewEntry) -> Result<OntologyEntry> {
        self.create_entry(entry, EntryKind::ControlMethod)
    }

    /// A variable described by a trait, observed by a method and recorded on a scale.
    ///
    /// # Errors
    /// Returns [`DomainError::Validation`] when any of the three links is missing.
    pub fn create_variable(&mut self, entry: NewEntry, links: VariableLinks) -> Result<OntologyEntry> {
        let (trait_id, method_id, scale_id) = links.require()?;
        self.require_label(trait_id, L::Trait)?;
        self.require_label(method_id, L::ObservationMethod)?;
        self.require_label(scale_id, L::Scale)?;
        self.create_with(entry, EntryKind::Variable, |service, variable| {
            service.relate(variable, trait_id, R::DescribesTrait, None)?;
            service.relate(variable, method_id, R::UsesObservationMethod, None)?;
            service.relate(variable, scale_id, R::UsesScale, None)?;
            Ok(())
        })
    }

    /// # Errors
    /// Returns [`DomainError::Validation`] when any of the three links is missing.
    pub fn create_factor(&mut self, entry: NewEntry, links: FactorLinks) -> Result<OntologyEntry> {
        let (condition_id, method_id, scale_id) = links.require()?;
        self.require_label(condition_id, L::Condition)?;
        self.require_label(method_id, L::ControlMethod)?;
        self.require_label(scale_id, L::Scale)?;
        self.create_with(entry, EntryKind::Factor, |service, factor| {
            service.relate(factor, condition_id, R::DescribesCondition, None)?;
            service.relate(factor, method_id, R::UsesControlMethod, None)?;
            service.relate(factor, scale_id, R::UsesScale, None)?;
            Ok(())
        })
    }

    /// # Errors
    /// See [`OntologyService::create_entry`].
    pub fn create_event_type(
        &mut self,
        entry: NewEntry,
        variables: &[EntryId],
        factors: &[EntryId],
        exposures: &[EntryId],
    ) -> Result<OntologyEntry> {
        self.create_with(entry, EntryKind::Event, |service, event| {
            for variable in dedup(variables) {
                service.relate(event, variable, R::DescribesVariable, None)?;
            }
            for factor in dedup(factors) {
                service.relate(event, factor, R::DescribesFactor, None)?;
            }
            for exposure in dedup(exposures) {
                service.relate(event, exposure, R::DescribesExposure, None)?;
            }
            Ok(())
        })
    }

    /// # Errors
    /// See [`OntologyService::create_entry`].
    pub fn create_layout_type(&mut self, entry: NewEntry, axes: Vec<AxisType>) -> Result<OntologyEntry> {
        self.create_entry(entry, EntryKind::LayoutType { axes })
    }

    /// Location types, designs, roles, titles and germplasm methods carry no
    /// label-specific fields or links.
    ///
    /// # Errors
    /// Returns [`DomainError::Validation`] for labels that need extra fields.
    pub fn create_plain(&mut self, entry: NewEntry, label: OntologyEntryLabel) -> Result<OntologyEntry> {
        self.create_entry(entry, EntryKind::plain(label)?)
    }

    /// Store a new DRAFT entry with its PARENT_OF and HAS_TERM links.
    ///
    /// # Errors
    /// Returns [`DomainError::IdentityExists`] for a name or abbreviation already
    /// used within the label, [`DomainError::IllegalOperation`] for callers below
    /// CONTRIBUTOR and for links that would form a cycle.
    pub fn create_entry(&mut self, entry: NewEntry, kind: EntryKind) -> Result<OntologyEntry> {
        self.create_with(entry, kind, |_, _| Ok(()))
    }

    fn create_describing_subjects(
        &mut self,
        entry: NewEntry,
        kind: EntryKind,
        subjects: &[EntryId],
    ) -> Result<OntologyEntry> {
        self.create_with(entry, kind, |service, described| {
            for subject in dedup(subjects) {
                service.relate(described, subject, R::DescribesSubject, None)?;
            }
            Ok(())
        })
    }

    fn create_with(
        &mut self,
        entry: NewEntry,
        kind: EntryKind,
        link: impl FnOnce(&mut Self, EntryId) -> Result<()>,
    ) -> Result<OntologyEntry> {
        let user = self.require_contributor()?;
        let NewEntry { fields, parents, children, terms } = entry;
        let input = OntologyEntryInput::build(kind, fields)?;
        self.check_unique(&input.fields, input.label(), None)?;

        let created = self.persistence.create_entry(input)?;
        let version = self.current_version()?;
        self.session.entry_lifecycles.insert(created.id, Lifecycle::drafted(version, user));
        // queries only see entries with a stored lifecycle
        self.flush()?;

        for parent in dedup(&parents) {
            self.relate(parent, created.id, R::ParentOf, None)?;
        }
        for child in dedup(&children) {
            self.relate(created.id, child, R::ParentOf, None)?;
        }
        for term in dedup(&terms) {
            self.relate(created.id, term, R::HasTerm, None)?;
        }
        link(self, created.id)?;
        self.flush()?;
        debug!(entry = %created.id, label = %created.label(), "created ontology entry");
        Ok(created)
    }

    // Relationships

    /// Relate two entries, or revert an existing equivalent relationship to DRAFT.
    ///
    /// # Errors
    /// Returns [`DomainError::NoResultFound`] for unknown endpoints and
    /// [`DomainError::IllegalOperation`] for incompatible labels, removed endpoints,
    /// edges that would close a cycle under `label`, and non-editors re-creating an
    /// existing edge past DRAFT.
    pub fn create_relationship(
        &mut self,
        source: EntryId,
        target: EntryId,
        label: OntologyRelationshipLabel,
        rank: Option<u32>,
    ) -> Result<OntologyRelationship> {
        self.require_contributor()?;
        let relationship = self.relate(source, target, label, rank)?;
        self.flush()?;
        Ok(relationship)
    }

    /// Change the rank of a HAS_CATEGORY relationship.
    ///
    /// # Errors
    /// Returns [`DomainError::IllegalOperation`] for ranks on other labels and for
    /// non-editors changing relationships past DRAFT.
    pub fn update_relationship(
        &mut self,
        id: RelationshipId,
        rank: Option<u32>,
    ) -> Result<OntologyRelationship> {
        self.require_contributor()?;
        let relationship = self.require_relationship(id)?;
        if rank.is_some() && relationship.label != R::HasCategory {
            return Err(DomainError::IllegalOperation(format!(
                "{} does not take a rank",
                relationship.label
            ))
            .into());
        }
        let relationship = self.set_rank(relationship, rank)?;
        self.flush()?;
        Ok(relationship)
    }

    fn relate(
        &mut self,
        source: EntryId,
        target: EntryId,
        label: OntologyRelationshipLabel,
        rank: Option<u32>,
    ) -> Result<OntologyRelationship> {
        let user = self.require_contributor()?;
        let labels = self.persistence.entry_labels(&[source, target])?;
        let endpoint = |id: EntryId| {
            labels
                .get(&id)
                .copied()
                .map(|label| (id, label))
                .ok_or_else(|| DomainError::NoResultFound(format!("ontology entry {id}")))
        };
        let input = OntologyRelationshipInput::build(endpoint(source)?, endpoint(target)?, label, rank)?;
        for id in [source, target] {
            if self.entry_lifecycle(id)?.current_phase() == Some(LifecyclePhase::Removed) {
                return Err(DomainError::IllegalOperation(format!(
                    "ontology entry {id} is removed"
                ))
                .into());
            }
        }
        if self.persistence.has_path_between_entries(target, source, label)? {
            return Err(DomainError::IllegalOperation(format!(
                "{label} from {source} to {target} would create a cycle"
            ))
            .into());
        }

        let version = self.current_version()?;
        let can_edit = self.role.can_edit();
        let existing = self
            .persistence
            .get_relationships(
                &RelationshipQuery {
                    source_ids: vec![source],
                    target_ids: vec![target],
                    labels: vec![label],
                    ..RelationshipQuery::default()
                }
                .in_any_phase(),
            )?
            .into_iter()
            .next();
        if let Some(mut relationship) = existing {
            let lifecycle = self.relationship_lifecycle(relationship.id)?;
            touch(
                lifecycle,
                user,
                version,
                can_edit,
                &format!("ontology relationship {}", relationship.id),
            )?;
            if relationship.rank != rank {
                relationship.rank = rank;
                self.persistence.update_relationship(&relationship)?;
            }
            debug!(relationship = %relationship.id, "redrafted existing relationship");
            return Ok(relationship);
        }

        let relationship = self.persistence.create_relationship(input)?;
        self.session
            .relationship_lifecycles
            .insert(relationship.id, Lifecycle::drafted(version, user));
        Ok(relationship)
    }

    // Edits

    /// Replace the scalar fields of an entry. Entries past DRAFT may only be edited
    /// by editors and revert to DRAFT at the current version.
    ///
    /// # Errors
    /// Returns [`DomainError::IdentityExists`] for clashing names and
    /// [`DomainError::IllegalOperation`] for contributors editing past-draft entries.
    pub fn update_entry(&mut self, id: EntryId, fields: EntryFields) -> Result<OntologyEntry> {
        self.require_contributor()?;
        let mut entry = self
            .persistence
            .get_entries(&EntryQuery::ids(&[id]).in_any_phase())?
            .into_iter()
            .next()
            .ok_or_else(|| DomainError::NoResultFound(format!("ontology entry {id}")))?;
        entry.apply(fields)?;
        self.check_unique(&entry.fields, entry.label(), Some(id))?;

        let (user, version, can_edit) = self.edit_context()?;
        let lifecycle = self.entry_lifecycle(id)?;
        touch(lifecycle, user, version, can_edit, &format!("ontology entry {id}"))?;
        self.persistence.update_entry(&entry)?;
        self.flush()?;
        Ok(entry)
    }

    // Scale categories

    /// Attach categories to a scale.
    ///
    /// NOMINAL scales ignore categories they already have and take no ranks.
    /// ORDINAL scales append when `ranks` is `None`; otherwise each category is
    /// inserted at its rank and later categories shift right.
    ///
    /// # Errors
    /// Returns [`DomainError::IllegalOperation`] for other scale types, ranks on
    /// nominal scales and categories already on an ordinal scale, and
    /// [`DomainError::Validation`] when `ranks` and `categories` differ in length
    /// or a rank lies past the end of the current order.
    pub fn add_scale_categories(
        &mut self,
        scale: EntryId,
        categories: &[EntryId],
        ranks: Option<&[u32]>,
    ) -> Result<Vec<OntologyRelationship>> {
        self.require_contributor()?;
        self.flush()?;
        let created = self.add_categories(scale, categories, ranks)?;
        self.flush()?;
        Ok(created)
    }

    fn add_categories(
        &mut self,
        scale: EntryId,
        categories: &[EntryId],
        ranks: Option<&[u32]>,
    ) -> Result<Vec<OntologyRelationship>> {
        let scale_type = self.scale_type(scale)?;
        let existing = self.category_edges(scale)?;
        let mut created = Vec::new();
        match scale_type {
            ScaleType::Nominal => {
                if ranks.is_some() {
                    return Err(DomainError::IllegalOperation(
                        "nominal scale categories are unranked".to_string(),
                    )
                    .into());
                }
                let mut present: BTreeSet<EntryId> =
                    existing.iter().map(|edge| edge.target_id).collect();
                for category in categories {
                    if present.insert(*category) {
                        created.push(self.relate(scale, *category, R::HasCategory, None)?);
                    }
                }
            }
            ScaleType::Ordinal => {
                let mut order: Vec<EntryId> = existing.iter().map(|edge| edge.target_id).collect();
                let mut present: BTreeSet<EntryId> = order.iter().copied().collect();
                for category in categories {
                    if !present.insert(*category) {
                        return Err(DomainError::IllegalOperation(format!(
                            "category {category} is already on scale {scale}"
                        ))
                        .into());
                    }
                }
                match ranks {
                    None => order.extend_from_slice(categories),
                    Some(ranks) if ranks.len() != categories.len() => {
                        return Err(DomainError::Validation(format!(
                            "{} ranks given for {} categories",
                            ranks.len(),
                            categories.len()
                        ))
                        .into());
                    }
                    Some(ranks) => {
                        for (category, rank) in categories.iter().zip(ranks) {
                            let at = usize::try_from(*rank)
                                .ok()
                                .filter(|at| *at <= order.len())
                                .ok_or_else(|| {
                                    DomainError::Validation(format!(
                                        "rank {rank} is beyond the {} categories on scale {scale}",
                                        order.len()
                                    ))
                                })?;
                            order.insert(at, *category);
                        }
                    }
                }
                let mut by_target: BTreeMap<EntryId, OntologyRelationship> =
                    existing.into_iter().map(|edge| (edge.target_id, edge)).collect();
                for (position, category) in order.into_iter().enumerate() {
                    let rank = rank_at(position)?;
                    match by_target.remove(&category) {
                        Some(edge) if edge.rank == Some(rank) => {}
                        Some(edge) => {
                            self.set_rank(edge, Some(rank))?;
                        }
                        None => {
                            created.push(self.relate(scale, category, R::HasCategory, Some(rank))?);
                        }
                    }
                }
            }
            other => {
                return Err(DomainError::IllegalOperation(format!(
                    "{other} scales do not take categories"
                ))
                .into());
            }
        }
        Ok(created)
    }

    /// Deprecate the HAS_CATEGORY relationships from `scale` to `categories`;
    /// remaining ordinal categories are re-ranked from 0.
    ///
    /// # Errors
    /// Returns [`DomainError::IllegalOperation`] below EDITOR and
    /// [`DomainError::NoResultFound`] for categories not on the scale.
    pub fn remove_scale_categories(&mut self, scale: EntryId, categories: &[EntryId]) -> Result<()> {
        let user = self.require_editor()?;
        self.flush()?;
        let scale_type = self.scale_type(scale)?;
        if !has_categories(scale_type) {
            return Err(DomainError::IllegalOperation(format!(
                "{scale_type} scales do not take categories"
            ))
            .into());
        }
        let version = self.current_version()?;
        let doomed: BTreeSet<EntryId> = categories.iter().copied().collect();
        let mut remaining = Vec::new();
        let mut found = BTreeSet::new();
        for edge in self.category_edges(scale)? {
            if !doomed.contains(&edge.target_id) {
                remaining.push(edge);
                continue;
            }
            found.insert(edge.target_id);
            let lifecycle = self.relationship_lifecycle(edge.id)?;
            if lifecycle.is_draft() {
                lifecycle.set_activated(version, user)?;
            }
            lifecycle.set_deprecated(version, user)?;
        }
        if let Some(missing) = doomed.difference(&found).next() {
            return Err(DomainError::NoResultFound(format!(
                "category {missing} on scale {scale}"
            ))
            .into());
        }
        if scale_type == ScaleType::Ordinal {
            for (position, edge) in remaining.into_iter().enumerate() {
                let rank = rank_at(position)?;
                if edge.rank != Some(rank) {
                    self.set_rank(edge, Some(rank))?;
                }
            }
        }
        self.flush()
    }

    // Lifecycle advances

    /// # Errors
    /// Returns [`DomainError::IllegalOperation`] below EDITOR or for entries not in DRAFT.
    pub fn activate_entries(&mut self, ids: &[EntryId]) -> Result<()> {
        self.advance_entries(ids, Lifecycle::set_activated)
    }

    /// # Errors
    /// Returns [`DomainError::IllegalOperation`] below EDITOR or for entries not ACTIVE.
    pub fn deprecate_entries(&mut self, ids: &[EntryId]) -> Result<()> {
        self.advance_entries(ids, Lifecycle::set_deprecated)
    }

    /// # Errors
    /// Returns [`DomainError::IllegalOperation`] below EDITOR or for entries not DEPRECATED.
    pub fn remove_entries(&mut self, ids: &[EntryId]) -> Result<()> {
        self.advance_entries(ids, Lifecycle::set_removed)
    }

    /// # Errors
    /// Returns [`DomainError::IllegalOperation`] below EDITOR or for relationships not in DRAFT.
    pub fn activate_relationships(&mut self, ids: &[RelationshipId]) -> Result<()> {
        self.advance_relationships(ids, Lifecycle::set_activated)
    }

    /// # Errors
    /// Returns [`DomainError::IllegalOperation`] below EDITOR or for relationships not ACTIVE.
    pub fn deprecate_relationships(&mut self, ids: &[RelationshipId]) -> Result<()> {
        self.advance_relationships(ids, Lifecycle::set_deprecated)
    }

    /// # Errors
    /// Returns [`DomainError::IllegalOperation`] below EDITOR or for relationships not DEPRECATED.
    pub fn remove_relationships(&mut self, ids: &[RelationshipId]) -> Result<()> {
        self.advance_relationships(ids, Lifecycle::set_removed)
    }

    fn advance_entries(
        &mut self,
        ids: &[EntryId],
        advance: fn(&mut Lifecycle, Version, UserId) -> Result<(), DomainError>,
    ) -> Result<()> {
        let user = self.require_editor()?;
        let version = self.current_version()?;
        for id in dedup(ids) {
            advance(self.entry_lifecycle(id)?, version, user)?;
        }
        self.flush()
    }

    fn advance_relationships(
        &mut self,
        ids: &[RelationshipId],
        advance: fn(&mut Lifecycle, Version, UserId) -> Result<(), DomainError>,
    ) -> Result<()> {
        let user = self.require_editor()?;
        let version = self.current_version()?;
        for id in dedup(ids) {
            advance(self.relationship_lifecycle(id)?, version, user)?;
        }
        self.flush()
    }

    /// Bump the version, activate every draft and remove everything deprecated.
    ///
    /// # Errors
    /// Returns [`DomainError::IllegalOperation`] below EDITOR or when the version
    /// cannot be represented.
    pub fn commit_version(
        &mut self,
        change: VersionChange,
        comment: Option<String>,
        licence: Option<i64>,
        copyright: Option<i64>,
    ) -> Result<VersionCommit> {
        let user = self.require_editor()?;
        self.flush()?;
        let commit = self.persistence.commit_version(user, change, comment, licence, copyright)?;
        let activated = self.persistence.activate_drafts(commit.version, user)?;
        let removed = self.persistence.remove_deprecated(commit.version, user)?;
        // cached lifecycles predate the bulk advances
        self.session.forget_lifecycles();
        self.session
            .events
            .push(DomainEvent::OntologyVersionCreated { version_id: commit.version.packed() });
        info!(version = %commit.version, activated, removed, user = %user, "committed ontology version");
        Ok(commit)
    }

    /// Write back every lifecycle changed since the last flush.
    ///
    /// # Errors
    /// Returns [`DomainError::IllegalOperation`] when changes exist but no user is
    /// attached to the service.
    pub fn flush(&mut self) -> Result<()> {
        if !self.session.has_pending_lifecycles() {
            return Ok(());
        }
        self.persistence.save_entry_lifecycles(&mut self.session.entry_lifecycles, self.user)?;
        self.persistence
            .save_relationship_lifecycles(&mut self.session.relationship_lifecycles, self.user)
    }

    pub fn drain_events(&mut self) -> Vec<DomainEvent> {
        self.session.drain_events()
    }

    // Helpers

    fn require_contributor(&self) -> Result<UserId> {
        let user = self.require_user()?;
        if !self.role.can_contribute() {
            return Err(DomainError::IllegalOperation(format!(
                "ontology role {} cannot change the ontology",
                self.role.as_str()
            ))
            .into());
        }
        Ok(user)
    }

    fn require_editor(&self) -> Result<UserId> {
        let user = self.require_user()?;
        if !self.role.can_edit() {
            return Err(DomainError::IllegalOperation(format!(
                "ontology role {} cannot advance lifecycles or commit versions",
                self.role.as_str()
            ))
            .into());
        }
        Ok(user)
    }

    fn require_user(&self) -> Result<UserId> {
        self.user.ok_or_else(|| {
            DomainError::UnauthorisedOperation("ontology changes need a signed-in user".to_string())
                .into()
        })
    }

    fn edit_context(&self) -> Result<(UserId, Version, bool)> {
        Ok((self.require_contributor()?, self.current_version()?, self.role.can_edit()))
    }

    fn check_unique(
        &self,
        fields: &EntryFields,
        label: OntologyEntryLabel,
        exclude: Option<EntryId>,
    ) -> Result<()> {
        if self.persistence.name_in_use(label, &fields.name, exclude)? {
            return Err(DomainError::IdentityExists(format!(
                "{label} named '{}' already exists",
                fields.name
            ))
            .into());
        }
        if let Some(abbreviation) = fields.abbreviation.as_deref() {
            if self.persistence.abbreviation_in_use(label, abbreviation, exclude)? {
                return Err(DomainError::IdentityExists(format!(
                    "{label} abbreviation '{abbreviation}' already exists"
                ))
                .into());
            }
        }
        Ok(())
    }

    fn require_label(&self, id: EntryId, label: OntologyEntryLabel) -> Result<()> {
        match self.persistence.entry_labels(&[id])?.get(&id) {
            Some(found) if *found == label => Ok(()),
            Some(found) => Err(DomainError::IllegalOperation(format!(
                "entry {id} is a {found}, expected {label}"
            ))
            .into()),
            None => Err(DomainError::NoResultFound(format!("ontology entry {id}")).into()),
        }
    }

    fn scale_type(&self, scale: EntryId) -> Result<ScaleType> {
        self.require_label(scale, L::Scale)?;
        self.persistence
            .get_entries(&EntryQuery::ids(&[scale]).in_any_phase())?
            .into_iter()
            .next()
            .and_then(|entry| entry.kind.scale_type())
            .ok_or_else(|| DomainError::NoResultFound(format!("scale {scale}")).into())
    }

    /// Draft and active HAS_CATEGORY edges of `scale`, in rank order.
    fn category_edges(&self, scale: EntryId) -> Result<Vec<OntologyRelationship>> {
        let mut edges = self.persistence.get_relationships(&RelationshipQuery {
            phases: vec![LifecyclePhase::Draft, LifecyclePhase::Active],
            ..RelationshipQuery::from_source(scale, R::HasCategory)
        })?;
        edges.sort_by_key(|edge| (edge.rank.unwrap_or(u32::MAX), edge.id));
        Ok(edges)
    }

    fn require_relationship(&self, id: RelationshipId) -> Result<OntologyRelationship> {
        self.persistence
            .get_relationships(
                &RelationshipQuery { relationship_ids: vec![id], ..RelationshipQuery::default() }
                    .in_any_phase(),
            )?
            .into_iter()
            .next()
            .ok_or_else(|| DomainError::NoResultFound(format!("ontology relationship {id}")).into())
    }

    fn set_rank(
        &mut self,
        mut relationship: OntologyRelationship,
        rank: Option<u32>,
    ) -> Result<OntologyRelationship> {
        let (user, version, can_edit) = self.edit_context()?;
        let lifecycle = self.relationship_lifecycle(relationship.id)?;
        touch(lifecycle, user, version, can_edit, &format!("relationship {}", relationship.id))?;
        relationship.rank = rank;
        self.persistence.update_relationship(&relationship)?;
        Ok(relationship)
    }

    fn entry_lifecycle(&mut self, id: EntryId) -> Result<&mut Lifecycle> {
        if !self.session.entry_lifecycles.contains_key(&id) {
            let loaded = self
                .persistence
                .get_entry_lifecycles(&[id])?
                .remove(&id)
                .ok_or_else(|| DomainError::NoResultFound(format!("lifecycle of entry {id}")))?;
            self.session.entry_lifecycles.insert(id, loaded);
        }
        self.session
            .entry_lifecycles
            .get_mut(&id)
            .ok_or_else(|| DomainError::NoResultFound(format!("lifecycle of entry {id}")).into())
    }

    fn relationship_lifecycle(&mut self, id: RelationshipId) -> Result<&mut Lifecycle> {
        if !self.session.relationship_lifecycles.contains_key(&id) {
            let loaded = self
                .persistence
                .get_relationship_lifecycles(&[id])?
                .remove(&id)
                .ok_or_else(|| {
                    DomainError::NoResultFound(format!("lifecycle of relationship {id}"))
                })?;
            self.session.relationship_lifecycles.insert(id, loaded);
        }
        self.session.relationship_lifecycles.get_mut(&id).ok_or_else(|| {
            DomainError::NoResultFound(format!("lifecycle of relationship {id}")).into()
        })
    }
}

/// Record an edit on `lifecycle`: drafts just gain a write, later phases need an
/// editor and revert to DRAFT at `version`.
fn touch(
    lifecycle: &mut Lifecycle,
    user: UserId,
    version: Version,
    can_edit: bool,
    what: &str,
) -> Result<(), DomainError> {
    match lifecycle.current_phase() {
        None | Some(LifecyclePhase::Draft) => {
            lifecycle.record_write(user);
            Ok(())
        }
        Some(LifecyclePhase::Removed) => {
            Err(DomainError::IllegalOperation(format!("{what} is removed")))
        }
        Some(_) if !can_edit => Err(DomainError::IllegalOperation(format!(
            "only editors may change {what} once it is past draft"
        ))),
        Some(_) => lifecycle.set_drafted(version, user),
    }
}

fn has_categories(scale_type: ScaleType) -> bool {
    matches!(scale_type, ScaleType::Nominal | ScaleType::Ordinal)
}

fn rank_at(position: usize) -> Result<u32, DomainError> {
    u32::try_from(position)
        .map_err(|_| DomainError::Validation(format!("category rank {position} is too large")))
}

/// Ids in first-seen order without repeats.
fn dedup<'i, I: Copy + Ord + 'i>(ids: impl IntoIterator<Item = &'i I>) -> Vec<I> {
    let mut seen = BTreeSet::new();
    ids.into_iter().copied().filter(|id| seen.insert(*id)).collect()
}
