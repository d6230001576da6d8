//! Access-controlled aggregate repositories.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;
use breedgraph_core::{
    ControlledAggregate, ControlledLabel, ControlledRef, DomainError, DomainEvent, Release, UserId,
};

use crate::access::AccessControlService;

/// Storage binding for one kind of controlled aggregate.
pub trait AggregatePersistence {
    type Aggregate: ControlledAggregate;
    type Input;

    /// Instantiate a new, unsaved aggregate for `user`.
    ///
    /// # Errors
    /// Returns a domain error for invalid input.
    fn build(&self, input: Self::Input, user: UserId) -> Result<Self::Aggregate>;

    /// Write every pending change; returns the members that received stored ids.
    ///
    /// # Errors
    /// Returns an error when any write fails.
    fn save(&self, aggregate: &mut Self::Aggregate) -> Result<Vec<ControlledRef>>;

    /// # Errors
    /// Returns an error when the aggregate cannot be loaded.
    fn load(&self, root: i64) -> Result<Option<Self::Aggregate>>;

    /// # Errors
    /// Returns an error when the roots cannot be listed.
    fn root_ids(&self) -> Result<Vec<i64>>;

    /// # Errors
    /// Returns an error when a delete fails.
    fn delete(&self, aggregate: &Self::Aggregate) -> Result<()>;

    fn take_events(&self, aggregate: &mut Self::Aggregate) -> Vec<DomainEvent>;
}

/// Create/get/update/remove with controller checks and redacted reads.
pub struct ControlledRepository<'a, P> {
    persistence: P,
    access: AccessControlService<'a>,
    release: Release,
    redacted: bool,
    events: &'a mut Vec<DomainEvent>,
}

impl<'a, P> ControlledRepository<'a, P> {
    pub fn new(
        persistence: P,
        access: AccessControlService<'a>,
        release: Release,
        redacted: bool,
        events: &'a mut Vec<DomainEvent>,
    ) -> Self {
        Self { persistence, access, release, redacted, events }
    }

    /// Read unredacted aggregates, for system handlers and state-machine edits
    /// that carry their own authorisation.
    #[must_use]
    pub fn unredacted(mut self) -> Self {
        self.redacted = false;
        self
    }

    /// Release attached to members created through this repository.
    #[must_use]
    pub fn with_release(mut self, release: Release) -> Self {
        self.release = release;
        self
    }

    #[must_use]
    pub fn persistence(&self) -> &P {
        &self.persistence
    }

    #[must_use]
    pub fn access(&self) -> &AccessControlService<'a> {
        &self.access
    }
}

impl<P: AggregatePersistence> ControlledRepository<'_, P> {
    /// Store a new aggregate controlled per its `initial_controllers`, returning the
    /// caller's projection of it.
    ///
    /// # Errors
    /// Returns [`DomainError::UnauthorisedOperation`] for anonymous callers or when
    /// no team would control a new member.
    pub fn create(&mut self, input: P::Input) -> Result<P::Aggregate> {
        let user = self.access.require_user()?;
        let mut aggregate = self.persistence.build(input, user)?;
        let stored = self.persistence.save(&mut aggregate)?;
        self.attach_controls(&aggregate, &stored)?;
        self.access.record_writes(&stored)?;
        self.events.extend(self.persistence.take_events(&mut aggregate));
        // the new aggregate may grant its creator roles
        self.access.initialize_user_context()?;
        self.project(aggregate)?.ok_or_else(|| {
            DomainError::UnauthorisedOperation("created aggregate is not readable".to_string())
                .into()
        })
    }

    /// # Errors
    /// Returns an error when loading or reading controls fails.
    pub fn get(&self, root: i64) -> Result<Option<P::Aggregate>> {
        match self.persistence.load(root)? {
            Some(aggregate) => self.project(aggregate),
            None => Ok(None),
        }
    }

    /// Every aggregate readable by the caller, in root id order.
    ///
    /// # Errors
    /// Returns an error when loading or reading controls fails.
    pub fn get_all(&self) -> Result<Vec<P::Aggregate>> {
        let mut aggregates = Vec::new();
        for root in self.persistence.root_ids()? {
            if let Some(aggregate) = self.get(root)? {
                aggregates.push(aggregate);
            }
        }
        Ok(aggregates)
    }

    /// Persist pending changes of `aggregate`; returns the members that received
    /// stored ids.
    ///
    /// # Errors
    /// Returns [`DomainError::IllegalOperation`] for redacted copies and
    /// [`DomainError::UnauthorisedOperation`] when a removed or changed member is not
    /// curated by the caller.
    pub fn update(&mut self, aggregate: &mut P::Aggregate) -> Result<Vec<ControlledRef>> {
        if aggregate.is_redacted() {
            return Err(DomainError::IllegalOperation(
                "redacted aggregates are read-only".to_string(),
            )
            .into());
        }
        if !aggregate.is_changed() {
            return Ok(Vec::new());
        }
        self.access.require_user()?;

        let removed = aggregate.removed_models();
        let changed = aggregate.changed_models();
        let guarded: Vec<ControlledRef> = removed.iter().chain(&changed).copied().collect();
        let controllers = self.access.controllers_for(&guarded)?;
        for model in &guarded {
            self.access.require_curate_any(*model, controllers.get(model))?;
        }

        let stored = self.persistence.save(aggregate)?;
        self.attach_controls(aggregate, &stored)?;
        for (label, ids) in by_label(&removed) {
            self.access.remove_controls(label, &ids, &BTreeSet::new())?;
        }
        let written: Vec<ControlledRef> = stored.iter().chain(&changed).copied().collect();
        self.access.record_writes(&written)?;
        self.events.extend(self.persistence.take_events(aggregate));
        Ok(stored)
    }

    /// # Errors
    /// Returns [`DomainError::ProtectedNode`] for protected aggregates and
    /// [`DomainError::UnauthorisedOperation`] unless the caller curates every
    /// controlling team of every member.
    pub fn remove(&mut self, aggregate: P::Aggregate) -> Result<()> {
        if aggregate.is_redacted() {
            return Err(DomainError::IllegalOperation(
                "redacted aggregates are read-only".to_string(),
            )
            .into());
        }
        self.access.require_user()?;
        if let Some(reason) = aggregate.protected() {
            return Err(DomainError::ProtectedNode(reason).into());
        }
        let models = aggregate.controlled_models();
        let controllers = self.access.controllers_for(&models)?;
        for model in &models {
            self.access.require_curate_all(*model, controllers.get(model))?;
        }
        self.persistence.delete(&aggregate)?;
        for (label, ids) in by_label(&models) {
            self.access.remove_controls(label, &ids, &BTreeSet::new())?;
        }
        Ok(())
    }

    /// Persist an aggregate whose structure was rewritten by the domain (for
    /// example one half of a split) without member-level checks.
    pub(crate) fn save_unchecked(&mut self, aggregate: &mut P::Aggregate) -> Result<()> {
        let stored = self.persistence.save(aggregate)?;
        self.attach_controls(aggregate, &stored)?;
        self.access.record_writes(&stored)?;
        self.events.extend(self.persistence.take_events(aggregate));
        Ok(())
    }

    fn attach_controls(&self, aggregate: &P::Aggregate, models: &[ControlledRef]) -> Result<()> {
        for model in models {
            let teams = aggregate.initial_controllers(*model, &self.access.teams().write);
            if teams.is_empty() {
                return Err(DomainError::UnauthorisedOperation(format!(
                    "no team of the caller may control new {} {}",
                    model.label.as_str(),
                    model.id
                ))
                .into());
            }
            self.access.set_controls(&[*model], &teams, self.release)?;
        }
        Ok(())
    }

    fn project(&self, aggregate: P::Aggregate) -> Result<Option<P::Aggregate>> {
        if !self.redacted {
            return Ok(Some(aggregate));
        }
        let controllers = self.access.controllers_for(&aggregate.controlled_models())?;
        Ok(aggregate.redacted(&controllers, self.access.user(), self.access.teams()))
    }
}

fn by_label(models: &[ControlledRef]) -> BTreeMap<ControlledLabel, Vec<i64>> {
    let mut grouped: BTreeMap<ControlledLabel, Vec<i64>> = BTreeMap::new();
    for model in models {
        grouped.entry(model.label).or_default().push(model.id);
    }
    grouped
}
