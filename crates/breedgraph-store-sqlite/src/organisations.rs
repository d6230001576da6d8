use std::collections::{BTreeMap, BTreeSet};

use anyhow::{anyhow, Context, Result};
use breedgraph_core::{
    Access, Affiliation, AffiliationChange, Authorisation, DiGraph, DomainError, EntityId,
    Organisation, Team, TeamId, TeamInput, Tracked, Tree, UserId,
};
use rusqlite::{params, Connection, OptionalExtension};

use crate::{next_id, placeholders, unique_violation, Counter};

/// Persistence for [`Organisation`] team trees and their affiliations.
pub struct OrganisationStore<'a> {
    conn: &'a Connection,
}

impl<'a> OrganisationStore<'a> {
    #[must_use]
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Persist every pending change of `organisation`.
    ///
    /// Transient teams receive stored ids (parents before children) and the
    /// aggregate is re-keyed in place. Returns the stored ids of inserted teams.
    ///
    /// # Errors
    /// Returns [`DomainError::IdentityExists`] when a team name clashes under its
    /// parent (or among roots), and an error when any write fails.
    pub fn save(&self, organisation: &mut Organisation) -> Result<Vec<TeamId>> {
        self.delete_teams(&organisation.tracked().removed_nodes())?;

        let mut order = vec![organisation.root_id()];
        let mut index = 0;
        while let Some(id) = order.get(index).copied() {
            order.extend(organisation.children(id));
            index += 1;
        }

        let mut inserted = Vec::new();
        for transient in order.into_iter().filter(|id| id.is_transient()) {
            let stored = TeamId(next_id(self.conn, Counter::Team)?);
            organisation.replace_team_id(transient, stored)?;
            let team = organisation
                .team(stored)
                .ok_or_else(|| DomainError::NoResultFound(format!("team {stored}")))?;
            self.conn
                .execute(
                    "INSERT INTO teams(id, parent_id, name, name_lower, fullname)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        stored.0,
                        organisation.parent(stored).map(|parent| parent.0),
                        team.name,
                        team.name.to_lowercase(),
                        team.fullname,
                    ],
                )
                .map_err(|err| unique_violation(err, format!("team name {} in use", team.name)))?;
            inserted.push(stored);
        }

        let root = organisation.root_id();
        self.conn
            .execute(
                "UPDATE teams SET parent_id = NULL WHERE id = ?1 AND parent_id IS NOT NULL",
                params![root.0],
            )
            .map_err(|err| unique_violation(err, format!("root team name of {root} in use")))?;
        for (parent, child) in organisation.tracked().added_edges() {
            if inserted.contains(&child) {
                continue;
            }
            self.conn
                .execute("UPDATE teams SET parent_id = ?2 WHERE id = ?1", params![child.0, parent.0])
                .map_err(|err| unique_violation(err, format!("team name of {child} in use")))?;
        }

        for team in organisation.teams() {
            let renamed = organisation
                .tracked()
                .original_node(team.id)
                .is_some_and(|original| team.details_differ(original));
            if renamed {
                self.conn
                    .execute(
                        "UPDATE teams SET name = ?2, name_lower = ?3, fullname = ?4 WHERE id = ?1",
                        params![team.id.0, team.name, team.name.to_lowercase(), team.fullname],
                    )
                    .map_err(|err| unique_violation(err, format!("team name {} in use", team.name)))?;
            }
            self.write_affiliations(team)?;
        }

        organisation.reset_tracking();
        Ok(inserted)
    }

    /// Load the tree rooted at `root`; `None` unless `root` is a stored root team.
    ///
    /// # Errors
    /// Returns an error when queries fail or stored rows do not form a tree.
    pub fn get(&self, root: TeamId) -> Result<Option<Organisation>> {
        let mut stmt = self.conn.prepare(
            "WITH RECURSIVE subtree(id) AS (
                SELECT id FROM teams WHERE id = ?1 AND parent_id IS NULL
                UNION ALL
                SELECT t.id FROM teams t JOIN subtree s ON t.parent_id = s.id
             )
             SELECT t.id, t.parent_id, t.name, t.fullname
             FROM teams t JOIN subtree s ON s.id = t.id
             ORDER BY t.id",
        )?;
        let rows = stmt
            .query_map(params![root.0], |row| {
                Ok((
                    TeamId(row.get(0)?),
                    row.get::<_, Option<i64>>(1)?.map(TeamId),
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .with_context(|| format!("failed to load teams under {root}"))?;
        if rows.is_empty() {
            return Ok(None);
        }

        let ids: Vec<TeamId> = rows.iter().map(|(id, ..)| *id).collect();
        let mut affiliations = self.affiliations_for(&ids)?;
        let mut teams = Vec::with_capacity(rows.len());
        let mut edges = Vec::new();
        for (id, parent, name, fullname) in rows {
            let mut team = Team::new(id, TeamInput { name, fullname });
            for (access, user, affiliation) in affiliations.remove(&id).unwrap_or_default() {
                team.set_affiliation(access, user, affiliation);
            }
            team.reset_tracking();
            teams.push(team);
            if let Some(parent) = parent {
                edges.push((parent, id, ()));
            }
        }
        let tree = Tree::from_graph(DiGraph::from_parts(teams, edges)?)?;
        Ok(Some(Organisation::load(tree)))
    }

    /// Ids of every root team.
    ///
    /// # Errors
    /// Returns an error when the query fails.
    pub fn root_ids(&self) -> Result<Vec<TeamId>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id FROM teams WHERE parent_id IS NULL ORDER BY id")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, i64>(0).map(TeamId))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("failed to list root teams")?;
        Ok(ids)
    }

    /// Root team of the tree containing `team`.
    ///
    /// # Errors
    /// Returns an error when the query fails.
    pub fn root_of(&self, team: TeamId) -> Result<Option<TeamId>> {
        self.conn
            .query_row(
                "WITH RECURSIVE up(id, parent_id) AS (
                    SELECT id, parent_id FROM teams WHERE id = ?1
                    UNION ALL
                    SELECT t.id, t.parent_id FROM teams t JOIN up u ON t.id = u.parent_id
                 )
                 SELECT id FROM up WHERE parent_id IS NULL",
                params![team.0],
                |row| row.get::<_, i64>(0).map(TeamId),
            )
            .optional()
            .with_context(|| format!("failed to resolve root of team {team}"))
    }

    /// Roots of trees in which `user` holds any affiliation row.
    ///
    /// # Errors
    /// Returns an error when the query fails.
    pub fn roots_for_user(&self, user: UserId) -> Result<BTreeSet<TeamId>> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT team_id FROM affiliations WHERE user_id = ?1")?;
        let teams = stmt
            .query_map(params![user.0], |row| row.get::<_, i64>(0).map(TeamId))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .with_context(|| format!("failed to list affiliations of user {user}"))?;
        let mut roots = BTreeSet::new();
        for team in teams {
            if let Some(root) = self.root_of(team)? {
                roots.insert(root);
            }
        }
        Ok(roots)
    }

    /// Delete every team of `organisation`; affiliations and controls follow.
    ///
    /// # Errors
    /// Returns an error when a delete fails.
    pub fn remove(&self, organisation: &Organisation) -> Result<()> {
        let ids: Vec<TeamId> = organisation.tree().node_ids().collect();
        self.delete_teams(&ids)
    }

    fn write_affiliations(&self, team: &Team) -> Result<()> {
        for change in team.affiliation_changes() {
            match change {
                AffiliationChange::Upsert { access, user, affiliation } => {
                    self.conn
                        .execute(
                            "INSERT INTO affiliations(team_id, user_id, access, authorisation, heritable)
                             VALUES (?1, ?2, ?3, ?4, ?5)
                             ON CONFLICT(team_id, user_id, access) DO UPDATE SET
                               authorisation = excluded.authorisation,
                               heritable = excluded.heritable",
                            params![
                                team.id.0,
                                user.0,
                                access.as_str(),
                                affiliation.authorisation.as_str(),
                                affiliation.heritable,
                            ],
                        )
                        .with_context(|| {
                            format!("failed to write affiliation of user {user} on team {}", team.id)
                        })?;
                }
                AffiliationChange::Delete { access, user } => {
                    self.conn
                        .execute(
                            "DELETE FROM affiliations WHERE team_id = ?1 AND user_id = ?2 AND access = ?3",
                            params![team.id.0, user.0, access.as_str()],
                        )
                        .with_context(|| {
                            format!("failed to delete affiliation of user {user} on team {}", team.id)
                        })?;
                }
            }
        }
        Ok(())
    }

    /// Deletes leaves first so parent references stay valid.
    fn delete_teams(&self, ids: &[TeamId]) -> Result<()> {
        let mut pending: Vec<TeamId> = ids.iter().copied().filter(|id| !id.is_transient()).collect();
        while !pending.is_empty() {
            let before = pending.len();
            let mut kept = Vec::new();
            for id in pending {
                let deleted = self
                    .conn
                    .execute(
                        "DELETE FROM teams WHERE id = ?1
                         AND NOT EXISTS (SELECT 1 FROM teams c WHERE c.parent_id = ?1)",
                        params![id.0],
                    )
                    .with_context(|| format!("failed to delete team {id}"))?;
                if deleted == 0 && self.team_exists(id)? {
                    kept.push(id);
                }
            }
            if kept.len() == before {
                return Err(DomainError::ProtectedNode(format!(
                    "teams {kept:?} still have stored child teams"
                ))
                .into());
            }
            pending = kept;
        }
        Ok(())
    }

    fn team_exists(&self, id: TeamId) -> Result<bool> {
        let exists: i64 = self
            .conn
            .query_row("SELECT EXISTS(SELECT 1 FROM teams WHERE id = ?1)", params![id.0], |row| {
                row.get(0)
            })
            .with_context(|| format!("failed to probe team {id}"))?;
        Ok(exists == 1)
    }

    fn affiliations_for(
        &self,
        teams: &[TeamId],
    ) -> Result<BTreeMap<TeamId, Vec<(Access, UserId, Affiliation)>>> {
        let sql = format!(
            "SELECT team_id, user_id, access, authorisation, heritable FROM affiliations
             WHERE team_id IN ({}) ORDER BY team_id, user_id, access",
            placeholders(teams.len())
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(teams.iter().map(|id| id.0)), |row| {
                Ok((
                    TeamId(row.get(0)?),
                    UserId(row.get(1)?),
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, bool>(4)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("failed to load affiliations")?;

        let mut grouped: BTreeMap<TeamId, Vec<(Access, UserId, Affiliation)>> = BTreeMap::new();
        for (team, user, access, authorisation, heritable) in rows {
            let access = Access::parse(&access).ok_or_else(|| anyhow!("invalid access {access}"))?;
            let authorisation = Authorisation::parse(&authorisation)
                .ok_or_else(|| anyhow!("invalid authorisation {authorisation}"))?;
            grouped.entry(team).or_default().push((
                access,
                user,
                Affiliation { authorisation, heritable },
            ));
        }
        Ok(grouped)
    }
}

#[cfg(test)]
mod tests {
    use breedgraph_core::{Account, OntologyRole, UserInput};

    use super::*;
    use crate::test_support::memory_store;
    use crate::AccountStore;

    fn user(conn: &Connection, name: &str) -> Result<UserId> {
        let mut account = Account::create(
            UserInput {
                name: name.to_string(),
                fullname: None,
                email: format!("{name}@x"),
                password_hash: "h".to_string(),
            },
            OntologyRole::Viewer,
        )?;
        AccountStore::new(conn).insert(&mut account)?;
        Ok(account.id())
    }

    fn team(name: &str) -> TeamInput {
        TeamInput { name: name.to_string(), fullname: None }
    }

    #[test]
    fn save_assigns_ids_parents_first_and_round_trips() -> Result<()> {
        let store = memory_store()?;
        let organisations = OrganisationStore::new(store.conn());
        let alice = user(store.conn(), "alice")?;

        let mut organisation = Organisation::create(team("R"), alice)?;
        let child = organisation.add_team(team("C"), organisation.root_id())?;
        organisation.add_team(team("G"), child)?;
        let inserted = organisations.save(&mut organisation)?;
        assert_eq!(inserted, vec![TeamId(1), TeamId(2), TeamId(3)]);
        assert!(!organisation.tracked().is_changed());

        let loaded =
            organisations.get(TeamId(1))?.ok_or_else(|| anyhow!("organisation missing"))?;
        assert_eq!(loaded.parent(TeamId(3)), Some(TeamId(2)));
        assert!(loaded.has_access(alice, TeamId(3), Access::Admin));
        assert!(organisations.get(TeamId(2))?.is_none());
        assert_eq!(organisations.root_of(TeamId(3))?, Some(TeamId(1)));
        Ok(())
    }

    #[test]
    fn affiliation_changes_are_written_as_row_diffs() -> Result<()> {
        let store = memory_store()?;
        let organisations = OrganisationStore::new(store.conn());
        let alice = user(store.conn(), "alice")?;
        let bob = user(store.conn(), "bob")?;

        let mut organisation = Organisation::create(team("R"), alice)?;
        organisations.save(&mut organisation)?;
        let root = organisation.root_id();
        organisation.request_affiliation(bob, root, bob, Access::Read, true)?;
        organisations.save(&mut organisation)?;

        let mut loaded = organisations.get(root)?.ok_or_else(|| anyhow!("missing"))?;
        assert_eq!(
            loaded.root().affiliation(Access::Read, bob),
            Some(Affiliation::requested(true))
        );
        loaded.remove_affiliation(bob, root, bob, Access::Read)?;
        organisations.save(&mut loaded)?;
        let reloaded = organisations.get(root)?.ok_or_else(|| anyhow!("missing"))?;
        assert_eq!(reloaded.root().affiliation(Access::Read, bob), None);
        assert_eq!(organisations.roots_for_user(bob)?, BTreeSet::new());
        Ok(())
    }

    #[test]
    fn split_persists_both_halves() -> Result<()> {
        let store = memory_store()?;
        let organisations = OrganisationStore::new(store.conn());
        let alice = user(store.conn(), "alice")?;

        let mut organisation = Organisation::create(team("R"), alice)?;
        organisation.add_team(team("C"), organisation.root_id())?;
        organisations.save(&mut organisation)?;
        let child = TeamId(2);

        let mut detached = organisation.split(alice, child)?;
        organisations.save(&mut organisation)?;
        organisations.save(&mut detached)?;

        assert_eq!(organisations.root_ids()?, vec![TeamId(1), TeamId(2)]);
        let reloaded = organisations.get(child)?.ok_or_else(|| anyhow!("detached missing"))?;
        assert_eq!(
            reloaded.root().affiliation(Access::Admin, alice),
            Some(Affiliation::authorised(true))
        );
        Ok(())
    }

    #[test]
    fn sibling_names_clash_in_the_store() -> Result<()> {
        let store = memory_store()?;
        let organisations = OrganisationStore::new(store.conn());
        let alice = user(store.conn(), "alice")?;
        organisations.save(&mut Organisation::create(team("R"), alice)?)?;
        let err = organisations
            .save(&mut Organisation::create(team("r"), alice)?)
            .err()
            .ok_or_else(|| anyhow!("duplicate root accepted"))?;
        assert!(matches!(err.downcast_ref::<DomainError>(), Some(DomainError::IdentityExists(_))));
        Ok(())
    }

    #[test]
    fn removed_leaf_teams_are_deleted() -> Result<()> {
        let store = memory_store()?;
        let organisations = OrganisationStore::new(store.conn());
        let alice = user(store.conn(), "alice")?;
        let mut organisation = Organisation::create(team("R"), alice)?;
        organisation.add_team(team("C"), organisation.root_id())?;
        organisations.save(&mut organisation)?;

        organisation.remove_team(TeamId(2))?;
        organisations.save(&mut organisation)?;
        let loaded = organisations.get(TeamId(1))?.ok_or_else(|| anyhow!("missing"))?;
        assert_eq!(loaded.tree().len(), 1);

        organisations.remove(&loaded)?;
        assert!(organisations.root_ids()?.is_empty());
        Ok(())
    }
}
