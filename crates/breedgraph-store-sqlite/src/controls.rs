use std::collections::{BTreeMap, BTreeSet};

use anyhow::{anyhow, Context, Result};
use breedgraph_core::{
    Control, ControlledLabel, ControlledRef, Controller, Release, TeamId, UserId, WriteStamp,
};
use rusqlite::{params, params_from_iter, Connection};
use time::OffsetDateTime;

use crate::{parse_rfc3339, placeholders_from, rfc3339};

/// Controlling teams, releases and write stamps of controlled models.
pub struct ControlStore<'a> {
    conn: &'a Connection,
}

impl<'a> ControlStore<'a> {
    #[must_use]
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Attach `teams` at `release` to each model, updating the release of
    /// existing controls.
    ///
    /// # Errors
    /// Returns an error when a write fails (for example an unknown team).
    pub fn set_controls(
        &self,
        models: &[ControlledRef],
        teams: &BTreeSet<TeamId>,
        release: Release,
    ) -> Result<()> {
        let now = rfc3339(OffsetDateTime::now_utc())?;
        let mut stmt = self.conn.prepare(
            "INSERT INTO controls(label, model_id, team_id, release, time)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(label, model_id, team_id) DO UPDATE SET
               release = excluded.release,
               time = excluded.time",
        )?;
        for model in models {
            for team in teams {
                stmt.execute(params![model.label.as_str(), model.id, team.0, release.as_str(), now])
                    .with_context(|| {
                        format!(
                            "failed to set control of team {team} on {} {}",
                            model.label.as_str(),
                            model.id
                        )
                    })?;
            }
        }
        Ok(())
    }

    /// # Errors
    /// Returns an error when a write fails.
    pub fn record_writes(&self, models: &[ControlledRef], user: UserId) -> Result<()> {
        let now = rfc3339(OffsetDateTime::now_utc())?;
        let mut stmt = self.conn.prepare(
            "INSERT INTO control_writes(label, model_id, user_id, time) VALUES (?1, ?2, ?3, ?4)",
        )?;
        for model in models {
            stmt.execute(params![model.label.as_str(), model.id, user.0, now]).with_context(
                || format!("failed to record write on {} {}", model.label.as_str(), model.id),
            )?;
        }
        Ok(())
    }

    /// Controllers keyed by model id; ids without any control row are absent.
    ///
    /// # Errors
    /// Returns an error when queries fail or rows are malformed.
    pub fn get_controllers(
        &self,
        label: ControlledLabel,
        ids: &[i64],
    ) -> Result<BTreeMap<i64, Controller>> {
        let mut controllers: BTreeMap<i64, Controller> = BTreeMap::new();
        if ids.is_empty() {
            return Ok(controllers);
        }
        let bind = || {
            std::iter::once(rusqlite::types::Value::from(label.as_str().to_string()))
                .chain(ids.iter().map(|id| rusqlite::types::Value::from(*id)))
        };
        let in_list = placeholders_from(2, ids.len());

        let mut stmt = self.conn.prepare(&format!(
            "SELECT model_id, team_id, release, time FROM controls
             WHERE label = ?1 AND model_id IN ({in_list}) ORDER BY model_id, team_id"
        ))?;
        let rows = stmt
            .query_map(params_from_iter(bind()), |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    TeamId(row.get(1)?),
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("failed to load controls")?;
        for (model, team, release, time) in rows {
            let release =
                Release::parse(&release).ok_or_else(|| anyhow!("invalid release {release}"))?;
            let control = Control { release, time: parse_rfc3339(&time)? };
            controllers.entry(model).or_default().controls.insert(team, control);
        }

        let mut stmt = self.conn.prepare(&format!(
            "SELECT model_id, user_id, time FROM control_writes
             WHERE label = ?1 AND model_id IN ({in_list}) ORDER BY id"
        ))?;
        let rows = stmt
            .query_map(params_from_iter(bind()), |row| {
                Ok((row.get::<_, i64>(0)?, UserId(row.get(1)?), row.get::<_, String>(2)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("failed to load control writes")?;
        for (model, user, time) in rows {
            if let Some(controller) = controllers.get_mut(&model) {
                controller.writes.push(WriteStamp { user, time: parse_rfc3339(&time)? });
            }
        }
        Ok(controllers)
    }

    /// Detach `teams` from each model; an empty set detaches every team and
    /// drops the write history.
    ///
    /// # Errors
    /// Returns an error when a delete fails.
    pub fn remove_controls(
        &self,
        label: ControlledLabel,
        ids: &[i64],
        teams: &BTreeSet<TeamId>,
    ) -> Result<()> {
        for id in ids {
            if teams.is_empty() {
                self.conn
                    .execute(
                        "DELETE FROM controls WHERE label = ?1 AND model_id = ?2",
                        params![label.as_str(), id],
                    )
                    .with_context(|| format!("failed to remove controls of {id}"))?;
                self.conn
                    .execute(
                        "DELETE FROM control_writes WHERE label = ?1 AND model_id = ?2",
                        params![label.as_str(), id],
                    )
                    .with_context(|| format!("failed to remove writes of {id}"))?;
                continue;
            }
            for team in teams {
                self.conn
                    .execute(
                        "DELETE FROM controls WHERE label = ?1 AND model_id = ?2 AND team_id = ?3",
                        params![label.as_str(), id, team.0],
                    )
                    .with_context(|| format!("failed to remove control of team {team} on {id}"))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::memory_store;

    fn seed_teams(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "INSERT INTO teams(id, parent_id, name, name_lower) VALUES (1, NULL, 'R', 'r');
             INSERT INTO teams(id, parent_id, name, name_lower) VALUES (2, 1, 'C', 'c');",
        )?;
        Ok(())
    }

    #[test]
    fn controllers_collect_controls_and_writes() -> Result<()> {
        let store = memory_store()?;
        seed_teams(store.conn())?;
        let controls = ControlStore::new(store.conn());
        let model = ControlledRef { label: ControlledLabel::Program, id: 7 };

        controls.set_controls(&[model], &BTreeSet::from([TeamId(1), TeamId(2)]), Release::Private)?;
        controls.set_controls(&[model], &BTreeSet::from([TeamId(2)]), Release::Public)?;
        controls.record_writes(&[model], UserId(3))?;

        let controllers = controls.get_controllers(ControlledLabel::Program, &[7, 8])?;
        assert_eq!(controllers.len(), 1);
        let controller = controllers.get(&7).ok_or_else(|| anyhow!("controller missing"))?;
        assert_eq!(controller.release(TeamId(1)), Some(Release::Private));
        assert_eq!(controller.release(TeamId(2)), Some(Release::Public));
        assert_eq!(controller.writes.len(), 1);
        assert_eq!(controller.writes[0].user, UserId(3));
        Ok(())
    }

    #[test]
    fn labels_keep_controls_apart() -> Result<()> {
        let store = memory_store()?;
        seed_teams(store.conn())?;
        let controls = ControlStore::new(store.conn());
        controls.set_controls(
            &[ControlledRef { label: ControlledLabel::Trial, id: 1 }],
            &BTreeSet::from([TeamId(1)]),
            Release::Private,
        )?;
        assert!(controls.get_controllers(ControlledLabel::Study, &[1])?.is_empty());
        Ok(())
    }

    #[test]
    fn removing_controls_by_team_and_entirely() -> Result<()> {
        let store = memory_store()?;
        seed_teams(store.conn())?;
        let controls = ControlStore::new(store.conn());
        let model = ControlledRef { label: ControlledLabel::Region, id: 4 };
        controls.set_controls(&[model], &BTreeSet::from([TeamId(1), TeamId(2)]), Release::Private)?;
        controls.record_writes(&[model], UserId(1))?;

        controls.remove_controls(ControlledLabel::Region, &[4], &BTreeSet::from([TeamId(1)]))?;
        let remaining = controls.get_controllers(ControlledLabel::Region, &[4])?;
        assert_eq!(remaining.get(&4).map(Controller::teams), Some(BTreeSet::from([TeamId(2)])));

        controls.remove_controls(ControlledLabel::Region, &[4], &BTreeSet::new())?;
        assert!(controls.get_controllers(ControlledLabel::Region, &[4])?.is_empty());
        Ok(())
    }
}
