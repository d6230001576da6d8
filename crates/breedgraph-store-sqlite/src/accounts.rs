use anyhow::{anyhow, Context, Result};
use breedgraph_core::{Account, DomainError, OntologyRole, User, UserId};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::{next_id, unique_violation, Counter};

const USER_COLUMNS: &str =
    "id, name, fullname, email, password_hash, email_verified, ontology_role";

/// Persistence for [`Account`] aggregates.
pub struct AccountStore<'a> {
    conn: &'a Connection,
}

impl<'a> AccountStore<'a> {
    #[must_use]
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// # Errors
    /// Returns an error when the count query fails.
    pub fn count_users(&self) -> Result<i64> {
        self.conn
            .query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))
            .context("failed to count users")
    }

    /// Store a new account, assigning its id from the user counter.
    ///
    /// # Errors
    /// Returns [`DomainError::IdentityExists`] when the name or email is taken
    /// (case-insensitively), or an error when the insert fails.
    pub fn insert(&self, account: &mut Account) -> Result<()> {
        let id = UserId(next_id(self.conn, Counter::User)?);
        account.mark_created(id)?;
        let user = account.user();
        self.conn
            .execute(
                "INSERT INTO users(
                    id, name, name_lower, fullname, email, email_lower, password_hash,
                    email_verified, ontology_role
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    user.id.0,
                    user.name,
                    user.name.to_lowercase(),
                    user.fullname,
                    user.email,
                    user.email.to_lowercase(),
                    user.password_hash,
                    user.email_verified,
                    user.ontology_role.as_str(),
                ],
            )
            .map_err(|err| {
                unique_violation(err, format!("user name or email in use: {}", user.email))
            })?;

        for (position, email) in account.allowed_emails().iter().enumerate() {
            self.insert_allowed_email(id, position, email)?;
        }
        account.reset_tracking();
        Ok(())
    }

    /// # Errors
    /// Returns an error when lookup queries fail or stored rows are malformed.
    pub fn get(&self, id: UserId) -> Result<Option<Account>> {
        let user = self
            .conn
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
                params![id.0],
                user_row,
            )
            .optional()
            .with_context(|| format!("failed to load user {id}"))?;
        user.map(|row| self.load(row)).transpose()
    }

    /// Resolve by name or email, both compared case-insensitively.
    ///
    /// # Errors
    /// Returns an error when lookup queries fail or stored rows are malformed.
    pub fn find_by_name_or_email(&self, name_or_email: &str) -> Result<Option<Account>> {
        let folded = name_or_email.trim().to_lowercase();
        let user = self
            .conn
            .query_row(
                &format!(
                    "SELECT {USER_COLUMNS} FROM users
                     WHERE name_lower = ?1 OR email_lower = ?1
                     ORDER BY id LIMIT 1"
                ),
                params![folded],
                user_row,
            )
            .optional()
            .with_context(|| format!("failed to look up user {name_or_email}"))?;
        user.map(|row| self.load(row)).transpose()
    }

    /// # Errors
    /// Returns an error when lookup queries fail or stored rows are malformed.
    pub fn get_all(&self) -> Result<Vec<Account>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {USER_COLUMNS} FROM users ORDER BY id"))
            .context("failed to prepare user listing")?;
        let rows = stmt.query_map([], user_row)?;
        let mut accounts = Vec::new();
        for row in rows {
            accounts.push(self.load(row?)?);
        }
        Ok(accounts)
    }

    /// Write only what changed since the account was loaded.
    ///
    /// # Errors
    /// Returns [`DomainError::IdentityExists`] for a clashing name or email and
    /// [`DomainError::NoResultFound`] when the user row is gone.
    pub fn update(&self, account: &mut Account) -> Result<()> {
        if !account.is_changed() {
            return Ok(());
        }
        let user = account.user();
        if user != account.original_user() {
            let updated = self
                .conn
                .execute(
                    "UPDATE users SET
                        name = ?2, name_lower = ?3, fullname = ?4, email = ?5, email_lower = ?6,
                        password_hash = ?7, email_verified = ?8, ontology_role = ?9
                     WHERE id = ?1",
                    params![
                        user.id.0,
                        user.name,
                        user.name.to_lowercase(),
                        user.fullname,
                        user.email,
                        user.email.to_lowercase(),
                        user.password_hash,
                        user.email_verified,
                        user.ontology_role.as_str(),
                    ],
                )
                .map_err(|err| unique_violation(err, format!("user name or email in use: {}", user.email)))?;
            if updated == 0 {
                return Err(DomainError::NoResultFound(format!("user {}", user.id)).into());
            }
        }

        let id = account.id();
        for email in account.allowed_emails().removed() {
            self.conn
                .execute(
                    "DELETE FROM allowed_emails WHERE user_id = ?1 AND email_lower = ?2",
                    params![id.0, email.to_lowercase()],
                )
                .with_context(|| format!("failed to remove allowed email {email}"))?;
        }
        for email in account.allowed_emails().added() {
            let position =
                account.allowed_emails().iter().position(|current| *current == email).unwrap_or(0);
            self.insert_allowed_email(id, position, &email)?;
        }
        account.reset_tracking();
        Ok(())
    }

    /// # Errors
    /// Returns [`DomainError::ProtectedNode`] for verified accounts.
    pub fn remove(&self, account: &Account) -> Result<()> {
        if let Some(reason) = account.protected() {
            return Err(DomainError::ProtectedNode(reason).into());
        }
        self.conn
            .execute("DELETE FROM users WHERE id = ?1", params![account.id().0])
            .with_context(|| format!("failed to remove user {}", account.id()))?;
        Ok(())
    }

    fn insert_allowed_email(&self, user: UserId, position: usize, email: &str) -> Result<()> {
        let position = i64::try_from(position).context("allowed email position overflow")?;
        self.conn
            .execute(
                "INSERT INTO allowed_emails(user_id, position, email, email_lower)
                 VALUES (?1, ?2, ?3, ?4)",
                params![user.0, position, email, email.to_lowercase()],
            )
            .map_err(|err| unique_violation(err, format!("email {email} already allowed")))?;
        Ok(())
    }

    fn load(&self, row: UserRow) -> Result<Account> {
        let ontology_role = OntologyRole::parse(&row.ontology_role)
            .ok_or_else(|| anyhow!("invalid ontology role {}", row.ontology_role))?;
        let user = User {
            id: UserId(row.id),
            name: row.name,
            fullname: row.fullname,
            email: row.email,
            password_hash: row.password_hash,
            email_verified: row.email_verified,
            ontology_role,
        };

        let mut stmt = self
            .conn
            .prepare("SELECT email FROM allowed_emails WHERE user_id = ?1 ORDER BY position, email")
            .context("failed to prepare allowed email query")?;
        let allowed_emails = stmt
            .query_map(params![row.id], |r| r.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .with_context(|| format!("failed to load allowed emails of user {}", row.id))?;

        let mut stmt = self
            .conn
            .prepare(
                "SELECT DISTINCT u.id FROM allowed_emails a
                 JOIN users u ON u.email_lower = a.email_lower
                 WHERE a.user_id = ?1 ORDER BY u.id",
            )
            .context("failed to prepare allowed users query")?;
        let allowed_users = stmt
            .query_map(params![row.id], |r| r.get::<_, i64>(0).map(UserId))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .with_context(|| format!("failed to load allowed users of user {}", row.id))?;

        Ok(Account::load(user, allowed_emails, allowed_users))
    }
}

struct UserRow {
    id: i64,
    name: String,
    fullname: Option<String>,
    email: String,
    password_hash: String,
    email_verified: bool,
    ontology_role: String,
}

fn user_row(row: &Row<'_>) -> rusqlite::Result<UserRow> {
    Ok(UserRow {
        id: row.get(0)?,
        name: row.get(1)?,
        fullname: row.get(2)?,
        email: row.get(3)?,
        password_hash: row.get(4)?,
        email_verified: row.get(5)?,
        ontology_role: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use breedgraph_core::UserInput;

    use super::*;
    use crate::test_support::memory_store;

    fn input(name: &str, email: &str) -> UserInput {
        UserInput {
            name: name.to_string(),
            fullname: None,
            email: email.to_string(),
            password_hash: "h1".to_string(),
        }
    }

    #[test]
    fn insert_assigns_ids_from_one() -> Result<()> {
        let store = memory_store()?;
        let accounts = AccountStore::new(store.conn());
        let mut alice = Account::create(input("alice", "a@x"), OntologyRole::Admin)?;
        accounts.insert(&mut alice)?;
        assert_eq!(alice.id(), UserId(1));
        assert!(!alice.is_changed());

        let loaded = accounts.get(UserId(1))?.ok_or_else(|| anyhow!("alice missing"))?;
        assert_eq!(loaded.user(), alice.user());
        assert_eq!(accounts.count_users()?, 1);
        Ok(())
    }

    #[test]
    fn duplicate_email_differing_in_case_is_rejected() -> Result<()> {
        let store = memory_store()?;
        let accounts = AccountStore::new(store.conn());
        accounts.insert(&mut Account::create(input("alice", "a@x"), OntologyRole::Admin)?)?;
        let err = accounts
            .insert(&mut Account::create(input("bob", "A@X"), OntologyRole::Viewer)?)
            .err()
            .ok_or_else(|| anyhow!("duplicate email accepted"))?;
        assert!(matches!(err.downcast_ref::<DomainError>(), Some(DomainError::IdentityExists(_))));
        Ok(())
    }

    #[test]
    fn update_writes_email_diffs_and_derives_allowed_users() -> Result<()> {
        let store = memory_store()?;
        let accounts = AccountStore::new(store.conn());
        let mut alice = Account::create(input("alice", "a@x"), OntologyRole::Admin)?;
        accounts.insert(&mut alice)?;
        let mut bob = Account::create(input("bob", "b@x"), OntologyRole::Viewer)?;
        accounts.insert(&mut bob)?;

        alice.allow_email("B@x")?;
        alice.allow_email("c@x")?;
        accounts.update(&mut alice)?;
        alice.remove_email("c@x")?;
        accounts.update(&mut alice)?;

        let loaded = accounts.get(alice.id())?.ok_or_else(|| anyhow!("alice missing"))?;
        assert_eq!(loaded.allowed_emails().to_vec(), vec!["B@x".to_string()]);
        assert_eq!(loaded.allowed_users(), &[bob.id()]);
        Ok(())
    }

    #[test]
    fn lookup_by_name_or_email_is_case_insensitive() -> Result<()> {
        let store = memory_store()?;
        let accounts = AccountStore::new(store.conn());
        accounts.insert(&mut Account::create(input("Alice", "a@x"), OntologyRole::Admin)?)?;
        assert!(accounts.find_by_name_or_email("alice")?.is_some());
        assert!(accounts.find_by_name_or_email("A@X")?.is_some());
        assert!(accounts.find_by_name_or_email("carol")?.is_none());
        Ok(())
    }

    #[test]
    fn verified_accounts_cannot_be_removed() -> Result<()> {
        let store = memory_store()?;
        let accounts = AccountStore::new(store.conn());
        let mut alice = Account::create(input("alice", "a@x"), OntologyRole::Admin)?;
        accounts.insert(&mut alice)?;
        alice.verify_email();
        accounts.update(&mut alice)?;
        let err = accounts.remove(&alice).err().ok_or_else(|| anyhow!("removal allowed"))?;
        assert!(matches!(err.downcast_ref::<DomainError>(), Some(DomainError::ProtectedNode(_))));

        let mut bob = Account::create(input("bob", "b@x"), OntologyRole::Viewer)?;
        accounts.insert(&mut bob)?;
        accounts.remove(&bob)?;
        assert!(accounts.get(bob.id())?.is_none());
        Ok(())
    }
}
