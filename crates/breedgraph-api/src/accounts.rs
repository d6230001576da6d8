use anyhow::Result;
use breedgraph_core::{
    Account, DomainError, DomainEvent, OntologyRole, UserId, UserInput, UserUpdate,
};
use breedgraph_store_sqlite::AccountStore;
use rusqlite::Connection;
use tracing::info;

/// Accounts as seen by one caller.
///
/// Accounts are not team-controlled; edits are limited to the account's owner and
/// ontology admins.
pub struct AccountRepository<'a> {
    store: AccountStore<'a>,
    caller: Option<UserId>,
    events: &'a mut Vec<DomainEvent>,
}

impl<'a> AccountRepository<'a> {
    pub fn new(
        conn: &'a Connection,
        caller: Option<UserId>,
        events: &'a mut Vec<DomainEvent>,
    ) -> Self {
        Self { store: AccountStore::new(conn), caller, events }
    }

    /// Register a new account. The first account in an empty store becomes the
    /// ontology admin; later ones start as viewers.
    ///
    /// # Errors
    /// Returns [`DomainError::Validation`] for invalid input and
    /// [`DomainError::IdentityExists`] when the name or email is taken.
    pub fn create(&mut self, input: UserInput) -> Result<Account> {
        let role = if self.store.count_users()? == 0 {
            OntologyRole::Admin
        } else {
            OntologyRole::Viewer
        };
        let mut account = Account::create(input, role)?;
        self.store.insert(&mut account)?;
        self.events.extend(account.drain_events());
        info!(user = %account.id(), role = role.as_str(), "created account");
        Ok(account)
    }

    /// # Errors
    /// Returns an error when the lookup fails.
    pub fn get(&self, id: UserId) -> Result<Option<Account>> {
        self.store.get(id)
    }

    /// # Errors
    /// Returns [`DomainError::NoResultFound`] for unknown users.
    pub fn require(&self, id: UserId) -> Result<Account> {
        self.store.get(id)?.ok_or_else(|| DomainError::NoResultFound(format!("user {id}")).into())
    }

    /// # Errors
    /// Returns an error when the lookup fails.
    pub fn find(&self, name_or_email: &str) -> Result<Option<Account>> {
        self.store.find_by_name_or_email(name_or_email)
    }

    /// # Errors
    /// Returns an error when the listing fails.
    pub fn get_all(&self) -> Result<Vec<Account>> {
        self.store.get_all()
    }

    /// Resolve credentials to an account.
    ///
    /// # Errors
    /// Returns [`DomainError::UnauthorisedOperation`] for unknown users and wrong
    /// credentials alike.
    pub fn login(&self, name_or_email: &str, password_hash: &str) -> Result<Account> {
        match self.store.find_by_name_or_email(name_or_email)? {
            Some(account) if account.user().password_hash == password_hash => Ok(account),
            _ => Err(DomainError::UnauthorisedOperation("invalid credentials".to_string()).into()),
        }
    }

    /// Persist pending changes; the caller must own the account or be an admin.
    ///
    /// # Errors
    /// Returns [`DomainError::UnauthorisedOperation`] for other callers.
    pub fn update(&mut self, account: &mut Account) -> Result<()> {
        self.require_owner_or_admin(account.id())?;
        self.store.update(account)?;
        self.events.extend(account.drain_events());
        Ok(())
    }

    /// Load, edit and persist the account `id` in one step.
    ///
    /// # Errors
    /// Returns [`DomainError::NoResultFound`] for unknown users and propagates the
    /// account's own validation errors.
    pub fn edit(
        &mut self,
        id: UserId,
        change: impl FnOnce(&mut Account) -> Result<(), DomainError>,
    ) -> Result<Account> {
        let mut account = self.require(id)?;
        change(&mut account)?;
        self.update(&mut account)?;
        Ok(account)
    }

    /// # Errors
    /// Returns [`DomainError::Validation`] for blank names.
    pub fn update_details(&mut self, id: UserId, update: UserUpdate) -> Result<Account> {
        self.edit(id, |account| account.update(update))
    }

    /// Mark the email of `id` verified. Token checks happen before the command
    /// reaches the core, so no caller is required.
    ///
    /// # Errors
    /// Returns [`DomainError::NoResultFound`] for unknown users.
    pub fn verify_email(&mut self, id: UserId) -> Result<Account> {
        let mut account = self.require(id)?;
        account.verify_email();
        self.store.update(&mut account)?;
        self.events.extend(account.drain_events());
        Ok(account)
    }

    /// # Errors
    /// Returns [`DomainError::UnauthorisedOperation`] unless the caller is an
    /// ontology admin.
    pub fn set_ontology_role(&mut self, id: UserId, role: OntologyRole) -> Result<Account> {
        let caller = self.require_caller()?;
        if self.caller_role(caller)? != OntologyRole::Admin {
            return Err(DomainError::UnauthorisedOperation(
                "only ontology admins may assign ontology roles".to_string(),
            )
            .into());
        }
        let mut account = self.require(id)?;
        account.set_ontology_role(role);
        self.store.update(&mut account)?;
        info!(user = %id, role = role.as_str(), "set ontology role");
        Ok(account)
    }

    /// # Errors
    /// Returns [`DomainError::ProtectedNode`] for verified accounts.
    pub fn remove(&mut self, id: UserId) -> Result<()> {
        let account = self.require(id)?;
        self.require_owner_or_admin(id)?;
        self.store.remove(&account)
    }

    fn require_caller(&self) -> Result<UserId> {
        self.caller.ok_or_else(|| {
            DomainError::UnauthorisedOperation("this operation needs a signed-in user".to_string())
                .into()
        })
    }

    fn caller_role(&self, caller: UserId) -> Result<OntologyRole> {
        Ok(self.require(caller)?.user().ontology_role)
    }

    fn require_owner_or_admin(&self, id: UserId) -> Result<()> {
        let caller = self.require_caller()?;
        if caller == id || self.caller_role(caller)? == OntologyRole::Admin {
            return Ok(());
        }
        Err(DomainError::UnauthorisedOperation(format!("user {caller} may not edit user {id}"))
            .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{domain_error, input, memory_store};

    #[test]
    fn first_account_is_admin_and_later_ones_are_viewers() -> Result<()> {
        let store = memory_store()?;
        let mut events = Vec::new();
        let mut accounts = AccountRepository::new(store.conn(), None, &mut events);
        let alice = accounts.create(input("alice", "a@x"))?;
        let bob = accounts.create(input("bob", "b@x"))?;

        assert_eq!(alice.id(), UserId(1));
        assert_eq!(alice.user().ontology_role, OntologyRole::Admin);
        assert!(!alice.user().email_verified);
        assert_eq!(bob.user().ontology_role, OntologyRole::Viewer);

        let duplicate = accounts.create(input("carol", "A@X")).err();
        assert!(matches!(domain_error(duplicate.as_ref()), Some(DomainError::IdentityExists(_))));
        assert_eq!(events.len(), 2);
        Ok(())
    }

    #[test]
    fn email_can_be_reused_after_unverified_removal() -> Result<()> {
        let store = memory_store()?;
        let mut events = Vec::new();
        let first =
            AccountRepository::new(store.conn(), None, &mut events).create(input("alice", "a@x"))?;
        AccountRepository::new(store.conn(), Some(first.id()), &mut events).remove(first.id())?;
        let again =
            AccountRepository::new(store.conn(), None, &mut events).create(input("alice", "a@x"))?;
        assert_eq!(again.id(), UserId(2));
        Ok(())
    }

    #[test]
    fn verified_accounts_cannot_be_removed() -> Result<()> {
        let store = memory_store()?;
        let mut events = Vec::new();
        let alice =
            AccountRepository::new(store.conn(), None, &mut events).create(input("alice", "a@x"))?;
        let mut accounts = AccountRepository::new(store.conn(), Some(alice.id()), &mut events);
        accounts.verify_email(alice.id())?;
        let error = accounts.remove(alice.id()).err();
        assert!(matches!(domain_error(error.as_ref()), Some(DomainError::ProtectedNode(_))));
        Ok(())
    }

    #[test]
    fn login_checks_the_credential_hash() -> Result<()> {
        let store = memory_store()?;
        let mut events = Vec::new();
        let mut accounts = AccountRepository::new(store.conn(), None, &mut events);
        accounts.create(input("alice", "a@x"))?;
        assert_eq!(accounts.login("A@x", "h")?.user().name, "alice");
        let error = accounts.login("alice", "wrong").err();
        assert!(matches!(
            domain_error(error.as_ref()),
            Some(DomainError::UnauthorisedOperation(_))
        ));
        Ok(())
    }

    #[test]
    fn only_admins_assign_roles_and_only_owners_edit() -> Result<()> {
        let store = memory_store()?;
        let mut events = Vec::new();
        let (alice, bob) = {
            let mut accounts = AccountRepository::new(store.conn(), None, &mut events);
            (accounts.create(input("alice", "a@x"))?, accounts.create(input("bob", "b@x"))?)
        };

        let mut as_bob = AccountRepository::new(store.conn(), Some(bob.id()), &mut events);
        assert!(as_bob.set_ontology_role(bob.id(), OntologyRole::Editor).is_err());
        assert!(as_bob.edit(alice.id(), |account| account.allow_email("x@y")).is_err());
        as_bob.edit(bob.id(), |account| account.allow_email("friend@y"))?;

        let mut as_alice = AccountRepository::new(store.conn(), Some(alice.id()), &mut events);
        let promoted = as_alice.set_ontology_role(bob.id(), OntologyRole::Editor)?;
        assert_eq!(promoted.user().ontology_role, OntologyRole::Editor);
        assert!(events.contains(&DomainEvent::EmailAdded { email: "friend@y".to_string() }));
        Ok(())
    }
}
