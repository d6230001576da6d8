use serde::{Deserialize, Serialize};

use crate::events::DomainEvent;
use crate::ids::{EntityId, UserId};
use crate::tracking::{Tracked, TrackedList, TrackedValue};
use crate::DomainError;

/// A user's organisation-wide authority over the ontology.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OntologyRole {
    #[default]
    Viewer,
    Contributor,
    Editor,
    Admin,
}

impl OntologyRole {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Viewer => "VIEWER",
            Self::Contributor => "CONTRIBUTOR",
            Self::Editor => "EDITOR",
            Self::Admin => "ADMIN",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "VIEWER" => Some(Self::Viewer),
            "CONTRIBUTOR" => Some(Self::Contributor),
            "EDITOR" => Some(Self::Editor),
            "ADMIN" => Some(Self::Admin),
            _ => None,
        }
    }

    #[must_use]
    pub fn can_contribute(self) -> bool {
        self >= Self::Contributor
    }

    #[must_use]
    pub fn can_edit(self) -> bool {
        self >= Self::Editor
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct UserInput {
    pub name: String,
    #[serde(default)]
    pub fullname: Option<String>,
    pub email: String,
    pub password_hash: String,
}

impl UserInput {
    /// # Errors
    /// Returns [`DomainError::Validation`] for blank names or malformed email addresses.
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.name.trim().is_empty() {
            return Err(DomainError::Validation("user name must be non-empty".to_string()));
        }
        validate_email(&self.email)?;
        if self.password_hash.is_empty() {
            return Err(DomainError::Validation("password hash must be non-empty".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct User {
    pub id: UserId,
    pub name: String,
    pub fullname: Option<String>,
    pub email: String,
    #[serde(skip_serializing, default)]
    pub password_hash: String,
    pub email_verified: bool,
    pub ontology_role: OntologyRole,
}

/// Editable user details; absent fields stay as they are.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct UserUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub fullname: Option<String>,
    #[serde(default)]
    pub password_hash: Option<String>,
}

/// A user plus the email addresses they may invite.
#[derive(Debug, Clone)]
pub struct Account {
    user: TrackedValue<User>,
    allowed_emails: TrackedList<String>,
    allowed_users: Vec<UserId>,
    events: Vec<DomainEvent>,
}

impl Account {
    /// A new, unverified account carrying a transient id.
    ///
    /// # Errors
    /// Returns [`DomainError::Validation`] for invalid input.
    pub fn create(input: UserInput, role: OntologyRole) -> Result<Self, DomainError> {
        input.validate()?;
        let user = User {
            id: UserId(-1),
            name: input.name.trim().to_string(),
            fullname: input.fullname,
            email: input.email.trim().to_string(),
            password_hash: input.password_hash,
            email_verified: false,
            ontology_role: role,
        };
        Ok(Self {
            user: TrackedValue::new(user),
            allowed_emails: TrackedList::default(),
            allowed_users: Vec::new(),
            events: Vec::new(),
        })
    }

    #[must_use]
    pub fn load(user: User, allowed_emails: Vec<String>, allowed_users: Vec<UserId>) -> Self {
        Self {
            user: TrackedValue::new(user),
            allowed_emails: TrackedList::new(allowed_emails),
            allowed_users,
            events: Vec::new(),
        }
    }

    #[must_use]
    pub fn user(&self) -> &User {
        &self.user
    }

    #[must_use]
    pub fn id(&self) -> UserId {
        self.user.id
    }

    #[must_use]
    pub fn allowed_emails(&self) -> &TrackedList<String> {
        &self.allowed_emails
    }

    /// Ids of registered users whose email this account allowed.
    #[must_use]
    pub fn allowed_users(&self) -> &[UserId] {
        &self.allowed_users
    }

    #[must_use]
    pub fn is_changed(&self) -> bool {
        self.user.is_changed() || self.allowed_emails.is_changed()
    }

    /// The user record as last loaded, for diffing.
    #[must_use]
    pub fn original_user(&self) -> &User {
        self.user.original()
    }

    /// Verified accounts are kept; returns why removal is refused.
    #[must_use]
    pub fn protected(&self) -> Option<String> {
        self.user
            .email_verified
            .then(|| format!("account {} has a verified email", self.user.id))
    }

    pub fn drain_events(&mut self) -> Vec<DomainEvent> {
        std::mem::take(&mut self.events)
    }

    /// # Errors
    /// Returns [`DomainError::Validation`] for malformed addresses and
    /// [`DomainError::IdentityExists`] when already allowed (case-insensitively).
    pub fn allow_email(&mut self, email: &str) -> Result<(), DomainError> {
        let email = email.trim();
        validate_email(email)?;
        if self.email_position(email).is_some() {
            return Err(DomainError::IdentityExists(format!("email {email} already allowed")));
        }
        self.allowed_emails.push(email.to_string());
        self.events.push(DomainEvent::EmailAdded { email: email.to_string() });
        Ok(())
    }

    /// # Errors
    /// Returns [`DomainError::NoResultFound`] when the address is not allowed.
    pub fn remove_email(&mut self, email: &str) -> Result<(), DomainError> {
        let index = self
            .email_position(email.trim())
            .ok_or_else(|| DomainError::NoResultFound(format!("allowed email {email}")))?;
        if let Some(removed) = self.allowed_emails.remove(index) {
            self.events.push(DomainEvent::EmailRemoved { email: removed });
        }
        Ok(())
    }

    pub fn verify_email(&mut self) {
        if !self.user.email_verified {
            self.user.update(|user| user.email_verified = true);
            self.events.push(DomainEvent::EmailVerified { user_id: self.user.id });
        }
    }

    pub fn update_password_hash(&mut self, password_hash: String) {
        self.user.update(|user| user.password_hash = password_hash);
    }

    pub fn set_ontology_role(&mut self, role: OntologyRole) {
        self.user.update(|user| user.ontology_role = role);
    }

    /// # Errors
    /// Returns [`DomainError::Validation`] for a blank name.
    pub fn update(&mut self, update: UserUpdate) -> Result<(), DomainError> {
        if let Some(name) = update.name.as_deref() {
            if name.trim().is_empty() {
                return Err(DomainError::Validation("user name must be non-empty".to_string()));
            }
        }
        self.user.update(|user| {
            if let Some(name) = update.name {
                user.name = name.trim().to_string();
            }
            if update.fullname.is_some() {
                user.fullname = update.fullname;
            }
            if let Some(hash) = update.password_hash {
                user.password_hash = hash;
            }
        });
        Ok(())
    }

    /// Ask to move to a new address; the stored email only changes once confirmed.
    ///
    /// # Errors
    /// Returns [`DomainError::Validation`] for malformed addresses.
    pub fn request_email_change(&mut self, new_email: &str) -> Result<(), DomainError> {
        let new_email = new_email.trim();
        validate_email(new_email)?;
        self.events.push(DomainEvent::EmailChangeRequested {
            user_id: self.user.id,
            new_email: new_email.to_string(),
        });
        Ok(())
    }

    /// Apply a confirmed email change; the new address starts unverified.
    ///
    /// # Errors
    /// Returns [`DomainError::Validation`] for malformed addresses.
    pub fn change_email(&mut self, new_email: &str) -> Result<(), DomainError> {
        let new_email = new_email.trim().to_string();
        validate_email(&new_email)?;
        self.user.update(|user| {
            if !user.email.eq_ignore_ascii_case(&new_email) {
                user.email = new_email;
                user.email_verified = false;
            }
        });
        Ok(())
    }

    /// Record the stored id and emit the creation event.
    ///
    /// # Errors
    /// Returns [`DomainError::IllegalOperation`] for already stored accounts.
    pub fn mark_created(&mut self, id: UserId) -> Result<(), DomainError> {
        if !self.user.id.is_transient() {
            return Err(DomainError::IllegalOperation(format!(
                "account {} is already stored",
                self.user.id
            )));
        }
        self.user.update(|user| user.id = id);
        self.events.push(DomainEvent::AccountCreated { user_id: id });
        Ok(())
    }

    pub fn reset_tracking(&mut self) {
        self.user.reset_tracking();
        self.allowed_emails.reset_tracking();
    }

    fn email_position(&self, email: &str) -> Option<usize> {
        self.allowed_emails.iter().position(|allowed| allowed.eq_ignore_ascii_case(email))
    }
}

impl Serialize for Account {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        #[derive(Serialize)]
        struct AccountView<'a> {
            user: &'a User,
            allowed_emails: &'a TrackedList<String>,
            allowed_users: &'a [UserId],
        }
        AccountView {
            user: &self.user,
            allowed_emails: &self.allowed_emails,
            allowed_users: &self.allowed_users,
        }
        .serialize(serializer)
    }
}

fn validate_email(email: &str) -> Result<(), DomainError> {
    let email = email.trim();
    let valid = email.split_once('@').is_some_and(|(local, domain)| {
        !local.is_empty() && !domain.is_empty() && !domain.contains('@')
    });
    if valid {
        Ok(())
    } else {
        Err(DomainError::Validation(format!("invalid email address '{email}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> Result<Account, DomainError> {
        Account::create(
            UserInput {
                name: "alice".to_string(),
                fullname: None,
                email: "a@x".to_string(),
                password_hash: "h1".to_string(),
            },
            OntologyRole::Admin,
        )
    }

    #[test]
    fn new_accounts_start_unverified_and_transient() -> Result<(), DomainError> {
        let account = alice()?;
        assert!(account.id().is_transient());
        assert!(!account.user().email_verified);
        assert!(account.protected().is_none());
        Ok(())
    }

    #[test]
    fn allowed_emails_are_case_insensitively_unique() -> Result<(), DomainError> {
        let mut account = alice()?;
        account.allow_email("Bob@Example.org")?;
        let again = account.allow_email("bob@example.org");
        assert!(matches!(again, Err(DomainError::IdentityExists(_))));
        account.remove_email("BOB@example.org")?;
        assert!(account.allowed_emails().is_empty());
        assert!(account.remove_email("bob@example.org").is_err());

        let names: Vec<&str> = account.drain_events().iter().map(DomainEvent::name).collect();
        assert_eq!(names, vec!["EmailAdded", "EmailRemoved"]);
        Ok(())
    }

    #[test]
    fn verified_accounts_are_protected() -> Result<(), DomainError> {
        let mut account = alice()?;
        account.mark_created(UserId(1))?;
        account.verify_email();
        account.verify_email();
        assert!(account.protected().is_some());
        let names: Vec<&str> = account.drain_events().iter().map(DomainEvent::name).collect();
        assert_eq!(names, vec!["AccountCreated", "EmailVerified"]);
        Ok(())
    }

    #[test]
    fn setting_a_value_back_leaves_the_account_clean() -> Result<(), DomainError> {
        let mut account = alice()?;
        account.reset_tracking();
        account.set_ontology_role(OntologyRole::Editor);
        assert!(account.is_changed());
        account.set_ontology_role(OntologyRole::Admin);
        assert!(!account.is_changed());
        Ok(())
    }

    #[test]
    fn email_change_request_does_not_touch_the_stored_email() -> Result<(), DomainError> {
        let mut account = alice()?;
        account.request_email_change("new@x")?;
        assert_eq!(account.user().email, "a@x");
        account.change_email("new@x")?;
        assert_eq!(account.user().email, "new@x");
        assert!(!account.user().email_verified);
        Ok(())
    }

    #[test]
    fn password_hash_is_not_serialized() -> Result<(), serde_json::Error> {
        let account = alice().map_err(serde::ser::Error::custom)?;
        let value = serde_json::to_value(&account)?;
        assert!(value["user"].get("password_hash").is_none());
        assert_eq!(value["user"]["ontology_role"], "ADMIN");
        Ok(())
    }

    #[test]
    fn roles_are_ordered_by_authority() {
        assert!(OntologyRole::Editor.can_edit());
        assert!(!OntologyRole::Contributor.can_edit());
        assert!(OntologyRole::Contributor.can_contribute());
        assert!(!OntologyRole::Viewer.can_contribute());
    }
}
