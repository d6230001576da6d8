use serde::{Deserialize, Serialize};

use crate::controls::Access;
use crate::ids::{TeamId, UserId};

/// Facts published after a unit of work commits.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "event")]
pub enum DomainEvent {
    AccountCreated { user_id: UserId },
    EmailAdded { email: String },
    EmailRemoved { email: String },
    EmailVerified { user_id: UserId },
    EmailChangeRequested { user_id: UserId, new_email: String },
    AffiliationRequested { user_id: UserId, team_id: TeamId, access: Access },
    AffiliationApproved { user_id: UserId, team_id: TeamId, access: Access },
    OntologyVersionCreated { version_id: u64 },
    UploadCompleted { user_id: UserId, reference_id: i64, uuid: String },
    UploadFailed { user_id: UserId, reference_id: i64, uuid: String },
    FileReferenceDeleted { uuid: String },
}

impl DomainEvent {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::AccountCreated { .. } => "AccountCreated",
            Self::EmailAdded { .. } => "EmailAdded",
            Self::EmailRemoved { .. } => "EmailRemoved",
            Self::EmailVerified { .. } => "EmailVerified",
            Self::EmailChangeRequested { .. } => "EmailChangeRequested",
            Self::AffiliationRequested { .. } => "AffiliationRequested",
            Self::AffiliationApproved { .. } => "AffiliationApproved",
            Self::OntologyVersionCreated { .. } => "OntologyVersionCreated",
            Self::UploadCompleted { .. } => "UploadCompleted",
            Self::UploadFailed { .. } => "UploadFailed",
            Self::FileReferenceDeleted { .. } => "FileReferenceDeleted",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_their_name_as_tag() -> Result<(), serde_json::Error> {
        let event = DomainEvent::AffiliationRequested {
            user_id: UserId(2),
            team_id: TeamId(5),
            access: Access::Read,
        };
        let value = serde_json::to_value(&event)?;
        assert_eq!(value["event"], event.name());
        assert_eq!(value["access"], "READ");
        assert_eq!(serde_json::from_value::<DomainEvent>(value)?, event);
        Ok(())
    }
}
