use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }

        impl From<$name> for Uuid {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

uuid_id!(
    /// Identity of a change ticket
    TicketId
);
uuid_id!(
    /// Identity of one required sign-off
    ApprovalId
);
uuid_id!(CommentId);
uuid_id!(AuditEntryId);
uuid_id!(
    /// Tenant boundary; ticket numbers are unique per organization
    OrganizationId
);
uuid_id!(
    /// A human or service principal acting on the system
    ActorId
);

impl PartialEq<Uuid> for ActorId {
    fn eq(&self, other: &Uuid) -> bool {
        self.0 == *other
    }
}
