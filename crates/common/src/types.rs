use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Declares a UUID-backed identifier newtype.
///
/// Every generated type is `Copy`, serializes transparently as the UUID
/// string and converts to and from [`Uuid`].
macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Creates a new random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Wraps an existing UUID.
            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Returns the underlying UUID.
            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl From<$name> for Uuid {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

/// Declares an identifier newtype for records owned by an external registry
/// (facility codes, donor registration numbers).
macro_rules! registry_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Creates an identifier from its registry code.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Returns the registry code.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

uuid_id!(
    /// Identifier of an event-sourced aggregate (blood requests, transport jobs).
    AggregateId
);

uuid_id!(
    /// Identifier of one physically distinct blood unit.
    UnitId
);

uuid_id!(
    /// Identifier of a commitment made toward a blood request.
    CommitmentId
);

uuid_id!(
    /// Identifier of a transportation job.
    JobId
);

uuid_id!(
    /// Identifier of a collected donation awaiting or past testing.
    DonationId
);

registry_id!(
    /// Registry code of a blood bank.
    BloodBankId
);

registry_id!(
    /// Registry code of a requesting hospital.
    HospitalId
);

registry_id!(
    /// Registry code of an individual donor.
    DonorId
);

registry_id!(
    /// Registry code of a college or institution able to recruit donor cohorts.
    InstitutionId
);

impl From<JobId> for AggregateId {
    fn from(id: JobId) -> Self {
        Self(id.as_uuid())
    }
}
