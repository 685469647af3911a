//! Numeric identifiers.
//!
//! Repositories, users, installations and check runs are identified by the
//! IDs GitHub assigns them. Builds use the database sequence.

use derive_more::{Display, From};
use serde::{Deserialize, Serialize};

macro_rules! numeric_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display, From,
        )]
        #[serde(transparent)]
        #[display("{_0}")]
        pub struct $name(i64);

        impl $name {
            pub const fn new(id: i64) -> Self {
                Self(id)
            }

            /// Get the underlying integer.
            pub const fn get(self) -> i64 {
                self.0
            }
        }

        impl From<$name> for i64 {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl std::str::FromStr for $name {
            type Err = std::num::ParseIntError;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                Ok(Self(s.parse()?))
            }
        }
    };
}

numeric_id!(
    /// Identifier of a build row.
    BuildId
);
numeric_id!(
    /// GitHub repository ID.
    RepoId
);
numeric_id!(
    /// GitHub account ID of the repository owner.
    UserId
);
numeric_id!(
    /// GitHub App installation ID; selects the credential used for a build.
    InstallationId
);
numeric_id!(
    /// GitHub Check Run ID, assigned by GitHub on creation.
    CheckRunId
);
