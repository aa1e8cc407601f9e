use std::fmt::{Display, Formatter};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Shown in place of an address the identity directory could not resolve.
pub const EMAIL_UNAVAILABLE: &str = "Email no disponible";

/// Access tier of a principal. Closed on purpose: anything else fails to parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    User,
    Admin,
}

impl Role {
    pub fn is_admin(self) -> bool { matches!(self, Role::Admin) }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Admin => "admin",
        }
    }

    /// Landing page for this role.
    pub fn home(self) -> &'static str {
        match self {
            Role::User => super::USER_HOME,
            Role::Admin => super::ADMIN_HOME,
        }
    }
}

impl Display for Role {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "admin" => Ok(Role::Admin),
            other => Err(format!("unknown role '{}'", other)),
        }
    }
}

/// Application-level user record, one per identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Profile {
    pub id: String,
    pub name: String,
    pub role: Role,
    pub created_at: DateTime<Utc>,
}

/// A profile joined with the email resolved from the identity directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserRow {
    #[serde(flatten)]
    pub profile: Profile,
    pub email: String,
}

impl UserRow {
    pub fn new(profile: Profile, email: Option<String>) -> Self {
        let email = email
            .filter(|e| !e.trim().is_empty())
            .unwrap_or_else(|| EMAIL_UNAVAILABLE.to_string());
        Self { profile, email }
    }

    pub fn id(&self) -> &str { &self.profile.id }
}
