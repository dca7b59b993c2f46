//! User and role records.

use std::fmt;
use std::str::FromStr;
use serde::{Deserialize, Serialize};

/// The closed set of role names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoleName {
    Guest,
    User,
    Developer,
}

impl RoleName {
    pub fn as_str(self) -> &'static str {
        match self {
            RoleName::Guest => "guest",
            RoleName::User => "user",
            RoleName::Developer => "developer",
        }
    }
}

impl fmt::Display for RoleName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown role name: {0}")]
pub struct UnknownRole(pub String);

impl FromStr for RoleName {
    type Err = UnknownRole;

    /// Case-insensitive.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "guest" => Ok(RoleName::Guest),
            "user" => Ok(RoleName::User),
            "developer" => Ok(RoleName::Developer),
            _ => Err(UnknownRole(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub user_id: String,
    pub username: String,
    pub role: RoleName,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub id: i64,
    pub name: RoleName,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_name_parsing() {
        assert_eq!("Developer".parse::<RoleName>(), Ok(RoleName::Developer));
        assert_eq!("guest".parse::<RoleName>(), Ok(RoleName::Guest));
        assert!("admin".parse::<RoleName>().is_err());
    }

    #[test]
    fn test_role_serializes_lowercase() {
        let role = Role {
            id: 3,
            name: RoleName::Developer,
        };
        assert_eq!(
            serde_json::to_string(&role).unwrap(),
            r#"{"id":3,"name":"developer"}"#
        );
    }
}
