use crate::error::{Result, StoreError};
use crate::visibility::is_token_byte;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use zeroize::Zeroizing;

/// Administrative privileges a principal may hold on a store instance.
///
/// Semantics:
/// - `Admin` implies every other permission.
/// - `CreateTable` / `DropTable` gate table administration only; reading and
///   writing existing tables needs no system permission.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SystemPermission {
    Admin,
    CreateTable,
    DropTable,
}

impl fmt::Display for SystemPermission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SystemPermission::Admin => write!(f, "admin"),
            SystemPermission::CreateTable => write!(f, "create_table"),
            SystemPermission::DropTable => write!(f, "drop_table"),
        }
    }
}

/// Checks whether `granted` satisfies `required`, honoring `Admin`.
pub fn has_permission(granted: &BTreeSet<SystemPermission>, required: SystemPermission) -> bool {
    granted.contains(&SystemPermission::Admin) || granted.contains(&required)
}

/// The set of access tokens a reader presents when scanning.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Authorizations {
    tokens: BTreeSet<String>,
}

impl Authorizations {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Accepts any non-empty token, including ones that need quoting inside a
    /// label expression.
    pub fn new<I, T>(tokens: I) -> Result<Self>
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let mut out = BTreeSet::new();
        for token in tokens {
            let token = token.into();
            if token.is_empty() {
                return Err(StoreError::InvalidVisibility {
                    expression: token,
                    position: 0,
                    reason: "authorization token must not be empty".into(),
                });
            }
            out.insert(token);
        }
        Ok(Self { tokens: out })
    }

    /// Parses a comma separated list such as `"public,audit"`. Empty entries
    /// are skipped; entries must use the unquoted token alphabet.
    pub fn parse(list: &str) -> Result<Self> {
        let mut tokens = BTreeSet::new();
        let mut offset = 0;
        for raw in list.split(',') {
            if let Some(bad) = raw.bytes().position(|b| !is_token_byte(b)) {
                return Err(StoreError::InvalidVisibility {
                    expression: list.to_string(),
                    position: offset + bad,
                    reason: format!("invalid character in authorization '{raw}'"),
                });
            }
            if !raw.is_empty() {
                tokens.insert(raw.to_string());
            }
            offset += raw.len() + 1;
        }
        Ok(Self { tokens })
    }

    pub fn contains(&self, token: &str) -> bool {
        self.tokens.contains(token)
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.tokens.iter().map(String::as_str)
    }

    pub fn is_subset_of(&self, other: &Authorizations) -> bool {
        self.tokens.is_subset(&other.tokens)
    }

    /// Tokens held here but missing from `granted`.
    pub fn missing_from<'a>(&'a self, granted: &'a Authorizations) -> Vec<&'a str> {
        self.tokens
            .difference(&granted.tokens)
            .map(String::as_str)
            .collect()
    }
}

impl fmt::Display for Authorizations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for token in &self.tokens {
            if !first {
                f.write_str(",")?;
            }
            first = false;
            f.write_str(token)?;
        }
        Ok(())
    }
}

/// Login for a cluster endpoint. The password is wiped from memory on drop.
#[derive(Clone)]
pub struct Credentials {
    pub user: String,
    password: Zeroizing<String>,
}

impl Credentials {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: Zeroizing::new(password.into()),
        }
    }

    pub fn password(&self) -> &str {
        self.password.as_str()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreErrorCode;

    #[test]
    fn parse_skips_empty_entries() {
        let auths = Authorizations::parse("public,,audit,").expect("parse");
        assert_eq!(auths.len(), 2);
        assert!(auths.contains("public"));
        assert!(auths.contains("audit"));
        assert_eq!(auths.to_string(), "audit,public");
        assert!(Authorizations::parse("").expect("empty").is_empty());
    }

    #[test]
    fn parse_rejects_characters_outside_token_alphabet() {
        let err = Authorizations::parse("ok,not ok").expect_err("space");
        assert_eq!(err.code(), StoreErrorCode::InvalidVisibilityLabel);
        match err {
            StoreError::InvalidVisibility { position, .. } => assert_eq!(position, 6),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn new_accepts_quoted_style_tokens_but_not_empty() {
        let auths = Authorizations::new(["two words"]).expect("new");
        assert!(auths.contains("two words"));
        assert!(Authorizations::new([""]).is_err());
    }

    #[test]
    fn subset_and_missing_tokens() {
        let granted = Authorizations::parse("a,b,c").expect("granted");
        let requested = Authorizations::parse("b,d").expect("requested");
        assert!(!requested.is_subset_of(&granted));
        assert_eq!(requested.missing_from(&granted), vec!["d"]);
        assert!(Authorizations::empty().is_subset_of(&granted));
    }

    #[test]
    fn admin_implies_every_permission() {
        let admin = BTreeSet::from([SystemPermission::Admin]);
        assert!(has_permission(&admin, SystemPermission::DropTable));
        let creator = BTreeSet::from([SystemPermission::CreateTable]);
        assert!(has_permission(&creator, SystemPermission::CreateTable));
        assert!(!has_permission(&creator, SystemPermission::DropTable));
    }

    #[test]
    fn credentials_debug_redacts_password() {
        let creds = Credentials::new("meter_ingest", "hunter2");
        assert_eq!(creds.password(), "hunter2");
        let rendered = format!("{creds:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("meter_ingest"));
    }
}
