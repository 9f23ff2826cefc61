//! Path based HTTP Basic access control.
//!
//! The table maps path prefixes to a realm and a set of users. The longest
//! prefix matching the request path decides; the empty prefix matches
//! everything.
use std::collections::{BTreeMap, HashMap};

use base64::Engine;

#[derive(Clone, Debug, Default)]
pub struct AccessRule {
    pub realm: String,

    /// Username to password.
    pub users: HashMap<String, String>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Access {
    /// No rule covers the path.
    Open,

    Granted,

    /// Send a 401 with a challenge for this realm.
    Denied { realm: String },
}

#[derive(Clone, Debug, Default)]
pub struct AccessControl {
    rules: BTreeMap<String, AccessRule>,
}

impl AccessControl {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, prefix: impl Into<String>, rule: AccessRule) {
        self.rules.insert(prefix.into(), rule);
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    fn rule_for(&self, path: &str) -> Option<&AccessRule> {
        // BTreeMap order doesn't give us "longest prefix" directly, and the
        // tables are tiny.
        self.rules
            .iter()
            .filter(|(prefix, _)| path.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, rule)| rule)
    }

    #[must_use]
    pub fn check(&self, path: &str, username: Option<&str>, password: Option<&str>) -> Access {
        let Some(rule) = self.rule_for(path) else {
            return Access::Open;
        };
        let ok = match (username, password) {
            (Some(u), Some(p)) => rule.users.get(u).is_some_and(|want| want == p),
            _ => false,
        };
        if ok {
            Access::Granted
        } else {
            Access::Denied {
                realm: rule.realm.clone(),
            }
        }
    }
}

/// Value for a `WWW-Authenticate` header.
#[must_use]
pub fn challenge(realm: &str) -> String {
    format!("Basic realm=\"{}\"", realm.replace('"', "'"))
}

/// Decode an `Authorization: Basic ...` header into username and password.
pub(crate) fn basic_credentials(header: &str) -> Option<(String, String)> {
    let (scheme, rest) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let raw = base64::engine::general_purpose::STANDARD
        .decode(rest.trim())
        .ok()?;
    let s = String::from_utf8(raw).ok()?;
    let (user, pass) = s.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(realm: &str, users: &[(&str, &str)]) -> AccessRule {
        AccessRule {
            realm: realm.to_string(),
            users: users
                .iter()
                .map(|(u, p)| ((*u).to_string(), (*p).to_string()))
                .collect(),
        }
    }

    #[test]
    fn longest_prefix_wins() {
        let mut ac = AccessControl::new();
        ac.insert("", rule("general", &[("fred", "1942")]));
        ac.insert("/admin", rule("admin", &[("root", "toor")]));

        assert_eq!(ac.check("/", Some("fred"), Some("1942")), Access::Granted);
        assert_eq!(
            ac.check("/admin/x", Some("fred"), Some("1942")),
            Access::Denied {
                realm: "admin".to_string()
            }
        );
        assert_eq!(
            ac.check("/admin/x", Some("root"), Some("toor")),
            Access::Granted
        );
        assert_eq!(
            ac.check("/x", None, None),
            Access::Denied {
                realm: "general".to_string()
            }
        );
    }

    #[test]
    fn open_without_rule() {
        let mut ac = AccessControl::new();
        assert_eq!(ac.check("/", None, None), Access::Open);
        ac.insert("/private", rule("p", &[]));
        assert_eq!(ac.check("/public", None, None), Access::Open);
    }

    #[test]
    fn decode_basic() {
        // "fred:19:42"
        assert_eq!(
            basic_credentials("Basic ZnJlZDoxOTo0Mg=="),
            Some(("fred".to_string(), "19:42".to_string()))
        );
        assert_eq!(basic_credentials("Bearer abc"), None);
        assert_eq!(basic_credentials("Basic !!!"), None);
        assert_eq!(challenge("a\"b"), "Basic realm=\"a'b\"");
    }
}
