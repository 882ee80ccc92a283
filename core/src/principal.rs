//! Principals and the resolver that turns "who is calling right now" into a
//! `Principal`, re-consulting the credential store on every call (spec 4.2).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::label::Sensitivity;
use crate::store::CredentialStore;

/// The fallback entry consulted when the caller's identity is unset or
/// unknown to the store.
pub const DEFAULT_USER: &str = "default_user";

/// An authenticated user: a name, a clearance, and a discretionary trust bit.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Principal {
    pub name: String,
    pub clearance: Sensitivity,
    pub trusted: bool,
}

impl Principal {
    /// The synthetic principal returned when no identity can be resolved at
    /// all: `{UNCLASSIFIED, untrusted}`. Never fails, per the resolver's
    /// contract.
    pub fn synthetic_unclassified(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            clearance: Sensitivity::Unclassified,
            trusted: false,
        }
    }

    /// Only a `TOP_SECRET` + trusted principal may administer other
    /// principals' labels and trust.
    pub fn is_administrator(&self) -> bool {
        self.trusted && self.clearance == Sensitivity::TopSecret
    }
}

/// The on-disk shape of one credential-store entry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PrincipalRecord {
    pub level: String,
    #[serde(default)]
    pub trusted: bool,
}

impl PrincipalRecord {
    pub fn new(level: Sensitivity, trusted: bool) -> Self {
        Self {
            level: level.as_str().to_string(),
            trusted,
        }
    }

    pub fn clearance(&self) -> Sensitivity {
        Sensitivity::parse(&self.level).unwrap_or(Sensitivity::Unclassified)
    }
}

/// Where the resolver reads "who is calling" from. A thin seam: the
/// production mount binds this to the `USER` environment variable (refreshed
/// via the session file), tests bind it to a fixed string. No hidden globals.
pub trait IdentitySource: Send + Sync {
    fn current_identity(&self) -> Option<String>;
}

/// Reads identity from the `USER` environment variable. The mount's session
/// file is loaded into the process environment before each mediated
/// operation span begins, so this naturally picks up `login` changes.
#[derive(Default)]
pub struct EnvIdentity;

impl IdentitySource for EnvIdentity {
    fn current_identity(&self) -> Option<String> {
        std::env::var("USER").ok()
    }
}

/// A fixed identity, for deterministic tests.
pub struct FixedIdentity(pub String);

impl IdentitySource for FixedIdentity {
    fn current_identity(&self) -> Option<String> {
        Some(self.0.clone())
    }
}

/// Reads identity from a session file (one username per line), falling back
/// to `$USER` if the file is absent or empty. `securefs-shell login` rewrites
/// this file so the *next* mediated operation observes the new identity
/// without anyone restarting the mount process - the resolver re-reads it on
/// every call, same as the credential store.
pub struct SessionFileIdentity {
    session_path: PathBuf,
}

impl SessionFileIdentity {
    pub fn new(session_path: impl Into<PathBuf>) -> Self {
        Self {
            session_path: session_path.into(),
        }
    }
}

impl IdentitySource for SessionFileIdentity {
    fn current_identity(&self) -> Option<String> {
        std::fs::read_to_string(&self.session_path)
            .ok()
            .map(|contents| contents.trim().to_string())
            .filter(|s| !s.is_empty())
            .or_else(|| std::env::var("USER").ok())
    }
}

/// Resolves the current principal by re-reading the credential store on
/// every call. Caching is forbidden here: it is what lets a long-running
/// mount observe administrative changes without a remount.
pub struct PrincipalResolver {
    identity: Arc<dyn IdentitySource>,
    store_path: PathBuf,
}

impl PrincipalResolver {
    pub fn new(identity: Arc<dyn IdentitySource>, store_path: impl Into<PathBuf>) -> Self {
        Self {
            identity,
            store_path: store_path.into(),
        }
    }

    /// Convenience constructor for the common case: identity from `$USER`.
    pub fn from_env(store_path: impl Into<PathBuf>) -> Self {
        Self::new(Arc::new(EnvIdentity), store_path)
    }

    /// Convenience constructor for a mount rooted at `backing`: identity
    /// comes from its session file (falling back to `$USER`), credentials
    /// from its well-known store path.
    pub fn from_backing(backing: &Path) -> Self {
        Self::new(
            Arc::new(SessionFileIdentity::new(crate::layout::session_path(backing))),
            crate::layout::credentials_path(backing),
        )
    }

    pub fn store_path(&self) -> &Path {
        &self.store_path
    }

    /// Resolve the current principal. Never fails: any I/O error reading the
    /// store, or an unknown identity, degrades to the synthetic
    /// unclassified/untrusted principal (after trying `default_user`).
    pub fn current_principal(&self) -> Principal {
        let name = self
            .identity
            .current_identity()
            .unwrap_or_else(|| DEFAULT_USER.to_string());

        let store = match CredentialStore::load(&self.store_path) {
            Ok(store) => store,
            Err(err) => {
                tracing::warn!(error = %err, path = %self.store_path.display(), "failed to read credential store, falling back to unclassified");
                return Principal::synthetic_unclassified(name);
            }
        };

        if let Some(record) = store.get(&name) {
            return Principal {
                name,
                clearance: record.clearance(),
                trusted: record.trusted,
            };
        }
        if let Some(record) = store.get(DEFAULT_USER) {
            return Principal {
                name,
                clearance: record.clearance(),
                trusted: record.trusted,
            };
        }
        Principal::synthetic_unclassified(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::CredentialStore;
    use std::collections::BTreeMap;

    fn store_with(entries: &[(&str, Sensitivity, bool)]) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.json");
        let mut map = BTreeMap::new();
        for (name, level, trusted) in entries {
            map.insert(name.to_string(), PrincipalRecord::new(*level, *trusted));
        }
        CredentialStore::from_map(map).save(&path).unwrap();
        (dir, path)
    }

    #[test]
    fn resolves_known_user() {
        let (_dir, path) = store_with(&[("alice", Sensitivity::Secret, false)]);
        let resolver = PrincipalResolver::new(Arc::new(FixedIdentity("alice".into())), path);
        let p = resolver.current_principal();
        assert_eq!(p.clearance, Sensitivity::Secret);
        assert!(!p.trusted);
    }

    #[test]
    fn falls_back_to_default_user() {
        let (_dir, path) = store_with(&[("default_user", Sensitivity::Confidential, false)]);
        let resolver = PrincipalResolver::new(Arc::new(FixedIdentity("mallory".into())), path);
        let p = resolver.current_principal();
        assert_eq!(p.clearance, Sensitivity::Confidential);
    }

    #[test]
    fn falls_back_to_synthetic_when_store_missing() {
        let resolver = PrincipalResolver::new(
            Arc::new(FixedIdentity("nobody".into())),
            PathBuf::from("/nonexistent/users.json"),
        );
        let p = resolver.current_principal();
        assert_eq!(p.clearance, Sensitivity::Unclassified);
        assert!(!p.trusted);
    }

    #[test]
    fn freshness_observes_mutation_immediately() {
        let (_dir, path) = store_with(&[("alice", Sensitivity::Confidential, false)]);
        let resolver = PrincipalResolver::new(Arc::new(FixedIdentity("alice".into())), path.clone());
        assert_eq!(
            resolver.current_principal().clearance,
            Sensitivity::Confidential
        );

        let mut store = CredentialStore::load(&path).unwrap();
        store.insert("alice", PrincipalRecord::new(Sensitivity::TopSecret, true));
        store.save(&path).unwrap();

        let p = resolver.current_principal();
        assert_eq!(p.clearance, Sensitivity::TopSecret);
        assert!(p.trusted);
    }
}
