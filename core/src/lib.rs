//! Core library for the label-aware, Bell-LaPadula-mediated passthrough
//! filesystem: label inference, principal resolution, the policy engine,
//! the audit sink, the credential store, and the `fuser` mediator that ties
//! them together. The three binaries (`securefs-mount`, `securefs-admin`,
//! `securefs-shell`) are thin clients of this crate.

pub mod audit;
pub mod error;
pub mod label;
pub mod mediator;
pub mod policy;
pub mod principal;
pub mod store;

pub use audit::{AuditRecord, AuditSink};
pub use error::{DenyReason, MediatorError, Result};
pub use label::{label_of, Sensitivity};
pub use mediator::Mediator;
pub use policy::{decide, Decision, Intent, Operation};
pub use principal::{
    EnvIdentity, FixedIdentity, IdentitySource, Principal, PrincipalRecord, PrincipalResolver,
    SessionFileIdentity,
};
pub use store::CredentialStore;

/// Default paths the three binaries agree on relative to a backing
/// directory, so `securefs-mount`, `securefs-admin`, and `securefs-shell`
/// find the same state without needing to be told three times.
pub mod layout {
    use std::path::{Path, PathBuf};

    const STATE_DIR: &str = ".securefs";

    pub fn state_dir(backing: &Path) -> PathBuf {
        backing.join(STATE_DIR)
    }

    pub fn credentials_path(backing: &Path) -> PathBuf {
        state_dir(backing).join("users.json")
    }

    pub fn audit_log_path(backing: &Path) -> PathBuf {
        state_dir(backing).join("audit.log")
    }

    pub fn session_path(backing: &Path) -> PathBuf {
        state_dir(backing).join("session.env")
    }
}
