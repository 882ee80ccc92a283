//! The two disjoint error families the mediator ever produces (spec section 7).

use std::io;

use thiserror::Error;

/// Why a policy decision was denied. Carried in audit records, never shown to
/// the caller as anything other than `PERMISSION_DENIED`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Error)]
pub enum DenyReason {
    #[error("no-read-up")]
    NoReadUp,
    #[error("no-write-down")]
    NoWriteDown,
    #[error("no-delete-up")]
    NoDeleteUp,
    #[error("not-trusted-for-downgrade")]
    NotTrustedForDowngrade,
    #[error("not-a-downgrade")]
    NotDowngrade,
    #[error("not-administrator")]
    NotAdministrator,
    #[error("level-change-not-authorized")]
    LevelChangeNotAuthorized,
    #[error("unknown-principal")]
    UnknownPrincipal,
    #[error("path-escape")]
    PathEscape,
}

/// A mediated operation's outcome, kept disjoint from `io::Error` so that a
/// policy denial can never be confused with a substrate failure.
#[derive(Debug, Error)]
pub enum MediatorError {
    /// The policy engine denied the operation.
    #[error("permission denied: {0}")]
    Denied(#[source] DenyReason),
    /// The backing filesystem (or the credential store / audit sink) failed.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl MediatorError {
    /// Translate to the errno the kernel expects in a FUSE reply.
    ///
    /// Policy denials always surface as `EACCES`; substrate errors keep their
    /// own kind so a caller can distinguish "not found" from "denied".
    pub fn errno(&self) -> libc::c_int {
        match self {
            Self::Denied(DenyReason::PathEscape) => libc::EACCES,
            Self::Denied(_) => libc::EACCES,
            Self::Io(err) => match err.kind() {
                io::ErrorKind::NotFound => libc::ENOENT,
                io::ErrorKind::AlreadyExists => libc::EEXIST,
                io::ErrorKind::PermissionDenied => libc::EACCES,
                _ => match err.raw_os_error() {
                    Some(errno) => errno,
                    None => libc::EIO,
                },
            },
        }
    }
}

/// Result alias used throughout the mediator.
pub type Result<T> = std::result::Result<T, MediatorError>;
