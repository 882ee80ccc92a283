//! The policy engine: a pure function from `(principal, operation, label,
//! intent)` to a `Decision` (spec section 4.3). No I/O, no state.

use crate::error::DenyReason;
use crate::label::Sensitivity;
use crate::principal::Principal;

/// Every operation the mediator can ask the policy engine about.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Operation {
    GetAttr,
    ReadDir,
    Access,
    OpenRead,
    OpenWrite,
    OpenReadWrite,
    OpenAppend,
    Create,
    Unlink,
    Expurgate,
    /// A mutation of the credential store itself, issued by `securefs-admin`.
    Admin,
    /// A clearance-level change specifically, which per spec 6 additionally
    /// requires the operator's clearance to exceed both the target's current
    /// and new level (on top of the usual administrator gate).
    AdminSetLevel,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::GetAttr => "getattr",
            Self::ReadDir => "readdir",
            Self::Access => "access",
            Self::OpenRead => "open(read)",
            Self::OpenWrite => "open(write)",
            Self::OpenReadWrite => "open(rdwr)",
            Self::OpenAppend => "open(append)",
            Self::Create => "create",
            Self::Unlink => "unlink",
            Self::Expurgate => "expurgate",
            Self::Admin => "admin",
            Self::AdminSetLevel => "admin(set-level)",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operation-specific context the engine needs beyond `(principal, op, label)`.
/// Only `Expurgate` currently carries anything: the destination label.
#[derive(Clone, Copy, Debug, Default)]
pub struct Intent {
    pub destination_label: Option<Sensitivity>,
}

impl Intent {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn expurgate_to(destination_label: Sensitivity) -> Self {
        Self {
            destination_label: Some(destination_label),
        }
    }
}

/// The outcome of a policy decision.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Decision {
    Grant,
    Deny(DenyReason),
    /// Granted, but as a trusted downgrade from `from` to `to`. Only ever
    /// returned for `Expurgate` and for trusted write-down.
    GrantAsDowngrade {
        from: Sensitivity,
        to: Sensitivity,
    },
}

impl Decision {
    pub fn is_grant(self) -> bool {
        matches!(self, Self::Grant | Self::GrantAsDowngrade { .. })
    }
}

/// Decide whether `principal` may perform `operation` against an object
/// labeled `object_label`, given `intent`. Stateless and total: every call
/// with valid inputs returns exactly one `Decision`.
pub fn decide(
    principal: &Principal,
    operation: Operation,
    object_label: Sensitivity,
    intent: Intent,
) -> Decision {
    let u = principal.clearance;
    let o = object_label;
    let t = principal.trusted;

    match operation {
        Operation::GetAttr | Operation::ReadDir => Decision::Grant,

        Operation::Access | Operation::OpenRead => {
            if u >= o {
                Decision::Grant
            } else {
                Decision::Deny(DenyReason::NoReadUp)
            }
        }

        Operation::OpenWrite | Operation::OpenAppend | Operation::Create => {
            write_decision(u, o, t)
        }

        Operation::OpenReadWrite => {
            if u < o {
                return Decision::Deny(DenyReason::NoReadUp);
            }
            write_decision(u, o, t)
        }

        Operation::Unlink => {
            if u >= o {
                Decision::Grant
            } else {
                Decision::Deny(DenyReason::NoDeleteUp)
            }
        }

        Operation::Admin => {
            if principal.is_administrator() {
                Decision::Grant
            } else {
                Decision::Deny(DenyReason::NotAdministrator)
            }
        }

        // `object_label` carries the target's *current* level, `intent`
        // carries the *new* one; both must be strictly below the operator's
        // clearance, on top of the ordinary administrator gate.
        Operation::AdminSetLevel => {
            if !principal.is_administrator() {
                return Decision::Deny(DenyReason::NotAdministrator);
            }
            let new_level = match intent.destination_label {
                Some(new_level) => new_level,
                None => return Decision::Deny(DenyReason::LevelChangeNotAuthorized),
            };
            if u > o && u > new_level {
                Decision::Grant
            } else {
                Decision::Deny(DenyReason::LevelChangeNotAuthorized)
            }
        }

        Operation::Expurgate => {
            let dest = match intent.destination_label {
                Some(dest) => dest,
                None => return Decision::Deny(DenyReason::NotDowngrade),
            };
            if !t {
                return Decision::Deny(DenyReason::NotTrustedForDowngrade);
            }
            if o > dest {
                Decision::GrantAsDowngrade {
                    from: o,
                    to: dest,
                }
            } else {
                Decision::Deny(DenyReason::NotDowngrade)
            }
        }
    }
}

/// Shared "no write down, trusted downgrade otherwise" rule used by
/// `OpenWrite`, `OpenAppend`, `Create`, and the write half of `OpenReadWrite`.
fn write_decision(u: Sensitivity, o: Sensitivity, t: bool) -> Decision {
    if u <= o {
        Decision::Grant
    } else if t {
        Decision::GrantAsDowngrade { from: u, to: o }
    } else {
        Decision::Deny(DenyReason::NoWriteDown)
    }
}

/// Should a `ReadDir` entry labeled `entry_label` be visible to `principal`?
/// Per spec 4.3, entries are *always* listed (to preserve legitimate
/// no-read-up-but-write-up flows); this only decides whether the listing
/// should be audited as a higher-than-clearance visibility.
pub fn is_visible_without_annotation(principal: &Principal, entry_label: Sensitivity) -> bool {
    principal.clearance >= entry_label
}
