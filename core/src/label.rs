//! Label inference: a pure, total function from a path to a [`Sensitivity`].

use std::path::{Component, Path};

/// The four Bell-LaPadula sensitivity levels, totally ordered ascending.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(u8)]
pub enum Sensitivity {
    Unclassified = 0,
    Confidential = 1,
    Secret = 2,
    TopSecret = 3,
}

impl Sensitivity {
    /// All four levels, descending. Used by [`label_of`] to scan high-to-low.
    const DESCENDING: [Sensitivity; 4] = [
        Sensitivity::TopSecret,
        Sensitivity::Secret,
        Sensitivity::Confidential,
        Sensitivity::Unclassified,
    ];

    /// The path-segment token this level matches against (`"top_secret"`, ...).
    fn token(self) -> &'static str {
        match self {
            Self::Unclassified => "unclassified",
            Self::Confidential => "confidential",
            Self::Secret => "secret",
            Self::TopSecret => "top_secret",
        }
    }

    /// Parse the credential-store / CLI spelling (`"TOP_SECRET"`, case-insensitive).
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "UNCLASSIFIED" => Some(Self::Unclassified),
            "CONFIDENTIAL" => Some(Self::Confidential),
            "SECRET" => Some(Self::Secret),
            "TOP_SECRET" => Some(Self::TopSecret),
            _ => None,
        }
    }

    /// The credential-store / CLI spelling (`"TOP_SECRET"`).
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unclassified => "UNCLASSIFIED",
            Self::Confidential => "CONFIDENTIAL",
            Self::Secret => "SECRET",
            Self::TopSecret => "TOP_SECRET",
        }
    }
}

impl std::fmt::Display for Sensitivity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Does `segment` (already lowercased) name `level`, either exactly or as a
/// `<level>_`-prefixed compound (`secret_plans`)? Matching is strictly on
/// whole segments, never on substrings of a segment - `topsecret_legacy.txt`
/// does not match `top_secret` (see spec section 9).
fn segment_matches(segment: &str, level: Sensitivity) -> bool {
    let token = level.token();
    segment == token || segment.starts_with(&format!("{token}_"))
}

/// Collapse `.` and `..` components lexically, the way the spec's
/// normalization step requires. Does not touch the filesystem: a `..` past
/// the root simply has nothing left to pop.
fn normalized_segments(path: &Path) -> Vec<String> {
    let mut stack: Vec<String> = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(os) => stack.push(os.to_string_lossy().to_ascii_lowercase()),
            Component::ParentDir => {
                stack.pop();
            }
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
        }
    }
    stack
}

/// Infer the sensitivity of a path. Total and deterministic: every path
/// string yields exactly one of the four levels. Accepts either a backing
/// path or a virtual path - inference only looks at segment names, so it is
/// insensitive to whatever prefix precedes the labeled directory.
pub fn label_of(path: impl AsRef<Path>) -> Sensitivity {
    let segments = normalized_segments(path.as_ref());

    for level in Sensitivity::DESCENDING {
        if segments.iter().any(|seg| segment_matches(seg, level)) {
            return level;
        }
    }
    Sensitivity::Unclassified
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlabeled_path_is_unclassified() {
        assert_eq!(label_of("/home/alice/notes.txt"), Sensitivity::Unclassified);
    }

    #[test]
    fn exact_segment_match() {
        assert_eq!(label_of("/mnt/secret/memo"), Sensitivity::Secret);
        assert_eq!(label_of("/mnt/top_secret/memo"), Sensitivity::TopSecret);
    }

    #[test]
    fn prefix_compound_match() {
        assert_eq!(label_of("/mnt/secret_plans/q3.txt"), Sensitivity::Secret);
    }

    #[test]
    fn descending_tie_break_prefers_highest_ancestor() {
        assert_eq!(
            label_of("/mnt/top_secret/secret/memo"),
            Sensitivity::TopSecret
        );
        assert_eq!(
            label_of("/mnt/secret/top_secret/memo"),
            Sensitivity::TopSecret
        );
    }

    #[test]
    fn case_insensitive() {
        assert_eq!(label_of("/mnt/SECRET/memo"), Sensitivity::Secret);
    }

    #[test]
    fn does_not_match_substrings() {
        // topsecret_legacy.txt under unclassified/ must not be misclassified -
        // it is neither exactly "top_secret" nor "top_secret_"-prefixed.
        assert_eq!(
            label_of("/mnt/unclassified/topsecret_legacy.txt"),
            Sensitivity::Unclassified
        );
    }

    #[test]
    fn dotdot_cancels_preceding_segment() {
        assert_eq!(
            label_of("/mnt/secret/../confidential/file"),
            Sensitivity::Confidential
        );
    }

    #[test]
    fn root_is_unclassified() {
        assert_eq!(label_of("/"), Sensitivity::Unclassified);
        assert_eq!(label_of(""), Sensitivity::Unclassified);
    }

    #[test]
    fn ordering_is_ascending() {
        assert!(Sensitivity::Unclassified < Sensitivity::Confidential);
        assert!(Sensitivity::Confidential < Sensitivity::Secret);
        assert!(Sensitivity::Secret < Sensitivity::TopSecret);
    }
}
