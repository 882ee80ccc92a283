//! The credential store: a human-editable `{name: {level, trusted}}` document
//! (spec section 6). Read-only from the mediator's perspective; the
//! administrative CLI is the only writer.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;

use crate::principal::PrincipalRecord;

/// An in-memory snapshot of the credential store, loaded fresh on every read
/// (the [`PrincipalResolver`](crate::principal::PrincipalResolver) never
/// caches one of these across operations).
#[derive(Clone, Debug, Default)]
pub struct CredentialStore {
    principals: BTreeMap<String, PrincipalRecord>,
}

impl CredentialStore {
    pub fn from_map(principals: BTreeMap<String, PrincipalRecord>) -> Self {
        Self { principals }
    }

    /// Load the store from `path`. A missing file is treated as an empty
    /// store (every principal then falls back to the synthetic default),
    /// matching the original's behavior when `users.json` does not exist yet.
    pub fn load(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(err) => return Err(err),
        };
        let principals: BTreeMap<String, PrincipalRecord> = serde_json::from_str(&contents)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        Ok(Self { principals })
    }

    /// Write the store back to `path`, pretty-printed so it stays
    /// human-editable, creating parent directories as needed.
    pub fn save(&self, path: impl AsRef<Path>) -> io::Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(&self.principals)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        fs::write(path, contents)
    }

    pub fn get(&self, name: &str) -> Option<&PrincipalRecord> {
        self.principals.get(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, record: PrincipalRecord) {
        self.principals.insert(name.into(), record);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.principals.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &PrincipalRecord)> {
        self.principals.iter()
    }
}
