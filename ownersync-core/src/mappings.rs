//! Local ownership data: the team and user mapping files and the CODEOWNERS
//! file that get pushed to Sentry.

use indexmap::IndexMap;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// All errors that can arise from loading the local mapping files.
#[derive(Debug, Error)]
pub enum MappingError {
    /// An I/O error, with annotated path for context.
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file was read but is not valid JSON of the expected shape.
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Convenience constructor for [`MappingError::Io`].
fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> MappingError {
    MappingError::Io {
        path: path.into(),
        source,
    }
}

/// Sentry team slug to external identities (GitHub/GitLab team names).
///
/// Entries keep the order they appear in on disk so that log output and API
/// calls line up with the file the operator edits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct TeamMap(pub IndexMap<String, Vec<String>>);

/// Organization member email to external identities (GitHub/GitLab usernames).
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct UserMap(pub IndexMap<String, Vec<String>>);

impl TeamMap {
    pub fn iter(&self) -> indexmap::map::Iter<'_, String, Vec<String>> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl UserMap {
    pub fn iter(&self) -> indexmap::map::Iter<'_, String, Vec<String>> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

pub fn load_team_map(path: &Path) -> Result<TeamMap, MappingError> {
    let raw = fs::read_to_string(path).map_err(|source| io_err(path, source))?;
    serde_json::from_str(&raw).map_err(|source| MappingError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

pub fn load_user_map(path: &Path) -> Result<UserMap, MappingError> {
    let raw = fs::read_to_string(path).map_err(|source| io_err(path, source))?;
    serde_json::from_str(&raw).map_err(|source| MappingError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Read the CODEOWNERS file verbatim; Sentry parses the rules server-side.
pub fn read_codeowners(path: &Path) -> Result<String, MappingError> {
    fs::read_to_string(path).map_err(|source| io_err(path, source))
}
