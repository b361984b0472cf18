//! Stash metadata: the `meta.json` model, name validation, and the remote
//! coordinate grammar.

use serde::{Deserialize, Serialize};

use crate::error::{Result, StashError};

/// Persisted stash metadata (`.stash/meta.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StashMeta {
    /// Stable stash name; see [`validate_name`] for the accepted grammar.
    pub name: String,

    /// Optional human-readable description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Opaque remote coordinate, e.g. `github:owner/repo` or
    /// `github:owner/repo/prefix`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote: Option<String>,
}

/// Validate a stash name.
///
/// 1..64 characters from `[A-Za-z0-9._-]`, not `.` or `..`, no path
/// separators, and must not start with `.` or `-`.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 64 {
        return Err(StashError::Validation(format!(
            "stash name must be 1..64 characters, got {}",
            name.len()
        )));
    }
    if name == "." || name == ".." {
        return Err(StashError::Validation(
            "stash name may not be '.' or '..'".to_string(),
        ));
    }
    if name.starts_with('.') || name.starts_with('-') {
        return Err(StashError::Validation(format!(
            "stash name may not start with '.' or '-': '{name}'"
        )));
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
    {
        return Err(StashError::Validation(format!(
            "stash name contains invalid character '{bad}': '{name}'"
        )));
    }
    Ok(())
}

/// Parsed form of a `github:` remote coordinate.
///
/// The core only validates the shape; the path prefix is interpreted by the
/// provider and treated as opaque here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCoordinate {
    /// Repository owner.
    pub owner: String,
    /// Repository name.
    pub repo: String,
    /// Optional path prefix inside the repository.
    pub prefix: Option<String>,
}

impl RemoteCoordinate {
    /// Parse `github:<owner>/<repo>[/<pathPrefix>]`.
    pub fn parse(coordinate: &str) -> Result<Self> {
        let rest = coordinate.strip_prefix("github:").ok_or_else(|| {
            StashError::Validation(format!(
                "unsupported remote coordinate '{coordinate}' (expected github:owner/repo)"
            ))
        })?;

        let mut parts = rest.splitn(3, '/');
        let owner = parts.next().unwrap_or_default();
        let repo = parts.next().unwrap_or_default();
        if owner.is_empty() || repo.is_empty() {
            return Err(StashError::Validation(format!(
                "malformed remote coordinate '{coordinate}'"
            )));
        }
        let prefix = parts.next().filter(|p| !p.is_empty()).map(String::from);

        Ok(Self {
            owner: owner.to_string(),
            repo: repo.to_string(),
            prefix,
        })
    }
}

impl std::fmt::Display for RemoteCoordinate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.prefix {
            Some(prefix) => write!(f, "github:{}/{}/{}", self.owner, self.repo, prefix),
            None => write!(f, "github:{}/{}", self.owner, self.repo),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_names() {
        for name in ["notes", "my-stash", "a", "v1.2_x", "A".repeat(64).as_str()] {
            assert!(validate_name(name).is_ok(), "expected '{name}' valid");
        }
    }

    #[test]
    fn test_invalid_names() {
        for name in [
            "",
            ".",
            "..",
            ".hidden",
            "-flag",
            "has/slash",
            "has space",
            "A".repeat(65).as_str(),
        ] {
            assert!(validate_name(name).is_err(), "expected '{name}' invalid");
        }
    }

    #[test]
    fn test_remote_coordinate_parse() {
        let plain = RemoteCoordinate::parse("github:alice/notes").unwrap();
        assert_eq!(plain.owner, "alice");
        assert_eq!(plain.repo, "notes");
        assert_eq!(plain.prefix, None);

        let prefixed = RemoteCoordinate::parse("github:alice/notes/team/shared").unwrap();
        assert_eq!(prefixed.prefix.as_deref(), Some("team/shared"));
        assert_eq!(prefixed.to_string(), "github:alice/notes/team/shared");

        assert!(RemoteCoordinate::parse("gitlab:a/b").is_err());
        assert!(RemoteCoordinate::parse("github:only-owner").is_err());
    }

    #[test]
    fn test_meta_serde_roundtrip() {
        let meta = StashMeta {
            name: "notes".to_string(),
            description: Some("my notes".to_string()),
            remote: Some("github:alice/notes".to_string()),
        };
        let json = serde_json::to_string(&meta).unwrap();
        let back: StashMeta = serde_json::from_str(&json).unwrap();
        assert_eq!(meta, back);
        // No-description metas serialize without the key.
        let bare = StashMeta {
            name: "notes".to_string(),
            description: None,
            remote: None,
        };
        assert_eq!(serde_json::to_string(&bare).unwrap(), r#"{"name":"notes"}"#);
    }
}
