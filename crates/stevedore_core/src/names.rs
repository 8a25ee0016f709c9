use once_cell::sync::Lazy;
use regex::Regex;

use crate::errors::{Error, Result};

/// Maximum length of a repository path, including separators.
pub const MAX_REPOSITORY_PATH_LEN: usize = 255;

static REPOSITORY_PATH_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9]+(?:(?:\.|_|__|-+)[a-z0-9]+)*(?:/[a-z0-9]+(?:(?:\.|_|__|-+)[a-z0-9]+)*)*$")
        .unwrap()
});

static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-zA-Z0-9_][a-zA-Z0-9._-]{0,127}$").unwrap());

/// Validate a slash-separated repository path.
pub fn validate_repository_path(path: &str) -> Result<()> {
    if path.len() > MAX_REPOSITORY_PATH_LEN || !REPOSITORY_PATH_RE.is_match(path) {
        return Err(Error::RepositoryNameInvalid(path.to_string()));
    }
    Ok(())
}

/// Validate a tag name against the distribution reference grammar.
pub fn validate_tag(name: &str) -> Result<()> {
    if !TAG_RE.is_match(name) {
        return Err(Error::TagNameInvalid(name.to_string()));
    }
    Ok(())
}

/// The top-level namespace of a repository path, i.e. everything before the
/// first `/` (or the whole path for single-segment repositories).
pub fn top_level_namespace(path: &str) -> &str {
    match path.split_once('/') {
        Some((ns, _)) => ns,
        None => path,
    }
}
