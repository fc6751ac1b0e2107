use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Error type for repository coordinate parsing
#[derive(Debug, Error)]
pub enum ReferenceError {
    #[error("Invalid repository coordinate {0:?}: expected host/path")]
    InvalidFormat(String),
    #[error("Invalid tag {0:?}")]
    InvalidTag(String),
}

const MAX_TAG_LEN: usize = 128;

/// Check a tag against the registry grammar `[A-Za-z0-9_][A-Za-z0-9_.-]{0,127}`.
pub fn validate_tag(tag: &str) -> Result<(), ReferenceError> {
    let mut chars = tag.chars();
    let valid = match chars.next() {
        Some(first) => {
            (first.is_ascii_alphanumeric() || first == '_')
                && tag.len() <= MAX_TAG_LEN
                && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        }
        None => false,
    };

    if valid {
        Ok(())
    } else {
        Err(ReferenceError::InvalidTag(tag.to_string()))
    }
}

/// Where an image lives: a registry host and a repository path on it.
///
/// Parsed from `host/path` by splitting on the first `/`. A leading
/// `http://` or `https://` stays attached to the host so the transport can
/// honour it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryCoordinate {
    /// Registry host, optionally with scheme and port
    pub registry_host: String,
    /// Repository path on the registry, e.g. `ns/svc`
    pub repository: String,
}

impl RepositoryCoordinate {
    pub fn new(registry_host: impl Into<String>, repository: impl Into<String>) -> Self {
        Self {
            registry_host: registry_host.into(),
            repository: repository.into(),
        }
    }

    /// Final path segment of the repository, used as the service identifier.
    pub fn service_identifier(&self) -> &str {
        self.repository
            .rsplit('/')
            .next()
            .unwrap_or(&self.repository)
    }
}

impl FromStr for RepositoryCoordinate {
    type Err = ReferenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim().trim_end_matches('/');
        let (scheme, rest) = match trimmed.split_once("://") {
            Some((scheme, rest)) if scheme == "http" || scheme == "https" => {
                (Some(scheme), rest)
            }
            Some(_) => return Err(ReferenceError::InvalidFormat(s.to_string())),
            None => (None, trimmed),
        };

        let (host, repository) = rest
            .split_once('/')
            .ok_or_else(|| ReferenceError::InvalidFormat(s.to_string()))?;

        if host.is_empty() || repository.is_empty() || repository.split('/').any(str::is_empty) {
            return Err(ReferenceError::InvalidFormat(s.to_string()));
        }

        let registry_host = match scheme {
            Some(scheme) => format!("{}://{}", scheme, host),
            None => host.to_string(),
        };

        Ok(Self {
            registry_host,
            repository: repository.to_string(),
        })
    }
}

impl fmt::Display for RepositoryCoordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry_host, self.repository)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_first_separator() {
        let coord: RepositoryCoordinate = "myhost/ns/svc".parse().unwrap();
        assert_eq!(coord.registry_host, "myhost");
        assert_eq!(coord.repository, "ns/svc");
        assert_eq!(coord.service_identifier(), "svc");
    }

    #[test]
    fn keeps_scheme_and_port_with_host() {
        let coord: RepositoryCoordinate = "https://registry.local:5000/team/api-gateway".parse().unwrap();
        assert_eq!(coord.registry_host, "https://registry.local:5000");
        assert_eq!(coord.repository, "team/api-gateway");
        assert_eq!(coord.service_identifier(), "api-gateway");
        assert_eq!(coord.to_string(), "https://registry.local:5000/team/api-gateway");
    }

    #[test]
    fn single_segment_repository() {
        let coord: RepositoryCoordinate = "localhost:5000/svc".parse().unwrap();
        assert_eq!(coord.service_identifier(), "svc");
    }

    #[test]
    fn tag_grammar() {
        for tag in ["v1.2.3", "latest", "_build-42", "2024.01.01"] {
            assert!(validate_tag(tag).is_ok(), "{tag:?} should be valid");
        }
        for tag in ["", "-v1", ".hidden", "v1:2", "a/b", "with space"] {
            assert!(validate_tag(tag).is_err(), "{tag:?} should be rejected");
        }
        assert!(validate_tag(&"a".repeat(129)).is_err());
    }

    #[test]
    fn rejects_malformed_coordinates() {
        for input in ["svc", "/ns/svc", "host/", "host//svc", "ftp://host/svc", ""] {
            assert!(
                input.parse::<RepositoryCoordinate>().is_err(),
                "{input:?} should not parse"
            );
        }
    }
}
