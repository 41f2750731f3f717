//! Versions, revisions and the change an application is rolling out.

use crate::{Error, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A platform release version.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    #[serde(default)]
    pub micro: u32,
}

impl Version {
    pub fn new(major: u32, minor: u32) -> Self {
        Self {
            major,
            minor,
            micro: 0,
        }
    }

    pub fn with_micro(mut self, micro: u32) -> Self {
        self.micro = micro;
        self
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.micro)
    }
}

impl std::str::FromStr for Version {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidVersion(s.to_string());
        let parts = s
            .trim()
            .split('.')
            .map(|part| part.parse::<u32>().map_err(|_| invalid()))
            .collect::<Result<Vec<_>>>()?;

        match parts.as_slice() {
            [major] => Ok(Self::new(*major, 0)),
            [major, minor] => Ok(Self::new(*major, *minor)),
            [major, minor, micro] => Ok(Self::new(*major, *minor).with_micro(*micro)),
            _ => Err(invalid()),
        }
    }
}

/// A submitted build of an application package.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub struct ApplicationRevision {
    pub build_number: u64,
    #[serde(default)]
    pub source: Option<String>,
}

impl ApplicationRevision {
    pub fn new(build_number: u64) -> Self {
        Self {
            build_number,
            source: None,
        }
    }
}

impl fmt::Display for ApplicationRevision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(source) => write!(f, "build {} ({})", self.build_number, source),
            None => write!(f, "build {}", self.build_number),
        }
    }
}

/// The version or revision an application is currently rolling out.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Change {
    Platform(Version),
    Application(ApplicationRevision),
}

impl Change {
    pub fn platform(&self) -> Option<Version> {
        match self {
            Change::Platform(version) => Some(*version),
            Change::Application(_) => None,
        }
    }

    /// Whether this is a platform upgrade to a version older than `version`.
    pub fn is_older_platform_than(&self, version: &Version) -> bool {
        self.platform().is_some_and(|current| current < *version)
    }
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Change::Platform(version) => write!(f, "platform {}", version),
            Change::Application(revision) => write!(f, "application {}", revision),
        }
    }
}
