//! Resource identifiers and stage names.

use derive_more::Display;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use uuid::Uuid;

use crate::{Error, Result};

/// A unique identifier for any resource in the system.
/// Uses UUIDv7 for time-ordered, sortable IDs.
///
/// Jobs, queue messages, payloads, events and dead letters all share this one
/// key type so that no table ever needs a conversion between id formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display)]
#[display("{_0}")]
#[serde(transparent)]
pub struct ResourceId(Uuid);

impl ResourceId {
    /// Create a new unique ResourceId using UUIDv7.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Create a ResourceId from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ResourceId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for ResourceId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl From<ResourceId> for Uuid {
    fn from(id: ResourceId) -> Self {
        id.0
    }
}

impl std::str::FromStr for ResourceId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

static STAGE_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z][a-z0-9_-]{0,63}$").expect("stage name pattern is valid")
});

/// Name of a pipeline stage, which is also the name of its queue.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display)]
#[display("{_0}")]
#[serde(try_from = "String", into = "String")]
pub struct StageName(String);

impl StageName {
    /// Reserved name under which intake stores a job's initial payload.
    pub const INTAKE: &'static str = "intake";

    /// Validate and wrap a stage name.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if !STAGE_NAME_RE.is_match(&name) {
            return Err(Error::InvalidInput(format!(
                "stage name '{}' must match {}",
                name,
                STAGE_NAME_RE.as_str()
            )));
        }
        Ok(Self(name))
    }

    /// The name used for a job's intake payload.
    pub fn intake() -> Self {
        Self(Self::INTAKE.to_string())
    }

    pub fn is_intake(&self) -> bool {
        self.0 == Self::INTAKE
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for StageName {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl TryFrom<&str> for StageName {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self> {
        Self::new(value)
    }
}

impl From<StageName> for String {
    fn from(name: StageName) -> Self {
        name.0
    }
}

impl AsRef<str> for StageName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::str::FromStr for StageName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}
