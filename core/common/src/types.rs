//! Common types used throughout recsync.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Client-generated identity of one queued mutation.
///
/// Generated once when the write is made and never reused. It is the only
/// key used to remove a mutation after the server acknowledges it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocalId(String);

impl LocalId {
    /// Generate a fresh, globally unique id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Wrap an existing id string.
    ///
    /// # Errors
    /// - Returns error if id is empty
    pub fn new(id: impl Into<String>) -> crate::Result<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(crate::Error::InvalidInput(
                "LocalId cannot be empty".to_string(),
            ));
        }
        Ok(Self(id))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Write operation a queued mutation performs on the remote API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MutationMethod {
    /// Create a new record.
    Create,
    /// Overwrite fields of an existing record.
    Update,
    /// Remove a record.
    Delete,
}

impl MutationMethod {
    /// Whether the mutation carries record data that can be shown locally.
    pub fn carries_payload(&self) -> bool {
        matches!(self, MutationMethod::Create | MutationMethod::Update)
    }

    /// Wire name of the method.
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationMethod::Create => "CREATE",
            MutationMethod::Update => "UPDATE",
            MutationMethod::Delete => "DELETE",
        }
    }
}

impl fmt::Display for MutationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MutationMethod {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "CREATE" => Ok(MutationMethod::Create),
            "UPDATE" => Ok(MutationMethod::Update),
            "DELETE" => Ok(MutationMethod::Delete),
            other => Err(crate::Error::InvalidInput(format!(
                "Unknown mutation method '{}'; use create, update or delete",
                other
            ))),
        }
    }
}

/// Logical resource path a mutation targets, e.g. `candidates` or `candidates/5`.
///
/// This is a path on the remote record API, independent of its base URL.
/// When the path has more than one segment the trailing segment names a
/// single record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Endpoint {
    segments: Vec<String>,
}

impl Endpoint {
    /// Parse an endpoint string. Leading and trailing '/' are ignored.
    ///
    /// # Errors
    /// - Endpoint is empty
    /// - A segment is empty or contains '\\', '?' or '#'
    pub fn parse(endpoint: &str) -> crate::Result<Self> {
        let trimmed = endpoint.trim().trim_start_matches('/').trim_end_matches('/');
        if trimmed.is_empty() {
            return Err(crate::Error::InvalidInput(
                "Endpoint cannot be empty".to_string(),
            ));
        }

        let segments: Vec<String> = trimmed.split('/').map(String::from).collect();
        for segment in &segments {
            if segment.is_empty() {
                return Err(crate::Error::InvalidInput(format!(
                    "Endpoint '{}' has an empty segment",
                    endpoint
                )));
            }
            if segment.contains(['\\', '?', '#']) || segment.chars().any(char::is_whitespace) {
                return Err(crate::Error::InvalidInput(format!(
                    "Endpoint segment '{}' contains invalid characters",
                    segment
                )));
            }
        }

        Ok(Self { segments })
    }

    /// The first segment, i.e. the resource type.
    pub fn resource(&self) -> &str {
        &self.segments[0]
    }

    /// Get the path segments.
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// The single record this endpoint addresses, if any.
    pub fn record_ref(&self) -> Option<RecordRef> {
        if self.segments.len() < 2 {
            return None;
        }
        let (id, collection) = self.segments.split_last()?;
        Some(RecordRef {
            collection: Endpoint {
                segments: collection.to_vec(),
            },
            id: id.clone(),
        })
    }

    /// Append a record id to this endpoint.
    pub fn join(&self, id: &str) -> crate::Result<Self> {
        Self::parse(&format!("{}/{}", self, id))
    }

    /// Convert to the slash-separated string form.
    pub fn to_path(&self) -> String {
        self.segments.join("/")
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_path())
    }
}

impl FromStr for Endpoint {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Endpoint {
    type Error = crate::Error;

    fn try_from(value: String) -> crate::Result<Self> {
        Self::parse(&value)
    }
}

impl From<Endpoint> for String {
    fn from(endpoint: Endpoint) -> Self {
        endpoint.to_path()
    }
}

/// A single remote record: the collection it lives in plus its id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordRef {
    collection: Endpoint,
    id: String,
}

impl RecordRef {
    /// Create a reference from a collection path and a record id.
    ///
    /// # Errors
    /// - Collection is not a valid endpoint
    /// - Id is empty or contains a '/'
    pub fn new(collection: &str, id: impl Into<String>) -> crate::Result<Self> {
        let collection = Endpoint::parse(collection)?;
        let id = id.into();
        if id.is_empty() || id.contains('/') {
            return Err(crate::Error::InvalidInput(format!(
                "Record id '{}' must be a single non-empty segment",
                id
            )));
        }
        Ok(Self { collection, id })
    }

    /// Collection endpoint, e.g. `candidates`.
    pub fn collection(&self) -> &Endpoint {
        &self.collection
    }

    /// Record id, e.g. `5`.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Endpoint addressing this record, e.g. `candidates/5`.
    pub fn endpoint(&self) -> Endpoint {
        let mut segments = self.collection.segments.clone();
        segments.push(self.id.clone());
        Endpoint { segments }
    }
}

impl fmt::Display for RecordRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.id)
    }
}
