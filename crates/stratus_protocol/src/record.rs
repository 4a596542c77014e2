//! Remote record snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Database scope a partition lives in.
///
/// Private, public and shared scopes are independent of each other and may
/// be synchronized in parallel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Scope {
    /// The signed-in user's private database.
    Private,
    /// The container-wide public database.
    Public,
    /// Records shared with the signed-in user.
    Shared,
}

impl Scope {
    /// All scopes, in upload order.
    pub const ALL: [Scope; 3] = [Scope::Private, Scope::Public, Scope::Shared];

    /// Returns the lowercase name used in storage keys and display.
    pub fn name(&self) -> &'static str {
        match self {
            Scope::Private => "private",
            Scope::Public => "public",
            Scope::Shared => "shared",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Scope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "private" => Ok(Scope::Private),
            "public" => Ok(Scope::Public),
            "shared" => Ok(Scope::Shared),
            other => Err(format!("unknown scope: {other}")),
        }
    }
}

/// An isolated namespace of remote records (a zone within a scope).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Partition {
    /// Database scope.
    pub scope: Scope,
    /// Zone name within the scope.
    pub zone: String,
}

impl Partition {
    /// Creates a partition.
    pub fn new(scope: Scope, zone: impl Into<String>) -> Self {
        Self {
            scope,
            zone: zone.into(),
        }
    }

    /// Creates a partition in the private scope.
    pub fn private(zone: impl Into<String>) -> Self {
        Self::new(Scope::Private, zone)
    }

    /// Creates a record identifier in this partition.
    pub fn record_id(&self, name: impl Into<String>) -> RecordId {
        RecordId::new(self.clone(), name)
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.scope, self.zone)
    }
}

impl FromStr for Partition {
    type Err = String;

    /// Parses `scope/zone`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scope, zone) = s
            .split_once('/')
            .ok_or_else(|| format!("expected scope/zone, got {s}"))?;
        if zone.is_empty() {
            return Err("zone name must not be empty".into());
        }
        Ok(Self::new(scope.parse()?, zone))
    }
}

/// Stable, partition-scoped identifier of a record.
///
/// Identifier plus partition uniquely determine a record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordId {
    /// Owning partition.
    pub partition: Partition,
    /// Record name, unique within the partition.
    pub name: String,
}

impl RecordId {
    /// Creates a record identifier.
    pub fn new(partition: Partition, name: impl Into<String>) -> Self {
        Self {
            partition,
            name: name.into(),
        }
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.partition, self.name)
    }
}

/// A typed field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    Integer(i64),
    /// Floating point number.
    Double(f64),
    /// UTF-8 text.
    Text(String),
    /// Opaque bytes.
    Bytes(Vec<u8>),
    /// Point in time.
    Timestamp(DateTime<Utc>),
    /// Reference to another record.
    Reference(RecordId),
    /// Ordered list of values.
    List(Vec<FieldValue>),
}

impl FieldValue {
    /// Returns the text value, if this is text.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the integer value, if this is an integer.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            FieldValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Returns the boolean value, if this is a boolean.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FieldValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Returns the double value, if this is a double.
    pub fn as_double(&self) -> Option<f64> {
        match self {
            FieldValue::Double(d) => Some(*d),
            _ => None,
        }
    }

    /// Returns the timestamp, if this is a timestamp.
    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            FieldValue::Timestamp(t) => Some(*t),
            _ => None,
        }
    }

    /// Returns the referenced record, if this is a reference.
    pub fn as_reference(&self) -> Option<&RecordId> {
        match self {
            FieldValue::Reference(id) => Some(id),
            _ => None,
        }
    }

    /// Returns the list items, if this is a list.
    pub fn as_list(&self) -> Option<&[FieldValue]> {
        match self {
            FieldValue::List(items) => Some(items),
            _ => None,
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Integer(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Bool(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Double(value)
    }
}

impl From<DateTime<Utc>> for FieldValue {
    fn from(value: DateTime<Utc>) -> Self {
        FieldValue::Timestamp(value)
    }
}

impl From<RecordId> for FieldValue {
    fn from(value: RecordId) -> Self {
        FieldValue::Reference(value)
    }
}

/// A remote-addressable entity snapshot.
///
/// # Fields
///
/// - `id`: partition-scoped identifier
/// - `record_type`: type tag used to pick the local entity mapping
/// - `fields`: ordered field map
/// - `modified_at`: server modification time, when known
/// - `change_tag`: server version tag used to detect stale writes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Record identifier.
    pub id: RecordId,
    /// Type tag.
    pub record_type: String,
    /// Field values by name.
    pub fields: BTreeMap<String, FieldValue>,
    /// Server modification time.
    pub modified_at: Option<DateTime<Utc>>,
    /// Server change tag.
    pub change_tag: Option<String>,
}

impl Record {
    /// Creates an empty record.
    pub fn new(id: RecordId, record_type: impl Into<String>) -> Self {
        Self {
            id,
            record_type: record_type.into(),
            fields: BTreeMap::new(),
            modified_at: None,
            change_tag: None,
        }
    }

    /// Sets a field, builder style.
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Sets the modification time, builder style.
    pub fn with_modified_at(mut self, modified_at: DateTime<Utc>) -> Self {
        self.modified_at = Some(modified_at);
        self
    }

    /// Returns the owning partition.
    pub fn partition(&self) -> &Partition {
        &self.id.partition
    }

    /// Returns a field value.
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    /// Sets a field value, returning the previous one.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Option<FieldValue> {
        self.fields.insert(name.into(), value.into())
    }

    /// Removes a field value.
    pub fn remove(&mut self, name: &str) -> Option<FieldValue> {
        self.fields.remove(name)
    }

    /// Iterates over fields holding a reference to another record.
    pub fn references(&self) -> impl Iterator<Item = (&str, &RecordId)> {
        self.fields
            .iter()
            .filter_map(|(name, value)| value.as_reference().map(|id| (name.as_str(), id)))
    }

    /// Merges a newer version of this record into `self`.
    ///
    /// Fields present in `newer` replace the current value; fields absent
    /// from `newer` keep their current value. Server metadata is taken from
    /// `newer` when it carries any.
    pub fn merge_from(&mut self, newer: &Record) {
        for (name, value) in &newer.fields {
            self.fields.insert(name.clone(), value.clone());
        }
        self.record_type = newer.record_type.clone();
        if newer.modified_at.is_some() {
            self.modified_at = newer.modified_at;
        }
        if newer.change_tag.is_some() {
            self.change_tag = newer.change_tag.clone();
        }
    }

    /// Writes every field of `other` over `self`.
    ///
    /// Fields `other` lacks keep their value; metadata is untouched.
    pub fn overlay_fields(&mut self, other: &Record) {
        for (name, value) in &other.fields {
            self.fields.insert(name.clone(), value.clone());
        }
    }

    /// Returns true if both records hold the same type and field values.
    pub fn has_same_content(&self, other: &Record) -> bool {
        self.record_type == other.record_type && self.fields == other.fields
    }
}
