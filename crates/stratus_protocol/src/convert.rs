//! Typed conversion between application structs and records.

use crate::record::{FieldValue, Partition, Record, RecordId};
use thiserror::Error;

/// Result type for record conversion.
pub type ConvertResult<T> = Result<T, ConvertError>;

/// Errors raised while converting a record.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConvertError {
    /// The record has a different type tag.
    #[error("expected record type {expected}, got {actual}")]
    WrongType {
        /// Expected type tag.
        expected: String,
        /// Actual type tag.
        actual: String,
    },

    /// A required field is absent.
    #[error("missing field: {0}")]
    MissingField(String),

    /// A field holds a value of the wrong kind.
    #[error("field {field} has unexpected value {value:?}")]
    InvalidField {
        /// Field name.
        field: String,
        /// The offending value.
        value: FieldValue,
    },
}

/// A type that converts to and from a [`Record`].
///
/// # Example
///
/// ```
/// use stratus_protocol::{ConvertError, ConvertResult, Partition, Record, RecordConvertible};
///
/// #[derive(Debug, PartialEq)]
/// struct Tag {
///     id: String,
///     label: String,
/// }
///
/// impl RecordConvertible for Tag {
///     const RECORD_TYPE: &'static str = "Tag";
///
///     fn stable_id(&self) -> String {
///         self.id.clone()
///     }
///
///     fn decode(record: &Record) -> ConvertResult<Self> {
///         Self::check_type(record)?;
///         Ok(Tag {
///             id: record.id.name.clone(),
///             label: Self::text(record, "label")?,
///         })
///     }
///
///     fn encode(&self, record: &mut Record) {
///         record.set("label", self.label.as_str());
///     }
/// }
///
/// let tag = Tag { id: "t1".into(), label: "rust".into() };
/// let record = tag.create_record(&Partition::private("Main"));
/// assert_eq!(Tag::decode(&record).unwrap(), tag);
/// ```
pub trait RecordConvertible: Sized {
    /// Type tag of records this type converts from.
    const RECORD_TYPE: &'static str;

    /// Stable identifier used as the record name.
    fn stable_id(&self) -> String;

    /// Builds a value from a record.
    fn decode(record: &Record) -> ConvertResult<Self>;

    /// Writes this value's fields into `record`.
    fn encode(&self, record: &mut Record);

    /// Returns the record identifier in `partition`.
    fn record_id(&self, partition: &Partition) -> RecordId {
        partition.record_id(self.stable_id())
    }

    /// Creates a fresh record holding this value.
    fn create_record(&self, partition: &Partition) -> Record {
        let mut record = Record::new(self.record_id(partition), Self::RECORD_TYPE);
        self.encode(&mut record);
        record
    }

    /// Fails unless `record` carries this type's tag.
    fn check_type(record: &Record) -> ConvertResult<()> {
        if record.record_type == Self::RECORD_TYPE {
            Ok(())
        } else {
            Err(ConvertError::WrongType {
                expected: Self::RECORD_TYPE.to_string(),
                actual: record.record_type.clone(),
            })
        }
    }

    /// Reads a required text field.
    fn text(record: &Record, field: &str) -> ConvertResult<String> {
        let value = record
            .get(field)
            .ok_or_else(|| ConvertError::MissingField(field.to_string()))?;
        value
            .as_text()
            .map(str::to_string)
            .ok_or_else(|| ConvertError::InvalidField {
                field: field.to_string(),
                value: value.clone(),
            })
    }

    /// Reads a required integer field.
    fn integer(record: &Record, field: &str) -> ConvertResult<i64> {
        let value = record
            .get(field)
            .ok_or_else(|| ConvertError::MissingField(field.to_string()))?;
        value.as_integer().ok_or_else(|| ConvertError::InvalidField {
            field: field.to_string(),
            value: value.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Counter {
        id: String,
        count: i64,
    }

    impl RecordConvertible for Counter {
        const RECORD_TYPE: &'static str = "Counter";

        fn stable_id(&self) -> String {
            self.id.clone()
        }

        fn decode(record: &Record) -> ConvertResult<Self> {
            Self::check_type(record)?;
            Ok(Counter {
                id: record.id.name.clone(),
                count: Self::integer(record, "count")?,
            })
        }

        fn encode(&self, record: &mut Record) {
            record.set("count", self.count);
        }
    }

    #[test]
    fn roundtrip_through_record() {
        let counter = Counter {
            id: "c1".into(),
            count: 3,
        };
        let record = counter.create_record(&Partition::private("Main"));
        assert_eq!(record.record_type, "Counter");
        assert_eq!(record.id.name, "c1");
        assert_eq!(Counter::decode(&record).unwrap(), counter);
    }

    #[test]
    fn decode_errors() {
        let id = Partition::private("Main").record_id("c1");

        let wrong = Record::new(id.clone(), "Other");
        assert!(matches!(
            Counter::decode(&wrong),
            Err(ConvertError::WrongType { .. })
        ));

        let missing = Record::new(id.clone(), "Counter");
        assert_eq!(
            Counter::decode(&missing),
            Err(ConvertError::MissingField("count".into()))
        );

        let invalid = Record::new(id, "Counter").with_field("count", "three");
        assert!(matches!(
            Counter::decode(&invalid),
            Err(ConvertError::InvalidField { .. })
        ));
    }
}
