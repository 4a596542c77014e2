//! CBOR encoding of persisted units.

use crate::error::{SyncError, SyncResult};
use serde::de::DeserializeOwned;
use serde::Serialize;

pub(crate) fn encode<T: Serialize>(value: &T) -> SyncResult<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| SyncError::Codec(e.to_string()))?;
    Ok(buf)
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> SyncResult<T> {
    ciborium::from_reader(bytes).map_err(|e| SyncError::Codec(e.to_string()))
}
