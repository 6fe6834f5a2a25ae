// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Opaque encoded event batches.
//!
//! Replication tasks carry history events as a [`DataBlob`]: an encoding tag
//! plus raw bytes. The receiving cluster must not interpret the bytes before
//! checking the tag; an undeclared or unsupported encoding is rejected before
//! any decoding work happens.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::events::HistoryEvent;

/// Supported blob encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EncodingType {
    /// JSON-encoded event batch. The only encoding this cluster speaks.
    Json,
}

impl EncodingType {
    /// Wire tag for this encoding.
    pub fn as_str(&self) -> &'static str {
        match self {
            EncodingType::Json => "json",
        }
    }
}

impl TryFrom<&str> for EncodingType {
    type Error = BlobError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "json" => Ok(EncodingType::Json),
            other => Err(BlobError::UnknownEncoding(other.to_string())),
        }
    }
}

/// Errors that can occur while encoding or decoding an event batch.
#[derive(Debug, Error)]
pub enum BlobError {
    /// The blob declares an encoding this cluster does not speak.
    #[error("unknown blob encoding: {0:?}")]
    UnknownEncoding(String),

    /// The blob decoded to zero events.
    #[error("encoded event batch is empty")]
    EmptyBatch,

    /// The payload does not parse under the declared encoding.
    #[error("corrupt event batch: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// An encoded batch of history events.
///
/// The encoding travels as a string tag so unknown encodings survive
/// transport and can be rejected here rather than at the RPC layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataBlob {
    /// Declared encoding of `data`.
    pub encoding: String,
    /// Raw encoded bytes.
    pub data: Bytes,
}

/// Encode an ordered batch of history events into a blob.
pub fn serialize_batch(events: &[HistoryEvent]) -> Result<DataBlob, BlobError> {
    if events.is_empty() {
        return Err(BlobError::EmptyBatch);
    }
    let data = serde_json::to_vec(events)?;
    Ok(DataBlob {
        encoding: EncodingType::Json.as_str().to_string(),
        data: Bytes::from(data),
    })
}

/// Decode a blob into an ordered batch of history events.
///
/// Fails with [`BlobError::UnknownEncoding`] before touching the payload if
/// the declared encoding is unsupported, and with [`BlobError::EmptyBatch`]
/// if the payload decodes to zero events.
pub fn deserialize_batch(blob: &DataBlob) -> Result<Vec<HistoryEvent>, BlobError> {
    let encoding = EncodingType::try_from(blob.encoding.as_str())?;
    let events: Vec<HistoryEvent> = match encoding {
        EncodingType::Json => serde_json::from_slice(&blob.data)?,
    };
    if events.is_empty() {
        return Err(BlobError::EmptyBatch);
    }
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoding_tag_round_trip() {
        assert_eq!(EncodingType::try_from("json").unwrap(), EncodingType::Json);
        assert!(matches!(
            EncodingType::try_from("thrift-rw"),
            Err(BlobError::UnknownEncoding(_))
        ));
    }
}
