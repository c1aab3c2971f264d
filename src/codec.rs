//! Versioned codecs for every record stored in the key-value store, plus the
//! string-packed wire formats used for queue members and worker-queue entries
//! (see [`member_codec`]).
//!
//! Stored records are rkyv-serialized behind a single version byte. When
//! evolving schemas, bump the constant and add migration logic in the decode
//! function.

pub mod member_codec;

pub use member_codec::{
    EncodedQueueMember, EncodedWorkerQueueEntry, QueueMember, WorkerQueueEntry,
    is_encoded_queue_member, is_encoded_worker_queue_entry,
};

use rkyv::{AlignedVec, Archive, Deserialize as RkyvDeserialize};

use crate::message::{
    BatchItem, BatchItemOutcome, BatchMeta, BatchRemaining, DebounceRecord, HolderRecord,
    StoredMessage,
};

/// Error type for versioned codec operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CodecError {
    #[error("data too short to contain version header")]
    TooShort,
    #[error("unsupported version: expected {expected}, found {found}")]
    UnsupportedVersion { expected: u8, found: u8 },
    #[error("rkyv error: {0}")]
    Rkyv(String),
    #[error("malformed wire entry: {0}")]
    MalformedEntry(String),
}

pub const STORED_MESSAGE_VERSION: u8 = 1;
pub const HOLDER_RECORD_VERSION: u8 = 1;
pub const BATCH_META_VERSION: u8 = 1;
pub const BATCH_ITEM_VERSION: u8 = 1;
pub const BATCH_OUTCOME_VERSION: u8 = 1;
pub const BATCH_REMAINING_VERSION: u8 = 1;
pub const DEBOUNCE_RECORD_VERSION: u8 = 1;

const VERSION_HEADER_SIZE: usize = 1;

/// Prepend a single version byte to the rkyv-serialized data.
#[inline]
fn prepend_version(version: u8, data: AlignedVec) -> Vec<u8> {
    let mut result = Vec::with_capacity(VERSION_HEADER_SIZE + data.len());
    result.push(version);
    result.extend_from_slice(&data);
    result
}

/// Strip the version byte, validating it, and copy the remainder into an
/// AlignedVec so rkyv sees properly aligned data.
#[inline]
fn strip_version(expected: u8, data: &[u8]) -> Result<AlignedVec, CodecError> {
    if data.len() < VERSION_HEADER_SIZE {
        return Err(CodecError::TooShort);
    }
    let found = data[0];
    if found != expected {
        return Err(CodecError::UnsupportedVersion { expected, found });
    }
    let rkyv_data = &data[VERSION_HEADER_SIZE..];
    let mut aligned = AlignedVec::with_capacity(rkyv_data.len());
    aligned.extend_from_slice(rkyv_data);
    Ok(aligned)
}

macro_rules! versioned_codec {
    ($encode:ident, $decode:ident, $ty:ty, $version:expr) => {
        #[inline]
        pub fn $encode(value: &$ty) -> Result<Vec<u8>, CodecError> {
            let data =
                rkyv::to_bytes::<$ty, 256>(value).map_err(|e| CodecError::Rkyv(e.to_string()))?;
            Ok(prepend_version($version, data))
        }

        #[inline]
        pub fn $decode(bytes: &[u8]) -> Result<$ty, CodecError> {
            let data = strip_version($version, bytes)?;
            let archived: &<$ty as Archive>::Archived = rkyv::check_archived_root::<$ty>(&data)
                .map_err(|e| CodecError::Rkyv(e.to_string()))?;
            let mut des = rkyv::Infallible;
            RkyvDeserialize::deserialize(archived, &mut des)
                .map_err(|_| CodecError::Rkyv("infallible deserialize failed".to_string()))
        }
    };
}

versioned_codec!(
    encode_stored_message,
    decode_stored_message,
    StoredMessage,
    STORED_MESSAGE_VERSION
);
versioned_codec!(encode_holder, decode_holder, HolderRecord, HOLDER_RECORD_VERSION);
versioned_codec!(encode_batch_meta, decode_batch_meta, BatchMeta, BATCH_META_VERSION);
versioned_codec!(encode_batch_item, decode_batch_item, BatchItem, BATCH_ITEM_VERSION);
versioned_codec!(
    encode_batch_outcome,
    decode_batch_outcome,
    BatchItemOutcome,
    BATCH_OUTCOME_VERSION
);
versioned_codec!(
    encode_batch_remaining,
    decode_batch_remaining,
    BatchRemaining,
    BATCH_REMAINING_VERSION
);
versioned_codec!(
    encode_debounce_record,
    decode_debounce_record,
    DebounceRecord,
    DEBOUNCE_RECORD_VERSION
);
