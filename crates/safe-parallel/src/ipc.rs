//! Message encoding for the process substrate.
//!
//! Every cross-process message travels as one datagram, so no length prefix is
//! needed; the datagram size is capped at [`MAX_MESSAGE_BYTES`].
//!
//! - Captured exceptions use rkyv (a fixed framework type).
//! - Result items use bincode over serde, so any `Serialize` type can be queued.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{Result, WorkerError};
use crate::exception::CapturedException;

/// Largest datagram sent between owner and worker process.
pub const MAX_MESSAGE_BYTES: usize = 64 * 1024;

/// Room kept for the non-trace fields when an exception must be shrunk.
const EXCEPTION_OVERHEAD: usize = 8 * 1024;

/// Encode a captured exception, truncating its trace if the frame would be too large.
pub fn encode_exception(exception: &CapturedException) -> Result<Vec<u8>> {
    let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(exception)
        .map_err(|e| WorkerError::Serialization(format!("Failed to encode exception: {}", e)))?;
    if bytes.len() <= MAX_MESSAGE_BYTES {
        return Ok(bytes.to_vec());
    }

    let mut shrunk = exception.clone();
    shrunk.truncate_trace(MAX_MESSAGE_BYTES - EXCEPTION_OVERHEAD);
    let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(&shrunk)
        .map_err(|e| WorkerError::Serialization(format!("Failed to encode exception: {}", e)))?;
    if bytes.len() > MAX_MESSAGE_BYTES {
        return Err(WorkerError::Serialization(format!(
            "Exception message too large: {} bytes",
            bytes.len()
        )));
    }
    Ok(bytes.to_vec())
}

/// Decode a captured exception received from a worker process.
pub fn decode_exception(bytes: &[u8]) -> Result<CapturedException> {
    // Received buffers carry no alignment guarantee.
    let mut aligned = rkyv::util::AlignedVec::<16>::with_capacity(bytes.len());
    aligned.extend_from_slice(bytes);

    rkyv::from_bytes::<CapturedException, rkyv::rancor::Error>(&aligned)
        .map_err(|e| WorkerError::Serialization(format!("Failed to decode exception: {}", e)))
}

/// Encode a result item.
pub fn encode_payload<T: Serialize>(item: &T) -> Result<Vec<u8>> {
    let bytes = bincode::serde::encode_to_vec(item, bincode::config::standard())
        .map_err(|e| WorkerError::Serialization(format!("Failed to encode result: {}", e)))?;
    if bytes.len() > MAX_MESSAGE_BYTES {
        return Err(WorkerError::Serialization(format!(
            "Result too large: {} bytes (limit {})",
            bytes.len(),
            MAX_MESSAGE_BYTES
        )));
    }
    Ok(bytes)
}

/// Decode a result item.
pub fn decode_payload<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map(|(item, _len)| item)
        .map_err(|e| WorkerError::Serialization(format!("Failed to decode result: {}", e)))
}
