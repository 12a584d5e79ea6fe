//! Reading and writing the correlation id in gRPC metadata.

use meshguard_core::correlation::{CorrelationId, RPC_CORRELATION_KEY};
use tonic::metadata::{Ascii, KeyAndValueRef, MetadataMap, MetadataValue};

/// Correlation id carried in `metadata`, matching the key in any case.
///
/// Blank and non-ASCII values are ignored.
#[must_use]
pub fn correlation_from_metadata(metadata: &MetadataMap) -> Option<CorrelationId> {
    metadata.iter().find_map(|entry| match entry {
        KeyAndValueRef::Ascii(key, value) if key.as_str().eq_ignore_ascii_case(RPC_CORRELATION_KEY) => {
            value.to_str().ok().and_then(|raw| CorrelationId::parse(raw).ok())
        }
        _ => None,
    })
}

/// Copy of `metadata` carrying `id` under the lower-case correlation key.
///
/// Any existing value for the key is replaced. The input map is left untouched.
#[must_use]
pub fn with_correlation(metadata: &MetadataMap, id: &CorrelationId) -> MetadataMap {
    let mut rebuilt = metadata.clone();
    match id.as_str().parse::<MetadataValue<Ascii>>() {
        Ok(value) => {
            rebuilt.insert(RPC_CORRELATION_KEY, value);
        }
        Err(_) => {
            tracing::warn!(correlation_id = %id, "Correlation id is not valid metadata");
        }
    }
    rebuilt
}
