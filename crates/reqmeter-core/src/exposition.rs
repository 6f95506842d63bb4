//! Prometheus text exposition.
//!
//! Serialization itself is delegated to `prometheus::TextEncoder`; this
//! module only gathers the live registry and pairs the bytes with the
//! matching content type.

use prometheus::{Encoder, Registry, TextEncoder};

use crate::error::{MetricsError, MetricsResult};

/// Content type of the text exposition format.
pub const CONTENT_TYPE_LATEST: &str = prometheus::TEXT_FORMAT;

/// Encode the current state of a registry.
pub fn encode(registry: &Registry) -> MetricsResult<Vec<u8>> {
    let families = registry.gather();
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&families, &mut buffer)
        .map_err(MetricsError::Encode)?;
    Ok(buffer)
}
