//! Top-level field projection of result payloads.

use marketdata_core::Payload;

use crate::types::QueryOptions;

/// Applies `include_fields` then `exclude_fields` to an object payload.
///
/// Non-object payloads are returned unchanged.
#[must_use]
pub fn project(data: Payload, options: &QueryOptions) -> Payload {
    let Payload::Object(mut fields) = data else {
        return data;
    };
    if !options.include_fields.is_empty() {
        fields.retain(|name, _| options.include_fields.iter().any(|f| f == name));
    }
    for name in &options.exclude_fields {
        fields.remove(name);
    }
    Payload::Object(fields)
}
