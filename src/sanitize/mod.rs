//! Sensitive data sanitization
//!
//! Telemetry passes through here before anything is persisted.

mod patterns;
mod sanitizer;
mod value;

pub use patterns::{
    hash_value, is_placeholder, partial_mask, DetectionPattern, SensitiveDataType, Strategy,
    ARRAY, CIRCULAR, NULL, OBJECT, REDACTED, REMOVED, UNDEFINED,
};
pub use sanitizer::{SanitizeError, SanitizeResult, Sanitizer};
pub use value::{OpaqueKind, SharedList, SharedMap, Value};
