//! Security helpers for the gateway.
//!
//! Credential masking for logs and traced request URIs.

pub mod redact;

pub use redact::{MaskingWriter, mask_sensitive, mask_value, redact_uri};
