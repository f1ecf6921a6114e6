//! Scope definitions for the key/value store
//!
//! Scopes provide logical separation of the blobs an agent persists while
//! sharing one backing store.

/// Scope for per-channel conversation snapshots
pub const SCOPE_CONVERSATIONS: &str = "conversations";

/// Scope for per-agent status snapshots
pub const SCOPE_STATUS: &str = "status";

/// Map an arbitrary key onto a filesystem-safe name.
///
/// ASCII alphanumerics, `-` and `_` pass through; every other byte is
/// written as `%XX`, so distinct keys never collide.
pub fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for byte in key.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{:02X}", byte));
        }
    }
    out
}
