//! Session identifier generation.
//!
//! Identifiers are 128 random bits rendered as 32 lowercase hex characters.
//! They are generated once per session and are unique across local, sandbox,
//! and SSH sessions for the lifetime of the process.

use rand::Rng;

/// Generate a fresh session identifier.
pub fn new_session_id() -> String {
    let bits: u128 = rand::thread_rng().gen();
    format!("{:032x}", bits)
}

/// Short prefix of a session id, used for derived names (e.g. container
/// names) where the full 32 characters would be unwieldy.
pub fn short(id: &str) -> &str {
    &id[..id.len().min(12)]
}
