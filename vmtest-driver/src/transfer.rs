//! Building blocks for copying host files into the guest.
//!
//! The guest has no shared filesystem we can rely on, so file contents travel
//! through the command channel as base64 text and are verified afterwards
//! against a SHA-256 of the host copy.

use base64::Engine as _;
use sha2::{Digest, Sha256};
use vmtest_core::{shell_quote, ContentHash};

/// Base64 characters per command. Keeps every request line well below
/// typical shell line limits.
pub const CHUNK_LEN: usize = 48 * 1024;

/// Compute the SHA-256 of `data`.
///
/// # Complexity
/// O(n) in the length of `data`.
#[must_use]
pub fn compute_hash(data: &[u8]) -> ContentHash {
    let digest = Sha256::digest(data);
    ContentHash::new(digest.into())
}

/// Guest commands that recreate `data` at `dest`.
///
/// The first command truncates `dest`; every further one appends a chunk.
/// Chunk boundaries fall on multiples of four base64 characters, so each
/// chunk decodes on its own.
#[must_use]
pub fn write_commands(data: &[u8], dest: &str) -> Vec<String> {
    let dest = shell_quote(dest);
    let encoded = base64::engine::general_purpose::STANDARD.encode(data);

    if encoded.is_empty() {
        return vec![format!(": > {dest}")];
    }

    encoded
        .as_bytes()
        .chunks(CHUNK_LEN)
        .enumerate()
        .map(|(i, chunk)| {
            let redirect = if i == 0 { ">" } else { ">>" };
            // base64 output is ASCII, so any byte boundary is a char boundary.
            let chunk = String::from_utf8_lossy(chunk);
            format!("printf '%s' '{chunk}' | base64 -d {redirect} {dest}")
        })
        .collect()
}

/// Guest command printing the SHA-256 of `dest`.
#[must_use]
pub fn checksum_command(dest: &str) -> String {
    format!("sha256sum {}", shell_quote(dest))
}

/// Extract the hex digest from `sha256sum` output.
#[must_use]
pub fn parse_checksum(output: &str) -> Option<&str> {
    output
        .split_whitespace()
        .next()
        .filter(|hex| hex.len() == 64 && hex.chars().all(|c| c.is_ascii_hexdigit()))
}
