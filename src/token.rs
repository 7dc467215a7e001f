//! Resource token generation
//!
//! The token is a 13 character lower-case base32 rendering of a 64-bit
//! xxh3 hash over (scope, environment, region). It is appended to every
//! resource name so repeated deployments into one scope never collide.

use std::fmt;

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::xxh3_64;

/// Lower-case RFC 4648 base32 alphabet
const ALPHABET: &[u8; 32] = b"abcdefghijklmnopqrstuvwxyz234567";

/// Length of a generated token (ceil(64 / 5))
pub const TOKEN_LEN: usize = 13;

/// Unit separator; never part of a well-formed scope, env name or region
const SEPARATOR: char = '\u{1f}';

/// Deterministic uniqueness suffix for resource names
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceToken(String);

impl ResourceToken {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ResourceToken {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Derive the resource token for a (scope, environment, region) triple.
///
/// Inputs are case-folded first so `EastUS` and `eastus` name the same
/// deployment.
pub fn generate_token(scope_id: &str, environment_name: &str, region: &str) -> ResourceToken {
    let mut input = String::with_capacity(scope_id.len() + environment_name.len() + region.len() + 2);
    input.push_str(&scope_id.to_lowercase());
    input.push(SEPARATOR);
    input.push_str(&environment_name.to_lowercase());
    input.push(SEPARATOR);
    input.push_str(&region.to_lowercase());

    ResourceToken(encode_base32(xxh3_64(input.as_bytes())))
}

fn encode_base32(mut hash: u64) -> String {
    let mut out = [0u8; TOKEN_LEN];
    for slot in out.iter_mut().rev() {
        *slot = ALPHABET[(hash & 0x1f) as usize];
        hash >>= 5;
    }
    out.iter().map(|&b| b as char).collect()
}
