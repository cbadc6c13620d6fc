//! Deterministic benchmark payloads.

use bytes::Bytes;
use rand::rngs::SmallRng;
use rand::{RngCore, SeedableRng};

/// Seed of every generated payload.
pub const PAYLOAD_SEED: u64 = 42;

/// Generates `len` pseudo-random bytes.
///
/// The bytes only depend on `len`, so repeated runs upload identical payloads.
pub fn generate(len: u64) -> Bytes {
    let mut rng = SmallRng::seed_from_u64(PAYLOAD_SEED);
    let mut payload = vec![0; len as usize];
    rng.fill_bytes(&mut payload);
    payload.into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payloads_are_reproducible() {
        let first = generate(4096);
        assert_eq!(first.len(), 4096);
        assert_eq!(first, generate(4096));
        assert_eq!(generate(16), first.slice(..16));
    }
}
