use sha2::{Digest, Sha256};

/// Hex characters in a SHA-256 digest, the highest reachable difficulty
pub const MAX_DIFFICULTY: usize = 64;

/// Hashes arbitrary bytes with SHA-256 and returns the lowercase hex digest
pub fn sha256_hex<T: AsRef<[u8]>>(data: T) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data.as_ref());
    hex::encode(hasher.finalize())
}

/// Folds a power-of-two list of hex leaves into a Merkle root
///
/// Each level hashes the concatenation of two adjacent hex digests, so an
/// 8-leaf batch goes 8 -> 4 -> 2 -> 1.
///
/// # Arguments
///
/// * `leaves` - The leaf digests, hex encoded
///
/// # Returns
///
/// The root digest, or `None` if `leaves` is empty or not a power of two
pub fn merkle_root(leaves: Vec<String>) -> Option<String> {
    if leaves.is_empty() || !leaves.len().is_power_of_two() {
        return None;
    }

    let mut level = leaves;
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| sha256_hex(format!("{}{}", pair[0], pair[1])))
            .collect();
    }

    level.pop()
}

/// Checks the proof-of-work condition: the first `difficulty` hex characters are '0'
pub fn meets_difficulty(hash: &str, difficulty: usize) -> bool {
    hash.len() >= difficulty && hash.bytes().take(difficulty).all(|b| b == b'0')
}
