use std::hash::BuildHasher;
use std::hash::Hasher;

/// Hashes bytes with a fixed seed so that hashes are stable across runs. Determinism of the output
/// file depends on this: fragment offsets and interner slot assignment are derived from hashes.
pub(crate) fn hash_bytes(bytes: &[u8]) -> u64 {
    let mut hasher = foldhash::fast::FixedState::default().build_hasher();
    hasher.write(bytes);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_across_calls() {
        assert_eq!(hash_bytes(b"_ZN4weld4linkEv"), hash_bytes(b"_ZN4weld4linkEv"));
        assert_ne!(hash_bytes(b"a"), hash_bytes(b"b"));
    }
}
