use md5::{Digest, Md5};

/// Content fingerprint of an asset: lowercase hex MD5 of its bytes.
///
/// Used only for identity and dedup, not for integrity against tampering.
pub fn fingerprint(bytes: &[u8]) -> String {
    format!("{:x}", Md5::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_is_deterministic() {
        let a = fingerprint(b"painting bytes");
        let b = fingerprint(b"painting bytes");
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
        assert_ne!(a, fingerprint(b"other bytes"));
    }

    #[test]
    fn test_known_digest() {
        assert_eq!(fingerprint(b""), "d41d8cd98f00b204e9800998ecf8427e");
    }
}
