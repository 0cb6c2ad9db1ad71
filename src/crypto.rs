use core::fmt;

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

/// A minimal secret container that zeroizes its contents on drop.
///
/// Never exposes the secret via `Debug`.
#[derive(Clone)]
pub(crate) struct SecretBytes(Vec<u8>);

impl SecretBytes {
    pub(crate) fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub(crate) fn expose(&self) -> &[u8] {
        &self.0
    }

    pub(crate) fn len(&self) -> usize {
        self.0.len()
    }
}

impl fmt::Debug for SecretBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<secret>")
    }
}

impl Drop for SecretBytes {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

/// SHA-256 over a DER certificate, as lowercase colon-separated hex.
pub(crate) fn certificate_fingerprint(der: &[u8]) -> String {
    let digest = Sha256::digest(der);
    let mut out = String::with_capacity(digest.len() * 3);
    for (i, b) in digest.iter().enumerate() {
        if i > 0 {
            out.push(':');
        }
        out.push_str(&format!("{b:02x}"));
    }
    out
}

/// Case-insensitive fingerprint comparison in constant time.
pub(crate) fn fingerprints_match(pinned: &str, presented: &str) -> bool {
    let a = pinned.trim().to_ascii_lowercase();
    let b = presented.trim().to_ascii_lowercase();
    ct_eq(a.as_bytes(), b.as_bytes())
}

pub(crate) fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_colon_separated_lowercase_sha256() {
        // SHA-256("abc")
        let fp = certificate_fingerprint(b"abc");
        assert_eq!(
            fp,
            "ba:78:16:bf:8f:01:cf:ea:41:41:40:de:5d:ae:22:23:\
             b0:03:61:a3:96:17:7a:9c:b4:10:ff:61:f2:00:15:ad"
        );
        assert_eq!(fp.len(), 32 * 3 - 1);
    }

    #[test]
    fn fingerprint_comparison_ignores_case() {
        let fp = certificate_fingerprint(b"server");
        assert!(fingerprints_match(&fp.to_ascii_uppercase(), &fp));
        assert!(!fingerprints_match(&fp[3..], &fp));
    }

    #[test]
    fn secret_debug_is_redacted() {
        let secret = SecretBytes::new(b"hunter2".to_vec());
        assert_eq!(format!("{secret:?}"), "<secret>");
        assert_eq!(secret.len(), 7);
    }
}
