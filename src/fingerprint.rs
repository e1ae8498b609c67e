//! Public key fingerprints for out-of-band comparison.

use sha2::{Digest, Sha256};

/// SHA-256 of `serialized_key`, as uppercase hex of the digest read as one
/// unsigned integer, with colons between digit pairs.
///
/// Leading zero digits are dropped the way an integer rendering drops them,
/// so the grouping is counted from the first significant digit.
pub fn fingerprint(serialized_key: &[u8]) -> String {
    let digest = hex::encode_upper(Sha256::digest(serialized_key));
    let digits = match digest.trim_start_matches('0') {
        "" => "0",
        trimmed => trimmed,
    };

    let last = digits.len() - 1;
    let mut out = String::with_capacity(digits.len() * 3 / 2);
    for (i, c) in digits.chars().enumerate() {
        out.push(c);
        if i & 1 == 1 && i != last {
            out.push(':');
        }
    }
    out
}
