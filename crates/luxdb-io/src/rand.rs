//! OS-backed randomness for salt generation.

use std::fs::File;
use std::io::Read;
use std::sync::atomic::{AtomicU64, Ordering};

/// Fills `buf` with random bytes.
///
/// Uses `/dev/urandom`; falls back to a deterministic xorshift sequence if it
/// is unavailable (hermetic test environments).
pub fn fill_random(buf: &mut [u8]) {
    static FALLBACK_SEQ: AtomicU64 = AtomicU64::new(0);

    if let Ok(mut f) = File::open("/dev/urandom") {
        if f.read_exact(buf).is_ok() {
            return;
        }
    }

    let seq = FALLBACK_SEQ.fetch_add(1, Ordering::Relaxed);
    let mut state: u64 = 0x5DEE_CE66_D1A4_F681 ^ seq.wrapping_mul(0x9E37_79B9_7F4A_7C15);
    for chunk in buf.chunks_mut(8) {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        let bytes = state.to_le_bytes();
        for (dst, &src) in chunk.iter_mut().zip(bytes.iter()) {
            *dst = src;
        }
    }
}

/// Returns a random `i32`.
#[must_use]
pub fn random_i32() -> i32 {
    let mut buf = [0_u8; 4];
    fill_random(&mut buf);
    i32::from_ne_bytes(buf)
}
