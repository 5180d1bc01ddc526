//! WebSocket frame masking
//!
//! Client-to-server frames carry a 4-byte key that is XORed over the payload:
//! `payload[i] ^= key[i % 4]`. Applying the same key twice restores the input.
//!
//! Key generation is behind the [`MaskGenerator`] trait so tests can plug in a
//! fixed key; the default uses `fastrand`.

/// Source of masking keys for outbound client frames
pub trait MaskGenerator: Send + Sync {
    /// Produce the key for the next frame
    fn next_mask(&self) -> [u8; 4];
}

/// Default generator backed by `fastrand`
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomMask;

impl MaskGenerator for RandomMask {
    #[inline]
    fn next_mask(&self) -> [u8; 4] {
        generate_mask()
    }
}

/// Generator that always returns the same key
#[derive(Debug, Clone, Copy)]
pub struct FixedMask(pub [u8; 4]);

impl MaskGenerator for FixedMask {
    #[inline]
    fn next_mask(&self) -> [u8; 4] {
        self.0
    }
}

/// Generate a random mask for client frames
#[inline]
pub fn generate_mask() -> [u8; 4] {
    fastrand::u32(..).to_ne_bytes()
}

/// Apply (or remove) a mask in place
///
/// Works on 8-byte words first, then on the tail byte by byte.
#[inline]
pub fn apply_mask(data: &mut [u8], mask: [u8; 4]) {
    let mask_u64 = u64::from_ne_bytes([
        mask[0], mask[1], mask[2], mask[3], mask[0], mask[1], mask[2], mask[3],
    ]);

    let mut chunks = data.chunks_exact_mut(8);
    for chunk in &mut chunks {
        let mut word = [0u8; 8];
        word.copy_from_slice(chunk);
        let masked = u64::from_ne_bytes(word) ^ mask_u64;
        chunk.copy_from_slice(&masked.to_ne_bytes());
    }

    // Remainder starts at a multiple of 8, so the key phase is unchanged
    for (i, byte) in chunks.into_remainder().iter_mut().enumerate() {
        *byte ^= mask[i & 3];
    }
}
