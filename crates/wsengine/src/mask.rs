// Payload masking, RFC 6455 Section 5.3.

/// Mask or unmask `buf` in place with the 4-byte key `mask`.
///
/// Masking is an XOR with the key repeated over the payload, so applying it twice restores
/// the input. The bulk of the buffer is processed eight bytes at a time.
#[inline]
pub fn apply_mask(buf: &mut [u8], mask: [u8; 4]) {
    // key repeated twice, so every 8-byte chunk starts at key offset 0
    let mask_u64 = u64::from_ne_bytes([
        mask[0], mask[1], mask[2], mask[3], mask[0], mask[1], mask[2], mask[3],
    ]);

    let mut chunks = buf.chunks_exact_mut(8);
    for chunk in &mut chunks {
        let mut word = [0u8; 8];
        word.copy_from_slice(chunk);
        let masked = u64::from_ne_bytes(word) ^ mask_u64;
        chunk.copy_from_slice(&masked.to_ne_bytes());
    }

    apply_mask_fallback(chunks.into_remainder(), mask);
}

/// Byte-at-a-time masking.
#[inline(always)]
fn apply_mask_fallback(buf: &mut [u8], mask: [u8; 4]) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte ^= mask[i & 3];
    }
}
