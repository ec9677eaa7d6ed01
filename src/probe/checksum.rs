//! Internet checksum (RFC 1071)

/// One's-complement checksum over `data`, read as big-endian 16-bit words.
///
/// An odd trailing byte is treated as the high byte of a zero-padded word.
pub fn checksum(data: &[u8]) -> u16 {
    !fold(sum_words(data, 0))
}

/// Folded one's-complement sum of `data`, without the final inversion
///
/// A buffer carrying a correct checksum field sums to `0xFFFF`.
pub fn ones_sum(data: &[u8]) -> u16 {
    fold(sum_words(data, 0))
}

/// Add the big-endian 16-bit words of `data` to `sum`
///
/// Used to chain the pseudo-header and the segment without copying them
/// into one buffer.
pub fn sum_words(data: &[u8], mut sum: u32) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for word in &mut chunks {
        sum += u16::from_be_bytes([word[0], word[1]]) as u32;
    }

    // Handle odd byte if present
    if let [last] = chunks.remainder() {
        sum += (*last as u32) << 8;
    }

    sum
}

/// Fold carries out of the upper 16 bits back into the low 16 bits
pub fn fold(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    sum as u16
}

/// True if a buffer with its checksum field in place sums to all ones
pub fn verify(data: &[u8]) -> bool {
    ones_sum(data) == 0xFFFF
}
