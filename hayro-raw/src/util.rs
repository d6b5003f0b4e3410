//! Small helpers shared across modules.

/// Build a four-character code from its ASCII bytes.
pub(crate) const fn fourcc(tag: &[u8; 4]) -> u32 {
    u32::from_be_bytes(*tag)
}

pub(crate) fn fourcc_to_string(tag: u32) -> String {
    String::from_utf8_lossy(&tag.to_be_bytes()).to_string()
}

/// Clamp `value` to the range that fits into `bits` bits.
#[inline(always)]
pub(crate) fn clamp_bits(value: i32, bits: u32) -> u16 {
    value.clamp(0, (1 << bits) - 1) as u16
}

/// Round `value` up to the next multiple of `multiple`.
pub(crate) fn round_up(value: usize, multiple: usize) -> usize {
    value.div_ceil(multiple) * multiple
}

/// Remove NULs and surrounding whitespace from a fixed-size string field.
pub(crate) fn trim_string(s: &str) -> String {
    s.trim_matches(|c: char| c == '\0' || c.is_whitespace())
        .to_string()
}
