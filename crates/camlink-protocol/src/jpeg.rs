//! JPEG structural helpers: SOI/EOI marker scanning for reassembly
//! completion checks, plus a lightweight SOF dimension probe so the link can
//! report frame width/height without a full decoder.

/// Start-Of-Image marker.
pub const SOI: [u8; 2] = [0xFF, 0xD8];
/// End-Of-Image marker.
pub const EOI: [u8; 2] = [0xFF, 0xD9];

/// Smallest plausible JPEG; anything shorter is rejected as corrupt.
pub const MIN_FRAME_SIZE: usize = 100;

/// True if an SOI marker appears anywhere in `data`.
pub fn contains_soi(data: &[u8]) -> bool {
    data.windows(2).any(|w| w == SOI)
}

/// True if an EOI marker appears anywhere in `data`.
pub fn contains_eoi(data: &[u8]) -> bool {
    data.windows(2).any(|w| w == EOI)
}

pub fn starts_with_soi(data: &[u8]) -> bool {
    data.len() >= 2 && data[..2] == SOI
}

pub fn ends_with_eoi(data: &[u8]) -> bool {
    data.len() >= 2 && data[data.len() - 2..] == EOI
}

/// Full acceptance check for a reassembled frame: SOI first, EOI last, and
/// at least the minimum plausible size.
pub fn is_complete_frame(data: &[u8]) -> bool {
    data.len() >= MIN_FRAME_SIZE && starts_with_soi(data) && ends_with_eoi(data)
}

/// Cut the buffer at the first EOI marker (inclusive). Fragments past the
/// image end carry padding from the fixed-size blocks and must be dropped
/// before validation.
pub fn trim_to_eoi(data: &[u8]) -> &[u8] {
    for i in 0..data.len().saturating_sub(1) {
        if data[i] == 0xFF && data[i + 1] == 0xD9 {
            return &data[..i + 2];
        }
    }
    data
}

/// Extract (width, height) from the first SOFn segment, without decoding.
///
/// Returns `None` for truncated or non-JPEG input.
pub fn dimensions(data: &[u8]) -> Option<(u16, u16)> {
    if !starts_with_soi(data) {
        return None;
    }
    let mut pos = 2;
    while pos + 4 <= data.len() {
        if data[pos] != 0xFF {
            return None;
        }
        let marker = data[pos + 1];
        // Standalone markers without a length field.
        if marker == 0xD8 || (0xD0..=0xD7).contains(&marker) || marker == 0x01 {
            pos += 2;
            continue;
        }
        let seg_len = u16::from_be_bytes([data[pos + 2], data[pos + 3]]) as usize;
        if seg_len < 2 {
            return None;
        }
        // SOF0-SOF15 except DHT (C4), DNL placeholder (C8), DAC (CC).
        if (0xC0..=0xCF).contains(&marker)
            && marker != 0xC4
            && marker != 0xC8
            && marker != 0xCC
        {
            if pos + 9 > data.len() {
                return None;
            }
            let height = u16::from_be_bytes([data[pos + 5], data[pos + 6]]);
            let width = u16::from_be_bytes([data[pos + 7], data[pos + 8]]);
            return Some((width, height));
        }
        if marker == 0xDA {
            // Entropy-coded data follows; no SOF was seen.
            return None;
        }
        pos += 2 + seg_len;
    }
    None
}
