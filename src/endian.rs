//! Big-endian word helpers shared by the JPEG marker scanner and the bitmap
//! writer. Wire order is fixed; host order never leaks into the output.

/// Read a big-endian `u16` at `offset`, or `None` if fewer than two bytes remain.
#[inline]
#[must_use]
pub fn read_u16_be(buf: &[u8], offset: usize) -> Option<u16> {
    let end = offset.checked_add(2)?;
    let bytes = buf.get(offset..end)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn write_u16_be(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_be_bytes());
}

/// Append 16-bit samples in network byte order.
pub fn write_u16_slice_be(out: &mut Vec<u8>, samples: &[u16]) {
    out.reserve(samples.len() * 2);
    for sample in samples {
        write_u16_be(out, *sample);
    }
}
