//! Consistent Overhead Byte Stuffing (<https://en.wikipedia.org/wiki/Consistent_Overhead_Byte_Stuffing>).
//!
//! Ported from `modules/common/src/cobs.c` in the original source, kept
//! allocation-free: caller supplies both buffers.

/// Encodes `data` into `buf`, returning the number of bytes written.
///
/// `buf` must be at least `data.len() + 1` to hold the worst case; shorter
/// buffers truncate the output the same way the C implementation does.
pub fn encode(buf: &mut [u8], data: &[u8]) -> usize {
    if buf.is_empty() {
        return 0;
    }

    let maxlen = core::cmp::min(buf.len(), data.len());
    let mut group_head_index = 0usize;
    let mut group_len: u8 = 1;
    let mut o = 1usize;

    let mut i = 0usize;
    while i < maxlen && o < buf.len() {
        if data[i] != 0 {
            buf[o] = data[i];
            o += 1;
            group_len += 1;
        }

        if data[i] == 0 || group_len == 0xFF {
            buf[group_head_index] = group_len;
            group_head_index = o;
            o += 1;
            if o >= buf.len() || (group_len == 0xFF && (i + 1) >= maxlen) {
                let last = core::cmp::min(o - 1, buf.len() - 1);
                buf[last] = 0;
                return o - 1;
            }
            group_len = 1;
        }

        i += 1;
    }

    buf[group_head_index] = group_len;
    let last = core::cmp::min(o, buf.len() - 1);
    buf[last] = 0;

    o
}

/// Decodes a COBS-framed `data` slice into `buf`, returning the number of
/// bytes written.
pub fn decode(buf: &mut [u8], data: &[u8]) -> usize {
    let mut o = 0usize;
    let mut group_len: u8 = 0;
    let mut code: u8 = 0xff;

    let mut i = 0usize;
    while i < data.len() && o < buf.len() {
        if group_len > 0 {
            buf[o] = data[i];
            o += 1;
        } else {
            if code != 0xff {
                buf[o] = 0;
                o += 1;
            }

            group_len = data[i];
            code = data[i];

            if code == 0 {
                break;
            }
        }

        group_len -= 1;
        i += 1;
    }

    o
}

/// Decodes `inout` in place, reusing the same buffer as source and
/// destination. Safe because decoding never writes past the read cursor
/// (the output index never overtakes the input index).
pub fn decode_overwrite(inout: &mut [u8]) -> usize {
    let mut o = 0usize;
    let mut group_len: u8 = 0;
    let mut code: u8 = 0xff;

    let mut i = 0usize;
    while i < inout.len() {
        let byte = inout[i];

        if group_len > 0 {
            inout[o] = byte;
            o += 1;
        } else {
            if code != 0xff {
                inout[o] = 0;
                o += 1;
            }

            group_len = byte;
            code = byte;

            if code == 0 {
                break;
            }
        }

        group_len -= 1;
        i += 1;
    }

    o
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(data: &[u8]) {
        let mut encoded = [0u8; 600];
        let encoded_len = encode(&mut encoded, data);

        let mut decoded = [0u8; 512];
        let decoded_len = decode(&mut decoded, &encoded[..encoded_len]);

        assert_eq!(data, &decoded[..decoded_len]);
    }

    #[test]
    fn roundtrip_empty() {
        roundtrip(&[]);
    }

    #[test]
    fn roundtrip_no_zeros() {
        roundtrip(b"hello world");
    }

    #[test]
    fn roundtrip_with_zeros() {
        roundtrip(&[0, 1, 0, 0, 2, 3, 0]);
    }

    #[test]
    fn roundtrip_long_run_without_zero() {
        let data = [1u8; 300];
        roundtrip(&data);
    }

    #[test]
    fn roundtrip_all_zeros() {
        let data = [0u8; 20];
        roundtrip(&data);
    }

    #[test]
    fn decode_overwrite_matches_decode() {
        let data = [5u8, 1, 0, 0, 9, 3, 0];

        let mut encoded = [0u8; 32];
        let encoded_len = encode(&mut encoded, &data);

        let mut decoded = [0u8; 32];
        let decoded_len = decode(&mut decoded, &encoded[..encoded_len]);

        let mut inout = encoded;
        let overwrite_len = decode_overwrite(&mut inout[..encoded_len]);

        assert_eq!(decoded_len, overwrite_len);
        assert_eq!(&decoded[..decoded_len], &inout[..overwrite_len]);
    }
}
