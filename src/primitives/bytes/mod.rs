#![forbid(unsafe_code)]
//! Encoding helpers shared by the redo codec and the on-disk log formats.

pub mod var {
    //! Prefix-length varints used inside redo records.
    //!
    //! The leading bits of the first byte give the total length:
    //! `0xxxxxxx` (1 byte), `10xxxxxx` (2), `110xxxxx` (3), `1110xxxx` (4),
    //! and `11110000` followed by a big-endian u32 (5). Every longer form
    //! starts counting where the shorter one ends, so each value has exactly
    //! one encoding.

    const MIN_2: u32 = 0x80;
    const MIN_3: u32 = MIN_2 + (1 << 14);
    const MIN_4: u32 = MIN_3 + (1 << 21);
    const MIN_5: u32 = MIN_4 + (1 << 28);

    /// Largest value that fits the 3-byte form; bounds record lengths.
    pub const MAX_3_BYTES: u32 = MIN_4 - 1;

    /// Outcome of decoding from a possibly short buffer.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub enum Decoded {
        /// Value and number of bytes consumed.
        Value(u32, usize),
        /// The buffer ends inside the varint.
        Short,
        /// The first byte is not a valid length prefix.
        Invalid,
    }

    /// Number of bytes [`encode_u32`] emits for `v`.
    pub fn encoded_len(v: u32) -> usize {
        if v < MIN_2 {
            1
        } else if v < MIN_3 {
            2
        } else if v < MIN_4 {
            3
        } else if v < MIN_5 {
            4
        } else {
            5
        }
    }

    /// Appends `v` in the shortest form.
    pub fn encode_u32(v: u32, out: &mut Vec<u8>) {
        match encoded_len(v) {
            1 => out.push(v as u8),
            2 => {
                let rest = v - MIN_2;
                out.extend_from_slice(&[0x80 | (rest >> 8) as u8, rest as u8]);
            }
            3 => {
                let rest = v - MIN_3;
                out.extend_from_slice(&[0xC0 | (rest >> 16) as u8, (rest >> 8) as u8, rest as u8]);
            }
            4 => {
                let rest = v - MIN_4;
                out.extend_from_slice(&[
                    0xE0 | (rest >> 24) as u8,
                    (rest >> 16) as u8,
                    (rest >> 8) as u8,
                    rest as u8,
                ]);
            }
            _ => {
                out.push(0xF0);
                out.extend_from_slice(&(v - MIN_5).to_be_bytes());
            }
        }
    }

    /// Decodes a varint at the start of `src` without reading past its end.
    pub fn decode_u32(src: &[u8]) -> Decoded {
        let Some(&first) = src.first() else {
            return Decoded::Short;
        };
        let (len, base, head) = match first {
            0x00..=0x7F => return Decoded::Value(first as u32, 1),
            0x80..=0xBF => (2, MIN_2, (first & 0x3F) as u32),
            0xC0..=0xDF => (3, MIN_3, (first & 0x1F) as u32),
            0xE0..=0xEF => (4, MIN_4, (first & 0x0F) as u32),
            0xF0 => (5, MIN_5, 0),
            _ => return Decoded::Invalid,
        };
        if src.len() < len {
            return Decoded::Short;
        }
        let mut rest = head as u64;
        for &b in &src[1..len] {
            rest = (rest << 8) | b as u64;
        }
        match (base as u64).checked_add(rest) {
            Some(v) if v <= u32::MAX as u64 => Decoded::Value(v as u32, len),
            _ => Decoded::Invalid,
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn boundaries_pick_expected_width() {
            for (v, len) in [
                (0u32, 1usize),
                (127, 1),
                (128, 2),
                (16511, 2),
                (16512, 3),
                (MAX_3_BYTES, 3),
                (MAX_3_BYTES + 1, 4),
                (MIN_5 - 1, 4),
                (MIN_5, 5),
                (u32::MAX, 5),
            ] {
                let mut out = Vec::new();
                encode_u32(v, &mut out);
                assert_eq!(out.len(), len, "value {v}");
                assert_eq!(decode_u32(&out), Decoded::Value(v, len));
            }
        }

        #[test]
        fn short_and_invalid_inputs() {
            assert_eq!(decode_u32(&[]), Decoded::Short);
            assert_eq!(decode_u32(&[0x80]), Decoded::Short);
            assert_eq!(decode_u32(&[0xF0, 0, 0]), Decoded::Short);
            assert_eq!(decode_u32(&[0xF8, 0, 0, 0, 0]), Decoded::Invalid);
            assert_eq!(decode_u32(&[0xF0, 0xFF, 0xFF, 0xFF, 0xFF]), Decoded::Invalid);
        }
    }
}

pub mod rel {
    //! Signed relative offsets with the sign stored in the low bit.
    //!
    //! Zero is never encoded: `v > 0` becomes `(v - 1) << 1` and `v < 0`
    //! becomes `((-v) - 1) << 1 | 1`.

    /// Encodes a non-zero relative offset.
    pub fn encode(v: i32) -> Option<u32> {
        match v {
            0 => None,
            v if v > 0 => Some(((v as u32) - 1) << 1),
            v => Some(((v.unsigned_abs() - 1) << 1) | 1),
        }
    }

    /// Decodes a value produced by [`encode`].
    pub fn decode(raw: u32) -> i64 {
        let magnitude = (raw >> 1) as i64 + 1;
        if raw & 1 == 0 {
            magnitude
        } else {
            -magnitude
        }
    }

}

pub mod be {
    //! Fixed-width big-endian accessors for header and slot codecs.

    /// Reads a big-endian u32 at `off`.
    pub fn get_u32(src: &[u8], off: usize) -> u32 {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&src[off..off + 4]);
        u32::from_be_bytes(raw)
    }

    /// Reads a big-endian u64 at `off`.
    pub fn get_u64(src: &[u8], off: usize) -> u64 {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&src[off..off + 8]);
        u64::from_be_bytes(raw)
    }

    /// Writes a big-endian u32 at `off`.
    pub fn put_u32(dst: &mut [u8], off: usize, v: u32) {
        dst[off..off + 4].copy_from_slice(&v.to_be_bytes());
    }

    /// Writes a big-endian u64 at `off`.
    pub fn put_u64(dst: &mut [u8], off: usize, v: u64) {
        dst[off..off + 8].copy_from_slice(&v.to_be_bytes());
    }
}
