//! Incremental UTF-8 decoding for terminal output streams.
//!
//! Output arrives in fixed-size chunks, so a multi-byte sequence can
//! straddle a chunk boundary. Decoding each chunk on its own would turn
//! the straddling character into replacement characters on both sides;
//! the carry buffer retains the incomplete trailing bytes until the rest
//! arrives. Invalid bytes mid-stream still become U+FFFD.

/// Streaming decoder with a carry buffer for one output stream. UTF-8
/// sequences are at most four bytes, so the carry never exceeds three.
#[derive(Default)]
pub struct Utf8Carry {
    carry: Vec<u8>,
}

impl Utf8Carry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode the next chunk, prepending bytes carried over from the
    /// previous call and retaining any incomplete trailing sequence for
    /// the next one.
    pub fn push(&mut self, chunk: &[u8]) -> String {
        let mut bytes = std::mem::take(&mut self.carry);
        bytes.extend_from_slice(chunk);

        let mut out = String::with_capacity(bytes.len());
        let mut rest = bytes.as_slice();
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    // The prefix up to valid_up_to is valid by contract.
                    out.push_str(unsafe { std::str::from_utf8_unchecked(valid) });
                    match e.error_len() {
                        Some(n) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[n..];
                        }
                        None => {
                            // Incomplete trailing sequence: keep it until
                            // the next chunk completes it.
                            self.carry = after.to_vec();
                            break;
                        }
                    }
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascii_passes_through() {
        let mut decoder = Utf8Carry::new();
        assert_eq!(decoder.push(b"hello world"), "hello world");
        assert_eq!(decoder.push(b""), "");
    }

    #[test]
    fn whole_multibyte_chunk_is_unchanged() {
        let mut decoder = Utf8Carry::new();
        assert_eq!(decoder.push("héllo €".as_bytes()), "héllo €");
    }

    #[test]
    fn euro_sign_split_after_first_byte() {
        // € is E2 82 AC.
        let mut decoder = Utf8Carry::new();
        assert_eq!(decoder.push(&[0xE2]), "");
        assert_eq!(decoder.push(&[0x82, 0xAC]), "€");
    }

    #[test]
    fn euro_sign_split_before_last_byte() {
        let mut decoder = Utf8Carry::new();
        assert_eq!(decoder.push(&[0xE2, 0x82]), "");
        assert_eq!(decoder.push(&[0xAC]), "€");
    }

    #[test]
    fn four_byte_emoji_split_byte_by_byte() {
        // 😀 is F0 9F 98 80.
        let mut decoder = Utf8Carry::new();
        assert_eq!(decoder.push(&[0xF0]), "");
        assert_eq!(decoder.push(&[0x9F]), "");
        assert_eq!(decoder.push(&[0x98]), "");
        assert_eq!(decoder.push(&[0x80]), "😀");
    }

    #[test]
    fn text_around_the_split_is_preserved() {
        let mut decoder = Utf8Carry::new();
        let bytes = "ab€cd".as_bytes();
        let mut out = decoder.push(&bytes[..3]); // "ab" + first byte of €
        out.push_str(&decoder.push(&bytes[3..]));
        assert_eq!(out, "ab€cd");
    }

    #[test]
    fn invalid_byte_mid_stream_becomes_replacement() {
        let mut decoder = Utf8Carry::new();
        assert_eq!(decoder.push(&[b'a', 0xFF, b'b']), "a\u{FFFD}b");
    }

    #[test]
    fn abandoned_partial_sequence_becomes_replacement() {
        // E2 82 carried over, then a plain ASCII byte: the carried bytes
        // can never complete and decode as one invalid sequence.
        let mut decoder = Utf8Carry::new();
        assert_eq!(decoder.push(&[0xE2, 0x82]), "");
        assert_eq!(decoder.push(b"A"), "\u{FFFD}A");
    }

    #[test]
    fn carry_never_exceeds_three_bytes() {
        let mut decoder = Utf8Carry::new();
        decoder.push(&[b'x', 0xF0, 0x9F, 0x98]);
        assert_eq!(decoder.carry, [0xF0, 0x9F, 0x98]);
        decoder.push(&[0x80]);
        assert!(decoder.carry.is_empty());
    }

    #[test]
    fn chunk_boundary_scan_over_long_text() {
        // Split a long multibyte string at every position; concatenated
        // output must always equal the input.
        let text = "boxes ┌─┐ kanji 漢字 emoji 🚀 done";
        let bytes = text.as_bytes();
        for split in 0..=bytes.len() {
            let mut decoder = Utf8Carry::new();
            let mut out = decoder.push(&bytes[..split]);
            out.push_str(&decoder.push(&bytes[split..]));
            assert_eq!(out, text, "corrupted at split {split}");
        }
    }
}
