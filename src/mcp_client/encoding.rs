//! Text codec for stdio framing.
//!
//! Servers may speak a non-UTF-8 encoding on their pipes. Each line read from
//! the child is decoded according to the descriptor's encoding label and
//! malformed-byte policy; outgoing lines are encoded the same way.

use std::borrow::Cow;

use encoding_rs::{DecoderResult, Encoding};

use super::config::EncodingErrorHandler;

/// Line codec bound to one encoding and one malformed-byte policy.
#[derive(Debug, Clone, Copy)]
pub struct TextCodec {
    encoding: &'static Encoding,
    on_error: EncodingErrorHandler,
}

impl TextCodec {
    /// Resolve an encoding label (e.g. `utf-8`, `latin1`, `shift_jis`).
    ///
    /// Returns `None` for labels `encoding_rs` does not know.
    pub fn new(label: &str, on_error: EncodingErrorHandler) -> Option<Self> {
        let encoding = Encoding::for_label(label.trim().as_bytes())?;
        Some(Self { encoding, on_error })
    }

    pub fn name(&self) -> &'static str {
        self.encoding.name()
    }

    /// Decode one line. `None` means the line was rejected under `strict`.
    pub fn decode<'a>(&self, bytes: &'a [u8]) -> Option<Cow<'a, str>> {
        match self.on_error {
            EncodingErrorHandler::Strict => self
                .encoding
                .decode_without_bom_handling_and_without_replacement(bytes),
            EncodingErrorHandler::Replace => {
                Some(self.encoding.decode_without_bom_handling(bytes).0)
            }
            EncodingErrorHandler::Ignore => Some(Cow::Owned(self.decode_skipping_malformed(bytes))),
        }
    }

    fn decode_skipping_malformed(&self, bytes: &[u8]) -> String {
        let mut decoder = self.encoding.new_decoder_without_bom_handling();
        let capacity = decoder
            .max_utf8_buffer_length_without_replacement(bytes.len())
            .unwrap_or(bytes.len() * 3);
        let mut out = String::with_capacity(capacity);
        let mut pos = 0;

        loop {
            let (result, read) =
                decoder.decode_to_string_without_replacement(&bytes[pos..], &mut out, true);
            pos += read;
            match result {
                DecoderResult::InputEmpty => break,
                DecoderResult::OutputFull => out.reserve(bytes.len() - pos + 16),
                DecoderResult::Malformed(_, _) => continue,
            }
        }

        out
    }

    /// Encode one outgoing line. `None` means unmappable characters under `strict`.
    pub fn encode<'a>(&self, text: &'a str) -> Option<Cow<'a, [u8]>> {
        let (bytes, _, had_errors) = self.encoding.encode(text);
        if had_errors && self.on_error == EncodingErrorHandler::Strict {
            return None;
        }
        Some(bytes)
    }
}
