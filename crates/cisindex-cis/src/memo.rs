//! Best-effort decoding of transfer memos into text.
//!
//! Memos are arbitrary bytes, usually a CBOR text string. The heuristic below
//! is empirically tuned and downstream consumers depend on its exact output,
//! thresholds and fallback order included.

use std::borrow::Cow;

use encoding_rs::Encoding;

/// Below this, detection is retried without the first two bytes.
pub const RETRY_CONFIDENCE: f32 = 0.1;
/// Detection must be more confident than this to decode at all.
pub const ACCEPT_CONFIDENCE: f32 = 0.5;
pub const DECODING_FAILURE: &str = "Decoding failure...";

/// A charset guess for a byte string.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    /// WHATWG encoding label.
    pub encoding: Option<String>,
    pub confidence: f32,
}

impl Detection {
    pub fn none() -> Self {
        Self {
            encoding: None,
            confidence: 0.0,
        }
    }
}

pub trait CharsetDetector: Send + Sync {
    fn detect(&self, bytes: &[u8]) -> Detection;
}

/// Statistical detection via the `chardet` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct ChardetDetector;

impl CharsetDetector for ChardetDetector {
    fn detect(&self, bytes: &[u8]) -> Detection {
        if bytes.is_empty() {
            return Detection::none();
        }
        let (charset, confidence, _language) = chardet::detect(bytes);
        if charset.is_empty() {
            return Detection::none();
        }
        Detection {
            encoding: Some(chardet::charset2encoding(&charset).to_string()),
            confidence,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedMemo {
    pub is_failure: bool,
    pub text: String,
}

impl DecodedMemo {
    fn ok(text: impl Into<String>) -> Self {
        Self {
            is_failure: false,
            text: text.into(),
        }
    }

    fn failure() -> Self {
        Self {
            is_failure: true,
            text: DECODING_FAILURE.to_string(),
        }
    }
}

pub struct MemoDecoder {
    detector: Box<dyn CharsetDetector>,
}

impl Default for MemoDecoder {
    fn default() -> Self {
        Self::new(ChardetDetector)
    }
}

impl MemoDecoder {
    pub fn new(detector: impl CharsetDetector + 'static) -> Self {
        Self {
            detector: Box::new(detector),
        }
    }

    /// Decode a hex memo. Never fails; undecodable input yields
    /// `is_failure = true` and the fixed failure text.
    pub fn decode(&self, hex_payload: &str) -> DecodedMemo {
        let Ok(bytes) = hex::decode(hex_payload) else {
            return DecodedMemo::failure();
        };
        let mut value: &[u8] = &bytes;

        let mut guess = self.detector.detect(value);
        if guess.confidence < RETRY_CONFIDENCE {
            value = value.get(2..).unwrap_or_default();
            guess = self.detector.detect(value);
        }

        let encoding = match guess.encoding {
            Some(label) if guess.confidence > ACCEPT_CONFIDENCE => label,
            _ => return DecodedMemo::failure(),
        };

        // A label the decoder does not know is a failure, not a decode error
        let Some(decoder) = Encoding::for_label(encoding.as_bytes()) else {
            return DecodedMemo::failure();
        };
        if let Some(text) = decoder.decode_without_bom_handling_and_without_replacement(value) {
            return DecodedMemo::ok(drop_first_char(&text));
        }

        // Byte-level fallback skips the raw marker byte, then still drops
        // the first character of what remains
        match std::str::from_utf8(value.get(1..).unwrap_or_default()) {
            Ok(text) => DecodedMemo::ok(drop_first_char(text)),
            Err(_) => DecodedMemo::failure(),
        }
    }
}

fn drop_first_char(text: &str) -> Cow<'_, str> {
    let mut chars = text.chars();
    chars.next();
    Cow::Borrowed(chars.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Replays scripted detections and records the inputs it saw.
    struct Scripted {
        answers: Mutex<Vec<Detection>>,
        seen: std::sync::Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl Scripted {
        fn new(answers: Vec<Detection>) -> (Self, std::sync::Arc<Mutex<Vec<Vec<u8>>>>) {
            let seen = std::sync::Arc::new(Mutex::new(vec![]));
            let mut answers = answers;
            answers.reverse();
            (
                Self {
                    answers: Mutex::new(answers),
                    seen: seen.clone(),
                },
                seen,
            )
        }
    }

    impl CharsetDetector for Scripted {
        fn detect(&self, bytes: &[u8]) -> Detection {
            self.seen.lock().unwrap().push(bytes.to_vec());
            self.answers.lock().unwrap().pop().unwrap_or_else(Detection::none)
        }
    }

    fn guess(label: &str, confidence: f32) -> Detection {
        Detection {
            encoding: Some(label.into()),
            confidence,
        }
    }

    #[test]
    fn confident_ascii_drops_marker_char() {
        let payload = hex::encode("khello world");
        let (detector, _) = Scripted::new(vec![guess("ascii", 1.0)]);
        let out = MemoDecoder::new(detector).decode(&payload);
        assert_eq!(out, DecodedMemo::ok("hello world"));
    }

    #[test]
    fn low_confidence_retries_without_length_prefix() {
        let payload = hex::encode(b"\x01\x02khi");
        let (detector, seen) = Scripted::new(vec![guess("utf-8", 0.05), guess("utf-8", 0.9)]);
        let out = MemoDecoder::new(detector).decode(&payload);
        assert_eq!(out, DecodedMemo::ok("hi"));
        assert_eq!(seen.lock().unwrap()[1], b"khi");
    }

    #[test]
    fn both_detections_failing_is_a_failure() {
        let payload = hex::encode([0xde, 0xad, 0xbe, 0xef]);
        let (detector, _) = Scripted::new(vec![Detection::none(), Detection::none()]);
        let out = MemoDecoder::new(detector).decode(&payload);
        assert_eq!(out, DecodedMemo::failure());
        assert_eq!(out.text, "Decoding failure...");
    }

    #[test]
    fn middling_confidence_is_not_enough() {
        let (detector, _) = Scripted::new(vec![guess("utf-8", 0.5)]);
        assert!(MemoDecoder::new(detector).decode("6b6869").is_failure);
    }

    #[test]
    fn character_decode_error_falls_back_to_utf8_bytes() {
        // Invalid as UTF-8 at byte 0, valid from byte 1 on
        let payload = hex::encode(b"\xffxok");
        let (detector, _) = Scripted::new(vec![guess("utf-8", 0.99)]);
        let out = MemoDecoder::new(detector).decode(&payload);
        assert_eq!(out, DecodedMemo::ok("ok"));
    }

    #[test]
    fn unknown_label_is_a_failure() {
        let payload = hex::encode(b"\x64xyz");
        let (detector, _) = Scripted::new(vec![guess("EUC-TW", 0.99)]);
        assert_eq!(MemoDecoder::new(detector).decode(&payload), DecodedMemo::failure());
    }

    #[test]
    fn fallback_that_is_not_utf8_either_fails() {
        let payload = hex::encode(b"\xff\xff\xff");
        let (detector, _) = Scripted::new(vec![guess("utf-8", 0.99)]);
        assert_eq!(MemoDecoder::new(detector).decode(&payload), DecodedMemo::failure());
    }

    #[test]
    fn bad_hex_and_empty_payloads_fail() {
        let decoder = MemoDecoder::default();
        assert!(decoder.decode("not hex").is_failure);
        assert!(decoder.decode("").is_failure);
    }

    #[test]
    fn chardet_detects_plain_ascii() {
        let out = MemoDecoder::default().decode(&hex::encode("khello world"));
        assert_eq!(out, DecodedMemo::ok("hello world"));
    }
}
