use encoding_rs::WINDOWS_1252;
use serde::Serialize;

const UTF8_BOM: [u8; 3] = [0xEF, 0xBB, 0xBF];
const MOJIBAKE_MARKERS: [char; 7] = ['\u{FFFD}', 'Ã', 'Â', '¡', '¢', '£', '¤'];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceEncoding {
    Utf8,
    Windows1252,
}

#[derive(Debug, Clone)]
pub struct DecodedText {
    pub text: String,
    pub encoding: SourceEncoding,
    pub utf8_score: usize,
    pub windows1252_score: usize,
    /// The winning decoding still carries replacement or mojibake markers.
    pub ambiguous: bool,
}

/// Counts U+FFFD replacement characters plus the usual UTF-8-read-as-Latin-1 markers.
pub fn mojibake_score(text: &str) -> usize {
    text.chars()
        .filter(|c| MOJIBAKE_MARKERS.contains(c))
        .count()
}

/// Picks between a UTF-8 and a Windows-1252 reading of `bytes`. Never fails.
pub fn decode_bytes(bytes: &[u8]) -> DecodedText {
    let body = bytes.strip_prefix(&UTF8_BOM).unwrap_or(bytes);

    let utf8 = String::from_utf8_lossy(body).into_owned();
    let (latin, _) = WINDOWS_1252.decode_without_bom_handling(body);
    let latin = latin.into_owned();

    let utf8_score = mojibake_score(&utf8);
    let windows1252_score = mojibake_score(&latin);

    let (text, encoding, winning) = if utf8_score <= windows1252_score {
        (utf8, SourceEncoding::Utf8, utf8_score)
    } else {
        (latin, SourceEncoding::Windows1252, windows1252_score)
    };

    if winning > 0 {
        tracing::warn!(
            ?encoding,
            utf8_score,
            windows1252_score,
            "decoded text still carries mojibake markers"
        );
    } else {
        tracing::debug!(?encoding, utf8_score, windows1252_score, "decoded input");
    }

    DecodedText {
        text,
        encoding,
        utf8_score,
        windows1252_score,
        ambiguous: winning > 0,
    }
}
