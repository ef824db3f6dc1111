//! Base64 helpers shared by key and envelope encodings.
//!
//! Encoding is always standard padded base64. Decoding is lenient about the
//! things browsers and copy-paste introduce: surrounding PEM armor, embedded
//! whitespace and stripped padding.

use base64::{Engine as _, engine::general_purpose::STANDARD};

/// Encode bytes as standard padded base64.
pub fn encode(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decode base64, tolerating PEM armor lines, whitespace and missing padding.
///
/// Returns `None` on anything that is not base64 after normalization.
pub fn decode(text: &str) -> Option<Vec<u8>> {
    let mut body: String = text
        .lines()
        .filter(|line| !line.trim_start().starts_with("-----"))
        .flat_map(|line| line.chars())
        .filter(|c| !c.is_ascii_whitespace())
        .collect();

    while body.len() % 4 != 0 {
        body.push('=');
    }

    STANDARD.decode(body.as_bytes()).ok()
}
