//! Base64 transport encoding for file payloads.
//!
//! # Design
//! File bytes cross the relay channel inside JSON-shaped messages, so they
//! travel as standard base64 text. Encoding walks the input in fixed chunks
//! whose length is a multiple of three: every chunk encodes to a padding-free
//! run of characters, so concatenating the runs yields exactly the encoding
//! of the whole input. Memory stays at one output buffer sized up front, no
//! matter how large the upload is.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

/// Bytes per encoding step. Must stay a multiple of 3.
const CHUNK_LEN: usize = 3 * 16 * 1024;

/// Encode `bytes` as standard (padded) base64.
pub fn encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len().div_ceil(3) * 4);
    for chunk in bytes.chunks(CHUNK_LEN) {
        STANDARD.encode_string(chunk, &mut out);
    }
    out
}

/// Decode standard base64 produced by [`encode`].
pub fn decode(text: &str) -> Result<Vec<u8>, base64::DecodeError> {
    STANDARD.decode(text)
}
