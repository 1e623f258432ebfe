//! Response body decoding for preview.
//!
//! [`decode_body`] never fails. Whatever the captured bytes look like, the
//! caller gets text back: the decoded body, a base64 rendering of binary data,
//! or a bracketed placeholder that explains what went wrong.
//!
//! Precedence, first match wins:
//!
//! 1. An explicit `Content-Encoding` naming a known codec.
//! 2. No header (or `identity`) but the gzip magic `1f 8b` up front.
//! 3. A NUL byte in the first [`BINARY_SNIFF_LEN`] bytes: binary, base64.
//! 4. Anything else: UTF-8 text.
//!
//! A header naming a codec we cannot decode produces an informational
//! placeholder rather than an error.

use std::io::Read;

use base64::engine::general_purpose;
use base64::Engine as _;
use flate2::read::{DeflateDecoder, MultiGzDecoder, ZlibDecoder};

/// How many leading bytes are scanned for a NUL when sniffing binary content.
pub const BINARY_SNIFF_LEN: usize = 1024;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const BROTLI_BUFFER_SIZE: usize = 4096;

/// Outcome of decoding one captured body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeResult {
    /// Decoded text, base64 for binary bodies, or a placeholder.
    pub text: String,
    /// Whether `text` is base64-encoded binary data.
    pub is_binary: bool,
    /// Set when `text` is a placeholder rather than the body itself.
    pub diagnostic: Option<String>,
}

impl DecodeResult {
    fn text(text: String) -> Self {
        Self {
            text,
            is_binary: false,
            diagnostic: None,
        }
    }

    fn binary(bytes: &[u8]) -> Self {
        Self {
            text: general_purpose::STANDARD.encode(bytes),
            is_binary: true,
            diagnostic: None,
        }
    }

    fn placeholder(message: String) -> Self {
        Self {
            text: message.clone(),
            is_binary: false,
            diagnostic: Some(message),
        }
    }

    /// Returns true if the body could not be rendered and a placeholder was used.
    pub fn is_placeholder(&self) -> bool {
        self.diagnostic.is_some()
    }
}

/// A content coding named by a `Content-Encoding` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Codec {
    Gzip,
    Brotli,
    Deflate,
    Zstd,
}

impl Codec {
    fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "gzip" | "x-gzip" => Some(Self::Gzip),
            "br" => Some(Self::Brotli),
            "deflate" => Some(Self::Deflate),
            "zstd" => Some(Self::Zstd),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Gzip => "gzip",
            Self::Brotli => "br",
            Self::Deflate => "deflate",
            Self::Zstd => "zstd",
        }
    }

    fn is_available(self) -> bool {
        match self {
            Self::Zstd => cfg!(feature = "zstd"),
            _ => true,
        }
    }

    fn decode(self, input: &[u8]) -> std::io::Result<Vec<u8>> {
        match self {
            Self::Gzip => gunzip(input),
            Self::Brotli => {
                let mut out = Vec::new();
                brotli::Decompressor::new(input, BROTLI_BUFFER_SIZE).read_to_end(&mut out)?;
                Ok(out)
            }
            Self::Deflate => inflate(input),
            Self::Zstd => unzstd(input),
        }
    }
}

fn gunzip(input: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    MultiGzDecoder::new(input).read_to_end(&mut out)?;
    Ok(out)
}

/// `deflate` is meant to be zlib-wrapped, but plenty of servers send raw deflate.
fn inflate(input: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    match ZlibDecoder::new(input).read_to_end(&mut out) {
        Ok(_) => Ok(out),
        Err(zlib_err) => {
            let mut raw = Vec::new();
            DeflateDecoder::new(input)
                .read_to_end(&mut raw)
                .map_err(|_| zlib_err)?;
            Ok(raw)
        }
    }
}

#[cfg(feature = "zstd")]
fn unzstd(input: &[u8]) -> std::io::Result<Vec<u8>> {
    zstd::stream::decode_all(input)
}

#[cfg(not(feature = "zstd"))]
fn unzstd(_input: &[u8]) -> std::io::Result<Vec<u8>> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "zstd support not compiled in",
    ))
}

/// Decodes a captured body for display.
///
/// `content_encoding` is the raw `Content-Encoding` header value, if any.
pub fn decode_body(body: &[u8], content_encoding: Option<&str>) -> DecodeResult {
    let codings: Vec<&str> = content_encoding
        .unwrap_or("")
        .split(',')
        .map(str::trim)
        .filter(|c| !c.is_empty() && !c.eq_ignore_ascii_case("identity"))
        .collect();

    if codings.is_empty() {
        return decode_undeclared(body);
    }

    // Codings are listed in the order they were applied; undo them backwards.
    let mut codecs = Vec::with_capacity(codings.len());
    for name in codings.iter().rev() {
        match Codec::parse(name) {
            Some(codec) if codec.is_available() => codecs.push(codec),
            _ => {
                return DecodeResult::placeholder(format!(
                    "[Content-Encoding '{}' is not supported for preview]",
                    name
                ))
            }
        }
    }

    let mut current = body.to_vec();
    for codec in codecs {
        match codec.decode(&current) {
            Ok(decoded) => current = decoded,
            Err(e) => {
                tracing::debug!(codec = codec.name(), error = %e, "Body decode failed");
                return DecodeResult::placeholder(format!(
                    "[Failed to decode {} body: {}]",
                    codec.name(),
                    e
                ));
            }
        }
    }

    classify(&current)
}

fn decode_undeclared(body: &[u8]) -> DecodeResult {
    if body.starts_with(&GZIP_MAGIC) {
        return match gunzip(body) {
            Ok(decoded) => classify(&decoded),
            Err(e) => DecodeResult::placeholder(format!(
                "[Body looks like gzip (no Content-Encoding header) but failed to decode: {}]",
                e
            )),
        };
    }
    classify(body)
}

/// Binary/text heuristic applied to already-decompressed bytes.
fn classify(bytes: &[u8]) -> DecodeResult {
    let window = &bytes[..bytes.len().min(BINARY_SNIFF_LEN)];
    if window.contains(&0) {
        DecodeResult::binary(bytes)
    } else {
        DecodeResult::text(String::from_utf8_lossy(bytes).into_owned())
    }
}

/// Formats a byte count the way the inspector shows it, e.g. `"1.2 KB"`.
pub fn format_size(bytes: usize) -> String {
    const UNITS: [&str; 3] = ["KB", "MB", "GB"];

    if bytes < 1024 {
        return format!("{} B", bytes);
    }

    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit])
}
