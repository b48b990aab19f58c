//! Payload compression.
//!
//! Method names are the wire-visible content-encoding values: `none` (or
//! empty), `gzip` and `br`. Anything else is rejected rather than passed
//! through, so a stored object can always be decoded by the name it was
//! stored under.

use std::borrow::Cow;
use std::fmt;
use std::io::{Read, Write};
use std::str::FromStr;

use flate2::{Compression, read::GzDecoder, write::GzEncoder};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StorageError};

pub const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
pub const DEFAULT_GZIP_LEVEL: u32 = 9;
/// 5/6 balance compression speed against ratio.
pub const DEFAULT_BROTLI_QUALITY: u32 = 5;

const MAX_GZIP_LEVEL: u32 = 9;
const MAX_BROTLI_QUALITY: u32 = 11;
const BROTLI_WINDOW: i32 = 22;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Encoding {
    #[default]
    #[serde(rename = "none", alias = "")]
    Identity,
    #[serde(rename = "gzip")]
    Gzip,
    #[serde(rename = "br")]
    Brotli,
}

impl Encoding {
    /// Value recorded in content-encoding metadata; `None` for identity.
    pub fn header_value(self) -> Option<&'static str> {
        match self {
            Encoding::Identity => None,
            Encoding::Gzip => Some("gzip"),
            Encoding::Brotli => Some("br"),
        }
    }

    /// File suffix used by the local filesystem backend.
    pub fn file_extension(self) -> Option<&'static str> {
        match self {
            Encoding::Identity => None,
            Encoding::Gzip => Some("gz"),
            Encoding::Brotli => Some("br"),
        }
    }

    pub fn default_level(self) -> Option<u32> {
        match self {
            Encoding::Identity => None,
            Encoding::Gzip => Some(DEFAULT_GZIP_LEVEL),
            Encoding::Brotli => Some(DEFAULT_BROTLI_QUALITY),
        }
    }

    fn max_level(self) -> u32 {
        match self {
            Encoding::Identity => 0,
            Encoding::Gzip => MAX_GZIP_LEVEL,
            Encoding::Brotli => MAX_BROTLI_QUALITY,
        }
    }

    /// Normalize a caller-supplied method into an encoding.
    pub fn resolve<'a>(method: impl Into<Method<'a>>) -> Result<Self> {
        match method.into() {
            Method::Unset | Method::Flag(false) => Ok(Encoding::Identity),
            // `true` predates named methods and always meant gzip.
            Method::Flag(true) => Ok(Encoding::Gzip),
            Method::Name(name) => name.parse(),
            Method::Encoding(encoding) => Ok(encoding),
        }
    }
}

impl FromStr for Encoding {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "" | "none" => Ok(Encoding::Identity),
            "gzip" => Ok(Encoding::Gzip),
            "br" => Ok(Encoding::Brotli),
            _ => Err(StorageError::UnsupportedCodec {
                method: s.to_owned(),
            }),
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.header_value().unwrap_or("none"))
    }
}

/// A compression method as callers spell it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method<'a> {
    Unset,
    Flag(bool),
    Name(&'a str),
    Encoding(Encoding),
}

impl<'a> From<&'a str> for Method<'a> {
    fn from(name: &'a str) -> Self {
        Method::Name(name)
    }
}

impl<'a> From<&'a String> for Method<'a> {
    fn from(name: &'a String) -> Self {
        Method::Name(name)
    }
}

impl<'a> From<Option<&'a str>> for Method<'a> {
    fn from(name: Option<&'a str>) -> Self {
        name.map_or(Method::Unset, Method::Name)
    }
}

impl From<bool> for Method<'_> {
    fn from(flag: bool) -> Self {
        Method::Flag(flag)
    }
}

impl From<Encoding> for Method<'_> {
    fn from(encoding: Encoding) -> Self {
        Method::Encoding(encoding)
    }
}

/// Compress `content` with `method`. An unset `level` uses the codec default.
pub fn compress<'a, 'c>(
    content: &'c [u8],
    method: impl Into<Method<'a>>,
    level: Option<u32>,
) -> Result<Cow<'c, [u8]>> {
    let encoding = Encoding::resolve(method)?;
    let level = match encoding.default_level() {
        None => return Ok(Cow::Borrowed(content)),
        Some(default) => level.unwrap_or(default),
    };
    if level > encoding.max_level() {
        return Err(StorageError::InvalidLevel {
            encoding,
            level,
            max: encoding.max_level(),
        });
    }

    let out = match encoding {
        Encoding::Gzip => gzip_compress(content, level),
        Encoding::Brotli => brotli_compress(content, level),
        Encoding::Identity => unreachable!("identity returns early"),
    };
    out.map(Cow::Owned)
        .map_err(|source| StorageError::CodecFailure {
            encoding,
            label: None,
            source,
        })
}

/// Decompress `content` stored under `encoding`.
///
/// `label` names the payload (usually its key) in any error raised, since
/// codec failures are otherwise hard to trace back to an object.
///
/// The gzip check only looks at the two magic bytes, so roughly one payload
/// in 65536 that is not gzip will get past it and fail inside the decoder
/// instead.
pub fn decompress<'a, 'c>(
    content: &'c [u8],
    encoding: impl Into<Method<'a>>,
    label: Option<&str>,
) -> Result<Cow<'c, [u8]>> {
    let encoding = Encoding::resolve(encoding)?;
    let out = match encoding {
        Encoding::Identity => return Ok(Cow::Borrowed(content)),
        Encoding::Gzip => {
            if !content.starts_with(&GZIP_MAGIC) {
                let observed = &content[..content.len().min(2)];
                return Err(StorageError::malformed_gzip(observed, label));
            }
            gunzip(content)
        }
        Encoding::Brotli => brotli_decompress(content),
    };
    out.map(Cow::Owned)
        .map_err(|source| StorageError::CodecFailure {
            encoding,
            label: label.map(str::to_owned),
            source,
        })
}

fn gzip_compress(content: &[u8], level: u32) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::new(level));
    encoder.write_all(content)?;
    encoder.finish()
}

fn gunzip(content: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    GzDecoder::new(content).read_to_end(&mut out)?;
    Ok(out)
}

fn brotli_compress(content: &[u8], quality: u32) -> std::io::Result<Vec<u8>> {
    let mut params = brotli::enc::BrotliEncoderParams::default();
    params.quality = quality as i32;
    params.lgwin = BROTLI_WINDOW;
    let mut out = Vec::new();
    brotli::BrotliCompress(&mut &content[..], &mut out, &params)?;
    Ok(out)
}

fn brotli_decompress(content: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    brotli::BrotliDecompress(&mut &content[..], &mut out)?;
    Ok(out)
}
