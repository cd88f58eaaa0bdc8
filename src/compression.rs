//! LZ4 stream compression for archive payloads
//!
//! The archive payload is compressed as one LZ4 frame so the whole stream can
//! be produced and consumed without seeking. Mode `none` passes bytes through
//! unchanged, which is useful for archives that will be compressed again by
//! the storage layer.
//!
//! ## Examples
//!
//! ```rust
//! use sysback::compression::{CompressionMode, CompressionWriter, DecompressionReader};
//! use std::io::{Read, Write};
//!
//! let mut writer = CompressionWriter::new(Vec::new(), CompressionMode::Fast);
//! writer.write_all(b"hello hello hello hello").unwrap();
//! let compressed = writer.finish().unwrap();
//!
//! let mut reader = DecompressionReader::new(&compressed[..], CompressionMode::Fast);
//! let mut out = Vec::new();
//! reader.read_to_end(&mut out).unwrap();
//! assert_eq!(out, b"hello hello hello hello");
//! ```

use crate::error::{Result, SysbackError};
use lz4_flex::frame::{FrameDecoder, FrameEncoder};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{self, Read, Write};
use std::str::FromStr;

/// Payload compression mode
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CompressionMode {
    /// Store the payload uncompressed
    None,
    /// LZ4 frame compression (default)
    #[default]
    Fast,
}

impl CompressionMode {
    /// Byte stored in the archive header
    pub fn to_byte(self) -> u8 {
        match self {
            CompressionMode::None => 0,
            CompressionMode::Fast => 1,
        }
    }

    /// Decode the header byte
    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(CompressionMode::None),
            1 => Ok(CompressionMode::Fast),
            other => Err(SysbackError::format(format!("unknown compression mode {}", other))),
        }
    }
}

impl fmt::Display for CompressionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CompressionMode::None => "none",
            CompressionMode::Fast => "fast",
        })
    }
}

impl FromStr for CompressionMode {
    type Err = SysbackError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "off" => Ok(CompressionMode::None),
            "fast" | "lz4" => Ok(CompressionMode::Fast),
            other => Err(SysbackError::InvalidConfiguration(format!(
                "unknown compression mode '{}'",
                other
            ))),
        }
    }
}

/// Writer that compresses everything written to it
pub enum CompressionWriter<W: Write> {
    /// Pass-through
    Raw(W),
    /// LZ4 frame encoder
    Lz4(FrameEncoder<W>),
}

impl<W: Write> CompressionWriter<W> {
    /// Wrap `inner` according to `mode`
    pub fn new(inner: W, mode: CompressionMode) -> Self {
        match mode {
            CompressionMode::None => CompressionWriter::Raw(inner),
            CompressionMode::Fast => CompressionWriter::Lz4(FrameEncoder::new(inner)),
        }
    }

    /// Write the frame end marker and return the inner writer
    pub fn finish(self) -> Result<W> {
        match self {
            CompressionWriter::Raw(mut w) => {
                w.flush()?;
                Ok(w)
            }
            CompressionWriter::Lz4(enc) => enc
                .finish()
                .map_err(|e| SysbackError::Io(io::Error::other(e.to_string()))),
        }
    }
}

impl<W: Write> Write for CompressionWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            CompressionWriter::Raw(w) => w.write(buf),
            CompressionWriter::Lz4(enc) => enc.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            CompressionWriter::Raw(w) => w.flush(),
            CompressionWriter::Lz4(enc) => enc.flush(),
        }
    }
}

impl<W: Write> fmt::Debug for CompressionWriter<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompressionWriter::Raw(_) => write!(f, "CompressionWriter::Raw"),
            CompressionWriter::Lz4(_) => write!(f, "CompressionWriter::Lz4"),
        }
    }
}

/// Reader that decompresses a payload written by [`CompressionWriter`]
pub enum DecompressionReader<R: Read> {
    /// Pass-through
    Raw(R),
    /// LZ4 frame decoder
    Lz4(FrameDecoder<R>),
}

impl<R: Read> DecompressionReader<R> {
    /// Wrap `inner` according to `mode`
    pub fn new(inner: R, mode: CompressionMode) -> Self {
        match mode {
            CompressionMode::None => DecompressionReader::Raw(inner),
            CompressionMode::Fast => DecompressionReader::Lz4(FrameDecoder::new(inner)),
        }
    }
}

impl<R: Read> Read for DecompressionReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            DecompressionReader::Raw(r) => r.read(buf),
            DecompressionReader::Lz4(dec) => dec.read(buf),
        }
    }
}

impl<R: Read> fmt::Debug for DecompressionReader<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecompressionReader::Raw(_) => write!(f, "DecompressionReader::Raw"),
            DecompressionReader::Lz4(_) => write!(f, "DecompressionReader::Lz4"),
        }
    }
}
