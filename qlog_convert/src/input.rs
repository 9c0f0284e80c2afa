//! Read trace files that may be gzip or zstd compressed.
//!
//! Compression is detected from the magic bytes at the start of the input,
//! not from the file extension.

use flate2::read::MultiGzDecoder;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use thiserror::Error;

/// Errors that can occur while reading an input file.
#[derive(Error, Debug)]
pub enum InputError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("input is not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

pub type Result<T> = std::result::Result<T, InputError>;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

/// Compression of an input stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
    Zstd,
}

impl Compression {
    /// Detect compression from the first bytes of the input.
    pub fn detect(bytes: &[u8]) -> Self {
        if bytes.starts_with(&GZIP_MAGIC) {
            Compression::Gzip
        } else if bytes.starts_with(&ZSTD_MAGIC) {
            Compression::Zstd
        } else {
            Compression::None
        }
    }
}

/// Read an entire input as text, decompressing it if needed.
pub fn read_input<R: Read>(mut reader: R) -> Result<String> {
    let mut raw = Vec::new();
    reader.read_to_end(&mut raw)?;

    let compression = Compression::detect(&raw);
    let bytes = match compression {
        Compression::None => raw,
        Compression::Gzip => {
            let mut decoded = Vec::new();
            MultiGzDecoder::new(raw.as_slice()).read_to_end(&mut decoded)?;
            decoded
        }
        Compression::Zstd => zstd::decode_all(raw.as_slice())?,
    };
    if compression != Compression::None {
        log::debug!("decompressed {:?} input to {} bytes", compression, bytes.len());
    }

    Ok(String::from_utf8(bytes)?)
}

/// Open and read a file with [`read_input`].
pub fn read_input_file(path: &Path) -> Result<String> {
    let file = File::open(path)?;
    read_input(BufReader::new(file))
}
