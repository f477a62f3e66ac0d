use std::io;

use rkyv::rancor;
use rkyv::util::AlignedVec;

use crate::protocol::{Datagram, MAX_DATAGRAM_SIZE};

pub const COMPRESSION_HINT_UNCOMPRESSED: u8 = 0;
pub const COMPRESSION_HINT_COMPRESSED: u8 = 1;

const COMPRESSION_LEVEL: i32 = 3;
const MAX_DECOMPRESSED_SIZE: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("serialization failed: {0}")]
    Serialize(rancor::Error),
    #[error("deserialization failed: {0}")]
    Deserialize(rancor::Error),
    #[error("compression failed: {0}")]
    Compression(io::Error),
    #[error("empty datagram")]
    Empty,
    #[error("unknown compression hint {0}")]
    UnknownCompression(u8),
    #[error("invalid datagram header")]
    InvalidHeader,
    #[error("datagram of {size} bytes exceeds the limit of {max} bytes")]
    TooLarge { size: usize, max: usize },
}

/// A compression hint byte followed by the rkyv archive of a [`Datagram`],
/// raw or as a zstd frame.
#[derive(Debug, Clone)]
pub struct Codec {
    compression: bool,
    max_datagram_size: usize,
}

impl Default for Codec {
    fn default() -> Self {
        Self::new(MAX_DATAGRAM_SIZE)
    }
}

impl Codec {
    pub fn new(max_datagram_size: usize) -> Self {
        Self {
            compression: false,
            max_datagram_size,
        }
    }

    pub fn with_compression(mut self, enabled: bool) -> Self {
        self.compression = enabled;
        self
    }

    pub fn compression(&self) -> bool {
        self.compression
    }

    pub fn max_datagram_size(&self) -> usize {
        self.max_datagram_size
    }

    pub fn encode(&self, datagram: &Datagram) -> Result<Vec<u8>, CodecError> {
        let archived =
            rkyv::to_bytes::<rancor::Error>(datagram).map_err(CodecError::Serialize)?;

        let mut data = Vec::with_capacity(archived.len() + 1);
        if self.compression {
            let compressed = zstd::bulk::compress(&archived, COMPRESSION_LEVEL)
                .map_err(CodecError::Compression)?;
            // Small datagrams usually grow under zstd; only keep wins.
            if compressed.len() < archived.len() {
                data.push(COMPRESSION_HINT_COMPRESSED);
                data.extend_from_slice(&compressed);
            }
        }
        if data.is_empty() {
            data.push(COMPRESSION_HINT_UNCOMPRESSED);
            data.extend_from_slice(&archived);
        }

        if data.len() > self.max_datagram_size {
            return Err(CodecError::TooLarge {
                size: data.len(),
                max: self.max_datagram_size,
            });
        }

        Ok(data)
    }

    pub fn decode(&self, data: &[u8]) -> Result<Datagram, CodecError> {
        let (&hint, body) = data.split_first().ok_or(CodecError::Empty)?;

        let mut aligned: AlignedVec = AlignedVec::with_capacity(body.len());
        match hint {
            COMPRESSION_HINT_UNCOMPRESSED => aligned.extend_from_slice(body),
            COMPRESSION_HINT_COMPRESSED => {
                let raw = zstd::bulk::decompress(body, MAX_DECOMPRESSED_SIZE)
                    .map_err(CodecError::Compression)?;
                aligned.extend_from_slice(&raw);
            }
            other => return Err(CodecError::UnknownCompression(other)),
        }

        let datagram = rkyv::from_bytes::<Datagram, rancor::Error>(&aligned)
            .map_err(CodecError::Deserialize)?;
        if !datagram.header.is_valid() {
            return Err(CodecError::InvalidHeader);
        }

        Ok(datagram)
    }
}
