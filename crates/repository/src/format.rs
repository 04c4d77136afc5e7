//! Typed, checksummed, optionally compressed serialization of metadata blobs.
//!
//! Wire layout: `magic(4) | codec-len(1) | codec(ascii) | version(i32 BE) |
//! body | crc32(u32 BE over header+body)`. The body is a JSON payload behind
//! a one-byte compression tag (raw, deflate, or lz4 block). Reads verify
//! magic, codec, version window, and checksum before touching the payload.

use std::io::Read;
use std::marker::PhantomData;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use reef_blob_store::BlobContainer;

use crate::error::{RepositoryError, Result};
use crate::settings::CompressionType;

/// Magic bytes opening every checksummed blob.
pub const CODEC_MAGIC: [u8; 4] = [0x3f, 0xd7, 0x6c, 0x17];

const BODY_RAW: u8 = 0;
const BODY_DEFLATE: u8 = 1;
const BODY_LZ4: u8 = 2;

fn corrupt(name: &str, reason: impl Into<String>) -> RepositoryError {
    RepositoryError::CorruptBlob {
        name: name.to_string(),
        reason: reason.into(),
    }
}

/// Reader/writer for one family of checksummed blobs (one codec name).
#[derive(Debug)]
pub struct ChecksumBlobFormat<T> {
    codec: &'static str,
    version: i32,
    min_version: i32,
    _payload: PhantomData<fn() -> T>,
}

impl<T> ChecksumBlobFormat<T>
where
    T: Serialize + DeserializeOwned,
{
    pub const fn new(codec: &'static str) -> Self {
        Self {
            codec,
            version: 1,
            min_version: 1,
            _payload: PhantomData,
        }
    }

    /// Blob name for a uuid-addressed metadata blob: `<prefix>-<uuid>.dat`.
    pub fn blob_name(prefix: &str, uuid: &str) -> String {
        format!("{prefix}{uuid}.dat")
    }

    /// Encode a payload into the checksummed wire form.
    pub fn serialize(&self, value: &T, compression: Option<CompressionType>) -> Result<Bytes> {
        let payload = serde_json::to_vec(value)?;
        let mut out = Vec::with_capacity(payload.len() + self.codec.len() + 16);
        out.extend_from_slice(&CODEC_MAGIC);
        out.push(self.codec.len() as u8);
        out.extend_from_slice(self.codec.as_bytes());
        out.extend_from_slice(&self.version.to_be_bytes());
        match compression {
            None => {
                out.push(BODY_RAW);
                out.extend_from_slice(&payload);
            }
            Some(CompressionType::Deflate) => {
                out.push(BODY_DEFLATE);
                let mut encoder = flate2::read::DeflateEncoder::new(
                    payload.as_slice(),
                    flate2::Compression::default(),
                );
                encoder.read_to_end(&mut out)?;
            }
            Some(CompressionType::Lz4) => {
                out.push(BODY_LZ4);
                let compressed = lz4::block::compress(&payload, None, true)?;
                out.extend_from_slice(&compressed);
            }
        }
        let checksum = crc32fast::hash(&out);
        out.extend_from_slice(&checksum.to_be_bytes());
        Ok(Bytes::from(out))
    }

    /// Decode and verify a checksummed blob.
    pub fn deserialize(&self, name: &str, data: &[u8]) -> Result<T> {
        let min_len = CODEC_MAGIC.len() + 1 + self.codec.len() + 4 + 1 + 4;
        if data.len() < min_len {
            return Err(corrupt(name, format!("blob too short: {} bytes", data.len())));
        }

        let (content, trailer) = data.split_at(data.len() - 4);
        let stored = u32::from_be_bytes(trailer.try_into().expect("trailer is 4 bytes"));
        let actual = crc32fast::hash(content);
        if stored != actual {
            return Err(corrupt(
                name,
                format!("checksum mismatch: stored {stored:#010x}, actual {actual:#010x}"),
            ));
        }

        let mut cursor = content;
        if cursor[..4] != CODEC_MAGIC {
            return Err(corrupt(name, "bad magic"));
        }
        cursor = &cursor[4..];
        let codec_len = cursor[0] as usize;
        cursor = &cursor[1..];
        if cursor.len() < codec_len + 5 {
            return Err(corrupt(name, "truncated header"));
        }
        let codec = &cursor[..codec_len];
        if codec != self.codec.as_bytes() {
            return Err(corrupt(
                name,
                format!(
                    "expected codec [{}], found [{}]",
                    self.codec,
                    String::from_utf8_lossy(codec)
                ),
            ));
        }
        cursor = &cursor[codec_len..];
        let version = i32::from_be_bytes(cursor[..4].try_into().expect("version is 4 bytes"));
        cursor = &cursor[4..];
        if version < self.min_version {
            return Err(RepositoryError::FormatTooOld {
                name: name.to_string(),
                version,
                min: self.min_version,
            });
        }
        if version > self.version {
            return Err(RepositoryError::FormatTooNew {
                name: name.to_string(),
                version,
                max: self.version,
            });
        }

        let tag = cursor[0];
        let body = &cursor[1..];
        let payload = match tag {
            BODY_RAW => body.to_vec(),
            BODY_DEFLATE => {
                let mut decoder = flate2::read::DeflateDecoder::new(body);
                let mut out = Vec::new();
                decoder
                    .read_to_end(&mut out)
                    .map_err(|e| corrupt(name, format!("deflate body: {e}")))?;
                out
            }
            BODY_LZ4 => lz4::block::decompress(body, None)
                .map_err(|e| corrupt(name, format!("lz4 body: {e}")))?,
            other => return Err(corrupt(name, format!("unknown body encoding {other}"))),
        };

        serde_json::from_slice(&payload)
            .map_err(|e| corrupt(name, format!("payload decode: {e}")))
    }

    /// Read and verify the named blob from a container.
    pub async fn read(&self, container: &dyn BlobContainer, name: &str) -> Result<T> {
        let data = container.read_blob(name).await?;
        self.deserialize(name, &data)
    }

    /// Write a blob, non-atomically.
    pub async fn write(
        &self,
        container: &dyn BlobContainer,
        name: &str,
        value: &T,
        compression: Option<CompressionType>,
        fail_if_exists: bool,
    ) -> Result<()> {
        let data = self.serialize(value, compression)?;
        container.write_blob(name, data, fail_if_exists).await?;
        Ok(())
    }

    /// Write a blob atomically: visible only after full success.
    pub async fn write_atomic(
        &self,
        container: &dyn BlobContainer,
        name: &str,
        value: &T,
        compression: Option<CompressionType>,
        fail_if_exists: bool,
    ) -> Result<()> {
        let data = self.serialize(value, compression)?;
        container
            .write_blob_atomic(name, data, fail_if_exists)
            .await?;
        Ok(())
    }
}
