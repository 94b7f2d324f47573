//! Splits a file into upload chunks and digests byte ranges.

use crate::config::{DEFAULT_CHUNK_SIZE, LARGE_FILE_THRESHOLD};
use serde::Serialize;
use sha1::{Digest, Sha1};
use std::{io::SeekFrom, path::Path};
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt, Take},
};

/// Size of the read buffer used while hashing.
const DIGEST_BUF_SIZE: usize = 64 * 1024;

/// One byte range of a file, uploaded as one part (or as the whole file when
/// the file is small).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkDescriptor {
    pub file_unique_id: String,
    /// 1-based.
    pub part_number: u32,
    pub start_byte: u64,
    /// Exclusive.
    pub end_byte: u64,
}

impl ChunkDescriptor {
    pub fn len(&self) -> u64 {
        self.end_byte - self.start_byte
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Stable identifier for a file across sessions: its size followed by the
/// name with everything but `[A-Za-z0-9_-]` removed.
pub fn unique_id(file_name: &str, file_size: u64) -> String {
    let cleaned: String = file_name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect();
    format!("{}-{}", file_size, cleaned)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkerOptions {
    /// Files larger than this are split into parts.
    pub multi_min_size: u64,
    pub chunk_size: u64,
}

impl Default for ChunkerOptions {
    fn default() -> Self {
        Self {
            multi_min_size: LARGE_FILE_THRESHOLD,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl ChunkerOptions {
    pub fn is_multipart(&self, file_size: u64) -> bool {
        file_size > self.multi_min_size
    }

    /// Chunks covering `0..file_size`. Small files (and a zero chunk size)
    /// yield a single chunk.
    pub fn plan(&self, file_unique_id: &str, file_size: u64) -> Vec<ChunkDescriptor> {
        let chunk_size = if self.is_multipart(file_size) && self.chunk_size > 0 {
            self.chunk_size
        } else {
            file_size.max(1)
        };

        let mut chunks = Vec::new();
        let mut start = 0;
        let mut part_number = 1;
        loop {
            let end = (start + chunk_size).min(file_size);
            chunks.push(ChunkDescriptor {
                file_unique_id: file_unique_id.to_string(),
                part_number,
                start_byte: start,
                end_byte: end,
            });
            if end >= file_size {
                break;
            }
            start = end;
            part_number += 1;
        }
        chunks
    }
}

/// Open `path` positioned at the start of `chunk`, limited to its length.
pub async fn open_range(path: &Path, chunk: &ChunkDescriptor) -> std::io::Result<Take<File>> {
    let mut file = File::open(path).await?;
    file.seek(SeekFrom::Start(chunk.start_byte)).await?;
    Ok(file.take(chunk.len()))
}

/// Hex SHA-1 of the bytes of `chunk`.
pub async fn digest_range(path: &Path, chunk: &ChunkDescriptor) -> std::io::Result<String> {
    let mut reader = open_range(path, chunk).await?;
    let mut hasher = Sha1::new();
    let mut buf = vec![0u8; DIGEST_BUF_SIZE];
    let mut read = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        read += n as u64;
    }
    if read != chunk.len() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!(
                "part {} expected {} bytes, file yielded {}",
                chunk.part_number,
                chunk.len(),
                read
            ),
        ));
    }
    Ok(hex::encode(hasher.finalize()))
}
