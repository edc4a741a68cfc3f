//! Collection writer
//!
//! Builds a manifest by appending files to per-directory streams. Each
//! stream packs its files' bytes back to back into blocks of at most
//! [`BLOCK_SIZE`]; a block is uploaded as soon as it fills, the last
//! partial block when the writer finishes.

use anyhow::{Context, Result};
use corral_core::BlobStore;
use corral_core::manifest::{BLOCK_SIZE, FileSegment, Locator, Manifest, Stream, normalize_path};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncReadExt;

const READ_CHUNK: usize = 1 << 20;

#[derive(Default)]
struct StreamBuilder {
    blocks: Vec<Locator>,
    files: Vec<FileSegment>,
    buffer: Vec<u8>,
    /// Bytes written to this stream so far, uploaded or not
    offset: u64,
}

pub struct CollectionWriter {
    blobs: Arc<dyn BlobStore>,
    block_size: usize,
    streams: BTreeMap<String, StreamBuilder>,
}

impl CollectionWriter {
    pub fn new(blobs: Arc<dyn BlobStore>) -> Self {
        Self {
            blobs,
            block_size: BLOCK_SIZE,
            streams: BTreeMap::new(),
        }
    }

    /// Uses smaller blocks; `block_size` is clamped to `1..=BLOCK_SIZE`
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size.clamp(1, BLOCK_SIZE);
        self
    }

    /// Adds a file at `path` (relative to the collection root) holding `data`
    pub async fn write_file(&mut self, path: &str, data: &[u8]) -> Result<()> {
        let (dir, name) = split(path)?;
        let start = self.stream(&dir).offset;
        for chunk in data.chunks(self.block_size) {
            self.append(&dir, chunk).await?;
        }
        self.finish_file(&dir, start, name);
        Ok(())
    }

    /// Adds a file at `path` by streaming the contents of `source`
    pub async fn copy_file(&mut self, path: &str, source: &Path) -> Result<()> {
        let (dir, name) = split(path)?;
        let mut file = tokio::fs::File::open(source)
            .await
            .with_context(|| format!("While opening {}", source.display()))?;

        let start = self.stream(&dir).offset;
        let mut chunk = vec![0u8; READ_CHUNK.min(self.block_size)];
        loop {
            let n = file
                .read(&mut chunk)
                .await
                .with_context(|| format!("While reading {}", source.display()))?;
            if n == 0 {
                break;
            }
            self.append(&dir, &chunk[..n]).await?;
        }
        self.finish_file(&dir, start, name);
        Ok(())
    }

    /// Uploads the remaining partial blocks and returns the manifest,
    /// streams sorted by name
    pub async fn finish(mut self) -> Result<Manifest> {
        let dirs: Vec<String> = self.streams.keys().cloned().collect();
        for dir in &dirs {
            self.flush(dir).await?;
        }

        let streams = self
            .streams
            .into_iter()
            .map(|(dir, builder)| Stream {
                name: Stream::name_for_dir(&dir),
                blocks: builder.blocks,
                files: builder.files,
            })
            .collect();
        Ok(Manifest { streams })
    }

    fn stream(&mut self, dir: &str) -> &mut StreamBuilder {
        self.streams.entry(dir.to_string()).or_default()
    }

    async fn append(&mut self, dir: &str, mut data: &[u8]) -> Result<()> {
        let block_size = self.block_size;
        while !data.is_empty() {
            let stream = self.stream(dir);
            let room = block_size - stream.buffer.len();
            let take = room.min(data.len());
            stream.buffer.extend_from_slice(&data[..take]);
            stream.offset += take as u64;
            data = &data[take..];

            if stream.buffer.len() == block_size {
                self.flush(dir).await?;
            }
        }
        Ok(())
    }

    async fn flush(&mut self, dir: &str) -> Result<()> {
        let stream = self.stream(dir);
        if stream.buffer.is_empty() {
            return Ok(());
        }
        let block = std::mem::take(&mut stream.buffer);
        let locator = self
            .blobs
            .put(&block)
            .await
            .with_context(|| format!("While uploading a block of {} bytes", block.len()))?;
        self.stream(dir).blocks.push(locator);
        Ok(())
    }

    fn finish_file(&mut self, dir: &str, start: u64, name: String) {
        let stream = self.stream(dir);
        let length = stream.offset - start;
        stream.files.push(FileSegment {
            offset: start,
            length,
            name,
        });
    }
}

/// Splits `a/b/c.txt` into the stream directory `a/b` and file name `c.txt`
fn split(path: &str) -> Result<(String, String)> {
    let path = normalize_path(path);
    let (dir, name) = match path.rsplit_once('/') {
        Some((dir, name)) => (dir.to_string(), name.to_string()),
        None => (String::new(), path),
    };
    if name.is_empty() {
        anyhow::bail!("Cannot write a file without a name");
    }
    Ok((dir, name))
}
