//! Manifest and locator codec
//!
//! A manifest describes a directory tree purely in terms of content-addressed
//! blocks. Each line is one stream (directory):
//!
//! ```text
//! ./dir <md5>+<size> [<md5>+<size> ...] <offset>:<length>:<name> [...]
//! ```
//!
//! File segments index into the concatenation of the stream's blocks. Names
//! escape whitespace and backslashes as `\ooo` octal sequences. A stream
//! with no data carries the zero-length placeholder block.

use md5::{Digest, Md5};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Upper bound on the size of a single block
pub const BLOCK_SIZE: usize = 64 << 20;

/// Locator of the zero-length block
pub const EMPTY_BLOCK_LOCATOR: &str = "d41d8cd98f00b204e9800998ecf8427e+0";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ManifestError {
    #[error("malformed manifest line {line}: {reason}")]
    Malformed { line: usize, reason: String },

    #[error("invalid locator {0:?}")]
    InvalidLocator(String),

    #[error("{0:?} not found in manifest")]
    NotFound(String),
}

// =============================================================================
// Locator
// =============================================================================

/// Content hash plus size hint identifying an immutable block of bytes
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Locator {
    hash: String,
    size: u64,
    hints: Vec<String>,
}

impl Locator {
    /// Computes the locator of a byte slice. Pure function of the bytes.
    pub fn for_bytes(data: &[u8]) -> Self {
        Self {
            hash: format!("{:x}", Md5::digest(data)),
            size: data.len() as u64,
            hints: Vec::new(),
        }
    }

    pub fn empty() -> Self {
        Self::for_bytes(&[])
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn hints(&self) -> &[String] {
        &self.hints
    }

    /// Appends a service-specific hint (e.g. a signature)
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hints.push(hint.into());
        self
    }

    /// The bare `hash+size` form
    pub fn without_hints(&self) -> Self {
        Self {
            hash: self.hash.clone(),
            size: self.size,
            hints: Vec::new(),
        }
    }

    /// Whether `data` is the content this locator names
    pub fn matches(&self, data: &[u8]) -> bool {
        data.len() as u64 == self.size && format!("{:x}", Md5::digest(data)) == self.hash
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}+{}", self.hash, self.size)?;
        for hint in &self.hints {
            write!(f, "+{}", hint)?;
        }
        Ok(())
    }
}

impl FromStr for Locator {
    type Err = ManifestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ManifestError::InvalidLocator(s.to_string());
        let mut parts = s.split('+');

        let hash = parts.next().ok_or_else(invalid)?;
        if hash.len() != 32 || !hash.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return Err(invalid());
        }

        let size = parts
            .next()
            .and_then(|p| p.parse::<u64>().ok())
            .ok_or_else(invalid)?;

        let hints: Vec<String> = parts.map(str::to_string).collect();
        if hints.iter().any(|h| h.is_empty()) {
            return Err(invalid());
        }

        Ok(Self {
            hash: hash.to_string(),
            size,
            hints,
        })
    }
}

// =============================================================================
// Streams
// =============================================================================

/// A byte range of a file within a stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSegment {
    pub offset: u64,
    pub length: u64,
    pub name: String,
}

/// Portion of a single block that belongs to a file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRange {
    pub locator: Locator,
    pub start: u64,
    pub end: u64,
}

/// One directory's worth of a manifest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stream {
    /// `.` for the root, `./a/b` for subdirectories
    pub name: String,
    pub blocks: Vec<Locator>,
    pub files: Vec<FileSegment>,
}

impl Stream {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            blocks: Vec::new(),
            files: Vec::new(),
        }
    }

    /// Stream name for a relative directory path (`""` is the root)
    pub fn name_for_dir(dir: &str) -> String {
        let dir = normalize_path(dir);
        if dir.is_empty() {
            ".".to_string()
        } else {
            format!("./{}", dir)
        }
    }

    /// Directory path relative to the root, `""` for the root stream
    pub fn dir(&self) -> String {
        normalize_path(&self.name)
    }

    pub fn total_size(&self) -> u64 {
        self.blocks.iter().map(Locator::size).sum()
    }

    /// Distinct file names in first-appearance order
    pub fn file_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for f in &self.files {
            if !names.contains(&f.name.as_str()) {
                names.push(&f.name);
            }
        }
        names
    }

    /// Block ranges making up `name`, in file order
    pub fn file_ranges(&self, name: &str) -> Vec<BlockRange> {
        let mut ranges = Vec::new();
        for seg in self.files.iter().filter(|f| f.name == name && f.length > 0) {
            let seg_end = seg.offset + seg.length;
            let mut block_start = 0;
            for block in &self.blocks {
                let block_end = block_start + block.size();
                if block_end > seg.offset && block_start < seg_end {
                    ranges.push(BlockRange {
                        locator: block.clone(),
                        start: seg.offset.max(block_start) - block_start,
                        end: seg_end.min(block_end) - block_start,
                    });
                }
                block_start = block_end;
            }
        }
        ranges
    }

    /// Builds a minimal stream holding only `name`, renamed to `new_name`
    /// inside directory `new_dir`.
    fn extract_file(&self, name: &str, new_dir: &str, new_name: &str) -> Option<Stream> {
        let segments: Vec<&FileSegment> = self.files.iter().filter(|f| f.name == name).collect();
        if segments.is_empty() {
            return None;
        }

        let mut starts = Vec::with_capacity(self.blocks.len());
        let mut pos = 0;
        for block in &self.blocks {
            starts.push(pos);
            pos += block.size();
        }

        let overlaps = |i: usize| {
            let (bs, be) = (starts[i], starts[i] + self.blocks[i].size());
            segments
                .iter()
                .any(|s| s.length > 0 && be > s.offset && bs < s.offset + s.length)
        };

        let mut out = Stream::new(Stream::name_for_dir(new_dir));
        let mut new_starts = vec![None; self.blocks.len()];
        let mut acc = 0;
        for i in (0..self.blocks.len()).filter(|&i| overlaps(i)) {
            new_starts[i] = Some(acc);
            acc += self.blocks[i].size();
            out.blocks.push(self.blocks[i].clone());
        }

        for seg in segments {
            let offset = if seg.length == 0 {
                0
            } else {
                (0..self.blocks.len())
                    .find(|&i| {
                        starts[i] <= seg.offset && seg.offset < starts[i] + self.blocks[i].size()
                    })
                    .and_then(|i| new_starts[i].map(|ns| ns + (seg.offset - starts[i])))
                    .unwrap_or(0)
            };
            out.files.push(FileSegment {
                offset,
                length: seg.length,
                name: new_name.to_string(),
            });
        }
        Some(out)
    }

    fn write_line(&self, out: &mut String) {
        out.push_str(&escape_name(&self.name));

        let mut wrote_block = false;
        for block in self.blocks.iter().filter(|b| b.size() > 0) {
            out.push(' ');
            out.push_str(&block.to_string());
            wrote_block = true;
        }
        if !wrote_block {
            out.push(' ');
            out.push_str(EMPTY_BLOCK_LOCATOR);
        }

        for f in &self.files {
            out.push_str(&format!(" {}:{}:{}", f.offset, f.length, escape_name(&f.name)));
        }
        out.push('\n');
    }
}

// =============================================================================
// Manifest
// =============================================================================

/// An ordered list of streams
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    pub streams: Vec<Stream>,
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub fn parse(text: &str) -> Result<Self, ManifestError> {
        let mut streams = Vec::new();

        for (idx, line) in text.lines().enumerate() {
            if line.is_empty() {
                continue;
            }
            let malformed = |reason: &str| ManifestError::Malformed {
                line: idx + 1,
                reason: reason.to_string(),
            };

            let mut tokens = line.split(' ');
            let name = tokens
                .next()
                .map(unescape_name)
                .filter(|n| n == "." || n.starts_with("./"))
                .ok_or_else(|| malformed("stream name must be . or start with ./"))?;

            let mut stream = Stream::new(name);
            for token in tokens {
                if stream.files.is_empty() {
                    if let Ok(locator) = token.parse::<Locator>() {
                        stream.blocks.push(locator);
                        continue;
                    }
                }
                let mut parts = token.splitn(3, ':');
                let (Some(offset), Some(length), Some(file)) =
                    (parts.next(), parts.next(), parts.next())
                else {
                    return Err(malformed(&format!("bad file token {:?}", token)));
                };
                let offset = offset
                    .parse::<u64>()
                    .map_err(|_| malformed(&format!("bad offset in {:?}", token)))?;
                let length = length
                    .parse::<u64>()
                    .map_err(|_| malformed(&format!("bad length in {:?}", token)))?;
                stream.files.push(FileSegment {
                    offset,
                    length,
                    name: unescape_name(file),
                });
            }

            if stream.blocks.is_empty() {
                return Err(malformed("stream has no blocks"));
            }
            if stream.files.is_empty() {
                return Err(malformed("stream has no files"));
            }
            let total = stream
                .blocks
                .iter()
                .try_fold(0u64, |sum, block| sum.checked_add(block.size()))
                .ok_or_else(|| malformed("stream size overflows"))?;
            if stream
                .files
                .iter()
                .any(|f| f.offset.checked_add(f.length).is_none_or(|end| end > total))
            {
                return Err(malformed("file segment extends past end of stream"));
            }
            streams.push(stream);
        }

        Ok(Self { streams })
    }

    /// Canonical text form
    pub fn text(&self) -> String {
        let mut out = String::new();
        for stream in &self.streams {
            stream.write_line(&mut out);
        }
        out
    }

    /// Locator of the manifest text, used as the immutable reference to it
    pub fn portable_data_hash(&self) -> Locator {
        Locator::for_bytes(self.text().as_bytes())
    }

    /// First file of the first stream, as `(stream, file name)`
    pub fn first_file(&self) -> Option<(&Stream, &str)> {
        self.streams
            .iter()
            .find_map(|s| s.files.first().map(|f| (s, f.name.as_str())))
    }

    /// Merges fragments into one manifest.
    ///
    /// Streams with the same name are concatenated (block lists appended,
    /// file offsets shifted) and the result is sorted by stream name.
    pub fn merge(fragments: impl IntoIterator<Item = Manifest>) -> Manifest {
        let mut by_name: BTreeMap<String, Stream> = BTreeMap::new();
        for fragment in fragments {
            for stream in fragment.streams {
                let entry = by_name
                    .entry(stream.name.clone())
                    .or_insert_with(|| Stream::new(stream.name.clone()));
                let shift = entry.total_size();
                entry
                    .blocks
                    .extend(stream.blocks.into_iter().filter(|b| b.size() > 0));
                entry.files.extend(stream.files.into_iter().map(|f| FileSegment {
                    offset: f.offset + shift,
                    ..f
                }));
            }
        }
        Manifest {
            streams: by_name.into_values().collect(),
        }
    }

    /// Extracts the subtree or file at `path`, relocated to `target`.
    ///
    /// Both paths are relative to the collection root; `""`, `.` and `/`
    /// all name the root.
    pub fn extract(&self, path: &str, target: &str) -> Result<Manifest, ManifestError> {
        let path = normalize_path(path);
        let target = normalize_path(target);

        let mut streams = Vec::new();
        for stream in &self.streams {
            let dir = stream.dir();
            let rest = if path.is_empty() {
                Some(dir.as_str())
            } else if dir == path {
                Some("")
            } else {
                dir.strip_prefix(&path).and_then(|r| r.strip_prefix('/'))
            };
            if let Some(rest) = rest {
                let relocated = join_path(&target, rest);
                streams.push(Stream {
                    name: Stream::name_for_dir(&relocated),
                    blocks: stream.blocks.clone(),
                    files: stream.files.clone(),
                });
            }
        }
        if !streams.is_empty() {
            return Ok(Manifest { streams });
        }

        // Not a directory: try a single file
        let (dir, base) = split_path(&path);
        let (target_dir, target_name) = split_path(&target);
        if base.is_empty() || target_name.is_empty() {
            return Err(ManifestError::NotFound(path));
        }
        self.streams
            .iter()
            .filter(|s| s.dir() == dir)
            .find_map(|s| s.extract_file(base, target_dir, target_name))
            .map(|s| Manifest { streams: vec![s] })
            .ok_or(ManifestError::NotFound(path))
    }
}

impl fmt::Display for Manifest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text())
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

/// Strips `.`, empty and leading components: `./a//b/` becomes `a/b`
pub fn normalize_path(path: &str) -> String {
    path.split('/')
        .filter(|c| !c.is_empty() && *c != ".")
        .collect::<Vec<_>>()
        .join("/")
}

fn join_path(a: &str, b: &str) -> String {
    match (a.is_empty(), b.is_empty()) {
        (true, _) => b.to_string(),
        (_, true) => a.to_string(),
        _ => format!("{}/{}", a, b),
    }
}

fn split_path(path: &str) -> (&str, &str) {
    match path.rsplit_once('/') {
        Some((dir, base)) => (dir, base),
        None => ("", path),
    }
}

fn escape_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        match c {
            ' ' | '\t' | '\n' | '\r' | '\\' => out.push_str(&format!("\\{:03o}", c as u32)),
            _ => out.push(c),
        }
    }
    out
}

fn unescape_name(name: &str) -> String {
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\'
            && i + 3 < bytes.len()
            && bytes[i + 1..i + 4].iter().all(|b| (b'0'..=b'7').contains(b))
        {
            let code = (bytes[i + 1] - b'0') as u32 * 64
                + (bytes[i + 2] - b'0') as u32 * 8
                + (bytes[i + 3] - b'0') as u32;
            if let Ok(b) = u8::try_from(code) {
                out.push(b);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
