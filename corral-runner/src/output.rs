//! Output capture
//!
//! Turns the host output directory into a manifest. The directory is
//! walked in lexical order:
//! - regular files are uploaded
//! - empty directories get a `.keep` placeholder
//! - symlinks are followed (at most [`MAX_SYMLINK_HOPS`]) and must land
//!   inside the output directory or inside a read-only collection mount,
//!   whose manifest fragment is spliced in at the link's path
//! - other file types are skipped
//!
//! Read-only collections mounted below the output path are spliced in
//! after the walk unless marked `exclude_from_output`.

use anyhow::{Context, Result};
use corral_core::BlobStore;
use corral_core::manifest::{EMPTY_BLOCK_LOCATOR, Manifest};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use crate::collection::CollectionWriter;
use crate::mounts::{CollectionMount, MountPlan};
use crate::resolver::CollectionResolver;

pub const MAX_SYMLINK_HOPS: usize = 10;

/// Left in the output directory by a virtualised collection mount
pub const COLLECTION_METAFILE: &str = ".arvados#collection";

/// One thing the walk found to put in the output
#[derive(Debug, Clone, PartialEq, Eq)]
enum Item {
    Upload { rel: String, host: PathBuf },
    Keep { rel: String },
    Splice { pdh: String, path: String, target: String },
}

struct Walker {
    host_output_dir: PathBuf,
    output_path: String,
    collections: BTreeMap<String, CollectionMount>,
    items: Vec<Item>,
}

/// Captures the output directory of `plan` as a manifest, uploading file
/// contents to `blobs`
pub async fn capture_output(
    plan: &MountPlan,
    output_path: &str,
    resolver: &dyn CollectionResolver,
    blobs: Arc<dyn BlobStore>,
) -> Result<Manifest> {
    let metafile = plan.host_output_dir.join(COLLECTION_METAFILE);
    if tokio::fs::try_exists(&metafile).await.unwrap_or(false) {
        info!("Using collection metadata from {}", metafile.display());
        return read_metafile(&metafile).await;
    }

    let walker = Walker {
        host_output_dir: plan.host_output_dir.clone(),
        output_path: output_path.trim_end_matches('/').to_string(),
        collections: plan.collections.clone(),
        items: Vec::new(),
    };
    let items = tokio::task::spawn_blocking(move || walker.run())
        .await
        .context("Output walk task failed")??;

    let mut writer = CollectionWriter::new(blobs);
    let mut fragments = Vec::new();
    for item in items {
        match item {
            Item::Upload { rel, host } => {
                debug!("Uploading output file {}", rel);
                writer
                    .copy_file(&rel, &host)
                    .await
                    .with_context(|| format!("While uploading output file {}", rel))?;
            }
            Item::Keep { rel } => {
                let text = format!("./{} {} 0:0:.keep\n", rel, EMPTY_BLOCK_LOCATOR);
                fragments.push(Manifest::parse(&text)?);
            }
            Item::Splice { pdh, path, target } => {
                let text = resolver
                    .manifest_text(&pdh, &path, &target)
                    .await
                    .with_context(|| format!("While splicing {} into output at {}", pdh, target))?;
                fragments.push(Manifest::parse(&text)?);
            }
        }
    }
    fragments.push(writer.finish().await?);

    Ok(Manifest::merge(fragments))
}

async fn read_metafile(path: &Path) -> Result<Manifest> {
    let data = tokio::fs::read(path)
        .await
        .with_context(|| format!("While reading {}", path.display()))?;
    let value: serde_json::Value =
        serde_json::from_slice(&data).with_context(|| format!("While decoding {}", path.display()))?;
    let text = value
        .get("manifest_text")
        .and_then(|t| t.as_str())
        .ok_or_else(|| anyhow::anyhow!("{} has no manifest_text", COLLECTION_METAFILE))?;
    Ok(Manifest::parse(text)?)
}

impl Walker {
    fn run(mut self) -> Result<Vec<Item>> {
        let root = self.host_output_dir.clone();
        self.walk(&root, "", 0)?;

        let prefix = format!("{}/", self.output_path);
        let splices: Vec<Item> = self
            .collections
            .iter()
            .filter(|(_, m)| m.portable_data_hash.is_some() && !m.writable && !m.exclude_from_output)
            .filter_map(|(bind, m)| {
                let target = bind.strip_prefix(&prefix)?;
                Some(Item::Splice {
                    pdh: m.portable_data_hash.clone()?,
                    path: m.path.clone(),
                    target: target.to_string(),
                })
            })
            .collect();
        self.items.extend(splices);
        Ok(self.items)
    }

    fn container_path(&self, rel: &str) -> String {
        if rel.is_empty() {
            self.output_path.clone()
        } else {
            format!("{}/{}", self.output_path, rel)
        }
    }

    /// Read-only collection bound exactly at `rel`
    fn is_readonly_bind(&self, rel: &str) -> bool {
        self.collections
            .get(&self.container_path(rel))
            .is_some_and(|m| m.portable_data_hash.is_some() && !m.writable)
    }

    fn walk(&mut self, dir: &Path, rel: &str, followed: usize) -> Result<()> {
        let mut entries = std::fs::read_dir(dir)
            .with_context(|| format!("While reading output directory {}", dir.display()))?
            .collect::<std::io::Result<Vec<_>>>()?;
        entries.sort_by_key(|e| e.file_name());

        if entries.is_empty() && !rel.is_empty() {
            self.items.push(Item::Keep {
                rel: rel.to_string(),
            });
            return Ok(());
        }

        for entry in entries {
            let name = entry.file_name().to_string_lossy().into_owned();
            let child_rel = join(rel, &name);
            if self.is_readonly_bind(&child_rel) {
                continue;
            }
            self.visit(&entry.path(), &child_rel, followed)?;
        }
        Ok(())
    }

    fn visit(&mut self, path: &Path, rel: &str, followed: usize) -> Result<()> {
        let meta = std::fs::symlink_metadata(path)
            .with_context(|| format!("While reading {}", path.display()))?;
        let file_type = meta.file_type();
        if file_type.is_symlink() {
            self.follow(path, rel, followed)
        } else if file_type.is_file() {
            self.items.push(Item::Upload {
                rel: rel.to_string(),
                host: path.to_path_buf(),
            });
            Ok(())
        } else if file_type.is_dir() {
            self.walk(path, rel, followed)
        } else {
            debug!("Skipping special file {} in output", rel);
            Ok(())
        }
    }

    fn follow(&mut self, link: &Path, rel: &str, mut followed: usize) -> Result<()> {
        let mut current = link.to_path_buf();
        loop {
            if followed >= MAX_SYMLINK_HOPS {
                anyhow::bail!(
                    "Symlink in output {} exceeds the limit of {} links followed",
                    rel,
                    MAX_SYMLINK_HOPS
                );
            }
            followed += 1;

            let raw = std::fs::read_link(&current)
                .with_context(|| format!("While reading symlink {}", current.display()))?;
            let joined = match current.parent() {
                Some(parent) if raw.is_relative() => parent.join(&raw),
                _ => raw.clone(),
            };
            let target = self.to_container(&clean(&joined));

            if let Some(item) = self.readonly_splice(&target, rel) {
                self.items.push(item);
                return Ok(());
            }

            let Some(host) = self.to_host(&target) else {
                anyhow::bail!(
                    "Symlink in output {} points to invalid location {}, must point to path within the output directory.",
                    rel,
                    raw.display()
                );
            };

            let meta = std::fs::symlink_metadata(&host).map_err(|e| {
                anyhow::anyhow!(
                    "Symlink in output {} points to invalid location {}: {}",
                    rel,
                    raw.display(),
                    e
                )
            })?;
            let file_type = meta.file_type();
            if file_type.is_symlink() {
                current = host;
                continue;
            }
            if file_type.is_file() {
                self.items.push(Item::Upload {
                    rel: rel.to_string(),
                    host,
                });
            } else if file_type.is_dir() {
                self.walk(&host, rel, followed)?;
            } else {
                debug!("Skipping special file {} in output", rel);
            }
            return Ok(());
        }
    }

    /// Maps a host path inside the output directory to the container
    /// namespace; other paths are returned unchanged
    fn to_container(&self, path: &Path) -> String {
        match path.strip_prefix(&self.host_output_dir) {
            Ok(rest) if rest.as_os_str().is_empty() => self.output_path.clone(),
            Ok(rest) => format!("{}/{}", self.output_path, rest.display()),
            Err(_) => path.display().to_string(),
        }
    }

    /// Host path for a container path inside the output path
    fn to_host(&self, target: &str) -> Option<PathBuf> {
        if target == self.output_path {
            return Some(self.host_output_dir.clone());
        }
        let rest = target.strip_prefix(&format!("{}/", self.output_path))?;
        Some(self.host_output_dir.join(rest))
    }

    /// Splice for a target at or below a read-only collection bind; the
    /// deepest matching bind wins
    fn readonly_splice(&self, target: &str, rel: &str) -> Option<Item> {
        let (bind, mount) = self
            .collections
            .iter()
            .filter(|(_, m)| m.portable_data_hash.is_some() && !m.writable)
            .filter(|(bind, _)| {
                target == bind.as_str() || target.starts_with(&format!("{}/", bind))
            })
            .max_by_key(|(bind, _)| bind.len())?;
        let suffix = target[bind.len()..].trim_start_matches('/');
        Some(Item::Splice {
            pdh: mount.portable_data_hash.clone()?,
            path: join(&mount.path, suffix),
            target: rel.to_string(),
        })
    }
}

fn join(a: &str, b: &str) -> String {
    match (a.is_empty(), b.is_empty()) {
        (true, _) => b.to_string(),
        (_, true) => a.to_string(),
        _ => format!("{}/{}", a, b),
    }
}

/// Lexically resolves `.` and `..` components
fn clean(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
