//! Mount planning
//!
//! Turns a Work Item's declared mounts into sandbox bind specifications
//! and host-side state: the writable output directory, the collection
//! binds that output capture needs to know about, and where stdout and
//! stderr are redirected.
//!
//! Rules:
//! - `stdout`/`stderr` must be `file` mounts inside the output path
//! - everything below the output path must be a collection
//! - exactly one writable mount sits at the output path
//! - a collection named by portable data hash is only writable below the
//!   output path, where it is staged by copying into the output directory

use anyhow::{Context, Result};
use corral_core::domain::{ExecutionSpec, Mount};
use regex::Regex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::LazyLock;
use tokio::process::Command;
use tracing::{debug, info};

use crate::resolver::CollectionResolver;

static COMMIT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9a-f]{40}$").expect("commit pattern is valid"));

/// A collection bound into the sandbox, keyed by container path in
/// [`MountPlan::collections`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionMount {
    /// `None` for an empty writable collection backed by a local directory
    pub portable_data_hash: Option<String>,
    /// Subpath inside the collection
    pub path: String,
    pub writable: bool,
    pub exclude_from_output: bool,
}

#[derive(Debug, Clone, Default)]
pub struct MountPlan {
    /// `host:container[:ro]` bind specifications
    pub binds: Vec<String>,
    /// Host directory bound at the output path
    pub host_output_dir: PathBuf,
    pub collections: BTreeMap<String, CollectionMount>,
    /// Host file receiving the sandbox's stdout, if redirected
    pub stdout: Option<PathBuf>,
    pub stderr: Option<PathBuf>,
    /// Whether the collection resolver was prepared and must be released
    pub uses_resolver: bool,
}

struct Planner<'a> {
    resolver: &'a dyn CollectionResolver,
    scratch: &'a Path,
    counter: usize,
}

impl Planner<'_> {
    /// Creates a fresh directory under the scratch dir
    async fn make_dir(&mut self, prefix: &str) -> Result<PathBuf> {
        let dir = self.scratch.join(format!("{}{}", prefix, self.counter));
        self.counter += 1;
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("While creating mount temp dir {}", dir.display()))?;
        Ok(dir)
    }
}

/// Plans the mounts of `spec`.
///
/// # Arguments
/// * `resolver` - exposes input collections; prepared only if a mount
///   names a portable data hash
/// * `scratch` - per-run directory for tmp mounts, json files and git trees
pub async fn build_mounts(
    spec: &ExecutionSpec,
    resolver: &dyn CollectionResolver,
    scratch: &Path,
) -> Result<MountPlan> {
    let output_path = spec.output_path.trim_end_matches('/');
    let prefix = format!("{}/", output_path);

    let mut planner = Planner {
        resolver,
        scratch,
        counter: 0,
    };
    let mut plan = MountPlan::default();
    let mut host_output_dir: Option<PathBuf> = None;
    let mut redirects: Vec<(&str, String)> = Vec::new();
    let mut copies: Vec<(PathBuf, String)> = Vec::new();
    let mut inputs: Vec<PathBuf> = Vec::new();

    for (bind, mount) in &spec.mounts {
        if bind == "stdout" || bind == "stderr" {
            let Mount::File { path } = mount else {
                anyhow::bail!(
                    "Unsupported mount kind '{}' for {}. Only 'file' is supported.",
                    mount.kind(),
                    bind
                );
            };
            let rel = path.strip_prefix(&prefix).ok_or_else(|| {
                anyhow::anyhow!(
                    "{} path does not start with OutputPath: {}, {}",
                    capitalize(bind),
                    path,
                    prefix
                )
            })?;
            redirects.push((bind.as_str(), rel.to_string()));
            continue;
        }

        if !bind.starts_with('/') {
            anyhow::bail!("Unsupported mount point {:?}", bind);
        }

        let under_output = bind.starts_with(&prefix);
        if under_output && !matches!(mount, Mount::Collection { .. }) {
            anyhow::bail!(
                "Only mount points of kind 'collection' are supported underneath the output_path: {}",
                bind
            );
        }

        match mount {
            Mount::Collection {
                portable_data_hash: Some(pdh),
                path,
                writable,
                exclude_from_output,
            } => {
                let (pdh, subpath) = split_pdh(pdh, path.as_deref());
                if *writable && !under_output {
                    anyhow::bail!("Can never write to a collection specified by portable data hash");
                }

                plan.uses_resolver = true;
                let src = resolver.host_path(&pdh, &subpath);
                if *writable {
                    copies.push((src.clone(), bind.clone()));
                } else {
                    plan.binds.push(format!("{}:{}:ro", src.display(), bind));
                }
                inputs.push(src);
                plan.collections.insert(
                    bind.clone(),
                    CollectionMount {
                        portable_data_hash: Some(pdh),
                        path: subpath,
                        writable: *writable,
                        exclude_from_output: *exclude_from_output,
                    },
                );
            }
            Mount::Collection {
                portable_data_hash: None,
                writable,
                exclude_from_output,
                ..
            } => {
                let src = planner.make_dir("tmp").await?;
                if bind == output_path {
                    host_output_dir = Some(src.clone());
                    plan.binds.push(format!("{}:{}", src.display(), bind));
                } else if under_output {
                    copies.push((src.clone(), bind.clone()));
                } else if *writable {
                    plan.binds.push(format!("{}:{}", src.display(), bind));
                } else {
                    plan.binds.push(format!("{}:{}:ro", src.display(), bind));
                }
                plan.collections.insert(
                    bind.clone(),
                    CollectionMount {
                        portable_data_hash: None,
                        path: String::new(),
                        writable: *writable || bind == output_path,
                        exclude_from_output: *exclude_from_output,
                    },
                );
            }
            Mount::Tmp { .. } => {
                let src = planner.make_dir("tmp").await?;
                set_mode(&src, 0o2777).await?;
                if bind == output_path {
                    host_output_dir = Some(src.clone());
                }
                plan.binds.push(format!("{}:{}", src.display(), bind));
            }
            Mount::Json { content } => {
                let dir = planner.make_dir("json").await?;
                let file = dir.join("mountdata.json");
                let data = serde_json::to_vec(content).context("While encoding json mount")?;
                tokio::fs::write(&file, data)
                    .await
                    .with_context(|| format!("While writing {}", file.display()))?;
                plan.binds.push(format!("{}:{}:ro", file.display(), bind));
            }
            Mount::GitTree {
                git_url,
                commit,
                path,
            } => {
                if !COMMIT_RE.is_match(commit) {
                    anyhow::bail!(
                        "Invalid commit {:?} for git_tree mount {}: must be a 40-character hex hash",
                        commit,
                        bind
                    );
                }
                let dir = planner.make_dir("git").await?;
                fetch_git_tree(git_url, commit, &dir)
                    .await
                    .with_context(|| format!("While fetching git_tree for {}", bind))?;
                let mut src = dir;
                if let Some(sub) = path.as_deref().map(|p| p.trim_matches('/')) {
                    if !sub.is_empty() {
                        src = src.join(sub);
                    }
                }
                plan.binds.push(format!("{}:{}:ro", src.display(), bind));
            }
            Mount::File { .. } => {
                anyhow::bail!(
                    "Mount kind 'file' is only supported for stdout and stderr: {}",
                    bind
                );
            }
        }
    }

    let host_output_dir = host_output_dir.ok_or_else(|| {
        anyhow::anyhow!("Output path does not correspond to a writable mount point")
    })?;

    if plan.uses_resolver {
        planner
            .resolver
            .prepare()
            .await
            .context("While preparing collection mounts")?;
        for input in &inputs {
            tokio::fs::metadata(input)
                .await
                .with_context(|| format!("While checking that input files exist: {}", input.display()))?;
        }
    }

    for (src, bind) in copies {
        let rel = bind.strip_prefix(&prefix).unwrap_or(&bind).to_string();
        let dst = host_output_dir.join(&rel);
        debug!("Staging {} into output at {}", src.display(), rel);
        tokio::task::spawn_blocking(move || copy_tree(&src, &dst))
            .await
            .context("Copy task failed")?
            .with_context(|| format!("While staging writable collection at {}", bind))?;
    }

    for (stream, rel) in redirects {
        let target = host_output_dir.join(rel);
        match stream {
            "stdout" => plan.stdout = Some(target),
            _ => plan.stderr = Some(target),
        }
    }

    info!(
        "Planned {} binds, output at {}",
        plan.binds.len(),
        host_output_dir.display()
    );
    plan.host_output_dir = host_output_dir;
    Ok(plan)
}

/// Splits `pdh/sub/dir` plus an optional `path` into the hash and subpath
fn split_pdh(pdh: &str, path: Option<&str>) -> (String, String) {
    let (hash, embedded) = match pdh.split_once('/') {
        Some((hash, rest)) => (hash, rest),
        None => (pdh, ""),
    };
    let subpath = [embedded, path.unwrap_or_default()]
        .iter()
        .flat_map(|p| p.split('/'))
        .filter(|c| !c.is_empty() && *c != ".")
        .collect::<Vec<_>>()
        .join("/");
    (hash.to_string(), subpath)
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

async fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .await
        .with_context(|| format!("While setting permissions on {}", path.display()))
}

async fn fetch_git_tree(url: &str, commit: &str, dir: &Path) -> Result<()> {
    git(&["clone", "--quiet", url, &dir.display().to_string()]).await?;
    git(&[
        "-C",
        &dir.display().to_string(),
        "checkout",
        "--quiet",
        "--detach",
        commit,
    ])
    .await?;
    tokio::fs::remove_dir_all(dir.join(".git"))
        .await
        .context("While removing .git")?;
    Ok(())
}

async fn git(args: &[&str]) -> Result<()> {
    let output = Command::new("git")
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
        .context("Failed to execute git")?;
    if !output.status.success() {
        anyhow::bail!(
            "git {} failed: {}",
            args.first().copied().unwrap_or_default(),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

/// Recursively copies regular files and directories from `src` to `dst`
fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    let meta = std::fs::metadata(src).with_context(|| format!("While reading {}", src.display()))?;
    if meta.is_dir() {
        std::fs::create_dir_all(dst).with_context(|| format!("While creating {}", dst.display()))?;
        for entry in std::fs::read_dir(src)? {
            let entry = entry?;
            copy_tree(&entry.path(), &dst.join(entry.file_name()))?;
        }
    } else if meta.is_file() {
        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(src, dst)
            .with_context(|| format!("While copying {} to {}", src.display(), dst.display()))?;
    } else {
        anyhow::bail!("Source {:?} is not a regular file or directory", src);
    }
    Ok(())
}
