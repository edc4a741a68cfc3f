//! Image staging
//!
//! A container image is stored as a collection whose first file is the
//! image tarball, named `<image id>.tar`.

use anyhow::{Context, Result};
use corral_core::BlobStore;
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tracing::info;

use crate::cache::ManifestCache;
use crate::sandbox::SandboxRuntime;

/// Makes the image in collection `pdh` available to `runtime`.
///
/// # Arguments
/// * `scratch` - directory for the temporary tarball when a load is needed
///
/// # Returns
/// The image id as known to the runtime
pub async fn stage_image(
    runtime: &dyn SandboxRuntime,
    blobs: &dyn BlobStore,
    cache: &ManifestCache,
    pdh: &str,
    scratch: &Path,
) -> Result<String> {
    let manifest = cache
        .load(blobs, pdh)
        .await
        .context("While fetching image manifest")?;

    let (stream, file_name) = manifest
        .first_file()
        .ok_or_else(|| anyhow::anyhow!("Container image collection {} is empty", pdh))?;
    let image_id = file_name
        .strip_suffix(".tar")
        .ok_or_else(|| {
            anyhow::anyhow!("First file in the container image collection does not end in .tar")
        })?
        .to_string();

    if runtime
        .image_exists(&image_id)
        .await
        .context("While checking for container image")?
    {
        info!("Image {} already loaded", image_id);
        return Ok(image_id);
    }

    info!("Loading image {} from collection {}", image_id, pdh);
    let tarball = tempfile::Builder::new()
        .prefix("image-")
        .suffix(".tar")
        .tempfile_in(scratch)
        .context("While creating image tarball")?;

    let mut file = tokio::fs::File::create(tarball.path())
        .await
        .context("While opening image tarball")?;
    for range in stream.file_ranges(file_name) {
        let block = blobs
            .get(&range.locator)
            .await
            .with_context(|| format!("While fetching image block {}", range.locator))?;
        let (start, end) = (range.start as usize, range.end as usize);
        if end > block.len() {
            anyhow::bail!("Image block {} is shorter than expected", range.locator);
        }
        file.write_all(&block[start..end])
            .await
            .context("While writing image tarball")?;
    }
    file.flush().await?;
    drop(file);

    runtime
        .load_image(tarball.path())
        .await
        .context("While loading container image into the runtime")?;

    Ok(image_id)
}
