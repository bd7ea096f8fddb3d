//! End-to-end melt pipeline.
//!
//! [`melt_archive`] drives the whole transformation: explode the outer
//! archive into a working tree, parse the manifest and every image config,
//! run the sharing analysis, unpack all distinct layers in parallel, fold
//! each image's layers with the fusion engine, repack the surviving layers
//! in parallel while recomputing their content digests, patch the metadata
//! byte images, and repack the working tree into the output archive.
//!
//! The caller owns the working directory: the binary allocates a temporary
//! directory and removes it whether the run succeeds or fails. The output
//! path must lie outside the working directory, or it would be swept into
//! the outer repack.
//!
//! # Example
//!
//! ```no_run
//! use melt_rs::{MeltOutcome, melt_archive};
//!
//! let work = tempfile::tempdir()?;
//! match melt_archive(
//!     "app.tar".as_ref(),
//!     "app-melted.tar".as_ref(),
//!     work.path(),
//! )? {
//!     MeltOutcome::Melted {
//!         input_layers,
//!         output_layers,
//!     } => println!("melted {input_layers} layers down to {output_layers}"),
//!     MeltOutcome::NothingToDo(reason) => println!("{reason}"),
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::analyzer::{self, Analysis};
use crate::error::{MeltError, Result};
use crate::extract;
use crate::fuse;
use crate::image::{ImageConfig, Manifest};
use crate::layer::LayerKey;
use crate::pack;
use crate::pool::WorkerPool;

/// How a melt run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeltOutcome {
    /// The archive was rewritten to the output path.
    Melted {
        /// Total layer references across all images before melting.
        input_layers: usize,
        /// Distinct layers written to the output archive.
        output_layers: usize,
    },
    /// Melting cannot reduce this archive; no output was written.
    NothingToDo(&'static str),
}

/// Melt `input` into `output`, using `work_dir` as scratch space.
///
/// `work_dir` must exist and be empty; `output` must not be inside it.
pub fn melt_archive(input: &Path, output: &Path, work_dir: &Path) -> Result<MeltOutcome> {
    tracing::debug!(input = %input.display(), "exploding image archive");
    extract::extract_archive(input, work_dir)?;

    let manifest_path = work_dir.join("manifest.json");
    let mut manifest = Manifest::load(&manifest_path)?;
    for entry in manifest.entries_mut() {
        if entry.config.is_empty() {
            continue;
        }
        entry.config_blob = Some(ImageConfig::load(&work_dir.join(&entry.config))?);
    }

    let input_layers: usize = manifest.entries().iter().map(|e| e.layers.len()).sum();
    let sharing = match analyzer::analyze(manifest.entries()) {
        Analysis::NothingToDo(reason) => {
            tracing::debug!(reason, "nothing to melt");
            return Ok(MeltOutcome::NothingToDo(reason));
        }
        Analysis::Melt(sharing) => sharing,
    };
    tracing::debug!(
        distinct_layers = sharing.len(),
        images = manifest.entries().len(),
        "unpacking layers"
    );

    // Extract phase: unpack every distinct layer concurrently. Legacy
    // per-layer metadata files are stripped and not reproduced. All
    // fallible setup runs to completion before the first task is
    // submitted, so a setup failure never leaves workers in flight over
    // a working tree the caller is about to tear down.
    let mut extract_jobs = Vec::with_capacity(sharing.len());
    for key in sharing.keys() {
        strip_legacy_metadata(&work_dir.join(key.layer_dir()))?;
        let unpack = work_dir.join(key.unpack_dir());
        fs::create_dir(&unpack)?;
        extract_jobs.push((work_dir.join(key.tar_path()), unpack));
    }
    let mut pool = WorkerPool::with_host_capacity();
    for (tar_path, unpack) in extract_jobs {
        pool.submit(move || extract::extract_archive(&tar_path, &unpack));
    }
    pool.join()?;

    // Fusion: strictly sequential within each image; the history, diff-id,
    // and layer vectors must stay in lockstep.
    for idx in 0..manifest.entries().len() {
        fuse::fuse_image(work_dir, manifest.entry_mut(idx), &sharing)?;
        if let Some(config) = manifest.entry_mut(idx).config_blob.as_mut() {
            config.flush_history()?;
        }
        manifest.flush_layers(idx)?;
    }
    fs::write(&manifest_path, manifest.raw())?;

    // Repack phase: every surviving layer is re-archived with its digest
    // recomputed. The table is keyed by layer key because several images
    // may reference the same post-melt layer. As above, the fallible
    // per-layer teardown finishes before anything is submitted.
    let digests: Arc<Mutex<HashMap<LayerKey, String>>> = Arc::new(Mutex::new(HashMap::new()));
    let mut repack_jobs = Vec::new();
    for key in sharing.keys() {
        let unpack = work_dir.join(key.unpack_dir());
        if fs::symlink_metadata(&unpack).is_err() {
            // Consumed by a melt.
            continue;
        }
        let tar_path = work_dir.join(key.tar_path());
        fs::remove_file(&tar_path)?;
        repack_jobs.push((key.clone(), unpack, tar_path));
    }
    let mut pool = WorkerPool::with_host_capacity();
    for (key, unpack, tar_path) in repack_jobs {
        let digests = Arc::clone(&digests);
        pool.submit(move || {
            let digest = pack::pack_dir_hashed(&unpack, &unpack, &tar_path)?;
            digests
                .lock()
                .map_err(|_| MeltError::Worker("digest table poisoned".to_string()))?
                .insert(key, digest);
            fs::remove_dir_all(&unpack)?;
            Ok(())
        });
    }
    pool.join()?;

    let digests = digests
        .lock()
        .map_err(|_| MeltError::Worker("digest table poisoned".to_string()))?;
    let output_layers = digests.len();

    // Content addressing: wire the recomputed diff-ids into each config and
    // write the patched blob back under its original name.
    for entry in manifest.entries_mut() {
        let config = entry.config_blob.as_mut().ok_or_else(|| {
            MeltError::CorruptConfig(format!("image entry {:?} has no configuration", entry.config))
        })?;
        for (j, key) in entry.layers.iter().enumerate() {
            let digest = digests.get(key).ok_or_else(|| {
                MeltError::CorruptManifest(format!("no digest recorded for layer {key}"))
            })?;
            match config.rootfs.diff_ids.get_mut(j) {
                Some(slot) => *slot = digest.clone(),
                None => {
                    return Err(MeltError::CorruptConfig(
                        "rootfs diff_ids list is shorter than the layer list".to_string(),
                    ));
                }
            }
        }
        config.flush_rootfs()?;
        fs::write(work_dir.join(&entry.config), config.raw())?;
    }

    tracing::debug!(input_layers, output_layers, "repacking outer archive");
    pack::pack_dir(work_dir, work_dir, output)?;

    Ok(MeltOutcome::Melted {
        input_layers,
        output_layers,
    })
}

/// Remove everything but `layer.tar` from a layer directory. docker-save
/// emits legacy `VERSION` and per-layer `json` files there; they are not
/// reproduced in the output.
fn strip_legacy_metadata(layer_dir: &Path) -> Result<()> {
    for dirent in fs::read_dir(layer_dir)? {
        let dirent = dirent?;
        if dirent.file_name() != "layer.tar" {
            fs::remove_file(dirent.path())?;
        }
    }
    Ok(())
}
