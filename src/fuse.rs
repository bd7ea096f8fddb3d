//! The layer-fusion engine.
//!
//! Fusion runs per image, after every distinct layer has been unpacked. It
//! walks the image's layer list with a root cursor: the first layer that is
//! not a sharing boundary becomes the melt sink, and every following layer
//! is folded into it until a boundary forces a fresh root.
//!
//! Folding a layer means merging its unpacked tree into the root's unpacked
//! tree (source metadata wins, whiteout markers are withheld, sources are
//! drained by moving), then walking the source a second time to apply
//! whiteouts against the merged tree, and finally dropping the drained
//! layer directory. The image's layer list, diff-id list, and history list
//! collapse in lockstep; history entries flagged `empty_layer` correspond
//! to no layer and are preserved at their positions.
//!
//! A layer whose unpack directory is already gone was consumed by an
//! earlier image that shares it; the tree work is skipped but the vector
//! surgery still applies, which is what keeps shared prefixes consistent
//! across images.

use std::fs;
use std::io;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;

use filetime::FileTime;

use crate::analyzer::{Multiplicity, SharingMap};
use crate::error::{MeltError, Result};
use crate::extract::maybe_chown;
use crate::image::ManifestEntry;
use crate::layer;

/// Collapse one image's layer sequence according to the sharing analysis.
///
/// On return the entry's layer list, its config's diff-id list, and the
/// non-empty history entries are still in one-to-one correspondence.
///
/// # Errors
///
/// An entry without a parsed configuration is corrupt input. Any I/O
/// failure during a melt aborts the run; the working tree is the caller's
/// to discard.
pub fn fuse_image(
    work_dir: &Path,
    entry: &mut ManifestEntry,
    sharing: &SharingMap,
) -> Result<()> {
    let ManifestEntry {
        layers,
        config_blob,
        config,
        ..
    } = entry;
    let image_config = config_blob.as_mut().ok_or_else(|| {
        MeltError::CorruptConfig(format!("image entry {config:?} has no configuration"))
    })?;

    let mut root_layer: Option<crate::layer::LayerKey> = None;
    let mut j = 0usize;
    let mut hist = 0usize;

    while j < layers.len() {
        // Entries flagged empty correspond to no layer; step past them so
        // `hist` points at the entry for the layer at `j`.
        while hist < image_config.history.len() && image_config.history[hist].empty_layer {
            hist += 1;
        }

        let current = layers[j].clone();
        let boundary = sharing.multiplicity(&current) == Multiplicity::Boundary;

        let Some(root) = &root_layer else {
            // A boundary layer can be neither sink nor source; anything
            // else becomes the new melt sink.
            if !boundary {
                root_layer = Some(current);
            }
            j += 1;
            hist += 1;
            continue;
        };

        let melt_from = work_dir.join(current.unpack_dir());
        if fs::symlink_metadata(&melt_from).is_ok() {
            let melt_into = work_dir.join(root.unpack_dir());
            tracing::debug!(
                from = %current.unpack_dir(),
                into = %root.unpack_dir(),
                "melting layer"
            );
            merge_tree(&melt_from, &melt_into)?;
            apply_whiteouts(&melt_from, &melt_into)?;
            fs::remove_dir_all(work_dir.join(current.layer_dir()))?;
        }

        if boundary {
            root_layer = None;
        }

        if hist >= image_config.history.len() {
            return Err(MeltError::CorruptConfig(
                "history list is shorter than the layer list".to_string(),
            ));
        }
        image_config.delete_history_at(hist);
        if j >= image_config.rootfs.diff_ids.len() {
            return Err(MeltError::CorruptConfig(
                "rootfs diff_ids list is shorter than the layer list".to_string(),
            ));
        }
        image_config.delete_diff_id_at(j);
        layers.remove(j);

        debug_assert_eq!(layers.len(), image_config.rootfs.diff_ids.len());
    }

    Ok(())
}

/// Merge the tree at `from` into `into`, draining `from`.
///
/// Files, symlinks, and special files are moved over whatever the
/// destination holds (their metadata travels with them); directories are
/// merged recursively with the source directory's metadata applied to the
/// destination. Whiteout markers are withheld so the second pass can apply
/// them.
fn merge_tree(from: &Path, into: &Path) -> Result<()> {
    for dirent in fs::read_dir(from)? {
        let dirent = dirent?;
        let file_type = dirent.file_type()?;
        let src = dirent.path();
        let dst = into.join(dirent.file_name());

        if file_type.is_dir() {
            match fs::symlink_metadata(&dst) {
                Ok(meta) if meta.is_dir() => {}
                Ok(_) => {
                    // An upper-layer directory replaces a lower-layer file.
                    fs::remove_file(&dst)?;
                    fs::create_dir(&dst)?;
                }
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    fs::create_dir(&dst)?;
                }
                Err(err) => return Err(err.into()),
            }
            merge_tree(&src, &dst)?;
            copy_dir_metadata(&src, &dst)?;
        } else {
            let name = dirent.file_name();
            if name.to_str().is_some_and(layer::is_whiteout) {
                continue;
            }
            move_entry(&src, &dst)?;
        }
    }
    Ok(())
}

/// Move one non-directory entry over whatever sits at `dst`.
fn move_entry(src: &Path, dst: &Path) -> Result<()> {
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(_) => {
            // Replacing a non-empty lower-layer directory with a file.
            remove_all(dst)?;
            fs::rename(src, dst)?;
            Ok(())
        }
    }
}

/// Apply the source directory's ownership, xattrs, mode, and mtime to the
/// merged destination directory.
fn copy_dir_metadata(src: &Path, dst: &Path) -> Result<()> {
    let meta = fs::symlink_metadata(src)?;

    match xattr::list(src) {
        Ok(names) => {
            for name in names {
                if let Ok(Some(value)) = xattr::get(src, &name)
                    && let Err(err) = xattr::set(dst, &name, &value)
                {
                    tracing::debug!(path = %dst.display(), "failed to carry xattr over: {err}");
                }
            }
        }
        Err(err) => {
            tracing::debug!(path = %src.display(), "failed to list xattrs: {err}");
        }
    }

    maybe_chown(dst, meta.uid(), meta.gid())?;
    fs::set_permissions(dst, fs::Permissions::from_mode(meta.mode() & 0o7777))?;
    let mtime = FileTime::from_unix_time(meta.mtime(), meta.mtime_nsec() as u32);
    filetime::set_symlink_file_times(dst, mtime, mtime)?;
    Ok(())
}

/// Walk the drained source tree and delete, from the merged destination,
/// every entity a whiteout marker names.
///
/// This is a batched readdir recursion rather than a sorted walk; order is
/// irrelevant as long as every entry is visited once.
fn apply_whiteouts(from: &Path, into: &Path) -> Result<()> {
    for dirent in fs::read_dir(from)? {
        let dirent = dirent?;
        if dirent.file_type()?.is_dir() {
            apply_whiteouts(&dirent.path(), &into.join(dirent.file_name()))?;
        } else {
            let name = dirent.file_name();
            if let Some(target) = name.to_str().and_then(layer::whiteout_target) {
                remove_all(&into.join(target))?;
            }
        }
    }
    Ok(())
}

/// Remove a file, symlink, or directory tree; absence is fine.
fn remove_all(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
        Ok(meta) if meta.is_dir() => Ok(fs::remove_dir_all(path)?),
        Ok(_) => Ok(fs::remove_file(path)?),
    }
}
