//! Manifest and image-configuration model.
//!
//! A docker-save archive carries a top-level `manifest.json` plus one
//! configuration blob per image. The melt engine edits exactly three values
//! in that metadata: each manifest entry's layer list, and each config's
//! `history` and `rootfs` values. Every other field must survive
//! byte-for-byte, including fields this crate knows nothing about, so full
//! re-serialisation is off the table.
//!
//! Instead, both files are read into memory once and the raw bytes are
//! retained. The three mutable values are captured as raw slices
//! ([`serde_json::value::RawValue`] preserves the exact input text) and
//! decoded a second time into typed structures. Mutations touch only the
//! decoded views; flushing re-encodes a decoded view and substitutes the
//! single occurrence of the captured raw slice inside the retained bytes.
//!
//! The single-occurrence substitution is a contract on the input: the raw
//! slice is the exact bytes of a JSON value with balanced brackets and
//! cannot collide with an unrelated region. Zero or multiple matches means
//! the input is corrupt, not that a weaker replacement should be attempted.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::error::{MeltError, Result};
use crate::layer::LayerKey;

/// One entry of an image-config `history` list.
///
/// Entries flagged `empty_layer` correspond to no filesystem layer and are
/// preserved at their positions; the remaining entries are in one-to-one
/// order correspondence with the layer list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistoryEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub empty_layer: bool,
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// The `rootfs` object of an image config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Rootfs {
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub fs_type: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diff_ids: Vec<String>,
}

/// Fields of an image config the engine decodes; everything else stays in
/// the retained raw bytes.
#[derive(Debug, Deserialize)]
struct RawConfig {
    history: Option<Box<RawValue>>,
    rootfs: Option<Box<RawValue>>,
}

/// An image configuration blob with its original bytes retained.
#[derive(Debug)]
pub struct ImageConfig {
    /// The blob as read from disk, patched in place on flush.
    raw: Vec<u8>,
    /// Exact bytes of the original `history` value.
    raw_history: Box<RawValue>,
    /// Exact bytes of the original `rootfs` value.
    raw_rootfs: Box<RawValue>,
    /// Decoded history list; mutated by the fusion engine.
    pub history: Vec<HistoryEntry>,
    /// Decoded rootfs; its diff-id list is mutated by the fusion engine and
    /// rewritten by the content addressor.
    pub rootfs: Rootfs,
}

impl ImageConfig {
    /// Load a config blob, retaining the raw bytes and capturing the
    /// `history` and `rootfs` values as raw slices.
    ///
    /// # Errors
    ///
    /// Returns [`MeltError::CorruptConfig`] if either value is missing, and
    /// a JSON error if the blob does not parse at all.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read(path)?;
        let parsed: RawConfig = serde_json::from_slice(&raw)?;
        let raw_history = parsed.history.ok_or_else(|| {
            MeltError::CorruptConfig(format!("{} has no history", path.display()))
        })?;
        let raw_rootfs = parsed.rootfs.ok_or_else(|| {
            MeltError::CorruptConfig(format!("{} has no rootfs", path.display()))
        })?;

        let history: Vec<HistoryEntry> = serde_json::from_str(raw_history.get())?;
        let rootfs: Rootfs = serde_json::from_str(raw_rootfs.get())?;

        Ok(Self {
            raw,
            raw_history,
            raw_rootfs,
            history,
            rootfs,
        })
    }

    /// Delete the history entry at `pos`.
    pub fn delete_history_at(&mut self, pos: usize) {
        self.history.remove(pos);
    }

    /// Delete the rootfs diff-id at `pos`.
    pub fn delete_diff_id_at(&mut self, pos: usize) {
        self.rootfs.diff_ids.remove(pos);
    }

    /// Substitute the mutated history list for the captured raw slice.
    pub fn flush_history(&mut self) -> Result<()> {
        let repl = serde_json::to_vec(&self.history)?;
        self.raw = replace_once(&self.raw, self.raw_history.get().as_bytes(), &repl)
            .ok_or_else(|| {
                MeltError::CorruptConfig(
                    "history value does not occur exactly once in the retained config bytes"
                        .to_string(),
                )
            })?;
        Ok(())
    }

    /// Substitute the mutated rootfs for the captured raw slice.
    pub fn flush_rootfs(&mut self) -> Result<()> {
        let repl = serde_json::to_vec(&self.rootfs)?;
        self.raw = replace_once(&self.raw, self.raw_rootfs.get().as_bytes(), &repl)
            .ok_or_else(|| {
                MeltError::CorruptConfig(
                    "rootfs value does not occur exactly once in the retained config bytes"
                        .to_string(),
                )
            })?;
        Ok(())
    }

    /// The (possibly patched) config bytes.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }
}

/// Manifest fields the engine decodes per image entry.
#[derive(Debug, Deserialize)]
struct RawManifestEntry {
    #[serde(rename = "Config", default)]
    config: String,
    #[serde(rename = "RepoTags", default)]
    repo_tags: Vec<String>,
    #[serde(rename = "Layers")]
    layers: Option<Box<RawValue>>,
}

/// One image entry of the outer manifest.
#[derive(Debug)]
pub struct ManifestEntry {
    /// Name of the config blob inside the archive; may be empty.
    pub config: String,
    /// Repository tags naming this image.
    pub repo_tags: Vec<String>,
    /// Exact bytes of the original `Layers` value.
    raw_layers: Box<RawValue>,
    /// Decoded layer list, root-first; mutated by the fusion engine.
    pub layers: Vec<LayerKey>,
    /// Parsed config blob, populated by the pipeline for entries that name
    /// one.
    pub config_blob: Option<ImageConfig>,
}

impl ManifestEntry {
    /// Delete the layer at `pos`.
    pub fn delete_layer_at(&mut self, pos: usize) {
        self.layers.remove(pos);
    }
}

/// The outer `manifest.json` with its original bytes retained.
#[derive(Debug)]
pub struct Manifest {
    entries: Vec<ManifestEntry>,
    raw: Vec<u8>,
}

impl Manifest {
    /// Load `manifest.json`, retaining the raw bytes and capturing each
    /// entry's `Layers` value as a raw slice.
    ///
    /// # Errors
    ///
    /// Returns [`MeltError::CorruptManifest`] if an entry has no `Layers`
    /// list or a layer key is not of the `<hex>/layer.tar` form.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read(path)?;
        let parsed: Vec<RawManifestEntry> = serde_json::from_slice(&raw)?;

        let mut entries = Vec::with_capacity(parsed.len());
        for (idx, entry) in parsed.into_iter().enumerate() {
            let raw_layers = entry.layers.ok_or_else(|| {
                MeltError::CorruptManifest(format!("image entry {idx} has no Layers list"))
            })?;
            let keys: Vec<String> = serde_json::from_str(raw_layers.get())?;
            let layers = keys
                .iter()
                .map(|key| LayerKey::parse(key))
                .collect::<Result<Vec<_>>>()?;
            entries.push(ManifestEntry {
                config: entry.config,
                repo_tags: entry.repo_tags,
                raw_layers,
                layers,
                config_blob: None,
            });
        }

        Ok(Self { entries, raw })
    }

    /// The image entries, in manifest order.
    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }

    /// Mutable access to the image entries.
    pub fn entries_mut(&mut self) -> &mut [ManifestEntry] {
        &mut self.entries
    }

    /// Mutable access to a single image entry.
    pub fn entry_mut(&mut self, idx: usize) -> &mut ManifestEntry {
        &mut self.entries[idx]
    }

    /// Substitute entry `idx`'s mutated layer list for its captured raw
    /// slice.
    pub fn flush_layers(&mut self, idx: usize) -> Result<()> {
        let entry = &self.entries[idx];
        let repl = serde_json::to_vec(&entry.layers)?;
        self.raw = replace_once(&self.raw, entry.raw_layers.get().as_bytes(), &repl)
            .ok_or_else(|| {
                MeltError::CorruptManifest(format!(
                    "layer list of image entry {idx} does not occur exactly once in the retained manifest bytes"
                ))
            })?;
        Ok(())
    }

    /// The (possibly patched) manifest bytes.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }
}

/// Replace the single occurrence of `needle` in `haystack`.
///
/// Returns `None` when the needle occurs zero times or more than once; the
/// caller reports that as input corruption.
fn replace_once(haystack: &[u8], needle: &[u8], replacement: &[u8]) -> Option<Vec<u8>> {
    let pos = find(haystack, needle)?;
    if find(&haystack[pos + 1..], needle).is_some() {
        return None;
    }
    let mut out = Vec::with_capacity(haystack.len() - needle.len() + replacement.len());
    out.extend_from_slice(&haystack[..pos]);
    out.extend_from_slice(replacement);
    out.extend_from_slice(&haystack[pos + needle.len()..]);
    Some(out)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
