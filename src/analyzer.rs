//! Cross-image layer sharing analysis.
//!
//! Before anything is melted, every distinct layer key across all images is
//! classified:
//!
//! - [`Multiplicity::Unique`] — the layer occurs in exactly one image.
//! - [`Multiplicity::Shared`] — the layer occurs in two or more images.
//! - [`Multiplicity::Boundary`] — a shared layer that is followed, in at
//!   least one image, by a unique layer. Melting across such a layer would
//!   mutate bytes other images depend on, so it can never be the sink of a
//!   melt.
//!
//! Classification happens in two passes: a seeding pass that distinguishes
//! unique from shared, then (only when the archive holds more than one
//! image) a boundary pass over each image's shared→unique transitions. Once
//! a layer is marked as a boundary it is never downgraded.

use std::collections::HashMap;
use std::collections::hash_map::Entry;

use crate::image::ManifestEntry;
use crate::layer::LayerKey;

/// How widely a layer is referenced across the images of the archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Multiplicity {
    /// The layer occurs in exactly one image's list.
    Unique,
    /// The layer occurs in two or more images' lists.
    Shared,
    /// A shared layer followed by a unique layer in at least one image;
    /// never a melt sink.
    Boundary,
}

/// The multiplicity classification of every distinct layer key.
#[derive(Debug)]
pub struct SharingMap {
    map: HashMap<LayerKey, Multiplicity>,
}

impl SharingMap {
    /// The multiplicity assigned to `key`.
    ///
    /// Keys that never appeared in any image default to `Unique`; the
    /// pipeline only queries keys taken from the analysed manifest.
    pub fn multiplicity(&self, key: &LayerKey) -> Multiplicity {
        self.map.get(key).copied().unwrap_or(Multiplicity::Unique)
    }

    /// Iterate over every distinct layer key.
    pub fn keys(&self) -> impl Iterator<Item = &LayerKey> {
        self.map.keys()
    }

    /// Number of distinct layers in the archive.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether the archive holds no layers at all.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Outcome of the sharing analysis.
#[derive(Debug)]
pub enum Analysis {
    /// Melting cannot reduce this archive; the run exits cleanly without
    /// writing output.
    NothingToDo(&'static str),
    /// Proceed with the melt using the computed sharing map.
    Melt(SharingMap),
}

/// Classify every distinct layer across all image entries.
pub fn analyze(entries: &[ManifestEntry]) -> Analysis {
    let total: usize = entries.iter().map(|entry| entry.layers.len()).sum();
    if total <= 1 {
        return Analysis::NothingToDo("the image only has one layer");
    }

    let mut map: HashMap<LayerKey, Multiplicity> = HashMap::with_capacity(total);
    for entry in entries {
        for key in &entry.layers {
            match map.entry(key.clone()) {
                Entry::Vacant(slot) => {
                    slot.insert(Multiplicity::Unique);
                }
                Entry::Occupied(mut slot) => {
                    // Only upgrade from Unique; repeat occurrences of an
                    // already-shared layer change nothing.
                    if *slot.get() == Multiplicity::Unique {
                        slot.insert(Multiplicity::Shared);
                    }
                }
            }
        }
    }

    // Boundaries only exist between images.
    if entries.len() > 1 {
        if map.values().all(|m| *m == Multiplicity::Shared) {
            return Analysis::NothingToDo("all layers are shared among images");
        }
        for entry in entries {
            for i in 1..entry.layers.len() {
                let cur = map.get(&entry.layers[i]).copied();
                let prev = map.get(&entry.layers[i - 1]).copied();
                if cur == Some(Multiplicity::Unique) && prev == Some(Multiplicity::Shared) {
                    map.insert(entry.layers[i - 1].clone(), Multiplicity::Boundary);
                }
            }
        }
    }

    Analysis::Melt(SharingMap { map })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::Manifest;

    fn manifest_from(layer_lists: &[&[&str]]) -> Manifest {
        let entries: Vec<String> = layer_lists
            .iter()
            .map(|layers| {
                let keys: Vec<String> = layers
                    .iter()
                    .map(|hash| format!("\"{hash}/layer.tar\""))
                    .collect();
                format!(
                    "{{\"Config\":\"cfg.json\",\"Layers\":[{}]}}",
                    keys.join(",")
                )
            })
            .collect();
        let json = format!("[{}]", entries.join(","));

        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("manifest.json");
        std::fs::write(&path, json).unwrap();
        Manifest::load(&path).unwrap()
    }

    fn key(hash: &str) -> LayerKey {
        LayerKey::parse(&format!("{hash}/layer.tar")).unwrap()
    }

    #[test]
    fn test_single_layer_is_nothing_to_do() {
        let manifest = manifest_from(&[&["a"]]);
        assert!(matches!(
            analyze(manifest.entries()),
            Analysis::NothingToDo(_)
        ));
    }

    #[test]
    fn test_single_image_layers_all_unique() {
        let manifest = manifest_from(&[&["a", "b", "c"]]);
        let Analysis::Melt(sharing) = analyze(manifest.entries()) else {
            panic!("expected a melt plan");
        };
        assert_eq!(sharing.len(), 3);
        for hash in ["a", "b", "c"] {
            assert_eq!(sharing.multiplicity(&key(hash)), Multiplicity::Unique);
        }
    }

    #[test]
    fn test_all_shared_is_nothing_to_do() {
        let manifest = manifest_from(&[&["a", "b"], &["a", "b"]]);
        let Analysis::NothingToDo(reason) = analyze(manifest.entries()) else {
            panic!("expected nothing to do");
        };
        assert!(reason.contains("shared"));
    }

    #[test]
    fn test_shared_prefix_marks_boundary() {
        // Image X: a, b, x1. Image Y: a, b, y1. The shared layer b is
        // followed by unique layers, so it becomes the boundary.
        let manifest = manifest_from(&[&["a", "b", "x1"], &["a", "b", "y1"]]);
        let Analysis::Melt(sharing) = analyze(manifest.entries()) else {
            panic!("expected a melt plan");
        };
        assert_eq!(sharing.multiplicity(&key("a")), Multiplicity::Shared);
        assert_eq!(sharing.multiplicity(&key("b")), Multiplicity::Boundary);
        assert_eq!(sharing.multiplicity(&key("x1")), Multiplicity::Unique);
        assert_eq!(sharing.multiplicity(&key("y1")), Multiplicity::Unique);
    }

    #[test]
    fn test_shared_suffix_does_not_mark_unique_layer() {
        // Image X: a, b, x1, d. Image Y: a, b, y1, d. Only the shared→unique
        // transition marks a boundary; unique→shared (x1 followed by d) does
        // not.
        let manifest = manifest_from(&[&["a", "b", "x1", "d"], &["a", "b", "y1", "d"]]);
        let Analysis::Melt(sharing) = analyze(manifest.entries()) else {
            panic!("expected a melt plan");
        };
        assert_eq!(sharing.multiplicity(&key("a")), Multiplicity::Shared);
        assert_eq!(sharing.multiplicity(&key("b")), Multiplicity::Boundary);
        assert_eq!(sharing.multiplicity(&key("x1")), Multiplicity::Unique);
        assert_eq!(sharing.multiplicity(&key("y1")), Multiplicity::Unique);
        assert_eq!(sharing.multiplicity(&key("d")), Multiplicity::Shared);
    }

    #[test]
    fn test_boundary_within_single_image_is_not_marked() {
        // With a single image there is nothing to protect; no boundary pass
        // runs even when a layer repeats inside the image.
        let manifest = manifest_from(&[&["a", "a", "b"]]);
        let Analysis::Melt(sharing) = analyze(manifest.entries()) else {
            panic!("expected a melt plan");
        };
        assert_eq!(sharing.multiplicity(&key("a")), Multiplicity::Shared);
        assert_eq!(sharing.multiplicity(&key("b")), Multiplicity::Unique);
    }
}
