//! Layer keys and whiteout naming.
//!
//! A docker-save archive names each layer by a key of the form
//! `<hex>/layer.tar`. The melt pipeline needs two further projections of
//! that key: the directory holding the archive (`<hex>`) and the directory
//! the archive unpacks into (`<hex>/layer`). All three are derived here by
//! fixed-length suffix trimming so no other module re-derives them ad hoc.

use serde::Serialize;

use crate::error::{MeltError, Result};

/// Suffix every layer key carries inside the outer archive.
const LAYER_TAR_SUFFIX: &str = "/layer.tar";

/// Whiteout file prefix used by overlay filesystems.
///
/// Files named `.wh.<name>` indicate that `<name>` should be removed from
/// lower layers.
pub const WHITEOUT_PREFIX: &str = ".wh.";

/// A layer as named by the outer archive manifest, e.g. `<hex>/layer.tar`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct LayerKey(String);

impl LayerKey {
    /// Parse a layer key from its manifest representation.
    ///
    /// # Errors
    ///
    /// Returns [`MeltError::CorruptManifest`] if the key does not end in
    /// `/layer.tar` or has no leading hash component.
    pub fn parse(key: &str) -> Result<Self> {
        if key.len() <= LAYER_TAR_SUFFIX.len() || !key.ends_with(LAYER_TAR_SUFFIX) {
            return Err(MeltError::CorruptManifest(format!(
                "layer key {key:?} does not name a layer archive"
            )));
        }
        Ok(Self(key.to_string()))
    }

    /// Path of the layer archive relative to the working tree (`<hex>/layer.tar`).
    pub fn tar_path(&self) -> &str {
        &self.0
    }

    /// Directory holding the layer archive (`<hex>`).
    pub fn layer_dir(&self) -> &str {
        &self.0[..self.0.len() - LAYER_TAR_SUFFIX.len()]
    }

    /// Directory the layer archive unpacks into (`<hex>/layer`).
    pub fn unpack_dir(&self) -> &str {
        &self.0[..self.0.len() - ".tar".len()]
    }
}

impl std::fmt::Display for LayerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Check whether a basename is a whiteout marker.
pub fn is_whiteout(name: &str) -> bool {
    whiteout_target(name).is_some()
}

/// The basename removed by the whiteout `name`, with the `.wh.` prefix
/// stripped.
///
/// A whiteout is `.wh.` followed by at least one ASCII alphanumeric
/// character. The opaque-directory marker `.wh..wh..opq` does not match
/// (the prefix is followed by a dot) and is deliberately left alone; it is
/// carried through like any regular file.
pub fn whiteout_target(name: &str) -> Option<&str> {
    let target = name.strip_prefix(WHITEOUT_PREFIX)?;
    let first = target.chars().next()?;
    first.is_ascii_alphanumeric().then_some(target)
}
