#![forbid(unsafe_code)]
//! Melt redundant layers in docker-save container image archives.
//!
//! A `docker save` archive holds one or more images, each described by an
//! ordered sequence of filesystem layers. This library rewrites such an
//! archive into a structurally equivalent one in which adjacent layers have
//! been merged ("melted"): the output loads with the same runtime and
//! yields byte-identical image filesystems, but with fewer, larger layers.
//!
//! # Overview
//!
//! The hard part is not tar plumbing but deciding what may be merged.
//! Images in one archive often share a prefix of their layer sequences;
//! folding a unique layer into a shared one would mutate bytes other images
//! depend on. The pipeline therefore:
//!
//! 1. classifies every distinct layer as unique, shared, or a
//!    sharing boundary ([`analyzer`]);
//! 2. unpacks all distinct layers in parallel ([`extract`], [`pool`]);
//! 3. folds each image's layers into root layers, honouring whiteout
//!    deletion markers and keeping the layer, diff-id, and history vectors
//!    in lockstep ([`fuse`]);
//! 4. repacks surviving layers while recomputing their content digests
//!    ([`pack`]);
//! 5. patches the manifest and config blobs by byte-level substitution so
//!    unknown JSON fields survive untouched ([`image`]).
//!
//! # Example
//!
//! ```no_run
//! use melt_rs::{MeltOutcome, melt_archive};
//!
//! let work = tempfile::tempdir()?;
//! let outcome = melt_archive(
//!     "app.tar".as_ref(),
//!     "app-melted.tar".as_ref(),
//!     work.path(),
//! )?;
//! if let MeltOutcome::NothingToDo(reason) = outcome {
//!     println!("{reason}; nothing to be done");
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod analyzer;
pub mod error;
pub mod extract;
pub mod fuse;
pub mod image;
pub mod layer;
pub mod melt;
pub mod pack;
pub mod pool;

pub use analyzer::{Analysis, Multiplicity, SharingMap, analyze};
pub use error::{MeltError, Result};
pub use image::{HistoryEntry, ImageConfig, Manifest, ManifestEntry, Rootfs};
pub use layer::LayerKey;
pub use melt::{MeltOutcome, melt_archive};
pub use pool::WorkerPool;
