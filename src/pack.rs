//! Deterministic tar packing, with optional SHA-256 streaming.
//!
//! The packer walks a source tree in pre-order, unsorted — entry order is
//! whatever the filesystem's directory listing yields, and the digest
//! produced by [`pack_dir_hashed`] is defined modulo that ordering. Entry
//! names are the walked path with a strip prefix removed; directories carry
//! a trailing slash.
//!
//! Regular files, directories, symlinks, character/block devices, and fifos
//! are emitted. Sockets cannot be represented and are skipped. Hard-linked
//! files are emitted as independent regular entries, each with full
//! content. Extended attributes ride along as PAX `SCHILY.xattr.*` records
//! immediately before the entry they describe (symlinks excepted).

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::Path;

use sha2::{Digest, Sha256};
use tar::{Builder, EntryType, Header};
use walkdir::WalkDir;

use crate::error::{MeltError, Result};

/// Pack the tree under `src` into a tar archive at `dest`.
///
/// Entry names are relative to `strip_prefix`, which must be a prefix of
/// every walked path (callers pass `src` itself or an ancestor).
pub fn pack_dir(src: &Path, strip_prefix: &Path, dest: &Path) -> Result<()> {
    let file = File::create(dest)?;
    let mut builder = Builder::new(BufWriter::new(file));
    append_tree(&mut builder, src, strip_prefix)?;
    let mut writer = builder.into_inner()?;
    writer.flush()?;
    Ok(())
}

/// Pack the tree under `src` into a tar archive at `dest`, streaming the
/// archive bytes through SHA-256.
///
/// Returns the digest in `sha256:<hex>` form — the diff-id a
/// content-addressed runtime derives for the layer.
pub fn pack_dir_hashed(src: &Path, strip_prefix: &Path, dest: &Path) -> Result<String> {
    let file = File::create(dest)?;
    let mut builder = Builder::new(HashingWriter {
        inner: BufWriter::new(file),
        hasher: Sha256::new(),
    });
    append_tree(&mut builder, src, strip_prefix)?;
    let mut writer = builder.into_inner()?;
    writer.flush()?;
    Ok(format!("sha256:{:x}", writer.hasher.finalize()))
}

/// Tee writer feeding a SHA-256 digester with exactly the bytes written.
struct HashingWriter<W: Write> {
    inner: W,
    hasher: Sha256,
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.hasher.update(&buf[..written]);
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

fn append_tree<W: Write>(builder: &mut Builder<W>, src: &Path, strip_prefix: &Path) -> Result<()> {
    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry?;
        if entry.depth() == 0 {
            continue;
        }
        let path = entry.path();
        let rel = path.strip_prefix(strip_prefix).map_err(|_| {
            MeltError::Io(io::Error::other(format!(
                "{} is outside the strip prefix {}",
                path.display(),
                strip_prefix.display()
            )))
        })?;

        let meta = fs::symlink_metadata(path)?;
        let file_type = meta.file_type();

        let mut header = Header::new_gnu();
        header.set_mode(meta.mode() & 0o7777);
        header.set_uid(meta.uid() as u64);
        header.set_gid(meta.gid() as u64);
        header.set_mtime(meta.mtime().max(0) as u64);
        header.set_size(0);

        if file_type.is_symlink() {
            header.set_entry_type(EntryType::Symlink);
            let target = fs::read_link(path)?;
            builder.append_link(&mut header, rel, &target)?;
            continue;
        }

        append_xattrs(builder, path)?;

        if file_type.is_dir() {
            header.set_entry_type(EntryType::Directory);
            let mut name = rel.as_os_str().to_os_string();
            name.push("/");
            builder.append_data(&mut header, &name, io::empty())?;
        } else if file_type.is_file() {
            header.set_entry_type(EntryType::Regular);
            header.set_size(meta.len());
            let mut file = File::open(path)?;
            builder.append_data(&mut header, rel, &mut file)?;
        } else if file_type.is_char_device() || file_type.is_block_device() {
            header.set_entry_type(if file_type.is_char_device() {
                EntryType::Char
            } else {
                EntryType::Block
            });
            let rdev = meta.rdev();
            header.set_device_major(nix::sys::stat::major(rdev) as u32)?;
            header.set_device_minor(nix::sys::stat::minor(rdev) as u32)?;
            builder.append_data(&mut header, rel, io::empty())?;
        } else if file_type.is_fifo() {
            header.set_entry_type(EntryType::Fifo);
            builder.append_data(&mut header, rel, io::empty())?;
        } else {
            // Sockets and anything else the tar format cannot carry.
            tracing::debug!(path = %path.display(), "skipping unrepresentable entry");
        }
    }
    Ok(())
}

/// Emit PAX xattr records for the next entry. Unreadable xattrs are not
/// fatal; some filesystems do not support them at all.
fn append_xattrs<W: Write>(builder: &mut Builder<W>, path: &Path) -> Result<()> {
    let names = match xattr::list(path) {
        Ok(names) => names,
        Err(err) => {
            tracing::debug!(path = %path.display(), "failed to list xattrs: {err}");
            return Ok(());
        }
    };

    let mut records: Vec<(String, Vec<u8>)> = Vec::new();
    for name in names {
        let Some(name) = name.to_str() else { continue };
        match xattr::get(path, name) {
            Ok(Some(value)) => {
                records.push((format!("{}{name}", crate::extract::PAX_XATTR_PREFIX), value));
            }
            Ok(None) => {}
            Err(err) => {
                tracing::debug!(path = %path.display(), name, "failed to read xattr: {err}");
            }
        }
    }

    if !records.is_empty() {
        builder.append_pax_extensions(
            records
                .iter()
                .map(|(key, value)| (key.as_str(), value.as_slice())),
        )?;
    }
    Ok(())
}
