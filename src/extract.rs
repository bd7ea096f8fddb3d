//! Tar extraction with full POSIX metadata.
//!
//! Layer archives and the outer docker-save archive are exploded with the
//! same routine: every entry type a layer can legally carry is reproduced
//! (regular files, directories, symlinks, hardlinks, character and block
//! devices, fifos), with numeric ownership, permission bits, modification
//! time, and `SCHILY.xattr.*` extended attributes restored. Entry types the
//! engine does not understand are skipped without failing.
//!
//! Ownership restoration is skipped when an entry already names the current
//! uid/gid, so unprivileged runs over archives built from the current user
//! succeed; restoring foreign ownership without privileges is an error, as
//! the melt contract requires preserved ownership.
//!
//! Directory mtimes are applied after the entry loop, since creating
//! children would otherwise clobber them.

use std::fs::{self, File, Permissions};
use std::io::{self, Read};
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;

use filetime::FileTime;
use nix::sys::stat::{Mode, SFlag, makedev, mknod};
use nix::unistd::mkfifo;
use tar::{Archive, Entry, EntryType, Header};

use crate::error::{MeltError, Result};

/// PAX record prefix carrying an extended attribute.
pub(crate) const PAX_XATTR_PREFIX: &str = "SCHILY.xattr.";

/// Extract `archive` into the directory `dest`.
///
/// `dest` must already exist. Entry paths are sanitised: a `..` component
/// is treated as a malformed archive, and absolute paths are re-rooted at
/// `dest`.
///
/// # Errors
///
/// Any I/O or header decode failure aborts the extraction; partial output
/// is considered corrupt and is the caller's to discard.
pub fn extract_archive(archive: &Path, dest: &Path) -> Result<()> {
    let file = File::open(archive)?;
    let mut reader = Archive::new(file);

    // Directory mtimes are restored once all children exist.
    let mut dir_times: Vec<(PathBuf, FileTime)> = Vec::new();

    for entry in reader.entries()? {
        let mut entry = entry?;
        let rel = sanitize_entry_path(&entry.path()?)?;
        if rel.as_os_str().is_empty() {
            continue;
        }
        let target = dest.join(&rel);

        match entry.header().entry_type() {
            EntryType::Directory => {
                let mtime = entry_mtime(entry.header())?;
                extract_dir(&mut entry, &target)?;
                dir_times.push((target, mtime));
            }
            EntryType::Regular | EntryType::Continuous => extract_regular(&mut entry, &target)?,
            EntryType::Symlink => extract_symlink(&mut entry, &target)?,
            EntryType::Link => extract_hardlink(&mut entry, dest, &target)?,
            EntryType::Char => extract_device(&mut entry, &target, SFlag::S_IFCHR)?,
            EntryType::Block => extract_device(&mut entry, &target, SFlag::S_IFBLK)?,
            EntryType::Fifo => extract_fifo(&mut entry, &target)?,
            other => {
                tracing::debug!(
                    entry_type = other.as_byte(),
                    path = %rel.display(),
                    "skipping unsupported tar entry"
                );
            }
        }
    }

    for (path, mtime) in dir_times {
        filetime::set_symlink_file_times(&path, mtime, mtime)?;
    }

    Ok(())
}

/// Report whether `archive` contains any entry at all.
pub fn is_empty_archive(archive: &Path) -> Result<bool> {
    let file = File::open(archive)?;
    let mut reader = Archive::new(file);
    match reader.entries()?.next() {
        None => Ok(true),
        Some(Ok(_)) => Ok(false),
        Some(Err(err)) => Err(err.into()),
    }
}

/// Strip a tar entry path down to its normal components.
fn sanitize_entry_path(path: &Path) -> Result<PathBuf> {
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir | Component::RootDir => {}
            Component::ParentDir | Component::Prefix(_) => {
                return Err(MeltError::MalformedArchive(format!(
                    "entry path escapes the extraction root: {}",
                    path.display()
                )));
            }
        }
    }
    Ok(clean)
}

fn entry_mtime(header: &Header) -> Result<FileTime> {
    Ok(FileTime::from_unix_time(header.mtime()? as i64, 0))
}

/// Collect `SCHILY.xattr.*` records attached to an entry.
fn pax_xattrs<R: Read>(entry: &mut Entry<'_, R>) -> Result<Vec<(String, Vec<u8>)>> {
    let mut xattrs = Vec::new();
    if let Some(extensions) = entry.pax_extensions()? {
        for extension in extensions {
            let extension = extension?;
            let Ok(record_key) = extension.key() else {
                continue;
            };
            if let Some(name) = record_key.strip_prefix(PAX_XATTR_PREFIX) {
                xattrs.push((name.to_string(), extension.value_bytes().to_vec()));
            }
        }
    }
    Ok(xattrs)
}

fn extract_dir<R: Read>(entry: &mut Entry<'_, R>, target: &Path) -> Result<()> {
    let xattrs = pax_xattrs(entry)?;
    fs::create_dir_all(target)?;
    apply_metadata(target, entry.header(), &xattrs, false)
}

fn extract_regular<R: Read>(entry: &mut Entry<'_, R>, target: &Path) -> Result<()> {
    ensure_parent(target)?;
    let xattrs = pax_xattrs(entry)?;
    let mut out = File::create(target)?;
    io::copy(entry, &mut out)?;
    drop(out);
    apply_metadata(target, entry.header(), &xattrs, true)
}

fn extract_symlink<R: Read>(entry: &mut Entry<'_, R>, target: &Path) -> Result<()> {
    ensure_parent(target)?;
    let link = entry.link_name()?.ok_or_else(|| {
        MeltError::MalformedArchive(format!("symlink without target: {}", target.display()))
    })?;
    if fs::symlink_metadata(target).is_ok() {
        fs::remove_file(target)?;
    }
    std::os::unix::fs::symlink(&link, target)?;

    let header = entry.header();
    maybe_lchown(target, header.uid()? as u32, header.gid()? as u32)?;
    let mtime = entry_mtime(header)?;
    filetime::set_symlink_file_times(target, mtime, mtime)?;
    Ok(())
}

fn extract_hardlink<R: Read>(entry: &mut Entry<'_, R>, dest: &Path, target: &Path) -> Result<()> {
    ensure_parent(target)?;
    let link = entry.link_name()?.ok_or_else(|| {
        MeltError::MalformedArchive(format!("hardlink without target: {}", target.display()))
    })?;
    let link_rel = sanitize_entry_path(&link)?;
    fs::hard_link(dest.join(link_rel), target)?;
    Ok(())
}

fn extract_device<R: Read>(entry: &mut Entry<'_, R>, target: &Path, kind: SFlag) -> Result<()> {
    ensure_parent(target)?;
    let xattrs = pax_xattrs(entry)?;
    let header = entry.header();
    let major = header.device_major()?.unwrap_or(0);
    let minor = header.device_minor()?.unwrap_or(0);
    let mode = Mode::from_bits_truncate(header.mode()?);
    mknod(target, kind, mode, makedev(major as u64, minor as u64))
        .map_err(io::Error::from)?;
    apply_metadata(target, header, &xattrs, true)
}

fn extract_fifo<R: Read>(entry: &mut Entry<'_, R>, target: &Path) -> Result<()> {
    ensure_parent(target)?;
    let xattrs = pax_xattrs(entry)?;
    let header = entry.header();
    mkfifo(target, Mode::from_bits_truncate(header.mode()?)).map_err(io::Error::from)?;
    apply_metadata(target, header, &xattrs, true)
}

fn ensure_parent(target: &Path) -> Result<()> {
    if let Some(parent) = target.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// Restore ownership, xattrs, mode, and (for non-directories) mtime.
fn apply_metadata(
    path: &Path,
    header: &Header,
    xattrs: &[(String, Vec<u8>)],
    set_mtime: bool,
) -> Result<()> {
    write_xattrs(path, xattrs);
    maybe_chown(path, header.uid()? as u32, header.gid()? as u32)?;
    fs::set_permissions(path, Permissions::from_mode(header.mode()? & 0o7777))?;
    if set_mtime {
        let mtime = entry_mtime(header)?;
        filetime::set_symlink_file_times(path, mtime, mtime)?;
    }
    Ok(())
}

/// Write xattrs, tolerating filesystems and privileges that refuse them.
fn write_xattrs(path: &Path, xattrs: &[(String, Vec<u8>)]) {
    for (name, value) in xattrs {
        if let Err(err) = xattr::set(path, name, value) {
            tracing::debug!(path = %path.display(), name, "failed to set xattr: {err}");
        }
    }
}

fn current_ids() -> (u32, u32) {
    static IDS: OnceLock<(u32, u32)> = OnceLock::new();
    *IDS.get_or_init(|| {
        (
            nix::unistd::getuid().as_raw(),
            nix::unistd::getgid().as_raw(),
        )
    })
}

/// Restore numeric ownership, skipping the no-op case so unprivileged runs
/// over the current user's archives succeed.
pub(crate) fn maybe_chown(path: &Path, uid: u32, gid: u32) -> Result<()> {
    if (uid, gid) == current_ids() {
        return Ok(());
    }
    std::os::unix::fs::chown(path, Some(uid), Some(gid))?;
    Ok(())
}

fn maybe_lchown(path: &Path, uid: u32, gid: u32) -> Result<()> {
    if (uid, gid) == current_ids() {
        return Ok(());
    }
    std::os::unix::fs::lchown(path, Some(uid), Some(gid))?;
    Ok(())
}
