// ──────────────────────────────────────────────────────────────────────────────
// vmgate-archive · ova
// ──────────────────────────────────────────────────────────────────────────────
// OVA container operations:
//  • Pack a directory tree into a single tar container
//  • Unpack a container into a destination directory
//  • List entries / locate the OVF descriptor
//  • Read a single entry as text
// ──────────────────────────────────────────────────────────────────────────────

use crate::error::{ArchiveError, ArchiveResult};
use log::{debug, warn};
use std::fs::{self, File};
use std::io::Read;
use std::path::{Component, Path, PathBuf};

/// File extension of the descriptor entry inside a container.
pub const DESCRIPTOR_EXT: &str = "ovf";

/// File extension of the container itself.
pub const CONTAINER_EXT: &str = "ova";

/// A single entry inside a container. Only valid while listing.
#[derive(Debug, Clone)]
pub struct ArchiveEntry {
    /// Path of the entry relative to the container root.
    pub path: String,
    pub size_bytes: u64,
    pub is_directory: bool,
}

// ── Listing / descriptor lookup ──────────────────────────────────────────────

/// List every entry in a container.
pub fn entries(archive: &Path) -> ArchiveResult<Vec<ArchiveEntry>> {
    let file = File::open(archive)
        .map_err(|e| ArchiveError::io(format!("Cannot open container '{}': {e}", archive.display())))?;
    let mut tar = tar::Archive::new(file);

    let mut out = Vec::new();
    for entry in tar
        .entries()
        .map_err(|e| ArchiveError::corrupt(format!("Cannot read container entries: {e}")))?
    {
        let entry = entry.map_err(|e| ArchiveError::corrupt(format!("Entry read failed: {e}")))?;
        let path = entry
            .path()
            .map_err(|e| ArchiveError::corrupt(format!("Entry path unreadable: {e}")))?
            .to_string_lossy()
            .into_owned();
        out.push(ArchiveEntry {
            path,
            size_bytes: entry.size(),
            is_directory: entry.header().entry_type().is_dir(),
        });
    }
    Ok(out)
}

/// Locate the descriptor entry: the first non-directory entry whose
/// extension matches [`DESCRIPTOR_EXT`]. Returns `None` if absent.
pub fn find_descriptor(archive: &Path) -> ArchiveResult<Option<String>> {
    for entry in entries(archive)? {
        if entry.is_directory {
            continue;
        }
        let matches = Path::new(&entry.path)
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case(DESCRIPTOR_EXT))
            .unwrap_or(false);
        if matches {
            return Ok(Some(entry.path));
        }
    }
    Ok(None)
}

/// Read a single named entry as UTF-8 text.
pub fn read_text_entry(archive: &Path, entry_path: &str) -> ArchiveResult<String> {
    let file = File::open(archive)
        .map_err(|e| ArchiveError::io(format!("Cannot open container '{}': {e}", archive.display())))?;
    let mut tar = tar::Archive::new(file);

    for entry in tar
        .entries()
        .map_err(|e| ArchiveError::corrupt(format!("Cannot read container entries: {e}")))?
    {
        let mut entry = entry.map_err(|e| ArchiveError::corrupt(format!("Entry read failed: {e}")))?;
        let path = entry
            .path()
            .map_err(|e| ArchiveError::corrupt(format!("Entry path unreadable: {e}")))?
            .to_string_lossy()
            .into_owned();
        if path == entry_path {
            let mut raw = Vec::with_capacity(entry.size() as usize);
            entry
                .read_to_end(&mut raw)
                .map_err(|e| ArchiveError::corrupt(format!("Entry '{entry_path}' read failed: {e}")))?;
            return String::from_utf8(raw).map_err(|e| {
                ArchiveError::encoding(format!("Entry '{entry_path}' is not valid UTF-8: {e}"))
            });
        }
    }

    Err(ArchiveError::entry_missing(format!(
        "No entry '{entry_path}' in container '{}'",
        archive.display()
    )))
}

// ── Packing ──────────────────────────────────────────────────────────────────

/// Pack a directory tree into a single tar container at `output`.
///
/// Entries are written with their path relative to `source_dir`. GNU headers
/// are used throughout, so entries above 8 GiB and path components beyond the
/// classic 100-character limit are supported. Returns the number of file
/// entries written.
pub fn pack(source_dir: &Path, output: &Path) -> ArchiveResult<u64> {
    let out_file = File::create(output)
        .map_err(|e| ArchiveError::io(format!("Cannot create container '{}': {e}", output.display())))?;
    let mut builder = tar::Builder::new(out_file);

    let count = append_dir_recursive(&mut builder, source_dir, Path::new(""))?;

    builder
        .into_inner()
        .map_err(|e| ArchiveError::io(format!("Container finalisation failed: {e}")))?;

    debug!("Packed {} file(s) from {} into {}", count, source_dir.display(), output.display());
    Ok(count)
}

fn append_dir_recursive(
    builder: &mut tar::Builder<File>,
    dir: &Path,
    prefix: &Path,
) -> ArchiveResult<u64> {
    let mut count = 0u64;

    let mut children: Vec<_> = fs::read_dir(dir)
        .map_err(|e| ArchiveError::io(format!("Cannot read directory '{}': {e}", dir.display())))?
        .collect::<Result<_, _>>()
        .map_err(|e| ArchiveError::io(format!("Directory entry error: {e}")))?;
    // Deterministic entry order — the descriptor sorts ahead of disk blobs.
    children.sort_by_key(|c| c.file_name());

    for child in children {
        let path = child.path();
        let rel = prefix.join(child.file_name());

        if path.is_dir() {
            builder
                .append_dir(&rel, &path)
                .map_err(|e| ArchiveError::io(format!("Cannot append directory '{}': {e}", rel.display())))?;
            count += append_dir_recursive(builder, &path, &rel)?;
        } else if path.is_file() {
            // append_path_with_name emits GNU long-name / large-size
            // extensions when the classic header cannot hold the value.
            builder
                .append_path_with_name(&path, &rel)
                .map_err(|e| ArchiveError::io(format!("Cannot append '{}': {e}", rel.display())))?;
            count += 1;
        } else {
            warn!("pack: skipping non-regular entry '{}'", path.display());
        }
    }

    Ok(count)
}

// ── Unpacking ────────────────────────────────────────────────────────────────

/// Unpack every regular-file entry of a container into `dest_dir`,
/// creating parent directories on demand.
///
/// Unsupported entry kinds (links, devices, …) are skipped with a warning
/// rather than aborting the extraction. Returns the number of files written.
pub fn unpack(archive: &Path, dest_dir: &Path) -> ArchiveResult<u64> {
    let file = File::open(archive)
        .map_err(|e| ArchiveError::io(format!("Cannot open container '{}': {e}", archive.display())))?;
    let mut tar = tar::Archive::new(file);

    fs::create_dir_all(dest_dir)
        .map_err(|e| ArchiveError::io(format!("Cannot create '{}': {e}", dest_dir.display())))?;

    let mut count = 0u64;
    for entry in tar
        .entries()
        .map_err(|e| ArchiveError::corrupt(format!("Cannot read container entries: {e}")))?
    {
        let mut entry = entry.map_err(|e| ArchiveError::corrupt(format!("Entry read failed: {e}")))?;
        let raw_path = entry
            .path()
            .map_err(|e| ArchiveError::corrupt(format!("Entry path unreadable: {e}")))?
            .to_path_buf();

        let Some(rel) = sanitize_entry_path(&raw_path) else {
            warn!("unpack: skipping entry with unsafe path '{}'", raw_path.display());
            continue;
        };
        let dest = dest_dir.join(&rel);

        let kind = entry.header().entry_type();
        if kind.is_dir() {
            fs::create_dir_all(&dest)
                .map_err(|e| ArchiveError::io(format!("Cannot create '{}': {e}", dest.display())))?;
            continue;
        }
        if !kind.is_file() {
            warn!("unpack: skipping unsupported entry kind {:?} at '{}'", kind, rel.display());
            continue;
        }

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| ArchiveError::io(format!("Cannot create '{}': {e}", parent.display())))?;
        }
        let mut out = File::create(&dest)
            .map_err(|e| ArchiveError::io(format!("Cannot create '{}': {e}", dest.display())))?;
        std::io::copy(&mut entry, &mut out)
            .map_err(|e| ArchiveError::io(format!("Extract of '{}' failed: {e}", rel.display())))?;
        count += 1;
    }

    debug!("Unpacked {} file(s) from {} into {}", count, archive.display(), dest_dir.display());
    Ok(count)
}

/// Reject absolute paths and parent-directory traversal inside a container.
fn sanitize_entry_path(path: &Path) -> Option<PathBuf> {
    let mut clean = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::Normal(c) => clean.push(c),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if clean.as_os_str().is_empty() {
        None
    } else {
        Some(clean)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_file(dir: &Path, rel: &str, data: &[u8]) {
        let path = dir.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        let mut f = File::create(path).unwrap();
        f.write_all(data).unwrap();
    }

    fn collect_files(dir: &Path, prefix: &Path, out: &mut Vec<(String, Vec<u8>)>) {
        for entry in fs::read_dir(dir).unwrap() {
            let entry = entry.unwrap();
            let path = entry.path();
            let rel = prefix.join(entry.file_name());
            if path.is_dir() {
                collect_files(&path, &rel, out);
            } else {
                out.push((rel.to_string_lossy().into_owned(), fs::read(&path).unwrap()));
            }
        }
    }

    #[test]
    fn pack_unpack_round_trip() {
        let src = TempDir::new().unwrap();
        write_file(src.path(), "machine.ovf", b"<Envelope/>");
        write_file(src.path(), "disk0.vmdk", &[0xAB; 4096]);
        write_file(src.path(), "nested/disk1.vmdk", &[0xCD; 1024]);

        let work = TempDir::new().unwrap();
        let container = work.path().join("machine.ova");
        let written = pack(src.path(), &container).unwrap();
        assert_eq!(written, 3);

        let dest = TempDir::new().unwrap();
        let extracted = unpack(&container, dest.path()).unwrap();
        assert_eq!(extracted, 3);

        let mut before = Vec::new();
        let mut after = Vec::new();
        collect_files(src.path(), Path::new(""), &mut before);
        collect_files(dest.path(), Path::new(""), &mut after);
        before.sort();
        after.sort();
        assert_eq!(before, after);
    }

    #[test]
    fn round_trip_long_path_component() {
        let src = TempDir::new().unwrap();
        let long = "d".repeat(120);
        write_file(src.path(), &format!("{long}/payload.bin"), b"data");

        let work = TempDir::new().unwrap();
        let container = work.path().join("long.ova");
        pack(src.path(), &container).unwrap();

        let dest = TempDir::new().unwrap();
        unpack(&container, dest.path()).unwrap();
        assert_eq!(fs::read(dest.path().join(&long).join("payload.bin")).unwrap(), b"data");
    }

    #[test]
    fn descriptor_located_and_read_exactly() {
        let src = TempDir::new().unwrap();
        let descriptor_text = "x".repeat(100);
        write_file(src.path(), "desc.ovf", descriptor_text.as_bytes());
        write_file(src.path(), "disk0.vmdk", &vec![0u8; 5_000_000]);

        let work = TempDir::new().unwrap();
        let container = work.path().join("appliance.ova");
        pack(src.path(), &container).unwrap();

        let found = find_descriptor(&container).unwrap();
        assert_eq!(found.as_deref(), Some("desc.ovf"));

        let text = read_text_entry(&container, "desc.ovf").unwrap();
        assert_eq!(text.len(), 100);
        assert_eq!(text, descriptor_text);
    }

    #[test]
    fn descriptor_absent_is_none() {
        let src = TempDir::new().unwrap();
        write_file(src.path(), "disk0.vmdk", b"blob");

        let work = TempDir::new().unwrap();
        let container = work.path().join("no-desc.ova");
        pack(src.path(), &container).unwrap();

        assert_eq!(find_descriptor(&container).unwrap(), None);
    }

    #[test]
    fn missing_entry_is_entry_missing_error() {
        let src = TempDir::new().unwrap();
        write_file(src.path(), "desc.ovf", b"<Envelope/>");

        let work = TempDir::new().unwrap();
        let container = work.path().join("one.ova");
        pack(src.path(), &container).unwrap();

        let err = read_text_entry(&container, "absent.ovf").unwrap_err();
        assert_eq!(err.kind, crate::error::ArchiveErrorKind::EntryMissing);
    }

    #[test]
    fn entries_reports_paths_and_sizes() {
        let src = TempDir::new().unwrap();
        write_file(src.path(), "desc.ovf", b"12345");
        write_file(src.path(), "disks/disk0.vmdk", &[0u8; 256]);

        let work = TempDir::new().unwrap();
        let container = work.path().join("list.ova");
        pack(src.path(), &container).unwrap();

        let listed = entries(&container).unwrap();
        let desc = listed.iter().find(|e| e.path == "desc.ovf").unwrap();
        assert_eq!(desc.size_bytes, 5);
        assert!(!desc.is_directory);
        assert!(listed.iter().any(|e| e.path == "disks" && e.is_directory));
        assert!(listed.iter().any(|e| e.path == "disks/disk0.vmdk" && e.size_bytes == 256));
    }

    #[test]
    fn unpack_skips_unsupported_entry_kinds() {
        let work = TempDir::new().unwrap();
        let container = work.path().join("mixed.ova");

        // Hand-build a container holding a regular file plus a symlink entry.
        let out = File::create(&container).unwrap();
        let mut builder = tar::Builder::new(out);

        let data = b"content";
        let mut header = tar::Header::new_gnu();
        header.set_path("real.txt").unwrap();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append(&header, &data[..]).unwrap();

        let mut link = tar::Header::new_gnu();
        link.set_entry_type(tar::EntryType::Symlink);
        link.set_size(0);
        link.set_mode(0o777);
        builder.append_link(&mut link, "evil", "real.txt").unwrap();
        builder.into_inner().unwrap();

        let dest = TempDir::new().unwrap();
        let extracted = unpack(&container, dest.path()).unwrap();
        assert_eq!(extracted, 1);
        assert!(dest.path().join("real.txt").exists());
        assert!(!dest.path().join("evil").exists());
    }

    #[test]
    fn unsafe_entry_paths_are_skipped() {
        assert_eq!(sanitize_entry_path(Path::new("a/b.vmdk")), Some(PathBuf::from("a/b.vmdk")));
        assert_eq!(sanitize_entry_path(Path::new("./a/b.vmdk")), Some(PathBuf::from("a/b.vmdk")));
        assert_eq!(sanitize_entry_path(Path::new("../escape")), None);
        assert_eq!(sanitize_entry_path(Path::new("/abs/path")), None);
        assert_eq!(sanitize_entry_path(Path::new("")), None);
    }
}
