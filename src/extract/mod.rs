//! Hardened TGZ (gzip + POSIX ustar) extraction
//!
//! The extractor streams a compressed archive and materializes regular files
//! and directories under a destination root. It is written for hostile
//! input: traversal names, link entries, oversized payloads and non-ASCII
//! names all abort the extraction, and nothing is ever created outside the
//! destination directory.
//!
//! Only ustar regular files and directories are materialized. Hard links
//! and symbolic links fail the whole extraction; any other type flag has
//! its payload skipped.

pub mod header;
pub mod path_guard;

use crate::util::interrupt;
use flate2::read::GzDecoder;
use header::{EntryType, NameCheck, TarHeader, BLOCK_SIZE};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read, Write};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Hard cap on entries per archive
pub const MAX_FILES: u64 = 10_000;
/// Hard cap on a single member's payload
pub const MAX_FILE_SIZE: u64 = 100 * 1024 * 1024;
/// Hard cap on total bytes materialized
pub const MAX_TOTAL_SIZE: u64 = 500 * 1024 * 1024;

/// Copy granularity for payload streaming and skip loops
const COPY_CHUNK: usize = 16 * 1024;

/// Extraction failure, first error wins; later entries are not processed.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("failed to open archive: {0}")]
    OpenFileFailed(#[source] std::io::Error),
    #[error("failed to read archive stream: {0}")]
    ReadFailed(#[source] std::io::Error),
    #[error("invalid archive header")]
    InvalidHeader,
    #[error("archive header checksum mismatch")]
    InvalidChecksum,
    #[error("failed to create directory {path}: {source}")]
    CreateDirFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write file {path}: {source}")]
    WriteFileFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("archive entry escapes destination directory")]
    PathTraversalDetected,
    #[error("archive entry exceeds the single-file size limit")]
    FileTooLarge,
    #[error("archive exceeds extraction limits")]
    ArchiveTooLarge,
    #[error("archive contains a link entry")]
    SymlinkDetected,
    #[error("archive entry name contains non-ASCII bytes")]
    UnicodeAttackDetected,
    #[error("extraction interrupted")]
    Interrupted,
}

/// Running totals for one extraction, checked at every header boundary.
struct Session {
    bytes_extracted_total: u64,
    files_seen_total: u64,
}

/// Extract `tgz_path` under `dest_dir`.
///
/// Directories are created mode 0o750, files mode 0o600 with
/// `O_EXCL|O_NOFOLLOW`. The extraction is not transactional across entries:
/// on failure, the entry being written is removed but completed entries and
/// created directories remain.
///
/// # Errors
///
/// Malformed headers, link entries, quota violations and names that fail
/// the lexical sanitizer are all fatal; the first error wins and later
/// entries are not processed. See [`ExtractError`] for the full taxonomy.
///
/// # Example
///
/// ```no_run
/// use std::path::Path;
/// use syspulse::extract::{extract, ExtractError};
///
/// match extract(Path::new("bundle.tgz"), Path::new("/srv/unpacked")) {
///     Ok(()) => println!("unpacked"),
///     Err(ExtractError::PathTraversalDetected) => eprintln!("hostile archive"),
///     Err(e) => eprintln!("extraction failed: {}", e),
/// }
/// ```
pub fn extract(tgz_path: &Path, dest_dir: &Path) -> Result<(), ExtractError> {
    let file = File::open(tgz_path).map_err(ExtractError::OpenFileFailed)?;
    let mut stream = GzDecoder::new(BufReader::new(file));

    let mut session = Session {
        bytes_extracted_total: 0,
        files_seen_total: 0,
    };

    loop {
        if interrupt::is_set() {
            return Err(ExtractError::Interrupted);
        }

        let mut block = [0u8; BLOCK_SIZE];
        if !read_block(&mut stream, &mut block)? {
            // Clean EOF without the zero marker; accepted as end of archive.
            return Ok(());
        }
        if header::is_zero_block(&block) {
            return Ok(());
        }

        session.files_seen_total += 1;
        if session.files_seen_total > MAX_FILES {
            return Err(ExtractError::ArchiveTooLarge);
        }

        if !header::verify_checksum(&block) {
            return Err(ExtractError::InvalidChecksum);
        }

        let hdr = TarHeader::decode(&block);
        match header::classify_name(&hdr.name) {
            NameCheck::NonAscii => return Err(ExtractError::UnicodeAttackDetected),
            NameCheck::Invalid => return Err(ExtractError::InvalidHeader),
            NameCheck::Ok => {}
        }
        match header::classify_name(&hdr.prefix) {
            NameCheck::NonAscii => return Err(ExtractError::UnicodeAttackDetected),
            NameCheck::Invalid => return Err(ExtractError::InvalidHeader),
            NameCheck::Ok => {}
        }

        if matches!(hdr.entry_type, EntryType::HardLink | EntryType::SymbolicLink) {
            return Err(ExtractError::SymlinkDetected);
        }

        if hdr.size > MAX_FILE_SIZE {
            return Err(ExtractError::FileTooLarge);
        }
        if session.bytes_extracted_total + hdr.size > MAX_TOTAL_SIZE {
            return Err(ExtractError::ArchiveTooLarge);
        }

        // Bytes verified ASCII above.
        let raw_path = hdr.combined_path();
        let path_str = std::str::from_utf8(&raw_path).map_err(|_| ExtractError::InvalidHeader)?;
        // Directory entries conventionally carry a trailing slash.
        let path_str = path_str.trim_end_matches('/');
        if path_str.is_empty() {
            return Err(ExtractError::InvalidHeader);
        }

        match hdr.entry_type {
            EntryType::Directory => {
                let dest = path_guard::sanitize(dest_dir, path_str)
                    .ok_or(ExtractError::PathTraversalDetected)?;
                create_dir_secure(&dest)?;
                skip_payload(&mut stream, hdr.size)?;
            }
            EntryType::RegularFile => {
                let dest = path_guard::sanitize(dest_dir, path_str)
                    .ok_or(ExtractError::PathTraversalDetected)?;
                if let Some(parent) = dest.parent() {
                    if parent != dest_dir || !parent.exists() {
                        create_dir_secure(parent)?;
                    }
                }
                write_entry(&mut stream, &dest, hdr.size)?;
                session.bytes_extracted_total += hdr.size;
                skip_bytes(&mut stream, padding_for(hdr.size))?;
            }
            EntryType::Other => {
                // Nothing is created; the payload is discarded.
                skip_payload(&mut stream, hdr.size)?;
            }
            EntryType::HardLink | EntryType::SymbolicLink => unreachable!(),
        }
    }
}

/// Read exactly one block. `Ok(false)` means clean EOF at a block boundary;
/// a short read inside a block is a malformed archive.
fn read_block<R: Read>(stream: &mut R, block: &mut [u8; BLOCK_SIZE]) -> Result<bool, ExtractError> {
    let mut filled = 0;
    while filled < BLOCK_SIZE {
        match stream.read(&mut block[filled..]) {
            Ok(0) => {
                if filled == 0 {
                    return Ok(false);
                }
                return Err(ExtractError::InvalidHeader);
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(ExtractError::ReadFailed(e)),
        }
    }
    Ok(true)
}

/// Recursively create `path` as a directory, mode 0o750, refusing to treat
/// a symlink or non-directory as satisfying the request.
fn create_dir_secure(path: &Path) -> Result<(), ExtractError> {
    if let Ok(meta) = fs::symlink_metadata(path) {
        if meta.file_type().is_symlink() {
            return Err(ExtractError::SymlinkDetected);
        }
        if !meta.is_dir() {
            return Err(ExtractError::CreateDirFailed {
                path: path.to_path_buf(),
                source: std::io::Error::from_raw_os_error(libc::ENOTDIR),
            });
        }
        return Ok(());
    }

    fs::DirBuilder::new()
        .recursive(true)
        .mode(0o750)
        .create(path)
        .map_err(|source| ExtractError::CreateDirFailed {
            path: path.to_path_buf(),
            source,
        })
}

/// Removes the destination on drop unless the write was committed.
struct PendingFile<'a> {
    path: &'a Path,
    committed: bool,
}

impl Drop for PendingFile<'_> {
    fn drop(&mut self) {
        if !self.committed {
            let _ = fs::remove_file(self.path);
        }
    }
}

/// Materialize one regular file of exactly `size` payload bytes.
fn write_entry<R: Read>(stream: &mut R, dest: &Path, size: u64) -> Result<(), ExtractError> {
    // A stale entry of the same name is replaced, never followed.
    match fs::remove_file(dest) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(ExtractError::WriteFileFailed {
                path: dest.to_path_buf(),
                source: e,
            })
        }
    }

    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .custom_flags(libc::O_NOFOLLOW | libc::O_CLOEXEC)
        .mode(0o600)
        .open(dest)
        .map_err(|e| match e.raw_os_error() {
            Some(libc::EEXIST) | Some(libc::ELOOP) => ExtractError::SymlinkDetected,
            _ => ExtractError::WriteFileFailed {
                path: dest.to_path_buf(),
                source: e,
            },
        })?;

    let mut guard = PendingFile {
        path: dest,
        committed: false,
    };

    let mut remaining = size;
    let mut chunk = [0u8; COPY_CHUNK];
    while remaining > 0 {
        if interrupt::is_set() {
            return Err(ExtractError::Interrupted);
        }
        let want = remaining.min(COPY_CHUNK as u64) as usize;
        let got = read_full(stream, &mut chunk[..want])?;
        if got < want {
            return Err(ExtractError::ReadFailed(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "archive payload truncated",
            )));
        }
        file.write_all(&chunk[..want])
            .map_err(|source| ExtractError::WriteFileFailed {
                path: dest.to_path_buf(),
                source,
            })?;
        remaining -= want as u64;
    }

    guard.committed = true;
    Ok(())
}

/// Discard a skipped entry's payload plus its block padding.
fn skip_payload<R: Read>(stream: &mut R, size: u64) -> Result<(), ExtractError> {
    skip_bytes(stream, size + padding_for(size))
}

/// ustar pads every payload to a 512-byte boundary.
fn padding_for(size: u64) -> u64 {
    (BLOCK_SIZE as u64 - (size % BLOCK_SIZE as u64)) % BLOCK_SIZE as u64
}

/// Forward the decompressed stream by `count` bytes. gzip streams have no
/// seek primitive, so this reads and discards in bounded chunks.
fn skip_bytes<R: Read>(stream: &mut R, count: u64) -> Result<(), ExtractError> {
    let mut remaining = count;
    let mut scratch = [0u8; COPY_CHUNK];
    while remaining > 0 {
        let want = remaining.min(COPY_CHUNK as u64) as usize;
        let got = read_full(stream, &mut scratch[..want])?;
        if got < want {
            return Err(ExtractError::ReadFailed(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "archive truncated inside padding",
            )));
        }
        remaining -= want as u64;
    }
    Ok(())
}

/// Read as many bytes as the stream will give, retrying EINTR. Returns the
/// number filled; less than `buf.len()` only at EOF.
fn read_full<R: Read>(stream: &mut R, buf: &mut [u8]) -> Result<usize, ExtractError> {
    let mut filled = 0;
    while filled < buf.len() {
        match stream.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(ExtractError::ReadFailed(e)),
        }
    }
    Ok(filled)
}


#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn write_archive(dir: &TempDir, raw: &[u8]) -> PathBuf {
        let path = dir.path().join("input.tgz");
        fs::write(&path, gzip(raw)).unwrap();
        path
    }

    #[test]
    fn test_round_trip_three_files() {
        let tmp = TempDir::new().unwrap();
        let mut raw = Vec::new();
        push_dir(&mut raw, "d/");
        push_file(&mut raw, "d/f1", b"a\n");
        push_file(&mut raw, "d/f2", b"bb\n");
        push_file(&mut raw, "d/f3", b"ccc\n");
        finish(&mut raw);

        let tgz = write_archive(&tmp, &raw);
        let dest = tmp.path().join("out");
        fs::create_dir(&dest).unwrap();

        extract(&tgz, &dest).unwrap();

        assert_eq!(fs::read(dest.join("d/f1")).unwrap(), b"a\n");
        assert_eq!(fs::read(dest.join("d/f2")).unwrap(), b"bb\n");
        assert_eq!(fs::read(dest.join("d/f3")).unwrap(), b"ccc\n");
        assert_eq!(fs::read_dir(dest.join("d")).unwrap().count(), 3);
    }

    #[test]
    fn test_file_modes() {
        let tmp = TempDir::new().unwrap();
        let mut raw = Vec::new();
        push_dir(&mut raw, "sub");
        push_file(&mut raw, "sub/data.bin", b"payload");
        finish(&mut raw);

        let tgz = write_archive(&tmp, &raw);
        let dest = tmp.path().join("out");
        fs::create_dir(&dest).unwrap();
        extract(&tgz, &dest).unwrap();

        // mkdir/open modes are subject to the process umask.
        let umask = unsafe {
            let current = libc::umask(0);
            libc::umask(current);
            current as u32
        };
        let dir_mode = fs::metadata(dest.join("sub")).unwrap().permissions().mode();
        assert_eq!(dir_mode & 0o777, 0o750 & !umask);
        let file_mode = fs::metadata(dest.join("sub/data.bin")).unwrap().permissions().mode();
        assert_eq!(file_mode & 0o777, 0o600 & !umask);
    }

    #[test]
    fn test_traversal_rejected() {
        let tmp = TempDir::new().unwrap();
        let mut raw = Vec::new();
        push_file(&mut raw, "../etc/evil", b"x");
        finish(&mut raw);

        let tgz = write_archive(&tmp, &raw);
        let dest = tmp.path().join("out");
        fs::create_dir(&dest).unwrap();

        let err = extract(&tgz, &dest).unwrap_err();
        assert!(matches!(err, ExtractError::PathTraversalDetected));
        assert!(!tmp.path().join("etc").exists());
        assert!(!tmp.path().join("etc/evil").exists());
    }

    #[test]
    fn test_symlink_entry_rejected() {
        let tmp = TempDir::new().unwrap();
        let mut raw = Vec::new();
        raw.extend_from_slice(&ustar_block(b"link", 0, b'2'));
        finish(&mut raw);

        let tgz = write_archive(&tmp, &raw);
        let dest = tmp.path().join("out");
        fs::create_dir(&dest).unwrap();

        let err = extract(&tgz, &dest).unwrap_err();
        assert!(matches!(err, ExtractError::SymlinkDetected));
        assert_eq!(fs::read_dir(&dest).unwrap().count(), 0);
    }

    #[test]
    fn test_hardlink_entry_rejected() {
        let tmp = TempDir::new().unwrap();
        let mut raw = Vec::new();
        raw.extend_from_slice(&ustar_block(b"hard", 0, b'1'));
        finish(&mut raw);

        let tgz = write_archive(&tmp, &raw);
        let dest = tmp.path().join("out");
        fs::create_dir(&dest).unwrap();

        let err = extract(&tgz, &dest).unwrap_err();
        assert!(matches!(err, ExtractError::SymlinkDetected));
    }

    #[test]
    fn test_checksum_mismatch() {
        let tmp = TempDir::new().unwrap();
        let mut block = ustar_block(b"file", 0, b'0');
        block[0] ^= 0x01; // corrupt after checksum was computed
        let mut raw = Vec::new();
        raw.extend_from_slice(&block);
        finish(&mut raw);

        let tgz = write_archive(&tmp, &raw);
        let dest = tmp.path().join("out");
        fs::create_dir(&dest).unwrap();

        let err = extract(&tgz, &dest).unwrap_err();
        assert!(matches!(err, ExtractError::InvalidChecksum));
    }

    #[test]
    fn test_non_ascii_name_rejected() {
        let tmp = TempDir::new().unwrap();
        let mut raw = Vec::new();
        raw.extend_from_slice(&ustar_block(&[b'f', 0xc3, 0xa9], 0, b'0'));
        finish(&mut raw);

        let tgz = write_archive(&tmp, &raw);
        let dest = tmp.path().join("out");
        fs::create_dir(&dest).unwrap();

        let err = extract(&tgz, &dest).unwrap_err();
        assert!(matches!(err, ExtractError::UnicodeAttackDetected));
    }

    #[test]
    fn test_file_size_limit_boundary() {
        let tmp = TempDir::new().unwrap();
        // Size fields only; the check fires before any payload is read.
        let mut raw = Vec::new();
        raw.extend_from_slice(&ustar_block(b"big", MAX_FILE_SIZE + 1, b'0'));
        finish(&mut raw);

        let tgz = write_archive(&tmp, &raw);
        let dest = tmp.path().join("out");
        fs::create_dir(&dest).unwrap();

        let err = extract(&tgz, &dest).unwrap_err();
        assert!(matches!(err, ExtractError::FileTooLarge));
    }

    #[test]
    fn test_entry_quota() {
        let tmp = TempDir::new().unwrap();
        let mut raw = Vec::new();
        for i in 0..=MAX_FILES {
            raw.extend_from_slice(&ustar_block(format!("f{}", i).as_bytes(), 0, b'0'));
        }
        finish(&mut raw);

        let tgz = write_archive(&tmp, &raw);
        let dest = tmp.path().join("out");
        fs::create_dir(&dest).unwrap();

        let err = extract(&tgz, &dest).unwrap_err();
        assert!(matches!(err, ExtractError::ArchiveTooLarge));
        assert!(fs::read_dir(&dest).unwrap().count() as u64 <= MAX_FILES);
    }

    #[test]
    fn test_unaligned_payload_padding() {
        let tmp = TempDir::new().unwrap();
        let body = vec![0x5au8; 513]; // forces 511 bytes of padding
        let mut raw = Vec::new();
        push_file(&mut raw, "odd.bin", &body);
        push_file(&mut raw, "next.txt", b"after");
        finish(&mut raw);

        let tgz = write_archive(&tmp, &raw);
        let dest = tmp.path().join("out");
        fs::create_dir(&dest).unwrap();
        extract(&tgz, &dest).unwrap();

        assert_eq!(fs::read(dest.join("odd.bin")).unwrap(), body);
        assert_eq!(fs::read(dest.join("next.txt")).unwrap(), b"after");
    }

    #[test]
    fn test_other_type_skipped() {
        let tmp = TempDir::new().unwrap();
        let body = b"fifo payload";
        let mut raw = Vec::new();
        raw.extend_from_slice(&ustar_block(b"weird", body.len() as u64, b'6'));
        raw.extend_from_slice(body);
        raw.extend_from_slice(&vec![0u8; (512 - body.len() % 512) % 512]);
        push_file(&mut raw, "normal.txt", b"kept");
        finish(&mut raw);

        let tgz = write_archive(&tmp, &raw);
        let dest = tmp.path().join("out");
        fs::create_dir(&dest).unwrap();
        extract(&tgz, &dest).unwrap();

        assert!(!dest.join("weird").exists());
        assert_eq!(fs::read(dest.join("normal.txt")).unwrap(), b"kept");
    }

    #[test]
    fn test_truncated_payload() {
        let tmp = TempDir::new().unwrap();
        let mut raw = Vec::new();
        raw.extend_from_slice(&ustar_block(b"cut.bin", 1024, b'0'));
        raw.extend_from_slice(&[0u8; 100]); // payload ends early
        let tgz = write_archive(&tmp, &raw);
        let dest = tmp.path().join("out");
        fs::create_dir(&dest).unwrap();

        let err = extract(&tgz, &dest).unwrap_err();
        assert!(matches!(err, ExtractError::ReadFailed(_)));
        // The partial file was cleaned up.
        assert!(!dest.join("cut.bin").exists());
    }

    #[test]
    fn test_short_header() {
        let tmp = TempDir::new().unwrap();
        let raw = vec![0x41u8; 100];
        let tgz = write_archive(&tmp, &raw);
        let dest = tmp.path().join("out");
        fs::create_dir(&dest).unwrap();

        let err = extract(&tgz, &dest).unwrap_err();
        assert!(matches!(err, ExtractError::InvalidHeader));
    }

    #[test]
    fn test_empty_archive() {
        let tmp = TempDir::new().unwrap();
        let mut raw = Vec::new();
        finish(&mut raw);
        let tgz = write_archive(&tmp, &raw);
        let dest = tmp.path().join("out");
        fs::create_dir(&dest).unwrap();

        extract(&tgz, &dest).unwrap();
        assert_eq!(fs::read_dir(&dest).unwrap().count(), 0);
    }

    #[test]
    fn test_preexisting_symlink_replaced_not_followed() {
        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("out");
        fs::create_dir(&dest).unwrap();

        let target = tmp.path().join("outside.txt");
        fs::write(&target, b"original").unwrap();
        std::os::unix::fs::symlink(&target, dest.join("victim")).unwrap();

        let mut raw = Vec::new();
        push_file(&mut raw, "victim", b"replaced");
        finish(&mut raw);
        let tgz = write_archive(&tmp, &raw);

        extract(&tgz, &dest).unwrap();

        // The symlink was removed and replaced by a regular file; the
        // link target is untouched.
        assert_eq!(fs::read(&target).unwrap(), b"original");
        let meta = fs::symlink_metadata(dest.join("victim")).unwrap();
        assert!(meta.file_type().is_file());
        assert_eq!(fs::read(dest.join("victim")).unwrap(), b"replaced");
    }

    #[test]
    fn test_gzip_round_trip_random_payload() {
        let tmp = TempDir::new().unwrap();
        // 1 KiB of non-trivial bytes through gzip and back.
        let body: Vec<u8> = (0..1024u32)
            .map(|i| (i.wrapping_mul(0x9E37_79B1) >> 8) as u8)
            .collect();
        let mut raw = Vec::new();
        push_dir(&mut raw, "a");
        push_file(&mut raw, "a/b", &body);
        finish(&mut raw);

        let tgz = write_archive(&tmp, &raw);
        let dest = tmp.path().join("out");
        fs::create_dir(&dest).unwrap();
        extract(&tgz, &dest).unwrap();

        assert_eq!(fs::read(dest.join("a/b")).unwrap(), body);
    }
}
