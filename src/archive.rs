//! Archive codec
//!
//! An archive is a single stream: an uncompressed 8-byte header followed by a
//! payload compressed as a whole (see [`crate::compression`]).
//!
//! ## Format
//!
//! ```text
//! header   : "SBKA" | version u8 | compression u8 | reserved u16
//! payload  : record*  trailer
//! record   : len u32 LE | bincode(Record::Entry) | content bytes (files only)
//! trailer  : len u32 LE | bincode(Record::Trailer)
//! ```
//!
//! Every regular file's content immediately follows its entry record, and the
//! entry carries the payload offset of that content. The trailer repeats the
//! entry count and total content size so a truncated stream is detected even
//! when the cut falls on a record boundary.
//!
//! The archive never embeds its own checksum. [`ArchiveWriter::finish`]
//! returns the SHA-256 of every byte it wrote; verification recomputes it
//! independently from the file on disk.

use crate::compression::{CompressionMode, CompressionWriter, DecompressionReader};
use crate::error::{Result, SysbackError};
use crate::types::{ArchiveEntry, ContentRef, EntryKind, SpecialKind};
use crate::utils;
use crate::walker::WalkedEntry;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, trace, warn};

/// Magic bytes at the start of every archive
pub const ARCHIVE_MAGIC: &[u8; 4] = b"SBKA";

/// Current archive format version
pub const FORMAT_VERSION: u8 = 1;

/// Size of the uncompressed header
pub const HEADER_LEN: usize = 8;

/// File extension used for archives in the snapshots directory
pub const ARCHIVE_EXTENSION: &str = "sba";

/// Upper bound on a single encoded record
const MAX_RECORD_LEN: u32 = 1024 * 1024;

const COPY_BUF: usize = 64 * 1024;

fn codec_config() -> impl bincode::config::Config {
    bincode::config::standard().with_fixed_int_encoding()
}

/// A framed record in the payload
#[derive(Debug, Serialize, Deserialize)]
enum Record {
    Entry(ArchiveEntry),
    Trailer(Trailer),
}

/// End-of-stream marker
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
struct Trailer {
    entry_count: u64,
    content_bytes: u64,
}

/// Totals reported when an archive is finished
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveSummary {
    /// Entries written, root included
    pub entries: u64,
    /// Sum of file content bytes
    pub content_bytes: u64,
    /// Bytes written to the underlying writer
    pub archive_bytes: u64,
    /// SHA-256 of the archive bytes, lowercase hex
    pub checksum: String,
}

/// Writer adapter that hashes and counts every byte passing through
#[derive(Debug)]
pub struct HashingWriter<W: Write> {
    inner: W,
    hasher: Sha256,
    bytes: u64,
}

impl<W: Write> HashingWriter<W> {
    /// Wrap a writer
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            bytes: 0,
        }
    }

    /// Bytes written so far
    pub fn bytes_written(&self) -> u64 {
        self.bytes
    }

    /// Return the inner writer, the hex digest and the byte count
    pub fn finalize(self) -> (W, String, u64) {
        (self.inner, hex::encode(self.hasher.finalize()), self.bytes)
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.bytes += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Build an archive entry from `lstat` metadata
///
/// # Arguments
///
/// * `path` - Absolute path of the object on disk
/// * `relative` - Path relative to the snapshot root (`.` for the root)
/// * `metadata` - Metadata obtained without following symlinks
///
/// # Errors
///
/// - [`SysbackError::PathIo`] if a symlink target cannot be read
pub fn capture_entry(path: &Path, relative: &Path, metadata: &fs::Metadata) -> Result<ArchiveEntry> {
    let file_type = metadata.file_type();
    let kind = if file_type.is_dir() {
        EntryKind::Directory
    } else if file_type.is_file() {
        EntryKind::File
    } else if file_type.is_symlink() {
        EntryKind::Symlink
    } else if file_type.is_fifo() {
        EntryKind::Special(SpecialKind::Fifo)
    } else if file_type.is_char_device() {
        EntryKind::Special(SpecialKind::CharDevice)
    } else if file_type.is_block_device() {
        EntryKind::Special(SpecialKind::BlockDevice)
    } else {
        EntryKind::Special(SpecialKind::Socket)
    };

    let link_target = if kind == EntryKind::Symlink {
        Some(fs::read_link(path).map_err(|e| SysbackError::path_io(path, e))?)
    } else {
        None
    };

    let size = if kind == EntryKind::File { metadata.len() } else { 0 };

    Ok(ArchiveEntry {
        path: relative.to_path_buf(),
        kind,
        mode: metadata.mode() & 0o7777,
        uid: metadata.uid(),
        gid: metadata.gid(),
        mtime: metadata.mtime(),
        mtime_nsec: metadata.mtime_nsec().clamp(0, 999_999_999) as u32,
        size,
        content: None,
        link_target,
        rdev: if matches!(kind, EntryKind::Special(_)) { metadata.rdev() } else { 0 },
    })
}

/// Streaming archive encoder
///
/// # Examples
///
/// ```rust
/// use sysback::archive::{ArchiveReader, ArchiveWriter};
/// use sysback::compression::CompressionMode;
/// use sysback::types::{ArchiveEntry, EntryKind};
/// use std::path::PathBuf;
///
/// let mut writer = ArchiveWriter::new(Vec::new(), CompressionMode::Fast).unwrap();
/// let entry = ArchiveEntry {
///     path: PathBuf::from("hello.txt"),
///     kind: EntryKind::File,
///     mode: 0o644, uid: 0, gid: 0, mtime: 0, mtime_nsec: 0,
///     size: 5, content: None, link_target: None, rdev: 0,
/// };
/// writer.append(entry, Some(&mut &b"hello"[..])).unwrap();
/// let (bytes, summary) = writer.finish().unwrap();
/// assert_eq!(summary.entries, 1);
///
/// let reader = ArchiveReader::new(&bytes[..]).unwrap();
/// let names: Vec<_> = reader.entries().map(|e| e.unwrap().path).collect();
/// assert_eq!(names, vec![PathBuf::from("hello.txt")]);
/// ```
pub struct ArchiveWriter<W: Write> {
    payload: CompressionWriter<HashingWriter<W>>,
    mode: CompressionMode,
    offset: u64,
    entries: u64,
    content_bytes: u64,
}

impl<W: Write> ArchiveWriter<W> {
    /// Write the header and prepare the payload stream
    pub fn new(inner: W, mode: CompressionMode) -> Result<Self> {
        let mut hashing = HashingWriter::new(inner);
        let mut header = [0u8; HEADER_LEN];
        header[..4].copy_from_slice(ARCHIVE_MAGIC);
        header[4] = FORMAT_VERSION;
        header[5] = mode.to_byte();
        hashing.write_all(&header)?;

        Ok(Self {
            payload: CompressionWriter::new(hashing, mode),
            mode,
            offset: 0,
            entries: 0,
            content_bytes: 0,
        })
    }

    /// Compression mode of this archive
    pub fn mode(&self) -> CompressionMode {
        self.mode
    }

    /// Entries appended so far
    pub fn entry_count(&self) -> u64 {
        self.entries
    }

    /// Content bytes appended so far
    pub fn content_bytes(&self) -> u64 {
        self.content_bytes
    }

    fn encode_record(record: &Record) -> Result<Vec<u8>> {
        let bytes = bincode::serde::encode_to_vec(record, codec_config())?;
        if bytes.len() as u64 > MAX_RECORD_LEN as u64 {
            return Err(SysbackError::format(format!(
                "record of {} bytes exceeds the {} byte limit",
                bytes.len(),
                MAX_RECORD_LEN
            )));
        }
        Ok(bytes)
    }

    fn write_frame(&mut self, bytes: &[u8]) -> Result<()> {
        self.payload.write_all(&(bytes.len() as u32).to_le_bytes())?;
        self.payload.write_all(bytes)?;
        self.offset += 4 + bytes.len() as u64;
        Ok(())
    }

    /// Append one entry
    ///
    /// For regular files `content` must yield the file's bytes. Exactly
    /// `entry.size` bytes are stored: a short read is zero-padded and a file
    /// that grew is truncated, each with a warning.
    ///
    /// # Errors
    ///
    /// - [`SysbackError::Format`] if the entry path is not a safe relative path
    /// - [`SysbackError::Internal`] if a file entry has no content reader
    /// - [`SysbackError::Io`] on write failure
    pub fn append(&mut self, mut entry: ArchiveEntry, content: Option<&mut dyn Read>) -> Result<ArchiveEntry> {
        validate_entry_path(&entry.path)?;

        if entry.kind != EntryKind::File {
            entry.size = 0;
            entry.content = None;
            let bytes = Self::encode_record(&Record::Entry(entry.clone()))?;
            self.write_frame(&bytes)?;
            self.entries += 1;
            trace!("Encoded {:?} ({:?})", entry.path, entry.kind);
            return Ok(entry);
        }

        let reader = content.ok_or_else(|| {
            SysbackError::internal(format!("no content supplied for file {:?}", entry.path))
        })?;

        // Fixed-width encoding: the record length does not depend on the offset value.
        entry.content = Some(ContentRef { offset: 0, length: entry.size });
        let header_len = Self::encode_record(&Record::Entry(entry.clone()))?.len() as u64;
        entry.content = Some(ContentRef {
            offset: self.offset + 4 + header_len,
            length: entry.size,
        });
        let bytes = Self::encode_record(&Record::Entry(entry.clone()))?;
        self.write_frame(&bytes)?;

        let copied = copy_exact(reader, &mut self.payload, entry.size)?;
        if copied < entry.size {
            warn!(
                "{:?} shrank while being archived ({} of {} bytes); padding with zeros",
                entry.path, copied, entry.size
            );
            write_zeros(&mut self.payload, entry.size - copied)?;
        } else {
            let mut extra = [0u8; 1];
            if reader.read(&mut extra)? > 0 {
                warn!("{:?} grew while being archived; truncated to {} bytes", entry.path, entry.size);
            }
        }

        self.offset += entry.size;
        self.content_bytes += entry.size;
        self.entries += 1;
        trace!("Encoded {:?} ({} bytes)", entry.path, entry.size);
        Ok(entry)
    }

    /// Capture and append the object at `path`
    pub fn append_path(&mut self, path: &Path, relative: &Path, metadata: &fs::Metadata) -> Result<ArchiveEntry> {
        let entry = capture_entry(path, relative, metadata)?;
        self.append_captured(path, entry)
    }

    /// Append an entry already built by [`capture_entry`], opening its content if needed
    pub fn append_captured(&mut self, path: &Path, entry: ArchiveEntry) -> Result<ArchiveEntry> {
        if entry.kind == EntryKind::File {
            let file = File::open(path).map_err(|e| SysbackError::path_io(path, e))?;
            let mut reader = BufReader::with_capacity(COPY_BUF, file);
            self.append(entry, Some(&mut reader))
        } else {
            self.append(entry, None)
        }
    }

    /// Write the trailer and flush everything
    ///
    /// Returns the inner writer together with the archive totals and the
    /// SHA-256 of all bytes written.
    pub fn finish(mut self) -> Result<(W, ArchiveSummary)> {
        let trailer = Trailer {
            entry_count: self.entries,
            content_bytes: self.content_bytes,
        };
        let bytes = Self::encode_record(&Record::Trailer(trailer))?;
        self.write_frame(&bytes)?;

        let mut hashing = self.payload.finish()?;
        hashing.flush()?;
        let (inner, checksum, archive_bytes) = hashing.finalize();

        debug!(
            "Archive finished: {} entries, {} content bytes, {} archive bytes",
            self.entries, self.content_bytes, archive_bytes
        );

        Ok((
            inner,
            ArchiveSummary {
                entries: self.entries,
                content_bytes: self.content_bytes,
                archive_bytes,
                checksum,
            },
        ))
    }
}

impl<W: Write> std::fmt::Debug for ArchiveWriter<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveWriter")
            .field("mode", &self.mode)
            .field("offset", &self.offset)
            .field("entries", &self.entries)
            .field("content_bytes", &self.content_bytes)
            .finish()
    }
}

/// Encode a walked tree into `writer`
///
/// Walk errors are propagated; nothing is skipped silently.
pub fn encode<W, I>(entries: I, writer: W, mode: CompressionMode) -> Result<(W, ArchiveSummary)>
where
    W: Write,
    I: IntoIterator<Item = Result<WalkedEntry>>,
{
    let mut archive = ArchiveWriter::new(writer, mode)?;
    for walked in entries {
        let walked = walked?;
        archive.append_path(&walked.path, &walked.relative, &walked.metadata)?;
    }
    archive.finish()
}

fn copy_exact(reader: &mut dyn Read, writer: &mut dyn Write, limit: u64) -> Result<u64> {
    let mut buf = vec![0u8; COPY_BUF.min(limit.max(1) as usize)];
    let mut copied = 0u64;
    while copied < limit {
        let want = ((limit - copied) as usize).min(buf.len());
        let n = match reader.read(&mut buf[..want]) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        writer.write_all(&buf[..n])?;
        copied += n as u64;
    }
    Ok(copied)
}

fn write_zeros(writer: &mut dyn Write, mut count: u64) -> Result<()> {
    let zeros = [0u8; 4096];
    while count > 0 {
        let n = count.min(zeros.len() as u64) as usize;
        writer.write_all(&zeros[..n])?;
        count -= n as u64;
    }
    Ok(())
}

/// Reject paths that could escape the extraction root
fn validate_entry_path(path: &Path) -> Result<()> {
    if path.as_os_str().is_empty() {
        return Err(SysbackError::format("entry with empty path"));
    }
    if path == Path::new(".") {
        return Ok(());
    }
    for component in path.components() {
        match component {
            Component::Normal(_) => {}
            Component::CurDir if path.components().count() == 1 => {}
            _ => {
                return Err(SysbackError::format(format!("unsafe entry path {:?}", path)));
            }
        }
    }
    Ok(())
}

/// Map payload read failures: damaged or short data is a format problem
fn payload_error(err: io::Error, what: &str) -> SysbackError {
    match err.kind() {
        io::ErrorKind::UnexpectedEof => SysbackError::format(format!("archive truncated while reading {}", what)),
        io::ErrorKind::InvalidData | io::ErrorKind::Other => {
            SysbackError::format(format!("corrupt payload while reading {}: {}", what, err))
        }
        _ => SysbackError::Io(err),
    }
}

/// Streaming archive decoder
pub struct ArchiveReader<R: Read> {
    payload: DecompressionReader<BufReader<R>>,
    mode: CompressionMode,
    offset: u64,
    pending_content: u64,
    entries: u64,
    content_bytes: u64,
    finished: bool,
}

impl<R: Read> ArchiveReader<R> {
    /// Read and check the header
    ///
    /// # Errors
    ///
    /// - [`SysbackError::Format`] if the magic, version or compression byte is wrong
    pub fn new(inner: R) -> Result<Self> {
        let mut inner = BufReader::with_capacity(COPY_BUF, inner);
        let mut header = [0u8; HEADER_LEN];
        inner
            .read_exact(&mut header)
            .map_err(|e| payload_error(e, "header"))?;

        if &header[..4] != ARCHIVE_MAGIC {
            return Err(SysbackError::format("not a sysback archive (bad magic)"));
        }
        if header[4] != FORMAT_VERSION {
            return Err(SysbackError::format(format!(
                "unsupported archive version {} (expected {})",
                header[4], FORMAT_VERSION
            )));
        }
        let mode = CompressionMode::from_byte(header[5])?;

        Ok(Self {
            payload: DecompressionReader::new(inner, mode),
            mode,
            offset: 0,
            pending_content: 0,
            entries: 0,
            content_bytes: 0,
            finished: false,
        })
    }

    /// Compression mode recorded in the header
    pub fn mode(&self) -> CompressionMode {
        self.mode
    }

    fn skip_pending(&mut self) -> Result<()> {
        if self.pending_content > 0 {
            let skipped = io::copy(&mut (&mut self.payload).take(self.pending_content), &mut io::sink())
                .map_err(|e| payload_error(e, "file content"))?;
            if skipped < self.pending_content {
                return Err(SysbackError::format("archive truncated inside file content"));
            }
            self.offset += skipped;
            self.pending_content = 0;
        }
        Ok(())
    }

    /// Read the next entry, skipping any unread content of the previous one
    ///
    /// Returns `Ok(None)` once the trailer has been read and matches the
    /// stream. A stream that ends without a trailer is a format error.
    pub fn next_entry(&mut self) -> Result<Option<ArchiveEntry>> {
        if self.finished {
            return Ok(None);
        }
        self.skip_pending()?;

        let mut len_buf = [0u8; 4];
        self.payload
            .read_exact(&mut len_buf)
            .map_err(|e| payload_error(e, "record length"))?;
        let len = u32::from_le_bytes(len_buf);
        if len == 0 || len > MAX_RECORD_LEN {
            return Err(SysbackError::format(format!("invalid record length {}", len)));
        }

        let mut record_buf = vec![0u8; len as usize];
        self.payload
            .read_exact(&mut record_buf)
            .map_err(|e| payload_error(e, "record"))?;
        self.offset += 4 + len as u64;

        let (record, _): (Record, usize) = bincode::serde::decode_from_slice(&record_buf, codec_config())
            .map_err(|e| SysbackError::format(format!("undecodable record: {}", e)))?;

        match record {
            Record::Entry(entry) => {
                validate_entry_path(&entry.path)?;
                if entry.kind == EntryKind::File {
                    match entry.content {
                        Some(c) if c.offset == self.offset && c.length == entry.size => {}
                        _ => {
                            return Err(SysbackError::format(format!(
                                "content reference of {:?} does not match stream position",
                                entry.path
                            )));
                        }
                    }
                    self.pending_content = entry.size;
                    self.content_bytes += entry.size;
                }
                self.entries += 1;
                Ok(Some(entry))
            }
            Record::Trailer(trailer) => {
                if trailer.entry_count != self.entries || trailer.content_bytes != self.content_bytes {
                    return Err(SysbackError::format(format!(
                        "trailer mismatch: trailer says {} entries / {} bytes, stream had {} / {}",
                        trailer.entry_count, trailer.content_bytes, self.entries, self.content_bytes
                    )));
                }
                self.finished = true;
                Ok(None)
            }
        }
    }

    /// Copy the content of the entry just returned by [`next_entry`](Self::next_entry)
    pub fn read_content(&mut self, out: &mut dyn Write) -> Result<u64> {
        let expected = self.pending_content;
        let copied = io::copy(&mut (&mut self.payload).take(expected), out)
            .map_err(|e| payload_error(e, "file content"))?;
        if copied < expected {
            return Err(SysbackError::format("archive truncated inside file content"));
        }
        self.offset += copied;
        self.pending_content = 0;
        Ok(copied)
    }

    /// Iterate over entries without materializing anything
    pub fn entries(self) -> Entries<R> {
        Entries {
            reader: self,
            failed: false,
        }
    }
}

impl<R: Read> std::fmt::Debug for ArchiveReader<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveReader")
            .field("mode", &self.mode)
            .field("offset", &self.offset)
            .field("entries", &self.entries)
            .field("finished", &self.finished)
            .finish()
    }
}

/// Listing iterator returned by [`ArchiveReader::entries`]
#[derive(Debug)]
pub struct Entries<R: Read> {
    reader: ArchiveReader<R>,
    failed: bool,
}

impl<R: Read> Iterator for Entries<R> {
    type Item = Result<ArchiveEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.reader.next_entry() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => None,
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

/// Filter deciding which entries are materialized
pub type EntryPredicate = Box<dyn FnMut(&ArchiveEntry) -> bool + Send>;

/// Options for [`decode`]
pub struct ExtractOptions {
    /// Restore uid/gid with `lchown`
    pub restore_ownership: bool,
    /// Only materialize entries for which this returns true
    pub predicate: Option<EntryPredicate>,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            restore_ownership: nix::unistd::Uid::effective().is_root(),
            predicate: None,
        }
    }
}

impl std::fmt::Debug for ExtractOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtractOptions")
            .field("restore_ownership", &self.restore_ownership)
            .field("predicate", &self.predicate.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

/// Start decoding `reader` into `target_root`
///
/// The returned iterator materializes each accepted entry as it goes and
/// yields it. Directory permissions and mtimes are applied once the trailer
/// has been verified, so read-only directories still receive their children.
/// The iterator stops after the first error and cannot be restarted.
pub fn decode<R: Read>(reader: R, target_root: &Path, options: ExtractOptions) -> Result<Extraction<R>> {
    let archive = ArchiveReader::new(reader)?;
    fs::create_dir_all(target_root).map_err(|e| SysbackError::path_io(target_root, e))?;
    Ok(Extraction {
        archive,
        target_root: target_root.to_path_buf(),
        options,
        deferred_dirs: Vec::new(),
        bytes_written: 0,
        done: false,
    })
}

/// Lazy extraction iterator returned by [`decode`]
pub struct Extraction<R: Read> {
    archive: ArchiveReader<R>,
    target_root: PathBuf,
    options: ExtractOptions,
    deferred_dirs: Vec<(PathBuf, ArchiveEntry)>,
    bytes_written: u64,
    done: bool,
}

impl<R: Read> Extraction<R> {
    /// File bytes written so far
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Drain the iterator, returning the number of entries materialized
    pub fn run(&mut self) -> Result<usize> {
        let mut count = 0;
        for entry in self.by_ref() {
            entry?;
            count += 1;
        }
        Ok(count)
    }

    fn destination(&self, relative: &Path) -> Result<PathBuf> {
        if relative == Path::new(".") {
            return Ok(self.target_root.clone());
        }

        // Refuse to write through a symlink created by an earlier entry.
        let mut current = self.target_root.clone();
        if let Some(parent) = relative.parent() {
            for component in parent.components() {
                current.push(component);
                match fs::symlink_metadata(&current) {
                    Ok(meta) if meta.file_type().is_symlink() => {
                        return Err(SysbackError::format(format!(
                            "entry {:?} would be written through symlink {:?}",
                            relative, current
                        )));
                    }
                    _ => {}
                }
            }
        }
        Ok(self.target_root.join(relative))
    }

    fn materialize(&mut self, entry: &ArchiveEntry) -> Result<()> {
        let dest = self.destination(&entry.path)?;
        if let Some(parent) = dest.parent() {
            if entry.path != Path::new(".") {
                fs::create_dir_all(parent).map_err(|e| SysbackError::path_io(parent, e))?;
            }
        }

        if entry.kind != EntryKind::Directory {
            remove_existing(&dest)?;
        }

        match entry.kind {
            EntryKind::Directory => {
                match fs::symlink_metadata(&dest) {
                    Ok(meta) if meta.is_dir() => {}
                    Ok(_) => {
                        fs::remove_file(&dest).map_err(|e| SysbackError::path_io(&dest, e))?;
                        fs::create_dir(&dest).map_err(|e| SysbackError::path_io(&dest, e))?;
                    }
                    Err(_) => fs::create_dir(&dest).map_err(|e| SysbackError::path_io(&dest, e))?,
                }
                self.deferred_dirs.push((dest, entry.clone()));
                return Ok(());
            }
            EntryKind::File => {
                let file = OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .open(&dest)
                    .map_err(|e| SysbackError::path_io(&dest, e))?;
                let mut out = BufWriter::with_capacity(COPY_BUF, file);
                let written = self.archive.read_content(&mut out)?;
                let file = out
                    .into_inner()
                    .map_err(|e| SysbackError::path_io(&dest, e.into_error()))?;
                file.sync_data().map_err(|e| SysbackError::path_io(&dest, e))?;
                self.bytes_written += written;
                utils::set_permissions(&dest, entry.permissions())?;
            }
            EntryKind::Symlink => {
                let target = entry
                    .link_target
                    .as_ref()
                    .ok_or_else(|| SysbackError::format(format!("symlink {:?} has no target", entry.path)))?;
                utils::create_symlink(target, &dest)?;
            }
            EntryKind::Special(kind) => {
                make_special(&dest, kind, entry.permissions(), entry.rdev)?;
            }
        }

        if self.options.restore_ownership {
            std::os::unix::fs::lchown(&dest, Some(entry.uid), Some(entry.gid))
                .map_err(|e| SysbackError::path_io(&dest, e))?;
            if entry.kind == EntryKind::File && entry.mode & 0o6000 != 0 {
                // chown clears setuid/setgid
                utils::set_permissions(&dest, entry.permissions())?;
            }
        }
        set_mtime(&dest, entry)?;
        Ok(())
    }

    fn apply_deferred(&mut self) -> Result<()> {
        while let Some((dest, entry)) = self.deferred_dirs.pop() {
            if self.options.restore_ownership {
                std::os::unix::fs::lchown(&dest, Some(entry.uid), Some(entry.gid))
                    .map_err(|e| SysbackError::path_io(&dest, e))?;
            }
            utils::set_permissions(&dest, entry.permissions())?;
            set_mtime(&dest, &entry)?;
        }
        Ok(())
    }
}

impl<R: Read> Iterator for Extraction<R> {
    type Item = Result<ArchiveEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            let entry = match self.archive.next_entry() {
                Ok(Some(entry)) => entry,
                Ok(None) => {
                    self.done = true;
                    return match self.apply_deferred() {
                        Ok(()) => None,
                        Err(e) => Some(Err(e)),
                    };
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            };

            let accepted = match self.options.predicate.as_mut() {
                Some(pred) => pred(&entry),
                None => true,
            };
            if !accepted {
                trace!("Skipping {:?}", entry.path);
                continue;
            }

            return match self.materialize(&entry) {
                Ok(()) => Some(Ok(entry)),
                Err(e) => {
                    self.done = true;
                    Some(Err(e))
                }
            };
        }
    }
}

impl<R: Read> std::fmt::Debug for Extraction<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Extraction")
            .field("target_root", &self.target_root)
            .field("archive", &self.archive)
            .field("bytes_written", &self.bytes_written)
            .finish()
    }
}

fn remove_existing(dest: &Path) -> Result<()> {
    match fs::symlink_metadata(dest) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(dest).map_err(|e| SysbackError::path_io(dest, e)),
        Ok(_) => fs::remove_file(dest).map_err(|e| SysbackError::path_io(dest, e)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(SysbackError::path_io(dest, e)),
    }
}

fn make_special(dest: &Path, kind: SpecialKind, perm: u32, rdev: u64) -> Result<()> {
    use nix::sys::stat::{mknod, Mode, SFlag};

    let flag = match kind {
        SpecialKind::Fifo => SFlag::S_IFIFO,
        SpecialKind::CharDevice => SFlag::S_IFCHR,
        SpecialKind::BlockDevice => SFlag::S_IFBLK,
        SpecialKind::Socket => SFlag::S_IFSOCK,
    };
    mknod(dest, flag, Mode::from_bits_truncate(perm as _), rdev as _)
        .map_err(|errno| SysbackError::path_io(dest, io::Error::from(errno)))?;
    // mknod honours the umask
    utils::set_permissions(dest, perm)
}

fn set_mtime(dest: &Path, entry: &ArchiveEntry) -> Result<()> {
    let mtime = filetime::FileTime::from_unix_time(entry.mtime, entry.mtime_nsec);
    let result = if entry.kind == EntryKind::Symlink {
        filetime::set_symlink_file_times(dest, mtime, mtime)
    } else {
        filetime::set_file_mtime(dest, mtime)
    };
    result.map_err(|e| SysbackError::path_io(dest, e))
}
