//! Append-only on-disk shader cache
//!
//! File layout:
//!
//! ```text
//! header:  "OCSC" | version u32 | key_size u32 | generator_version u32
//! record:  key [key_size] | length u32 | bytecode [length]
//! ```
//!
//! All integers are little-endian. The same key may appear more than once
//! (a record appended by an earlier run); readers keep the first one.
//! Compatibility between binaries and the running backend/driver/game is
//! decided by the file name, never by record contents.

use oc_core::ShaderCacheError;
use sha1::{Digest, Sha1};
use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Cache file magic
pub const CACHE_MAGIC: [u8; 4] = *b"OCSC";
/// Layout version of the file format itself
pub const CACHE_VERSION: u32 = 1;
/// Header size in bytes
pub const HEADER_SIZE: u64 = 16;
/// Largest key accepted from a file header
pub const MAX_KEY_SIZE: u32 = 4096;
/// Largest bytecode blob accepted from disk
pub const MAX_RECORD_SIZE: u32 = 64 << 20;

/// Cache file header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheHeader {
    pub version: u32,
    pub key_size: u32,
    /// Bumped whenever generated source changes for the same key
    pub generator_version: u32,
}

impl CacheHeader {
    pub fn new(key_size: u32, generator_version: u32) -> Self {
        Self {
            version: CACHE_VERSION,
            key_size,
            generator_version,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE as usize] {
        let mut out = [0u8; HEADER_SIZE as usize];
        out[0..4].copy_from_slice(&CACHE_MAGIC);
        out[4..8].copy_from_slice(&self.version.to_le_bytes());
        out[8..12].copy_from_slice(&self.key_size.to_le_bytes());
        out[12..16].copy_from_slice(&self.generator_version.to_le_bytes());
        out
    }

    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self, ShaderCacheError> {
        let mut raw = [0u8; HEADER_SIZE as usize];
        reader.read_exact(&mut raw).map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => {
                ShaderCacheError::VersionMismatch("file shorter than header".to_string())
            }
            _ => ShaderCacheError::Io(e),
        })?;

        if raw[0..4] != CACHE_MAGIC {
            return Err(ShaderCacheError::VersionMismatch("bad magic".to_string()));
        }

        let word = |i: usize| u32::from_le_bytes([raw[i], raw[i + 1], raw[i + 2], raw[i + 3]]);
        Ok(Self {
            version: word(4),
            key_size: word(8),
            generator_version: word(12),
        })
    }
}

/// One record read back from disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskRecord {
    /// File offset of the record
    pub offset: u64,
    pub key: Vec<u8>,
    pub bytecode: Vec<u8>,
}

/// Streaming reader over the records following a header.
///
/// Records with an empty bytecode blob are skipped. A record that runs past
/// the end of the file, or claims an implausible length, ends the stream:
/// nothing after it can be framed. `valid_end` is the offset just past the
/// last well-framed record.
pub struct RecordReader<R> {
    reader: R,
    key_size: usize,
    offset: u64,
    limit: u64,
    valid_end: u64,
    skipped: usize,
    error: Option<ShaderCacheError>,
    done: bool,
}

impl<R: Read> RecordReader<R> {
    /// `reader` must be positioned right after the header; `limit` is the file length
    pub fn new(reader: R, key_size: usize, limit: u64) -> Self {
        Self {
            reader,
            key_size,
            offset: HEADER_SIZE,
            limit,
            valid_end: HEADER_SIZE,
            skipped: 0,
            error: None,
            done: false,
        }
    }

    /// Offset just past the last well-framed record
    pub fn valid_end(&self) -> u64 {
        self.valid_end
    }

    /// Records dropped for having no bytecode
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Why reading stopped early, if it did
    pub fn error(&self) -> Option<&ShaderCacheError> {
        self.error.as_ref()
    }

    pub fn take_error(&mut self) -> Option<ShaderCacheError> {
        self.error.take()
    }

    fn stop(&mut self, reason: impl Into<String>) {
        self.error = Some(ShaderCacheError::Corrupt {
            offset: self.offset,
            reason: reason.into(),
        });
        self.done = true;
    }

    fn read_record(&mut self) -> Option<DiskRecord> {
        let record_start = self.offset;

        let mut key = vec![0u8; self.key_size];
        match read_exact_or_eof(&mut self.reader, &mut key) {
            Ok(true) => {}
            Ok(false) => {
                self.done = true;
                return None;
            }
            Err(e) => {
                self.stop(format!("truncated key: {}", e));
                return None;
            }
        }

        let mut len = [0u8; 4];
        if let Err(e) = self.reader.read_exact(&mut len) {
            self.stop(format!("truncated length: {}", e));
            return None;
        }
        let len = u32::from_le_bytes(len);

        let end = record_start + self.key_size as u64 + 4 + len as u64;
        if len > MAX_RECORD_SIZE || end > self.limit {
            self.stop(format!("implausible bytecode length {}", len));
            return None;
        }

        let mut bytecode = vec![0u8; len as usize];
        if let Err(e) = self.reader.read_exact(&mut bytecode) {
            self.stop(format!("truncated bytecode: {}", e));
            return None;
        }

        self.offset = end;
        self.valid_end = end;

        Some(DiskRecord {
            offset: record_start,
            key,
            bytecode,
        })
    }
}

impl<R: Read> Iterator for RecordReader<R> {
    type Item = DiskRecord;

    fn next(&mut self) -> Option<DiskRecord> {
        while !self.done {
            let record = self.read_record()?;
            if record.bytecode.is_empty() {
                warn!("Skipping shader cache record at offset {} with no bytecode", record.offset);
                self.skipped += 1;
                continue;
            }
            return Some(record);
        }
        None
    }
}

/// Fill `buf` completely, or return `Ok(false)` on a clean EOF before any byte
fn read_exact_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

/// Outcome of reading an existing file at open time
#[derive(Debug, Default)]
pub struct ReplayReport {
    /// Well-formed records, in file order (may contain duplicate keys)
    pub records: Vec<DiskRecord>,
    /// Records dropped while reading
    pub skipped: usize,
    /// A damaged tail was cut off
    pub truncated: bool,
    /// The whole file was thrown away (header mismatch or unreadable)
    pub discarded: bool,
}

/// Open append handle on one cache file
pub struct LinearDiskCache {
    path: PathBuf,
    writer: BufWriter<File>,
    key_size: usize,
    appended: usize,
}

impl LinearDiskCache {
    /// Open (or create) a cache file, returning its existing records.
    ///
    /// A file with a foreign header is replaced by an empty one. A damaged
    /// tail is truncated away so that later appends stay readable.
    pub fn open(
        path: &Path,
        key_size: usize,
        generator_version: u32,
    ) -> Result<(Self, ReplayReport), ShaderCacheError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let file_len = file.metadata()?.len();
        let expected = CacheHeader::new(key_size as u32, generator_version);

        let mut report = ReplayReport::default();
        let mut valid_end = HEADER_SIZE;
        let mut rewrite = file_len == 0;

        if file_len > 0 {
            let mut reader = BufReader::new(&file);
            match CacheHeader::read_from(&mut reader) {
                Ok(header) if header == expected => {
                    let mut records = RecordReader::new(reader, key_size, file_len);
                    report.records = records.by_ref().collect();
                    report.skipped = records.skipped();
                    valid_end = records.valid_end();
                    if let Some(err) = records.take_error() {
                        warn!("{}: {}; dropping the rest of the file", path.display(), err);
                        report.truncated = true;
                    }
                }
                Ok(header) => {
                    info!(
                        "{}: discarding cache (version {} key size {} generator {}, expected {} {} {})",
                        path.display(),
                        header.version,
                        header.key_size,
                        header.generator_version,
                        expected.version,
                        expected.key_size,
                        expected.generator_version
                    );
                    rewrite = true;
                    report.discarded = true;
                }
                Err(e) => {
                    warn!("{}: unreadable shader cache ({}), starting empty", path.display(), e);
                    rewrite = true;
                    report.discarded = true;
                }
            }
        }

        if rewrite {
            file.set_len(0)?;
            file.seek(SeekFrom::Start(0))?;
            file.write_all(&expected.encode())?;
            valid_end = HEADER_SIZE;
        } else if valid_end < file_len {
            file.set_len(valid_end)?;
        }
        file.seek(SeekFrom::Start(valid_end))?;

        debug!(
            "Opened shader cache {} ({} records, {} skipped)",
            path.display(),
            report.records.len(),
            report.skipped
        );

        Ok((
            Self {
                path: path.to_path_buf(),
                writer: BufWriter::new(file),
                key_size,
                appended: 0,
            },
            report,
        ))
    }

    /// Append one record and push it to the OS
    pub fn append(&mut self, key: &[u8], bytecode: &[u8]) -> Result<(), ShaderCacheError> {
        if key.len() != self.key_size {
            return Err(ShaderCacheError::DiskWrite(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("key is {} bytes, cache expects {}", key.len(), self.key_size),
            )));
        }
        let len = u32::try_from(bytecode.len())
            .ok()
            .filter(|len| *len <= MAX_RECORD_SIZE)
            .ok_or_else(|| {
                ShaderCacheError::DiskWrite(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("bytecode of {} bytes is too large", bytecode.len()),
                ))
            })?;

        self.writer.write_all(key).map_err(ShaderCacheError::DiskWrite)?;
        self.writer.write_all(&len.to_le_bytes()).map_err(ShaderCacheError::DiskWrite)?;
        self.writer.write_all(bytecode).map_err(ShaderCacheError::DiskWrite)?;
        self.writer.flush().map_err(ShaderCacheError::DiskWrite)?;
        self.appended += 1;
        Ok(())
    }

    /// Flush buffered data and ask the OS to persist it
    pub fn sync(&mut self) -> Result<(), ShaderCacheError> {
        self.writer.flush().map_err(ShaderCacheError::DiskWrite)?;
        self.writer.get_ref().sync_data().map_err(ShaderCacheError::DiskWrite)
    }

    /// Sync and release the file
    pub fn close(mut self) -> Result<(), ShaderCacheError> {
        self.sync()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn key_size(&self) -> usize {
        self.key_size
    }

    /// Records appended since open
    pub fn appended(&self) -> usize {
        self.appended
    }
}

/// Build the cache file name for one stage.
///
/// `<BACKEND>-<sig8>-<game>-<suffix>.cache`, where `sig8` is derived from the
/// driver/device signature so that binaries from another GPU or driver are
/// never picked up.
pub fn cache_file_name(
    backend: &str,
    device_signature: &str,
    game_id: &str,
    suffix: &str,
) -> String {
    let digest = Sha1::digest(device_signature.as_bytes());
    let sig: String = digest[..4].iter().map(|b| format!("{:02x}", b)).collect();

    format!("{}-{}-{}-{}.cache", backend, sig, game_tag(game_id), suffix)
}

/// Game id as it appears in cache file names
pub fn game_tag(game_id: &str) -> String {
    let game: String = game_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if game.is_empty() {
        "default".to_string()
    } else {
        game
    }
}

/// Summary of a cache file for tooling
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskCacheSummary {
    pub header: CacheHeader,
    pub records: usize,
    pub unique_keys: usize,
    pub duplicates: usize,
    pub skipped: usize,
    pub bytecode_bytes: u64,
    /// Offset where reading stopped on a damaged tail
    pub truncated_at: Option<u64>,
}

type ReadAll = (CacheHeader, Vec<DiskRecord>, usize, Option<u64>);

fn read_all(path: &Path) -> Result<ReadAll, ShaderCacheError> {
    let file = File::open(path)?;
    let limit = file.metadata()?.len();
    let mut reader = BufReader::new(file);
    let header = CacheHeader::read_from(&mut reader)?;
    if header.key_size == 0 || header.key_size > MAX_KEY_SIZE {
        return Err(ShaderCacheError::VersionMismatch(format!(
            "implausible key size {}",
            header.key_size
        )));
    }

    let mut records = RecordReader::new(reader, header.key_size as usize, limit);
    let all: Vec<DiskRecord> = records.by_ref().collect();
    let truncated_at = records.error().map(|_| records.valid_end());
    Ok((header, all, records.skipped(), truncated_at))
}

/// Read a cache file without modifying it
pub fn inspect(path: &Path) -> Result<DiskCacheSummary, ShaderCacheError> {
    let (header, records, skipped, truncated_at) = read_all(path)?;

    let mut seen = HashSet::new();
    let mut bytecode_bytes = 0u64;
    for record in &records {
        seen.insert(record.key.as_slice());
        bytecode_bytes += record.bytecode.len() as u64;
    }

    Ok(DiskCacheSummary {
        header,
        records: records.len(),
        unique_keys: seen.len(),
        duplicates: records.len() - seen.len(),
        skipped,
        bytecode_bytes,
        truncated_at,
    })
}

/// Rewrite a cache file keeping only the first record of each key.
/// Returns the summary of the rewritten file.
pub fn compact(path: &Path) -> Result<DiskCacheSummary, ShaderCacheError> {
    let (header, records, _, _) = read_all(path)?;

    let tmp_path = path.with_extension("cache.tmp");
    {
        let mut out = BufWriter::new(File::create(&tmp_path)?);
        out.write_all(&header.encode()).map_err(ShaderCacheError::DiskWrite)?;

        let mut seen = HashSet::new();
        for record in &records {
            if !seen.insert(record.key.as_slice()) {
                continue;
            }
            out.write_all(&record.key).map_err(ShaderCacheError::DiskWrite)?;
            out.write_all(&(record.bytecode.len() as u32).to_le_bytes())
                .map_err(ShaderCacheError::DiskWrite)?;
            out.write_all(&record.bytecode).map_err(ShaderCacheError::DiskWrite)?;
        }

        out.flush().map_err(ShaderCacheError::DiskWrite)?;
        out.get_ref().sync_all().map_err(ShaderCacheError::DiskWrite)?;
    }
    fs::rename(&tmp_path, path)?;

    inspect(path)
}
