use crate::encoding::{crc32, write_u32};
use crate::error::{Result, TimelineError};
use crate::types::HostSampleBatch;

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, Write};
use std::path::{Path, PathBuf};

const BLOG_MAGIC: &[u8; 8] = b"TLBLOG01";
const BLOG_VERSION: u32 = 1;

const ACTIVE_LOG: &str = "blog.log";

/// Local crash-safe log of every accepted sample batch.
///
/// Records are appended before a batch reaches its accumulator, so anything not yet durable in
/// the store can be rebuilt by replaying the log.
pub trait BackingLog: std::fmt::Debug + Send + 'static {
    /// Appends one record and makes it durable.
    fn append(&mut self, batch: &HostSampleBatch) -> Result<()>;

    /// Feeds every record, oldest first, to `f`. Rotated segments come before the active log.
    fn read_all(&mut self, f: &mut dyn FnMut(HostSampleBatch)) -> Result<()>;

    /// Drops every record, rotated segments included.
    fn discard(&mut self) -> Result<()>;

    /// Seals the active log and starts a fresh one. Returns the sealed segment(s).
    fn rotate(&mut self) -> Result<Vec<PathBuf>>;

    /// Deletes segments previously returned by [`BackingLog::rotate`].
    fn discard_rotated(&mut self, segments: &[PathBuf]) -> Result<()>;
}

/// File-backed [`BackingLog`]: `blog.log` plus sealed `blog_<ns>.log` segments in one directory.
///
/// Layout: `TLBLOG01` magic, `u32` version, then records framed as
/// `len u32 LE | crc32 u32 LE | bincode payload`. Every append is followed by `sync_data`.
#[derive(Debug)]
pub struct FileBackingLog {
    log_file: Option<BufWriter<File>>,
    log_dir: PathBuf,
    log_path: PathBuf,
}

impl FileBackingLog {
    /// Opens (or creates) the backing log in `log_dir`.
    pub fn open<P: AsRef<Path>>(log_dir: P) -> Result<Self> {
        let log_dir = log_dir.as_ref().to_path_buf();
        fs::create_dir_all(&log_dir)?;
        let log_path = log_dir.join(ACTIVE_LOG);

        let mut log = FileBackingLog {
            log_file: None,
            log_dir,
            log_path,
        };
        log.reopen_active()?;
        Ok(log)
    }

    pub fn dir(&self) -> &Path {
        &self.log_dir
    }

    fn reopen_active(&mut self) -> Result<()> {
        self.log_file = None;
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.log_path)?;
        if file.metadata()?.len() == 0 {
            write_log_header(&mut file)?;
        } else {
            check_log_header(&self.log_path)?;
        }
        self.log_file = Some(BufWriter::new(file));
        Ok(())
    }

    fn rotated_segments(&self) -> Result<Vec<PathBuf>> {
        let mut paths = Vec::new();
        for entry in fs::read_dir(&self.log_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with("blog_") && name.ends_with(".log") {
                paths.push(entry.path());
            }
        }
        // Zero-padded nanosecond names sort chronologically.
        paths.sort();
        Ok(paths)
    }
}

impl BackingLog for FileBackingLog {
    fn append(&mut self, batch: &HostSampleBatch) -> Result<()> {
        let payload = bincode::serialize(batch)?;
        let crc = crc32(&payload);
        let log_file = self
            .log_file
            .as_mut()
            .ok_or_else(|| TimelineError::Internal("backing log file not open".to_string()))?;
        let mut record = Vec::with_capacity(8 + payload.len());
        write_u32(&mut record, payload.len() as u32);
        write_u32(&mut record, crc);
        record.extend_from_slice(&payload);
        log_file.write_all(&record)?;
        log_file.flush()?;
        log_file.get_ref().sync_data()?;
        Ok(())
    }

    fn read_all(&mut self, f: &mut dyn FnMut(HostSampleBatch)) -> Result<()> {
        if let Some(log_file) = self.log_file.as_mut() {
            log_file.flush()?;
        }
        let mut paths = self.rotated_segments()?;
        paths.push(self.log_path.clone());
        for path in paths {
            if path.exists() {
                read_records_from_path(&path, f)?;
            }
        }
        Ok(())
    }

    fn discard(&mut self) -> Result<()> {
        let rotated = self.rotated_segments()?;
        self.discard_rotated(&rotated)?;

        self.log_file = None;
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.log_path)?;
        write_log_header(&mut file)?;
        drop(file);
        self.reopen_active()
    }

    fn rotate(&mut self) -> Result<Vec<PathBuf>> {
        if let Some(log_file) = self.log_file.as_mut() {
            log_file.flush()?;
        }
        self.log_file = None;

        let mut sealed = Vec::new();
        if self.log_path.exists() {
            let rotated = self.log_dir.join(format!("blog_{:020}.log", now_ns()));
            fs::rename(&self.log_path, &rotated)?;
            sync_dir(&self.log_dir)?;
            sealed.push(rotated);
        }
        self.reopen_active()?;
        Ok(sealed)
    }

    fn discard_rotated(&mut self, segments: &[PathBuf]) -> Result<()> {
        for path in segments {
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        if !segments.is_empty() {
            sync_dir(&self.log_dir)?;
        }
        Ok(())
    }
}

/// In-memory [`BackingLog`] for collectors that run without a data directory.
///
/// Offers no crash safety; replay only sees records appended by this process.
#[derive(Debug, Default)]
pub struct MemoryBackingLog {
    active: Vec<HostSampleBatch>,
    sealed: Vec<(PathBuf, Vec<HostSampleBatch>)>,
    next_segment: u64,
}

impl MemoryBackingLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.active.len() + self.sealed.iter().map(|(_, s)| s.len()).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BackingLog for MemoryBackingLog {
    fn append(&mut self, batch: &HostSampleBatch) -> Result<()> {
        self.active.push(batch.clone());
        Ok(())
    }

    fn read_all(&mut self, f: &mut dyn FnMut(HostSampleBatch)) -> Result<()> {
        for (_, segment) in &self.sealed {
            segment.iter().cloned().for_each(&mut *f);
        }
        self.active.iter().cloned().for_each(f);
        Ok(())
    }

    fn discard(&mut self) -> Result<()> {
        self.active.clear();
        self.sealed.clear();
        Ok(())
    }

    fn rotate(&mut self) -> Result<Vec<PathBuf>> {
        self.next_segment += 1;
        let name = PathBuf::from(format!("memory-segment-{}", self.next_segment));
        self.sealed
            .push((name.clone(), std::mem::take(&mut self.active)));
        Ok(vec![name])
    }

    fn discard_rotated(&mut self, segments: &[PathBuf]) -> Result<()> {
        self.sealed.retain(|(name, _)| !segments.contains(name));
        Ok(())
    }
}

fn write_log_header(file: &mut File) -> Result<()> {
    file.write_all(BLOG_MAGIC)?;
    file.write_all(&BLOG_VERSION.to_le_bytes())?;
    file.flush()?;
    file.sync_data()?;
    Ok(())
}

fn check_log_header(path: &Path) -> Result<()> {
    let mut f = File::open(path)?;
    let mut magic = [0u8; 8];
    let mut version = [0u8; 4];
    let header_ok = f.read_exact(&mut magic).is_ok()
        && f.read_exact(&mut version).is_ok()
        && &magic == BLOG_MAGIC;
    if !header_ok {
        return Err(TimelineError::Corruption {
            details: format!("{:?} is not a backing log", path),
            path: Some(path.to_path_buf()),
            offset: Some(0),
        });
    }
    let version = u32::from_le_bytes(version);
    if version != BLOG_VERSION {
        return Err(TimelineError::Corruption {
            details: format!("unsupported backing log version {} in {:?}", version, path),
            path: Some(path.to_path_buf()),
            offset: Some(8),
        });
    }
    Ok(())
}

fn read_records_from_path(path: &Path, f: &mut dyn FnMut(HostSampleBatch)) -> Result<()> {
    check_log_header(path)?;
    let mut reader = BufReader::new(File::open(path)?);
    reader.seek(io::SeekFrom::Start((BLOG_MAGIC.len() + 4) as u64))?;

    loop {
        let rec_start_off = reader.stream_position().unwrap_or(0);

        // A torn tail (crash mid-append) ends the log cleanly.
        let mut len_bytes = [0u8; 4];
        match reader.read_exact(&mut len_bytes) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
        let mut crc_bytes = [0u8; 4];
        match reader.read_exact(&mut crc_bytes) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
        let mut payload = vec![0u8; u32::from_le_bytes(len_bytes) as usize];
        match reader.read_exact(&mut payload) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }

        if crc32(&payload) != u32::from_le_bytes(crc_bytes) {
            return Err(TimelineError::Corruption {
                details: format!(
                    "backing log record CRC mismatch in {:?} at offset {}",
                    path, rec_start_off
                ),
                path: Some(path.to_path_buf()),
                offset: Some(rec_start_off),
            });
        }
        let batch: HostSampleBatch =
            bincode::deserialize(&payload).map_err(|e| TimelineError::Corruption {
                details: format!(
                    "backing log record decode failed in {:?} at offset {}: {}",
                    path, rec_start_off, e
                ),
                path: Some(path.to_path_buf()),
                offset: Some(rec_start_off),
            })?;
        f(batch);
    }
    Ok(())
}

pub(crate) fn sync_dir(dir: &Path) -> Result<()> {
    let d = File::open(dir)?;
    d.sync_data()?;
    Ok(())
}

/// Atomic install: write to a temp file, fsync, rename over `path`, fsync the directory.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| TimelineError::Internal(format!("{:?} has no parent directory", path)))?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp_path = dir.join(format!(".tmp_{}", file_name));

    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&tmp_path)?;
    let mut w = BufWriter::new(file);
    w.write_all(bytes)?;
    w.flush()?;
    w.get_ref().sync_data()?;
    drop(w);

    fs::rename(&tmp_path, path)?;
    sync_dir(dir)?;
    Ok(())
}

fn now_ns() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}
