use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

const MAGIC: &[u8; 5] = b"SKWAL";
const VERSION: u8 = 1;
/// Magic, version byte, two reserved zero bytes.
const HEADER_LEN: usize = 8;

fn header() -> [u8; HEADER_LEN] {
    let mut h = [0u8; HEADER_LEN];
    h[..MAGIC.len()].copy_from_slice(MAGIC);
    h[MAGIC.len()] = VERSION;
    h
}

fn invalid(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

/// One framed record: little-endian payload length, bincode payload, crc32 of
/// the payload.
fn write_record(out: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload = bincode::serialize(event).map_err(|e| invalid(e.to_string()))?;
    let len = u32::try_from(payload.len()).map_err(|_| invalid("event too large".into()))?;
    let mut frame = Vec::with_capacity(payload.len() + 8);
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&payload);
    frame.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    out.write_all(&frame)
}

/// Fills `buf` completely. `Ok(false)` means the input ended first.
fn fill(input: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match input.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Reads records until the end of the log or the first torn one, tracking
/// how many leading bytes of the file are intact.
struct RecordReader<R> {
    input: R,
    origin: PathBuf,
    intact: u64,
}

impl<R: Read> RecordReader<R> {
    /// Checks the header. `Ok(None)` for a log that never got past it.
    fn start(mut input: R, origin: &Path) -> io::Result<Option<Self>> {
        let mut head = [0u8; HEADER_LEN];
        if !fill(&mut input, &mut head)? {
            return Ok(None);
        }
        if &head[..MAGIC.len()] != MAGIC {
            return Err(invalid(format!("{} is not a slotkeeper WAL", origin.display())));
        }
        if head[MAGIC.len()] != VERSION {
            return Err(invalid(format!("unsupported WAL version {}", head[MAGIC.len()])));
        }
        Ok(Some(Self {
            input,
            origin: origin.to_path_buf(),
            intact: HEADER_LEN as u64,
        }))
    }

    fn next_event(&mut self) -> io::Result<Option<Event>> {
        let mut len = [0u8; 4];
        if !fill(&mut self.input, &mut len)? {
            return Ok(None);
        }
        let mut payload = vec![0u8; u32::from_le_bytes(len) as usize];
        let mut crc = [0u8; 4];
        if !fill(&mut self.input, &mut payload)? || !fill(&mut self.input, &mut crc)? {
            return Ok(None);
        }
        if u32::from_le_bytes(crc) != crc32fast::hash(&payload) {
            tracing::warn!(wal = %self.origin.display(), "checksum mismatch, dropping tail");
            return Ok(None);
        }
        let Ok(event) = bincode::deserialize(&payload) else {
            return Ok(None);
        };
        self.intact += (payload.len() + 8) as u64;
        Ok(Some(event))
    }
}

/// Intact events of the log at `path` and the length of the prefix holding them.
fn read_log(path: &Path) -> io::Result<(Vec<Event>, u64)> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
        Err(e) => return Err(e),
    };
    let mut events = Vec::new();
    let Some(mut records) = RecordReader::start(BufReader::new(file), path)? else {
        return Ok((events, 0));
    };
    while let Some(event) = records.next_event()? {
        events.push(event);
    }
    Ok((events, records.intact))
}

/// Append-only log of every applied `Event` for one tenant.
///
/// Layout: an 8-byte header (`SKWAL`, version, reserved), then framed records.
/// A crash mid-write leaves a torn last record, which `recover` cuts off.
///
/// Frames are staged in memory and only reach the file in `flush_sync`, so a
/// batch that fails can be taken back completely.
pub struct Wal {
    file: File,
    pending: Vec<u8>,
    path: PathBuf,
    appended: u64,
    /// File length as of the last successful sync.
    durable: u64,
    /// Set when a failed batch could not be rolled back; every later commit fails.
    broken: bool,
}

impl Wal {
    /// Opens the log for appending, writing the header into a new file.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let durable = file.metadata()?.len();
        let mut wal = Self {
            file,
            pending: Vec::new(),
            path: path.to_path_buf(),
            appended: 0,
            durable,
            broken: false,
        };
        if durable == 0 {
            wal.pending.extend_from_slice(&header());
            wal.flush_sync()?;
        }
        Ok(wal)
    }

    /// Replays the log and cuts off a torn or corrupt tail, so that appends
    /// made after a restart land right behind the last intact record.
    pub fn recover(path: &Path) -> io::Result<Vec<Event>> {
        let (events, intact) = read_log(path)?;
        match fs::metadata(path) {
            Ok(meta) if meta.len() > intact => {
                tracing::warn!(
                    wal = %path.display(),
                    dropped = meta.len() - intact,
                    "truncating torn WAL tail"
                );
                let file = OpenOptions::new().write(true).open(path)?;
                file.set_len(intact)?;
                file.sync_all()?;
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        Ok(events)
    }

    /// Appends and syncs `events` as one batch. On failure no byte of the
    /// batch stays staged or on disk.
    pub fn commit(&mut self, events: &[Event]) -> io::Result<()> {
        if self.broken {
            return Err(io::Error::other("WAL unusable after a failed rollback"));
        }
        let appended_before = self.appended;
        let result = events
            .iter()
            .try_for_each(|event| self.append_buffered(event))
            .and_then(|()| self.flush_sync());
        if result.is_err() {
            self.appended = appended_before;
            if let Err(e) = self.discard_pending() {
                tracing::error!(wal = %self.path.display(), "WAL rollback failed: {e}");
                self.broken = true;
            }
        }
        result
    }

    /// Forgets staged frames and truncates the file back to its durable length,
    /// removing whatever part of a failed write reached it.
    fn discard_pending(&mut self) -> io::Result<()> {
        self.pending.clear();
        self.file.set_len(self.durable)?;
        self.file.sync_all()
    }

    /// Stages one record; durable after the next `flush_sync`.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        write_record(&mut self.pending, event)?;
        self.appended += 1;
        Ok(())
    }

    /// Writes the staged records and fsyncs. On error the staged bytes are
    /// kept; `commit` is the caller that rolls them back.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.file.write_all(&self.pending)?;
        self.file.sync_all()?;
        self.pending.clear();
        self.durable = self.file.metadata()?.len();
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn compact_path(path: &Path) -> PathBuf {
        path.with_extension("wal.tmp")
    }

    /// First compaction phase: the full replacement log, synced, next to `path`.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let mut out = BufWriter::new(File::create(Self::compact_path(path))?);
        out.write_all(&header())?;
        for event in events {
            write_record(&mut out, event)?;
        }
        out.flush()?;
        out.get_ref().sync_all()
    }

    /// Second phase: rename the replacement over the live log and reopen it.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        fs::rename(Self::compact_path(&self.path), &self.path)?;
        self.file = OpenOptions::new().append(true).open(&self.path)?;
        self.durable = self.file.metadata()?.len();
        self.appended = 0;
        self.broken = false;
        Ok(())
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appended
    }

    /// Every intact event in the log, oldest first. A missing file is an empty
    /// log; a file with a foreign header is an error. Read-only.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        read_log(path).map(|(events, _)| events)
    }
}
