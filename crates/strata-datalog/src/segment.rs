//! On-disk segment file format.
//!
//! A segment is one append-only file holding a header followed by a
//! sequence of `(24-byte key, value)` entries. Every entry is preceded
//! by a resynchronization marker (a 4-byte escape plus the segment's
//! random 16-byte session id) so a reader can locate a record boundary
//! from an arbitrary file offset, and followed by a CRC32 so replay
//! detects corruption. Filenames are the creation timestamp as 16
//! zero-padded hex digits, a random UUID, and a fixed suffix; simple
//! string sort of names equals creation order.
//!
//! Exactly one writer owns the active segment; sealed segments are
//! immutable and may be read concurrently without locking.

use crate::error::{DatalogError, DatalogResult};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use uuid::Uuid;

/// Filename suffix of every segment file.
pub const SEGMENT_SUFFIX: &str = ".datalog";
/// Magic bytes at the head of every segment file.
pub const SEGMENT_MAGIC: [u8; 8] = *b"STRATALG";
/// Format version written after the magic.
pub const SEGMENT_VERSION: u16 = 1;

/// Escape bytes introducing a resync marker. A real entry can never
/// start with these because key timestamps stay far below `u32::MAX`
/// milliseconds.
const SYNC_ESCAPE: [u8; 4] = [0xFF, 0xFF, 0xFF, 0xFF];
const MARKER_LEN: usize = SYNC_ESCAPE.len() + 16;
const KEY_LEN: usize = strata_model::RECORD_KEY_LEN;

/// Entry values are never legitimately this large; a bigger length
/// field means the file is damaged.
const MAX_VALUE_LEN: u32 = 256 * 1024 * 1024;

const FLAG_RAW: u8 = 0;
const FLAG_LZ4: u8 = 1;

/// Build a segment filename for the given creation timestamp.
pub fn segment_name(created_ms: i64) -> String {
    format!("{:016x}.{}{}", created_ms, Uuid::new_v4(), SEGMENT_SUFFIX)
}

/// Parse the creation timestamp out of a segment filename.
///
/// Returns `None` for files that are not segments (wrong shape or
/// suffix), which the directory scan uses as its filter.
pub fn parse_segment_name(name: &str) -> Option<i64> {
    let stem = name.strip_suffix(SEGMENT_SUFFIX)?;
    let (hex, uuid) = stem.split_at_checked(16)?;
    let uuid = uuid.strip_prefix('.')?;
    if Uuid::parse_str(uuid).is_err() {
        return None;
    }
    i64::from_str_radix(hex, 16).ok()
}

/// Full path of a segment inside the log directory.
pub fn segment_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(name)
}

/// File-level metadata embedded at the head of a segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentHeader {
    /// Creation timestamp, milliseconds since the Unix epoch.
    pub created_ms: i64,
    /// Random per-segment session id, repeated in every resync marker.
    pub session: [u8; 16],
    /// Identifier of the instance that produced the segment.
    pub instance_id: String,
}

impl SegmentHeader {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(&SEGMENT_MAGIC);
        buf.extend_from_slice(&SEGMENT_VERSION.to_be_bytes());
        buf.extend_from_slice(&self.created_ms.to_be_bytes());
        buf.extend_from_slice(&self.session);
        buf.extend_from_slice(&(self.instance_id.len() as u16).to_be_bytes());
        buf.extend_from_slice(self.instance_id.as_bytes());
        buf
    }

    fn encoded_len(&self) -> u64 {
        (SEGMENT_MAGIC.len() + 2 + 8 + 16 + 2 + self.instance_id.len()) as u64
    }
}

/// One decoded segment entry.
#[derive(Debug, Clone)]
pub struct SegmentEntry {
    /// The 24-byte record key.
    pub key: [u8; KEY_LEN],
    /// The record value, decompressed if the entry was compressed.
    pub value: Vec<u8>,
    /// File offset of the entry that follows this one; streaming this
    /// offset to a consumer lets it resume exactly after this record.
    pub next_pos: u64,
}

impl SegmentEntry {
    /// Class id embedded in the key.
    pub fn class_id(&self) -> u64 {
        let mut id = [0u8; 8];
        id.copy_from_slice(&self.key[8..16]);
        u64::from_be_bytes(id)
    }

    /// Labels id embedded in the key.
    pub fn labels_id(&self) -> u64 {
        let mut id = [0u8; 8];
        id.copy_from_slice(&self.key[16..24]);
        u64::from_be_bytes(id)
    }
}

/// Writer owning the active segment file.
#[derive(Debug)]
pub struct SegmentWriter {
    file: File,
    path: PathBuf,
    name: String,
    header: SegmentHeader,
    entry_bytes: u64,
    records: u64,
}

impl SegmentWriter {
    /// Create a fresh segment in `dir`, named by `created_ms`, and
    /// write its header.
    pub async fn create(dir: &Path, instance_id: &str, created_ms: i64) -> DatalogResult<Self> {
        // The header stores the instance id behind a u16 length prefix.
        if instance_id.len() > u16::MAX as usize {
            return Err(DatalogError::config(format!(
                "instance id of {} bytes exceeds the {} limit",
                instance_id.len(),
                u16::MAX
            )));
        }
        let name = segment_name(created_ms);
        let path = segment_path(dir, &name);
        let header = SegmentHeader {
            created_ms,
            session: *Uuid::new_v4().as_bytes(),
            instance_id: instance_id.to_string(),
        };
        let mut file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&path)
            .await?;
        file.write_all(&header.encode()).await?;
        tracing::debug!(segment = %name, "created segment");
        Ok(Self {
            file,
            path,
            name,
            header,
            entry_bytes: 0,
            records: 0,
        })
    }

    /// Append one `(key, value)` entry, preceded by a resync marker and
    /// followed by a CRC32 of the entry body.
    pub async fn append(
        &mut self,
        key: &[u8; KEY_LEN],
        value: &[u8],
        compress: bool,
    ) -> DatalogResult<()> {
        let (flag, stored) = if compress {
            (
                FLAG_LZ4,
                lz4_flex::block::compress_prepend_size(value),
            )
        } else {
            (FLAG_RAW, value.to_vec())
        };

        let mut crc = crc32fast::Hasher::new();
        crc.update(key);
        crc.update(&[flag]);
        crc.update(&stored);

        let mut buf = Vec::with_capacity(MARKER_LEN + KEY_LEN + 9 + stored.len() + 4);
        buf.extend_from_slice(&SYNC_ESCAPE);
        buf.extend_from_slice(&self.header.session);
        buf.extend_from_slice(key);
        buf.push(flag);
        buf.extend_from_slice(&(stored.len() as u32).to_be_bytes());
        buf.extend_from_slice(&stored);
        buf.extend_from_slice(&crc.finalize().to_be_bytes());

        self.file.write_all(&buf).await?;
        self.entry_bytes += buf.len() as u64;
        self.records += 1;
        Ok(())
    }

    /// Force a durability barrier: everything appended so far reaches
    /// stable storage before this returns.
    pub async fn sync(&mut self) -> DatalogResult<()> {
        self.file.flush().await?;
        self.file.sync_data().await?;
        Ok(())
    }

    /// Durably flush and close the segment. Returns `true` if the
    /// segment held no records and its file was deleted.
    pub async fn close(mut self) -> DatalogResult<bool> {
        self.sync().await?;
        drop(self.file);
        if self.records == 0 {
            tokio::fs::remove_file(&self.path).await?;
            tracing::debug!(segment = %self.name, "deleted empty segment on rotation");
            return Ok(true);
        }
        tracing::debug!(
            segment = %self.name,
            records = self.records,
            bytes = self.entry_bytes,
            "sealed segment"
        );
        Ok(false)
    }

    /// Name of the segment file.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Creation timestamp of the segment.
    pub fn created_ms(&self) -> i64 {
        self.header.created_ms
    }

    /// Total entry bytes appended so far (rotation size trigger).
    pub fn entry_bytes(&self) -> u64 {
        self.entry_bytes
    }

    /// Number of records appended so far.
    pub fn records(&self) -> u64 {
        self.records
    }
}

/// Reader over one segment file.
///
/// Tolerates a torn trailing entry (a crash mid-append leaves one) by
/// reporting end-of-segment with [`SegmentReader::partial_tail`] set;
/// a bad marker or checksum with the full entry bytes present is
/// corruption and is fatal.
#[derive(Debug)]
pub struct SegmentReader {
    file: File,
    name: String,
    header: SegmentHeader,
    pos: u64,
    partial_tail: bool,
}

impl SegmentReader {
    /// Open a segment and read its header.
    pub async fn open(path: &Path) -> DatalogResult<Self> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut file = File::open(path).await?;

        let mut fixed = [0u8; 8 + 2 + 8 + 16 + 2];
        let n = read_fully(&mut file, &mut fixed).await?;
        if n < fixed.len() {
            // Crash between create and header write; no records lost.
            return Err(DatalogError::corrupt(name, "truncated header"));
        }
        if fixed[0..8] != SEGMENT_MAGIC {
            return Err(DatalogError::corrupt(name, "bad magic"));
        }
        let version = u16::from_be_bytes([fixed[8], fixed[9]]);
        if version != SEGMENT_VERSION {
            return Err(DatalogError::corrupt(
                name,
                format!("unsupported segment version {version}"),
            ));
        }
        let mut created = [0u8; 8];
        created.copy_from_slice(&fixed[10..18]);
        let created_ms = i64::from_be_bytes(created);
        let mut session = [0u8; 16];
        session.copy_from_slice(&fixed[18..34]);
        let id_len = u16::from_be_bytes([fixed[34], fixed[35]]) as usize;
        let mut id = vec![0u8; id_len];
        if read_fully(&mut file, &mut id).await? < id_len {
            return Err(DatalogError::corrupt(name, "truncated header"));
        }
        let instance_id = String::from_utf8(id)
            .map_err(|_| DatalogError::corrupt(name.clone(), "instance id is not UTF-8"))?;

        let header = SegmentHeader {
            created_ms,
            session,
            instance_id,
        };
        let pos = header.encoded_len();
        Ok(Self {
            file,
            name,
            header,
            pos,
            partial_tail: false,
        })
    }

    /// The segment's embedded header.
    pub fn header(&self) -> &SegmentHeader {
        &self.header
    }

    /// Current file offset, always at an entry boundary.
    pub fn position(&self) -> u64 {
        self.pos
    }

    /// Offset of the first entry.
    pub fn entries_start(&self) -> u64 {
        self.header.encoded_len()
    }

    /// True once a torn trailing entry was observed.
    pub fn partial_tail(&self) -> bool {
        self.partial_tail
    }

    /// Seek to an entry boundary previously obtained from
    /// [`SegmentEntry::next_pos`] or [`SegmentReader::position`].
    /// A position of zero means the first entry.
    pub async fn seek(&mut self, pos: u64) -> DatalogResult<()> {
        let pos = if pos == 0 { self.entries_start() } else { pos };
        self.file.seek(SeekFrom::Start(pos)).await?;
        self.pos = pos;
        self.partial_tail = false;
        Ok(())
    }

    /// Scan forward from the current offset until the next resync
    /// marker, leaving the reader at that entry boundary. Lets a reader
    /// recover a boundary from an arbitrary offset.
    pub async fn resync(&mut self) -> DatalogResult<bool> {
        let mut marker = [0u8; MARKER_LEN];
        marker[..4].copy_from_slice(&SYNC_ESCAPE);
        marker[4..].copy_from_slice(&self.header.session);

        self.file.seek(SeekFrom::Start(self.pos)).await?;
        let mut window: Vec<u8> = Vec::new();
        let mut chunk = [0u8; 4096];
        let mut base = self.pos;
        loop {
            let n = self.file.read(&mut chunk).await?;
            if n == 0 {
                return Ok(false);
            }
            window.extend_from_slice(&chunk[..n]);
            if let Some(idx) = window
                .windows(MARKER_LEN)
                .position(|w| w == marker)
            {
                self.seek(base + idx as u64).await?;
                return Ok(true);
            }
            // Keep a marker-sized overlap between chunks.
            if window.len() > MARKER_LEN {
                let drop = window.len() - MARKER_LEN + 1;
                window.drain(..drop);
                base += drop as u64;
            }
        }
    }

    /// Read the next entry, or `None` at end of segment. A torn
    /// trailing entry also yields `None` and sets
    /// [`SegmentReader::partial_tail`]; the reader stays positioned at
    /// the torn entry so an active segment can be retried after more
    /// bytes are appended.
    pub async fn next_entry(&mut self) -> DatalogResult<Option<SegmentEntry>> {
        let start = self.pos;

        let mut marker = [0u8; MARKER_LEN];
        match self.read_or_rewind(&mut marker, start).await? {
            ReadOutcome::Full => {}
            ReadOutcome::Empty => return Ok(None),
            ReadOutcome::Partial => return Ok(None),
        }
        if marker[..4] != SYNC_ESCAPE || marker[4..] != self.header.session {
            return Err(DatalogError::corrupt(
                self.name.clone(),
                format!("bad resync marker at offset {start}"),
            ));
        }

        let mut fixed = [0u8; KEY_LEN + 1 + 4];
        match self.read_or_rewind(&mut fixed, start).await? {
            ReadOutcome::Full => {}
            _ => return Ok(None),
        }
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&fixed[..KEY_LEN]);
        let flag = fixed[KEY_LEN];
        let mut len_buf = [0u8; 4];
        len_buf.copy_from_slice(&fixed[KEY_LEN + 1..]);
        let stored_len = u32::from_be_bytes(len_buf);
        if stored_len > MAX_VALUE_LEN {
            return Err(DatalogError::corrupt(
                self.name.clone(),
                format!("entry length {stored_len} at offset {start} exceeds limit"),
            ));
        }

        let mut stored = vec![0u8; stored_len as usize];
        match self.read_or_rewind(&mut stored, start).await? {
            ReadOutcome::Full => {}
            _ => return Ok(None),
        }
        let mut crc_buf = [0u8; 4];
        match self.read_or_rewind(&mut crc_buf, start).await? {
            ReadOutcome::Full => {}
            _ => return Ok(None),
        }

        let mut crc = crc32fast::Hasher::new();
        crc.update(&key);
        crc.update(&[flag]);
        crc.update(&stored);
        if crc.finalize() != u32::from_be_bytes(crc_buf) {
            return Err(DatalogError::corrupt(
                self.name.clone(),
                format!("checksum mismatch at offset {start}"),
            ));
        }

        let value = match flag {
            FLAG_RAW => stored,
            FLAG_LZ4 => lz4_flex::block::decompress_size_prepended(&stored).map_err(|e| {
                DatalogError::corrupt(self.name.clone(), format!("lz4 error at {start}: {e}"))
            })?,
            other => {
                return Err(DatalogError::corrupt(
                    self.name.clone(),
                    format!("unknown compression flag {other} at offset {start}"),
                ))
            }
        };

        self.pos = start
            + (MARKER_LEN + KEY_LEN + 1 + 4 + stored_len as usize + 4) as u64;
        self.partial_tail = false;
        Ok(Some(SegmentEntry {
            key,
            value,
            next_pos: self.pos,
        }))
    }

    async fn read_or_rewind(
        &mut self,
        buf: &mut [u8],
        entry_start: u64,
    ) -> DatalogResult<ReadOutcome> {
        let n = read_fully(&mut self.file, buf).await?;
        if n == buf.len() {
            return Ok(ReadOutcome::Full);
        }
        // Incomplete entry: rewind so the caller can retry once the
        // active segment grows.
        self.file.seek(SeekFrom::Start(entry_start)).await?;
        self.pos = entry_start;
        if n == 0 && buf.len() == MARKER_LEN {
            // Nothing after the previous entry at all.
            self.partial_tail = false;
            return Ok(ReadOutcome::Empty);
        }
        self.partial_tail = true;
        Ok(ReadOutcome::Partial)
    }
}

enum ReadOutcome {
    Full,
    Empty,
    Partial,
}

async fn read_fully(file: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
