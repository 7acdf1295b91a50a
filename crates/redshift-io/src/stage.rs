//! Stage writer (§4.4): one open append-only file per stream under a
//! caller-configurable scratch directory, with optional streaming
//! compression. Sealed at flush time; the sealed path is handed to
//! the warehouse sync layer and deleted once its load commits.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use bzip2::write::BzEncoder;
use bzip2::Compression as BzLevel;
use flate2::write::GzEncoder;
use flate2::Compression as GzLevel;
use uuid::Uuid;

use redshift_core::config::Compression;
use redshift_core::error::{Result, TargetError};

enum Sink {
    Plain(BufWriter<File>),
    Gzip(GzEncoder<BufWriter<File>>),
    Bzip2(BzEncoder<BufWriter<File>>),
}

impl Sink {
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        match self {
            Sink::Plain(w) => w.write_all(buf),
            Sink::Gzip(w) => w.write_all(buf),
            Sink::Bzip2(w) => w.write_all(buf),
        }
    }

    /// Flush and unwrap down to the underlying file so the caller can
    /// fsync it before handing the path off to a flush worker.
    fn finish(self) -> io::Result<File> {
        let mut buffered = match self {
            Sink::Plain(w) => w,
            Sink::Gzip(w) => w.finish()?,
            Sink::Bzip2(w) => w.finish()?,
        };
        buffered.flush()?;
        buffered.into_inner().map_err(|e| e.into_error())
    }
}

/// An open per-stream staging file, created lazily on a stream's
/// first record of a batch.
pub struct StageFile {
    pub stream: String,
    pub path: PathBuf,
    sink: Sink,
    pub row_count: usize,
    pub byte_count: u64,
}

impl StageFile {
    pub fn create(scratch_dir: &Path, stream: &str, compression: Compression) -> Result<Self> {
        std::fs::create_dir_all(scratch_dir).map_err(|e| TargetError::Fatal(e.into()))?;

        let safe_stem: String = stream
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        let file_name = format!(
            "{}_{}.csv{}",
            safe_stem,
            Uuid::new_v4(),
            compression.extension()
        );
        let path = scratch_dir.join(file_name);

        let file = File::create(&path).map_err(|e| TargetError::Fatal(e.into()))?;
        let buffered = BufWriter::new(file);
        let sink = match compression {
            Compression::None => Sink::Plain(buffered),
            Compression::Gzip => Sink::Gzip(GzEncoder::new(buffered, GzLevel::default())),
            Compression::Bzip2 => Sink::Bzip2(BzEncoder::new(buffered, BzLevel::default())),
        };

        Ok(Self {
            stream: stream.to_string(),
            path,
            sink,
            row_count: 0,
            byte_count: 0,
        })
    }

    /// Append one already-CSV-rendered, newline-terminated row.
    pub fn append_row(&mut self, line: &str) -> Result<()> {
        self.sink
            .write_all(line.as_bytes())
            .map_err(|e| TargetError::Fatal(e.into()))?;
        self.row_count += 1;
        self.byte_count += line.len() as u64;
        Ok(())
    }

    /// Close the file, fsync it, and return its sealed description.
    /// The caller owns the path from here on; nothing else will
    /// append to it.
    pub fn seal(self) -> Result<SealedBatch> {
        let stream = self.stream;
        let path = self.path;
        let row_count = self.row_count;
        let byte_count = self.byte_count;

        let file = self.sink.finish().map_err(|e| TargetError::Fatal(e.into()))?;
        file.sync_all().map_err(|e| TargetError::Fatal(e.into()))?;

        Ok(SealedBatch {
            stream,
            path,
            row_count,
            byte_count,
        })
    }
}

/// A closed, durable staging file ready to be uploaded and loaded.
#[derive(Debug, Clone)]
pub struct SealedBatch {
    pub stream: String,
    pub path: PathBuf,
    pub row_count: usize,
    pub byte_count: u64,
}

/// A stream's open batch. Streams with no declared primary key append
/// straight through to an open `StageFile`. Streams with a primary key
/// buffer rows in memory instead, keyed by the record's primary-key
/// signature, so a later record with the same key overwrites the
/// earlier one's row rather than adding a second. The stage file for a
/// keyed batch is only created at `seal`, once the final row set is
/// known, so the target ends up with exactly one row per distinct key
/// (last write wins) rather than duplicates.
pub enum Batch {
    Streaming(StageFile),
    Keyed {
        stream: String,
        rows: Vec<String>,
        index: HashMap<String, usize>,
        received: usize,
    },
}

impl Batch {
    pub fn new_streaming(file: StageFile) -> Self {
        Batch::Streaming(file)
    }

    pub fn new_keyed(stream: String) -> Self {
        Batch::Keyed { stream, rows: Vec::new(), index: HashMap::new(), received: 0 }
    }

    /// Append one rendered CSV line. `key`, when present, dedupes by
    /// primary key: a repeat key overwrites the row already buffered
    /// for it in place instead of appending a new one.
    pub fn append_row(&mut self, key: Option<&str>, line: &str) -> Result<()> {
        match self {
            Batch::Streaming(file) => file.append_row(line),
            Batch::Keyed { rows, index, received, .. } => {
                *received += 1;
                match key.and_then(|k| index.get(k).copied()) {
                    Some(i) => rows[i] = line.to_string(),
                    None => {
                        if let Some(k) = key {
                            index.insert(k.to_string(), rows.len());
                        }
                        rows.push(line.to_string());
                    }
                }
                Ok(())
            }
        }
    }

    /// Records appended so far, counting duplicate keys, for the
    /// batch-full trigger (§4.7 trigger 1). Deduplication changes what
    /// lands in the target, not when a batch is considered full.
    pub fn received_count(&self) -> usize {
        match self {
            Batch::Streaming(file) => file.row_count,
            Batch::Keyed { received, .. } => *received,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.received_count() == 0
    }

    /// Close the batch. A streaming batch just seals its already-open
    /// file; a keyed batch materializes its deduplicated rows into a
    /// fresh stage file first.
    pub fn seal(self, scratch_dir: &Path, compression: Compression) -> Result<SealedBatch> {
        match self {
            Batch::Streaming(file) => file.seal(),
            Batch::Keyed { stream, rows, .. } => {
                let mut file = StageFile::create(scratch_dir, &stream, compression)?;
                for line in &rows {
                    file.append_row(line)?;
                }
                file.seal()
            }
        }
    }
}

/// Delete every staging file this engine could have produced under
/// `scratch_dir`. Called on clean exit, on a flush failure, and
/// before forcing exit on signal. The scratch directory is expected
/// to be empty afterward (§8 property 6).
pub fn sweep_scratch_dir(scratch_dir: &Path) -> Result<()> {
    let entries = match std::fs::read_dir(scratch_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(TargetError::Fatal(e.into())),
    };

    for entry in entries {
        let entry = entry.map_err(|e| TargetError::Fatal(e.into()))?;
        let path = entry.path();
        if path.is_file() && is_stage_file_name(&path) {
            let _ = std::fs::remove_file(&path);
        }
    }
    Ok(())
}

fn is_stage_file_name(path: &Path) -> bool {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
    name.contains(".csv")
}
