//! Streaming decompression and CSV batching
//!
//! [`stream`] opens a downloaded archive and yields [`RecordBatch`]es lazily.
//! Nothing is held beyond the batch being filled, so memory stays bounded by
//! `batch_size` whatever the archive size. Each call reopens the file, which
//! makes the sequence restartable: the same file and batch size always yield
//! the same batches.
//!
//! The release files are `;`-separated, header-less and ISO-8859-1 encoded.

use crate::error::{PipelineError, Result};
use crate::schema::{FileKind, TableSchema};
use flate2::read::{DeflateDecoder, GzDecoder};
use flate2::Crc;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, warn};
use zip::CompressionMethod;

/// Rows with problems are logged individually only up to this many per file
const MAX_LOGGED_BAD_ROWS: u64 = 10;

/// Text encoding of the CSV payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    /// ISO-8859-1: every byte is one char, decoding cannot fail
    #[default]
    Latin1,
    /// Strict UTF-8: rows with invalid sequences are skipped
    Utf8,
}

impl FromStr for Encoding {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "latin1" | "latin-1" | "iso-8859-1" | "iso8859-1" => Ok(Encoding::Latin1),
            "utf8" | "utf-8" => Ok(Encoding::Utf8),
            _ => Err(anyhow::anyhow!("Unsupported encoding '{}'", s)),
        }
    }
}

impl Encoding {
    fn decode(self, bytes: &[u8]) -> std::result::Result<String, std::str::Utf8Error> {
        match self {
            Encoding::Latin1 => Ok(bytes.iter().map(|&b| b as char).collect()),
            Encoding::Utf8 => std::str::from_utf8(bytes).map(str::to_owned),
        }
    }
}

/// One typed cell
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    Text(String),
    Float(f64),
}

impl FieldValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }
}

pub type Row = Vec<FieldValue>;

/// Bounded, ordered group of rows from one source file
#[derive(Debug, Clone)]
pub struct RecordBatch {
    pub source: String,
    pub schema: &'static TableSchema,
    /// Position within the source file, starting at 0 with no gaps
    pub sequence: u64,
    pub rows: Vec<Row>,
}

impl RecordBatch {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Per-file row counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProcessingStats {
    pub rows_read: u64,
    pub rows_emitted: u64,
    pub rows_skipped: u64,
    pub batches: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct ProcessOptions {
    pub batch_size: usize,
    pub encoding: Encoding,
    /// Fail the file when skipped/read exceeds this; `None` tolerates anything
    pub max_skipped_row_ratio: Option<f64>,
}

impl ProcessOptions {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size,
            encoding: Encoding::Latin1,
            max_skipped_row_ratio: None,
        }
    }
}

type CsvReader = csv::Reader<Box<dyn Read + Send>>;

/// Lazy iterator of batches for one file
pub struct BatchStream {
    source: String,
    schema: &'static TableSchema,
    reader: CsvReader,
    record: csv::ByteRecord,
    options: ProcessOptions,
    stats: ProcessingStats,
    next_sequence: u64,
    finished: bool,
}

impl std::fmt::Debug for BatchStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchStream")
            .field("source", &self.source)
            .field("table", &self.schema.table)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

fn processing_error(source: &str, reason: impl std::fmt::Display) -> PipelineError {
    PipelineError::Processing {
        file: source.to_string(),
        reason: reason.to_string(),
    }
}

/// Checks a zip entry's CRC-32 and length once the payload is exhausted.
///
/// A mismatch surfaces as an `InvalidData` read error on the final read, so a
/// damaged entry fails the file instead of ending the stream cleanly.
struct EntryCheck<R> {
    inner: R,
    crc: Crc,
    expected_crc: u32,
    expected_size: u64,
    read: u64,
    verified: bool,
}

impl<R: Read> EntryCheck<R> {
    fn new(inner: R, expected_crc: u32, expected_size: u64) -> Self {
        Self {
            inner,
            crc: Crc::new(),
            expected_crc,
            expected_size,
            read: 0,
            verified: false,
        }
    }

    fn verify(&mut self) -> io::Result<()> {
        if self.verified {
            return Ok(());
        }
        let actual = self.crc.sum();
        if self.read != self.expected_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "zip entry is {} bytes, central directory says {}",
                    self.read, self.expected_size
                ),
            ));
        }
        if actual != self.expected_crc {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "zip entry checksum mismatch (crc32 {:08x}, expected {:08x})",
                    actual, self.expected_crc
                ),
            ));
        }
        self.verified = true;
        Ok(())
    }
}

impl<R: Read> Read for EntryCheck<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n == 0 && !buf.is_empty() {
            self.verify()?;
        } else {
            self.crc.update(&buf[..n]);
            self.read += n as u64;
        }
        Ok(n)
    }
}

/// Open the payload of `path` as a byte stream and report the inner file name.
///
/// Zip entries are located through the central directory and then read as a
/// raw stream from their data offset, so the returned reader borrows nothing.
/// The decompressed bytes are checked against the entry's CRC-32 at the end.
fn open_payload(path: &Path, source: &str) -> Result<(Box<dyn Read + Send>, String)> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| source.to_string());
    let lower = file_name.to_ascii_lowercase();

    if lower.ends_with(".zip") {
        let (entry_name, method, data_start, compressed_size, crc32, size) = {
            let mut archive = zip::ZipArchive::new(File::open(path)?)
                .map_err(|e| processing_error(source, format!("invalid zip archive: {}", e)))?;
            let index = (0..archive.len())
                .find(|&i| archive.by_index_raw(i).map(|f| !f.is_dir()).unwrap_or(false))
                .ok_or_else(|| processing_error(source, "zip archive has no file entries"))?;
            let entry = archive
                .by_index_raw(index)
                .map_err(|e| processing_error(source, e))?;
            (
                entry.name().to_string(),
                entry.compression(),
                entry.data_start(),
                entry.compressed_size(),
                entry.crc32(),
                entry.size(),
            )
        };

        let mut file = File::open(path)?;
        file.seek(SeekFrom::Start(data_start))?;
        let raw = BufReader::new(file).take(compressed_size);
        let reader: Box<dyn Read + Send> = match method {
            CompressionMethod::Stored => Box::new(EntryCheck::new(raw, crc32, size)),
            CompressionMethod::Deflated => {
                Box::new(EntryCheck::new(DeflateDecoder::new(raw), crc32, size))
            },
            other => {
                return Err(processing_error(
                    source,
                    format!("unsupported zip compression {:?} for {}", other, entry_name),
                ))
            },
        };
        return Ok((reader, entry_name));
    }

    let file = BufReader::new(File::open(path)?);
    if lower.ends_with(".gz") {
        let inner = file_name[..file_name.len() - 3].to_string();
        Ok((Box::new(GzDecoder::new(file)), inner))
    } else {
        Ok((Box::new(file), file_name))
    }
}

/// Start streaming `path` in batches of `options.batch_size` rows.
///
/// Fails up front when the archive cannot be opened or its kind is unknown.
pub fn stream(path: &Path, source: &str, options: &ProcessOptions) -> Result<BatchStream> {
    let (payload, entry_name) = open_payload(path, source)?;
    let kind = FileKind::detect(Some(entry_name.as_str()), source).ok_or_else(|| {
        processing_error(source, format!("unrecognised file kind (entry '{}')", entry_name))
    })?;

    debug!(file = %source, entry = %entry_name, table = kind.schema().table, "Opened payload");

    let reader = csv::ReaderBuilder::new()
        .delimiter(b';')
        .quote(b'"')
        .has_headers(false)
        .flexible(true)
        .from_reader(payload);

    Ok(BatchStream {
        source: source.to_string(),
        schema: kind.schema(),
        reader,
        record: csv::ByteRecord::new(),
        options: ProcessOptions {
            batch_size: options.batch_size.max(1),
            ..*options
        },
        stats: ProcessingStats::default(),
        next_sequence: 0,
        finished: false,
    })
}

/// Convert one raw record into typed values for `schema`
pub(crate) fn convert_row(
    schema: &TableSchema,
    record: &csv::ByteRecord,
    encoding: Encoding,
) -> std::result::Result<Row, String> {
    if record.len() != schema.width() {
        return Err(format!(
            "expected {} columns, found {}",
            schema.width(),
            record.len()
        ));
    }

    let mut row = Vec::with_capacity(schema.width());
    for (idx, raw) in record.iter().enumerate() {
        let column = schema.columns[idx];
        let text = encoding
            .decode(raw)
            .map_err(|e| format!("column {}: {}", column, e))?;
        row.push(convert_value(schema, column, text));
    }
    Ok(row)
}

fn convert_value(schema: &TableSchema, column: &str, text: String) -> FieldValue {
    let is_key = schema.natural_key.contains(&column);
    let trimmed = text.trim();

    if trimmed.is_empty() {
        return if is_key {
            FieldValue::Text(String::new())
        } else {
            FieldValue::Null
        };
    }

    if schema.numeric.contains(&column) {
        return trimmed
            .replace(',', ".")
            .parse::<f64>()
            .map(FieldValue::Float)
            .unwrap_or(FieldValue::Null);
    }

    if schema.dates.contains(&column) && trimmed.bytes().all(|b| b == b'0') {
        return FieldValue::Null;
    }

    if schema.kind == FileKind::Estabelecimentos
        && column == "pais"
        && trimmed.bytes().all(|b| b.is_ascii_digit())
    {
        return FieldValue::Text(format!("{:0>3}", trimmed));
    }

    FieldValue::Text(text)
}

impl BatchStream {
    pub fn stats(&self) -> ProcessingStats {
        self.stats
    }

    pub fn schema(&self) -> &'static TableSchema {
        self.schema
    }

    fn skip_row(&mut self, reason: &str) {
        self.stats.rows_skipped += 1;
        if self.stats.rows_skipped <= MAX_LOGGED_BAD_ROWS {
            let err = PipelineError::ParseRow {
                file: self.source.clone(),
                row: self.stats.rows_read,
                reason: reason.to_string(),
            };
            warn!(file = %self.source, error = %err, "Skipping row");
        }
    }

    fn check_tolerance(&self) -> Result<()> {
        let Some(limit) = self.options.max_skipped_row_ratio else {
            return Ok(());
        };
        if self.stats.rows_read == 0 {
            return Ok(());
        }
        let ratio = self.stats.rows_skipped as f64 / self.stats.rows_read as f64;
        if ratio > limit {
            return Err(processing_error(
                &self.source,
                format!(
                    "{} of {} rows skipped ({:.2}% > {:.2}% allowed)",
                    self.stats.rows_skipped,
                    self.stats.rows_read,
                    ratio * 100.0,
                    limit * 100.0
                ),
            ));
        }
        Ok(())
    }

    fn fill_batch(&mut self) -> Result<Vec<Row>> {
        let mut rows = Vec::with_capacity(self.options.batch_size.min(64 * 1024));
        while rows.len() < self.options.batch_size {
            match self.reader.read_byte_record(&mut self.record) {
                Ok(false) => {
                    self.finished = true;
                    break;
                },
                Ok(true) => {
                    self.stats.rows_read += 1;
                    match convert_row(self.schema, &self.record, self.options.encoding) {
                        Ok(row) => rows.push(row),
                        Err(reason) => self.skip_row(&reason),
                    }
                },
                Err(e) if e.is_io_error() => {
                    return Err(processing_error(
                        &self.source,
                        format!("read failed after {} rows: {}", self.stats.rows_read, e),
                    ));
                },
                Err(e) => {
                    self.stats.rows_read += 1;
                    self.skip_row(&e.to_string());
                },
            }
        }
        Ok(rows)
    }
}

impl Iterator for BatchStream {
    type Item = Result<RecordBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        let rows = match self.fill_batch() {
            Ok(rows) => rows,
            Err(e) => {
                self.finished = true;
                return Some(Err(e));
            },
        };

        // A short or empty batch means end of input
        if self.finished {
            if let Err(e) = self.check_tolerance() {
                return Some(Err(e));
            }
        }
        if rows.is_empty() {
            return None;
        }

        let batch = RecordBatch {
            source: self.source.clone(),
            schema: self.schema,
            sequence: self.next_sequence,
            rows,
        };
        self.next_sequence += 1;
        self.stats.batches += 1;
        self.stats.rows_emitted += batch.len() as u64;
        Some(Ok(batch))
    }
}
