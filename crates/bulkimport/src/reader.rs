//! Streaming reader for delimited source files.
//!
//! The `csv` crate drops blank lines silently, but blank lines have to be
//! counted, so physical lines are first joined into logical records (a
//! quoted field may span lines) and each record is then parsed on its own.

use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::ImporterConfig;
use crate::error::ReaderError;

/// Read buffer size. Coalesces small reads on large files.
pub const READ_BUFFER_BYTES: usize = 8 * 1024;

/// Per-job parsing configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParseOptions {
    pub delimiter: u8,
    pub enclosure: u8,
    /// Escape byte inside enclosed fields. Doubled enclosures are always
    /// accepted as well.
    pub escape: Option<u8>,
    /// Discard the first record unconditionally, even if it is blank.
    pub skip_header: bool,
    pub chunk_size: usize,
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self {
            delimiter: b',',
            enclosure: b'"',
            escape: None,
            skip_header: true,
            chunk_size: 250,
        }
    }
}

impl ParseOptions {
    pub fn validate(&self) -> Result<(), ReaderError> {
        check_control_byte("delimiter", self.delimiter)?;
        check_control_byte("enclosure", self.enclosure)?;
        if let Some(escape) = self.escape {
            check_control_byte("escape", escape)?;
        }
        if self.delimiter == self.enclosure {
            return Err(ReaderError::InvalidOption {
                name: "enclosure",
                value: (self.enclosure as char).to_string(),
            });
        }
        if self.chunk_size == 0 {
            return Err(ReaderError::InvalidOption {
                name: "chunk_size",
                value: "0".to_string(),
            });
        }
        Ok(())
    }

    /// Parses a stored single-character option such as `","` or `"\t"`.
    pub fn byte_from_str(name: &'static str, value: &str) -> Result<u8, ReaderError> {
        let mut chars = value.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) if c.is_ascii() => Ok(c as u8),
            _ => Err(ReaderError::InvalidOption {
                name,
                value: value.to_string(),
            }),
        }
    }
}

fn check_control_byte(name: &'static str, byte: u8) -> Result<(), ReaderError> {
    if !byte.is_ascii() || byte == b'\n' || byte == b'\r' {
        return Err(ReaderError::InvalidOption {
            name,
            value: (byte as char).escape_default().to_string(),
        });
    }
    Ok(())
}

/// Bounded retry for opening the source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenRetry {
    pub attempts: u32,
    pub delay: Duration,
}

impl OpenRetry {
    pub fn from_config(config: &ImporterConfig) -> Self {
        Self {
            attempts: config.open_retry_attempts.max(1),
            delay: config.open_retry_delay(),
        }
    }

    /// A single attempt with no delay.
    pub fn once() -> Self {
        Self {
            attempts: 1,
            delay: Duration::ZERO,
        }
    }
}

/// One parsed record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    fields: Vec<String>,
    line: u64,
}

impl Row {
    pub fn new(fields: Vec<String>, line: u64) -> Self {
        Self { fields, line }
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.fields.get(index).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Physical line the record starts on (1-based).
    pub fn line(&self) -> u64 {
        self.line
    }

    /// True iff at least one field is non-empty after trimming.
    pub fn has_content(&self) -> bool {
        self.fields.iter().any(|f| !f.trim().is_empty())
    }

    pub fn into_fields(self) -> Vec<String> {
        self.fields
    }
}

/// Record stream over a delimited source.
pub struct CsvSource<R = File> {
    input: BufReader<R>,
    options: ParseOptions,
    path: PathBuf,
    line: u64,
    buf: Vec<u8>,
}

impl CsvSource<File> {
    /// Opens `path`, retrying transient failures.
    pub fn open(path: &Path, options: ParseOptions, retry: OpenRetry) -> Result<Self, ReaderError> {
        options.validate()?;
        let file = open_with_retry(path, retry)?;
        Ok(Self::with_path(file, options, path.to_path_buf()))
    }
}

impl<R: Read> CsvSource<R> {
    pub fn from_reader(reader: R, options: ParseOptions) -> Self {
        Self::with_path(reader, options, PathBuf::from("<reader>"))
    }

    fn with_path(reader: R, options: ParseOptions, path: PathBuf) -> Self {
        Self {
            input: BufReader::with_capacity(READ_BUFFER_BYTES, reader),
            options,
            path,
            line: 0,
            buf: Vec::new(),
        }
    }

    pub fn options(&self) -> &ParseOptions {
        &self.options
    }

    /// Returns the next record, or `None` at end of input.
    pub fn next_record(&mut self) -> Result<Option<Row>, ReaderError> {
        self.buf.clear();
        let start_line = self.line + 1;
        let mut in_quotes = false;

        loop {
            let read = self
                .input
                .read_until(b'\n', &mut self.buf)
                .map_err(|e| ReaderError::Io {
                    path: self.path.clone(),
                    source: e,
                })?;
            if read == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                break;
            }
            self.line += 1;

            let from = self.buf.len() - read;
            in_quotes = scan_quotes(&self.buf[from..], in_quotes, &self.options);
            if !in_quotes {
                break;
            }
        }

        parse_record(&self.buf, &self.options, start_line).map(Some)
    }
}

impl<R: Read> Iterator for CsvSource<R> {
    type Item = Result<Row, ReaderError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record().transpose()
    }
}

/// Tracks whether a line ends inside an enclosed field. An enclosure only
/// opens a field at its first byte, matching how the record parser reads it.
fn scan_quotes(line: &[u8], mut in_quotes: bool, options: &ParseOptions) -> bool {
    let mut at_field_start = !in_quotes;
    let mut i = 0;
    while i < line.len() {
        let b = line[i];
        if in_quotes {
            if Some(b) == options.escape && b != options.enclosure {
                i += 1;
            } else if b == options.enclosure {
                if line.get(i + 1) == Some(&options.enclosure) {
                    i += 1;
                } else {
                    in_quotes = false;
                }
            }
        } else if b == options.enclosure && at_field_start {
            in_quotes = true;
        }
        at_field_start = !in_quotes && b == options.delimiter;
        i += 1;
    }
    in_quotes
}

fn parse_record(raw: &[u8], options: &ParseOptions, line: u64) -> Result<Row, ReaderError> {
    let trimmed = trim_line_end(raw);
    if trimmed.is_empty() {
        return Ok(Row::new(Vec::new(), line));
    }

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .delimiter(options.delimiter)
        .quote(options.enclosure)
        .escape(options.escape)
        .from_reader(trimmed);

    let mut record = csv::ByteRecord::new();
    let found = reader
        .read_byte_record(&mut record)
        .map_err(|e| ReaderError::Malformed {
            line,
            reason: e.to_string(),
        })?;
    if !found {
        return Ok(Row::new(Vec::new(), line));
    }

    let fields = record
        .iter()
        .map(|f| String::from_utf8_lossy(f).into_owned())
        .collect();
    Ok(Row::new(fields, line))
}

fn trim_line_end(raw: &[u8]) -> &[u8] {
    let mut end = raw.len();
    while end > 0 && (raw[end - 1] == b'\n' || raw[end - 1] == b'\r') {
        end -= 1;
    }
    &raw[..end]
}

fn open_with_retry(path: &Path, retry: OpenRetry) -> Result<File, ReaderError> {
    let attempts = retry.attempts.max(1);
    let mut attempt = 1;
    loop {
        match try_open(path) {
            Ok(file) => return Ok(file),
            Err(e) if attempt >= attempts => return Err(e),
            Err(e) => {
                log::warn!(
                    "Opening {} failed (attempt {}/{}): {}",
                    path.display(),
                    attempt,
                    attempts,
                    e
                );
                std::thread::sleep(retry.delay);
                attempt += 1;
            }
        }
    }
}

fn try_open(path: &Path) -> Result<File, ReaderError> {
    match std::fs::metadata(path) {
        Ok(meta) if meta.is_dir() => {
            return Err(ReaderError::NotReadable {
                path: path.to_path_buf(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "is a directory"),
            })
        }
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ReaderError::NotFound(path.to_path_buf()))
        }
        Err(_) => {}
    }

    File::open(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => ReaderError::NotFound(path.to_path_buf()),
        _ => ReaderError::NotReadable {
            path: path.to_path_buf(),
            source: e,
        },
    })
}

/// Counts the rows a processing pass would hand to the row handler:
/// the header record is dropped if configured, then only content rows
/// are counted.
pub fn count_records(
    path: &Path,
    options: ParseOptions,
    retry: OpenRetry,
) -> Result<u64, ReaderError> {
    let mut source = CsvSource::open(path, options, retry)?;
    count_source(&mut source)
}

pub(crate) fn count_source<R: Read>(source: &mut CsvSource<R>) -> Result<u64, ReaderError> {
    if source.options().skip_header {
        source.next_record()?;
    }
    let mut total = 0;
    while let Some(row) = source.next_record()? {
        if row.has_content() {
            total += 1;
        }
    }
    Ok(total)
}
