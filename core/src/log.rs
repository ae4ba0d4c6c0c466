//! Container log parsing.
//!
//! Two on-disk formats coexist, and a rotated file may mix them, so the
//! format is decided per line:
//!
//! - Docker JSON lines: `{"log":"content\n","stream":"stdout","time":"2016-10-20T18:39:20.57606443Z"}`
//! - CRI plaintext: `2016-10-06T00:17:09.669794202Z stdout The content of the log entry 1`
//!
//! Records come back in file line order. Timestamps are not checked for
//! monotonicity.

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use crate::error::{CriTestError, Result};

/// Output stream a log record was written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamType {
    Stdout,
    Stderr,
}

impl std::fmt::Display for StreamType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stdout => write!(f, "stdout"),
            Self::Stderr => write!(f, "stderr"),
        }
    }
}

impl std::str::FromStr for StreamType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "stdout" => Ok(Self::Stdout),
            "stderr" => Ok(Self::Stderr),
            _ => Err(format!("unknown stream '{}' (expected stdout or stderr)", s)),
        }
    }
}

/// A single Docker JSON log entry, as written to disk.
#[derive(Debug, Serialize, Deserialize)]
pub struct LogEntry {
    /// The log message (including trailing newline).
    pub log: String,
    /// The output stream: "stdout" or "stderr".
    pub stream: String,
    /// RFC 3339 timestamp with nanosecond precision.
    pub time: String,
}

/// Canonical parsed log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub timestamp: DateTime<FixedOffset>,
    pub stream: StreamType,
    pub log: Vec<u8>,
}

/// On-disk format of a single log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Docker `json-file` driver line.
    DockerJson,
    /// CRI plaintext line.
    Cri,
}

impl LogFormat {
    /// Classify a raw line by its first character.
    pub fn detect(line: &str) -> Self {
        if line.starts_with('{') {
            Self::DockerJson
        } else {
            Self::Cri
        }
    }

    /// Parse a line already known to be in this format.
    pub fn parse(self, line: &str) -> std::result::Result<LogRecord, String> {
        match self {
            Self::DockerJson => parse_docker_json(line),
            Self::Cri => parse_cri(line),
        }
    }
}

/// Parse one raw log line.
///
/// Malformed lines are reported as line 1; use [`parse_file`] or
/// [`LogReader`] for file positions.
pub fn parse_line(line: &str) -> Result<LogRecord> {
    parse_numbered(line, 1)
}

/// Parse every line of a log file, in order.
///
/// The first malformed line aborts the parse.
pub fn parse_file(path: &Path) -> Result<Vec<LogRecord>> {
    let records = LogReader::open(path)?.collect::<Result<Vec<_>>>()?;
    tracing::debug!(path = %path.display(), records = records.len(), "Parsed container log");
    Ok(records)
}

/// Finite iterator over the records of a log file.
///
/// Opening the same path again starts over from the first line.
pub struct LogReader {
    path: PathBuf,
    reader: BufReader<File>,
    buf: Vec<u8>,
    line_no: usize,
    failed: bool,
}

impl LogReader {
    /// Open a log file for reading from the beginning.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            reader: BufReader::new(file),
            buf: Vec::new(),
            line_no: 0,
            failed: false,
        })
    }

    /// Path this reader was opened on.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Iterator for LogReader {
    type Item = Result<LogRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        self.buf.clear();
        match self.reader.read_until(b'\n', &mut self.buf) {
            Ok(0) => return None,
            Ok(_) => {}
            Err(e) => {
                self.failed = true;
                return Some(Err(e.into()));
            }
        }
        self.line_no += 1;
        if self.buf.ends_with(b"\n") {
            self.buf.pop();
            if self.buf.ends_with(b"\r") {
                self.buf.pop();
            }
        }
        let line = match std::str::from_utf8(&self.buf) {
            Ok(line) => line,
            Err(e) => {
                self.failed = true;
                return Some(Err(CriTestError::MalformedLogError {
                    line: self.line_no,
                    message: format!("line is not valid UTF-8: {}", e),
                }));
            }
        };
        let result = parse_numbered(line, self.line_no);
        if result.is_err() {
            self.failed = true;
        }
        Some(result)
    }
}

fn parse_numbered(line: &str, line_no: usize) -> Result<LogRecord> {
    LogFormat::detect(line)
        .parse(line)
        .map_err(|message| CriTestError::MalformedLogError {
            line: line_no,
            message,
        })
}

fn parse_docker_json(line: &str) -> std::result::Result<LogRecord, String> {
    let entry: LogEntry =
        serde_json::from_str(line).map_err(|e| format!("invalid JSON log entry: {}", e))?;
    Ok(LogRecord {
        timestamp: parse_timestamp(&entry.time)?,
        stream: entry.stream.parse()?,
        log: entry.log.into_bytes(),
    })
}

fn parse_cri(line: &str) -> std::result::Result<LogRecord, String> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 3 {
        return Err(format!(
            "expected at least 3 fields (timestamp, stream, message), found {}",
            fields.len()
        ));
    }

    let mut log = fields[2..].join(" ");
    log.push('\n');

    Ok(LogRecord {
        timestamp: parse_timestamp(fields[0])?,
        stream: fields[1].parse()?,
        log: log.into_bytes(),
    })
}

fn parse_timestamp(s: &str) -> std::result::Result<DateTime<FixedOffset>, String> {
    DateTime::parse_from_rfc3339(s).map_err(|e| format!("invalid timestamp '{}': {}", s, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};
    use std::io::Write;

    fn write_log(lines: &[&str]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for line in lines {
            writeln!(file, "{}", line).unwrap();
        }
        file
    }

    #[test]
    fn test_detect_format() {
        assert_eq!(LogFormat::detect(r#"{"log":"x"}"#), LogFormat::DockerJson);
        assert_eq!(
            LogFormat::detect("2016-10-06T00:17:09.669794202Z stdout x"),
            LogFormat::Cri
        );
        // Leading whitespace is not JSON
        assert_eq!(LogFormat::detect(r#" {"log":"x"}"#), LogFormat::Cri);
    }

    #[test]
    fn test_parse_docker_json_line() {
        let record =
            parse_line(r#"{"log":"hi\n","stream":"stdout","time":"2020-01-01T00:00:00Z"}"#)
                .unwrap();
        assert_eq!(record.stream, StreamType::Stdout);
        assert_eq!(record.log, b"hi\n");
        assert_eq!(record.timestamp.year(), 2020);
    }

    #[test]
    fn test_parse_docker_json_keeps_payload_verbatim() {
        let record = parse_line(
            r#"{"log":"  two  spaces\tand tab","stream":"stderr","time":"2016-10-20T18:39:20.57606443Z"}"#,
        )
        .unwrap();
        assert_eq!(record.stream, StreamType::Stderr);
        assert_eq!(record.log, b"  two  spaces\tand tab");
        assert_eq!(record.timestamp.nanosecond(), 576_064_430);
    }

    #[test]
    fn test_parse_cri_line() {
        let record =
            parse_line("2016-10-06T00:17:09.669794202Z stdout The content of the log entry 1")
                .unwrap();
        assert_eq!(record.stream, StreamType::Stdout);
        assert_eq!(record.log, b"The content of the log entry 1\n");
        assert_eq!(record.timestamp.nanosecond(), 669_794_202);
    }

    #[test]
    fn test_parse_cri_collapses_whitespace() {
        let record =
            parse_line("2016-10-06T00:17:10.113242941Z stderr  spaced    out   words").unwrap();
        assert_eq!(record.stream, StreamType::Stderr);
        assert_eq!(record.log, b"spaced out words\n");
    }

    #[test]
    fn test_parse_cri_too_few_fields() {
        let err = parse_line("2016-10-06T00:17:09.669794202Z stdout").unwrap_err();
        assert!(matches!(err, CriTestError::MalformedLogError { line: 1, .. }));
    }

    #[test]
    fn test_parse_cri_bad_timestamp() {
        let err = parse_line("yesterday stdout hello").unwrap_err();
        assert!(err.to_string().contains("invalid timestamp"));
    }

    #[test]
    fn test_parse_unknown_stream() {
        let err = parse_line("2016-10-06T00:17:09.669794202Z stdlog hello").unwrap_err();
        assert!(err.to_string().contains("unknown stream"));
    }

    #[test]
    fn test_parse_broken_json() {
        let err = parse_line(r#"{"log":"hi\n","stream":"#).unwrap_err();
        assert!(matches!(err, CriTestError::MalformedLogError { .. }));
    }

    #[test]
    fn test_parse_json_missing_field() {
        let err = parse_line(r#"{"log":"hi\n","stream":"stdout"}"#).unwrap_err();
        assert!(err.to_string().contains("invalid JSON log entry"));
    }

    #[test]
    fn test_parse_file_mixed_formats_in_order() {
        let file = write_log(&[
            r#"{"log":"first\n","stream":"stdout","time":"2016-10-20T18:39:20.57606443Z"}"#,
            "2016-10-06T00:17:09.669794202Z stderr second line",
            r#"{"log":"third\n","stream":"stderr","time":"2016-10-20T18:39:20.57606444Z"}"#,
        ]);

        let records = parse_file(file.path()).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].log, b"first\n");
        assert_eq!(records[1].log, b"second line\n");
        assert_eq!(records[1].stream, StreamType::Stderr);
        assert_eq!(records[2].log, b"third\n");
        // Second record is older than the first; order still follows the file
        assert!(records[1].timestamp < records[0].timestamp);
    }

    #[test]
    fn test_parse_file_aborts_on_malformed_line() {
        let file = write_log(&[
            "2016-10-06T00:17:09.669794202Z stdout ok",
            "garbage",
            "2016-10-06T00:17:10.669794202Z stdout never reached",
        ]);

        let err = parse_file(file.path()).unwrap_err();
        assert!(matches!(err, CriTestError::MalformedLogError { line: 2, .. }));
    }

    #[test]
    fn test_invalid_utf8_line_is_malformed() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"2016-10-06T00:17:09.669794202Z stdout ok\n").unwrap();
        file.write_all(b"2016-10-06T00:17:10.669794202Z stdout \xff\xfe\n").unwrap();

        let err = parse_file(file.path()).unwrap_err();
        assert!(
            matches!(err, CriTestError::MalformedLogError { line: 2, .. }),
            "unexpected error: {}",
            err
        );
    }

    #[test]
    fn test_reader_strips_crlf() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"2016-10-06T00:17:09.669794202Z stderr windows\r\n").unwrap();

        let records = parse_file(file.path()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].stream, StreamType::Stderr);
        assert_eq!(records[0].log, b"windows\n".to_vec());
    }

    #[test]
    fn test_reader_stops_after_error() {
        let file = write_log(&["bad", "2016-10-06T00:17:09.669794202Z stdout ok"]);
        let mut reader = LogReader::open(file.path()).unwrap();
        assert!(reader.next().unwrap().is_err());
        assert!(reader.next().is_none());
    }

    #[test]
    fn test_reader_is_restartable() {
        let file = write_log(&[
            "2016-10-06T00:17:09.669794202Z stdout one",
            "2016-10-06T00:17:10.669794202Z stdout two",
        ]);

        let first: Vec<_> = LogReader::open(file.path())
            .unwrap()
            .map(|r| r.unwrap())
            .collect();
        let second: Vec<_> = LogReader::open(file.path())
            .unwrap()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(first, second);
        assert_eq!(first.len(), 2);
    }

    #[test]
    fn test_parse_file_missing() {
        let err = parse_file(Path::new("/nonexistent/a3s-critest.log")).unwrap_err();
        assert!(matches!(err, CriTestError::IoError(_)));
    }

    #[test]
    fn test_empty_file_has_no_records() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert!(parse_file(file.path()).unwrap().is_empty());
    }

    #[test]
    fn test_stream_type_display_roundtrip() {
        for stream in [StreamType::Stdout, StreamType::Stderr] {
            assert_eq!(stream.to_string().parse::<StreamType>().unwrap(), stream);
        }
    }
}
