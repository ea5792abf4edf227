use std::{
    fmt,
    fs::{self, File, OpenOptions},
    io::{self, BufRead, BufReader, Write},
    path::{Path, PathBuf},
    str::FromStr,
};

use chrono::{DateTime, TimeZone};
use serde::{Deserialize, Serialize};

use crate::{LoggerError, PlaybackPosition, Result};

/// First line of every log file.
pub const LOG_HEADER: &str =
    "Timestamp, X, Y, Z, MediaTimestamp, CalculatedMediaTimestamp, TrackName";

const FIELD_SEPARATOR: &str = ", ";
const FIELD_COUNT: usize = 7;
const MAX_NAME_SUFFIX: u32 = 999;

/// `{deviceIdentity}_{yyyy-MM-dd_HH-mm}.txt`
pub fn log_file_name<Tz: TimeZone>(device_identity: &str, started: &DateTime<Tz>) -> String
where
    Tz::Offset: fmt::Display,
{
    format!("{device_identity}_{}.txt", started.format("%Y-%m-%d_%H-%M"))
}

/// One correlated row of the log. The playback fields are `None` while no
/// clip is playing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub wall_clock_millis: i64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub media_position_millis: Option<u64>,
    pub computed_elapsed_millis: Option<u64>,
    pub clip_name: Option<String>,
}

impl LogRecord {
    pub fn new(
        wall_clock_millis: i64,
        [x, y, z]: [f64; 3],
        position: Option<PlaybackPosition>,
    ) -> Self {
        let (media, elapsed, name) = match position {
            Some(position) => (
                Some(position.media_position_millis),
                Some(position.elapsed_since_clip_start_millis),
                Some(position.clip_name),
            ),
            None => (None, None, None),
        };
        Self {
            wall_clock_millis,
            x,
            y,
            z,
            media_position_millis: media,
            computed_elapsed_millis: elapsed,
            clip_name: name,
        }
    }
}

/// Renders the record as one log line without the trailing newline. Absent
/// playback fields become empty placeholders so every line has seven fields.
impl fmt::Display for LogRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{sep}{:?}{sep}{:?}{sep}{:?}{sep}{}{sep}{}{sep}{}",
            self.wall_clock_millis,
            self.x,
            self.y,
            self.z,
            OptionalField(&self.media_position_millis),
            OptionalField(&self.computed_elapsed_millis),
            OptionalField(&self.clip_name),
            sep = FIELD_SEPARATOR,
        )
    }
}

struct OptionalField<'a, T>(&'a Option<T>);

impl<T: fmt::Display> fmt::Display for OptionalField<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(value) => value.fmt(f),
            None => Ok(()),
        }
    }
}

impl FromStr for LogRecord {
    type Err = LoggerError;

    fn from_str(line: &str) -> Result<Self> {
        let fields: Vec<&str> = line.splitn(FIELD_COUNT, FIELD_SEPARATOR).collect();
        if fields.len() != FIELD_COUNT {
            return Err(LoggerError::msg(format!(
                "expected {FIELD_COUNT} fields, found {} in `{line}`",
                fields.len()
            )));
        }

        fn parse<T: FromStr>(field: &str, name: &str) -> Result<T> {
            field
                .trim()
                .parse()
                .map_err(|_| LoggerError::msg(format!("invalid {name} field `{field}`")))
        }
        fn optional<T: FromStr>(field: &str, name: &str) -> Result<Option<T>> {
            if field.trim().is_empty() {
                Ok(None)
            } else {
                parse(field, name).map(Some)
            }
        }

        let clip_name = fields[6].trim_end_matches(|c| c == '\r' || c == '\n');
        Ok(Self {
            wall_clock_millis: parse(fields[0], "timestamp")?,
            x: parse(fields[1], "x")?,
            y: parse(fields[2], "y")?,
            z: parse(fields[3], "z")?,
            media_position_millis: optional(fields[4], "media timestamp")?,
            computed_elapsed_millis: optional(fields[5], "calculated media timestamp")?,
            clip_name: (!clip_name.is_empty()).then(|| clip_name.to_string()),
        })
    }
}

/// Append-only writer for one test run's log file. Each record is written as
/// a single complete line, so a crash loses at most the line in flight.
#[derive(Debug)]
pub struct RecordWriter {
    path: PathBuf,
    file: File,
    sync_interval: u32,
    since_sync: u32,
    records_written: u64,
}

impl RecordWriter {
    /// Creates the file at `path` and writes the header. An existing file is
    /// never overwritten. On failure no file handle stays open and a
    /// partially written file is removed.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        Self::with_sync_interval(path, 0)
    }

    /// Like [`RecordWriter::open`], additionally syncing file data to disk
    /// every `sync_interval` appends. Zero leaves flushing to the OS.
    pub fn with_sync_interval(path: impl Into<PathBuf>, sync_interval: u32) -> Result<Self> {
        let path = path.into();
        let create_error = |source| LoggerError::LogCreate {
            path: path.clone(),
            source,
        };

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(create_error)?;

        let header = format!("{LOG_HEADER}\n");
        if let Err(err) = file.write_all(header.as_bytes()).and_then(|_| file.sync_data()) {
            drop(file);
            let is_regular = fs::metadata(&path).map(|m| m.is_file()).unwrap_or(false);
            if is_regular {
                let _ = fs::remove_file(&path);
            }
            return Err(create_error(err));
        }

        tracing::info!(?path, "log file created");
        Ok(Self::from_file(path, file, sync_interval))
    }

    /// Like [`RecordWriter::with_sync_interval`], but when `path` is taken by
    /// an earlier run the log goes to `{stem}_{n}.{ext}` for the first free
    /// `n` instead.
    pub fn create_unique(path: impl Into<PathBuf>, sync_interval: u32) -> Result<Self> {
        let path = path.into();
        let mut candidate = path.clone();
        for n in 1..=MAX_NAME_SUFFIX {
            match Self::with_sync_interval(&candidate, sync_interval) {
                Err(LoggerError::LogCreate { source, .. })
                    if source.kind() == io::ErrorKind::AlreadyExists =>
                {
                    candidate = numbered_path(&path, n);
                }
                other => return other,
            }
        }
        Self::with_sync_interval(candidate, sync_interval)
    }

    /// Wraps an already opened file whose header has been written.
    pub(crate) fn from_file(path: PathBuf, file: File, sync_interval: u32) -> Self {
        Self {
            path,
            file,
            sync_interval,
            since_sync: 0,
            records_written: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn records_written(&self) -> u64 {
        self.records_written
    }

    pub fn append(&mut self, record: &LogRecord) -> Result<()> {
        let line = format!("{record}\n");
        self.file
            .write_all(line.as_bytes())
            .map_err(LoggerError::LogWrite)?;
        self.records_written += 1;

        if self.sync_interval > 0 {
            self.since_sync += 1;
            if self.since_sync >= self.sync_interval {
                self.since_sync = 0;
                self.file.sync_data().map_err(LoggerError::LogWrite)?;
            }
        }
        Ok(())
    }

    /// Flushes outstanding data and closes the file.
    pub fn close(mut self) -> Result<PathBuf> {
        self.file.flush()?;
        self.file.sync_all()?;
        tracing::info!(path = ?self.path, records = self.records_written, "log file closed");
        Ok(self.path)
    }
}

fn numbered_path(path: &Path, n: u32) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|stem| stem.to_string_lossy())
        .unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{stem}_{n}.{}", ext.to_string_lossy()),
        None => format!("{stem}_{n}"),
    };
    path.with_file_name(name)
}

/// Contents of a log file as read back from disk.
#[derive(Debug, Clone, PartialEq)]
pub struct LogContents {
    pub header: String,
    pub records: Vec<LogRecord>,
}

/// Reads a log file written by [`RecordWriter`].
pub fn read_log(path: impl AsRef<Path>) -> Result<LogContents> {
    let reader = BufReader::new(File::open(path.as_ref())?);
    let mut lines = reader.lines();

    let header = lines
        .next()
        .transpose()?
        .ok_or_else(|| LoggerError::msg("log file is empty"))?;

    let mut records = Vec::new();
    for line in lines {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        records.push(line.parse()?);
    }

    Ok(LogContents { header, records })
}

#[cfg(test)]
mod tests {
    use chrono::{FixedOffset, Utc};

    use super::*;

    fn playing(wall: i64) -> LogRecord {
        LogRecord {
            wall_clock_millis: wall,
            x: 0.125,
            y: -9.81,
            z: 3.0,
            media_position_millis: Some(480),
            computed_elapsed_millis: Some(492),
            clip_name: Some("train_a".to_string()),
        }
    }

    fn idle(wall: i64) -> LogRecord {
        LogRecord::new(wall, [0.0, 1.5, -2.25], None)
    }

    #[test]
    fn formats_lines_with_placeholders() {
        assert_eq!(
            playing(1).to_string(),
            "1, 0.125, -9.81, 3.0, 480, 492, train_a"
        );
        assert_eq!(idle(2).to_string(), "2, 0.0, 1.5, -2.25, , , ");
    }

    #[test]
    fn round_trips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.txt");

        let records = vec![idle(10), playing(11), playing(12), idle(13)];
        let mut writer = RecordWriter::open(&path).unwrap();
        for record in &records {
            writer.append(record).unwrap();
        }
        assert_eq!(writer.records_written(), 4);
        writer.close().unwrap();

        let contents = read_log(&path).unwrap();
        assert_eq!(contents.header, LOG_HEADER);
        assert_eq!(contents.records, records);
    }

    #[test]
    fn header_is_written_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.txt");
        let writer = RecordWriter::with_sync_interval(&path, 1).unwrap();
        drop(writer);

        assert_eq!(fs::read_to_string(&path).unwrap(), format!("{LOG_HEADER}\n"));
    }

    #[test]
    fn unwritable_path_fails_with_create_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("run.txt");

        let err = RecordWriter::open(&path).unwrap_err();
        assert!(matches!(err, LoggerError::LogCreate { .. }));
        assert!(!path.exists());
    }

    #[test]
    fn existing_log_is_never_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Rig_2024-03-07_09-05.txt");
        let mut first = RecordWriter::open(&path).unwrap();
        first.append(&playing(1)).unwrap();
        first.close().unwrap();

        let err = RecordWriter::open(&path).unwrap_err();
        assert!(matches!(err, LoggerError::LogCreate { .. }));

        let second = RecordWriter::create_unique(&path, 0).unwrap();
        assert_eq!(second.path(), dir.path().join("Rig_2024-03-07_09-05_1.txt"));
        let third = RecordWriter::create_unique(&path, 0).unwrap();
        assert_eq!(third.path(), dir.path().join("Rig_2024-03-07_09-05_2.txt"));

        assert_eq!(read_log(&path).unwrap().records, vec![playing(1)]);
    }

    #[test]
    fn clip_names_keep_trailing_spaces() {
        let mut record = playing(5);
        record.clip_name = Some("train_a  ".to_string());

        let parsed: LogRecord = record.to_string().parse().unwrap();
        assert_eq!(parsed.clip_name.as_deref(), Some("train_a  "));
        let parsed: LogRecord = format!("{record}\r\n").parse().unwrap();
        assert_eq!(parsed.clip_name.as_deref(), Some("train_a  "));
    }

    #[test]
    fn rejects_truncated_lines() {
        assert!("1, 2.0, 3.0".parse::<LogRecord>().is_err());
    }

    #[test]
    fn file_name_uses_minute_resolution() {
        let started = FixedOffset::east_opt(0)
            .unwrap()
            .with_ymd_and_hms(2024, 3, 7, 9, 5, 59)
            .unwrap();
        assert_eq!(
            log_file_name("Google_Pixel 7", &started),
            "Google_Pixel 7_2024-03-07_09-05.txt"
        );
        assert!(log_file_name("dev", &Utc::now()).starts_with("dev_"));
    }
}
