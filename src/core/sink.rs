//! Persistence sinks
//!
//! Append-only writers for decoded records, plus the consumer thread that
//! drains a [`SampleStream`] into one of them.

use crate::core::channel::{Heartbeat, Record, SampleStream};
use crate::core::timeline::Sample;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};
use thiserror::Error;
use tracing::{debug, error, info};

/// CSV header, shared by sample and heartbeat rows
pub const CSV_HEADER: &str =
    "kind,timestamp,packet_id,sensor_id,reading_index,meat_temp,fire_temp,message";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Sink errors
#[derive(Error, Debug)]
pub enum SinkError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Destination for decoded records
pub trait SampleSink: Send {
    /// Append one reconstructed reading
    fn write_sample(&mut self, sample: &Sample) -> Result<(), SinkError>;

    /// Append one heartbeat
    fn write_heartbeat(&mut self, heartbeat: &Heartbeat) -> Result<(), SinkError>;

    /// Push buffered rows to storage
    fn flush(&mut self) -> Result<(), SinkError>;

    /// Dispatch a channel record
    fn write_record(&mut self, record: &Record) -> Result<(), SinkError> {
        match record {
            Record::Sample(sample) => self.write_sample(sample),
            Record::Heartbeat(heartbeat) => self.write_heartbeat(heartbeat),
        }
    }
}

/// Output file format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordFormat {
    /// Comma separated values with a header row
    #[default]
    Csv,
    /// One JSON object per line
    JsonLines,
}

impl RecordFormat {
    /// Get file extension for format
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Csv => "csv",
            Self::JsonLines => "jsonl",
        }
    }
}

/// Record writer over any byte sink
pub struct RecordWriter<W: Write> {
    out: W,
    format: RecordFormat,
    flush_every: usize,
    pending: usize,
    written: u64,
}

/// Record writer appending to a file
pub type FileSink = RecordWriter<BufWriter<File>>;

impl<W: Write> RecordWriter<W> {
    /// Wrap a writer. The CSV header is emitted when `write_header` is set.
    pub fn new(mut out: W, format: RecordFormat, write_header: bool) -> Result<Self, SinkError> {
        if format == RecordFormat::Csv && write_header {
            writeln!(out, "{CSV_HEADER}")?;
        }
        Ok(Self {
            out,
            format,
            flush_every: 1,
            pending: 0,
            written: 0,
        })
    }

    /// Flush after this many records (at least 1)
    #[must_use]
    pub fn flush_every(mut self, records: usize) -> Self {
        self.flush_every = records.max(1);
        self
    }

    /// Records written so far
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Output format
    pub fn format(&self) -> RecordFormat {
        self.format
    }

    /// Unwrap the inner writer
    pub fn into_inner(self) -> W {
        self.out
    }

    fn finish_row(&mut self) -> Result<(), SinkError> {
        self.written += 1;
        self.pending += 1;
        if self.pending >= self.flush_every {
            self.flush_out()?;
        }
        Ok(())
    }

    fn flush_out(&mut self) -> Result<(), SinkError> {
        self.pending = 0;
        self.out.flush()?;
        Ok(())
    }
}

impl FileSink {
    /// Open `path` for appending
    pub fn open(path: &Path, format: RecordFormat) -> Result<Self, SinkError> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let empty = file.metadata()?.len() == 0;
        info!(path = %path.display(), format = ?format, "Writing records");
        Self::new(BufWriter::new(file), format, empty)
    }
}

impl<W: Write + Send> SampleSink for RecordWriter<W> {
    fn write_sample(&mut self, sample: &Sample) -> Result<(), SinkError> {
        match self.format {
            RecordFormat::Csv => writeln!(
                self.out,
                "sample,{},{},{},{},{:.1},{:.1},",
                sample.timestamp.format(TIMESTAMP_FORMAT),
                sample.packet_id,
                sample.sensor_id,
                sample.reading_index,
                sample.meat_temp,
                sample.fire_temp
            )?,
            RecordFormat::JsonLines => {
                serde_json::to_writer(&mut self.out, &Record::Sample(sample.clone()))?;
                writeln!(self.out)?;
            }
        }
        self.finish_row()
    }

    fn write_heartbeat(&mut self, heartbeat: &Heartbeat) -> Result<(), SinkError> {
        match self.format {
            RecordFormat::Csv => writeln!(
                self.out,
                "heartbeat,{},{},,,,,{}",
                heartbeat.timestamp.format(TIMESTAMP_FORMAT),
                heartbeat.sequence_id,
                csv_field(&heartbeat.text)
            )?,
            RecordFormat::JsonLines => {
                serde_json::to_writer(&mut self.out, &Record::Heartbeat(heartbeat.clone()))?;
                writeln!(self.out)?;
            }
        }
        self.finish_row()
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        self.flush_out()
    }
}

fn csv_field(text: &str) -> String {
    if text.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", text.replace('"', "\"\""))
    } else {
        text.to_string()
    }
}

/// Default output file name for a run started at `now`
pub fn default_output_path(dir: &Path, format: RecordFormat, now: DateTime<Local>) -> PathBuf {
    dir.join(format!(
        "readings_{}.{}",
        now.format("%Y%m%d_%H%M%S"),
        format.extension()
    ))
}

/// Drain `stream` into `sink` on a dedicated thread until the channel closes.
///
/// Returns the number of records written. A sink error ends this consumer
/// only; the subscription is dropped and the producer stops feeding it.
pub fn spawn_sink_consumer<S>(
    stream: SampleStream,
    mut sink: S,
) -> std::io::Result<JoinHandle<Result<u64, SinkError>>>
where
    S: SampleSink + 'static,
{
    let name = format!("sink-{}", stream.name());
    thread::Builder::new().name(name).spawn(move || {
        let mut count = 0u64;
        for record in stream.iter() {
            if let Err(e) = sink.write_record(&record) {
                error!(subscriber = stream.name(), error = %e, "Sink write failed");
                return Err(e);
            }
            count += 1;
        }
        sink.flush()?;
        debug!(subscriber = stream.name(), records = count, "Sink drained");
        Ok(count)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::channel::SampleChannel;
    use crate::core::stop::StopSignal;
    use chrono::TimeZone;

    fn at() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 6, 1, 12, 0, 4).unwrap()
    }

    fn sample() -> Sample {
        Sample {
            timestamp: at(),
            meat_temp: 63.5,
            fire_temp: 110.0,
            sensor_id: 2,
            packet_id: 17,
            reading_index: 4,
        }
    }

    #[test]
    fn test_csv_rows() {
        let mut writer = RecordWriter::new(Vec::new(), RecordFormat::Csv, true).unwrap();
        writer.write_sample(&sample()).unwrap();
        writer
            .write_heartbeat(&Heartbeat {
                timestamp: at(),
                sequence_id: 9,
                text: "up 5s, rssi -61".into(),
            })
            .unwrap();

        let text = String::from_utf8(writer.into_inner()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], CSV_HEADER);
        assert_eq!(lines[1], "sample,2024-06-01 12:00:04,17,2,4,63.5,110.0,");
        assert_eq!(lines[2], "heartbeat,2024-06-01 12:00:04,9,,,,,\"up 5s, rssi -61\"");
    }

    #[test]
    fn test_json_lines_parse_back() {
        let mut writer = RecordWriter::new(Vec::new(), RecordFormat::JsonLines, true).unwrap();
        writer.write_sample(&sample()).unwrap();

        let text = String::from_utf8(writer.into_inner()).unwrap();
        let record: Record = serde_json::from_str(text.trim_end()).unwrap();
        assert_eq!(record, Record::Sample(sample()));
        assert!(text.contains("\"kind\":\"sample\""));
    }

    #[test]
    fn test_flush_every_batches_rows() {
        let out = BufWriter::new(Vec::new());
        let mut writer = RecordWriter::new(out, RecordFormat::Csv, false)
            .unwrap()
            .flush_every(2);

        writer.write_sample(&sample()).unwrap();
        let out = writer.into_inner();
        assert!(out.get_ref().is_empty());
        assert!(!out.buffer().is_empty());

        let mut writer = RecordWriter::new(out, RecordFormat::Csv, false)
            .unwrap()
            .flush_every(2);
        writer.write_sample(&sample()).unwrap();
        writer.write_sample(&sample()).unwrap();
        let out = writer.into_inner();
        assert!(out.buffer().is_empty());
        assert_eq!(String::from_utf8_lossy(out.get_ref()).lines().count(), 3);
    }

    #[test]
    fn test_file_sink_appends_without_second_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");

        for _ in 0..2 {
            let mut sink = FileSink::open(&path, RecordFormat::Csv).unwrap();
            sink.write_sample(&sample()).unwrap();
            sink.flush().unwrap();
        }

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().filter(|l| *l == CSV_HEADER).count(), 1);
        assert_eq!(text.lines().count(), 3);
    }

    #[test]
    fn test_consumer_drains_until_close() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.jsonl");
        let channel = SampleChannel::default();
        let stop = StopSignal::new();

        let sink = FileSink::open(&path, RecordFormat::JsonLines).unwrap().flush_every(10);
        let handle = spawn_sink_consumer(channel.subscribe("file"), sink).unwrap();

        for _ in 0..3 {
            channel.publish(Record::Sample(sample()), &stop);
        }
        channel.close();

        assert_eq!(handle.join().unwrap().unwrap(), 3);
        assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), 3);
    }

    #[test]
    fn test_default_output_path() {
        let path = default_output_path(Path::new("/data"), RecordFormat::JsonLines, at());
        assert_eq!(path, Path::new("/data/readings_20240601_120004.jsonl"));
    }
}
