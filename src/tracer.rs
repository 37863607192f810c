// Copyright 2026 Alexander Orlov <alexander.orlov@loxal.net>

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use crossbeam_channel::{bounded, Sender};
use tracing::warn;

use crate::record::Record;

pub const CHANNEL_CAPACITY: usize = 1024;

/// Output serialization of the trace destination.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Format {
    Csv,
    Json,
}

/// Asynchronous trace sink. `trace` enqueues onto a bounded channel; a
/// single writer thread drains it in FIFO order and serializes each record
/// to the destination. Destination write failures drop the record and are
/// never reported back to the file system handlers.
#[derive(Debug)]
pub struct Tracer {
    tx: RwLock<Option<Sender<Record>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    dropped: Arc<AtomicU64>,
}

impl Tracer {
    pub fn new(format: Format, destination: &str) -> Result<Tracer> {
        let dest = open_trace_destination(destination)?;
        Ok(Tracer::with_writer(format, dest))
    }

    pub fn with_writer(format: Format, dest: Box<dyn Write + Send>) -> Tracer {
        let (tx, rx) = bounded::<Record>(CHANNEL_CAPACITY);
        let dropped = Arc::new(AtomicU64::new(0));
        let counter = dropped.clone();
        let handle = thread::spawn(move || {
            let mut dest = dest;
            for record in rx {
                if write_record(&mut dest, format, &record).is_err() {
                    counter.fetch_add(1, Ordering::Relaxed);
                }
            }
            let _ = dest.flush();
        });
        Tracer {
            tx: RwLock::new(Some(tx)),
            writer: Mutex::new(Some(handle)),
            dropped,
        }
    }

    /// Hands one record to the collector. Blocks at most for an enqueue
    /// onto the bounded channel.
    pub fn trace(&self, record: Record) {
        if let Some(tx) = self.tx.read().unwrap().as_ref() {
            let _ = tx.send(record);
        }
    }

    /// Number of records dropped because the destination failed.
    pub fn dropped_records(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Drains any queued records, stops the writer and closes the
    /// destination.
    pub fn close(&self) {
        self.tx.write().unwrap().take();
        if let Some(handle) = self.writer.lock().unwrap().take() {
            let _ = handle.join();
        }
        let dropped = self.dropped_records();
        if dropped > 0 {
            warn!(dropped, "trace records were dropped on destination write errors");
        }
    }
}

impl Drop for Tracer {
    fn drop(&mut self) {
        self.close();
    }
}

fn write_record(dest: &mut Box<dyn Write + Send>, format: Format, record: &Record) -> io::Result<()> {
    match format {
        Format::Json => {
            serde_json::to_writer(&mut *dest, record).map_err(io::Error::other)?;
            dest.write_all(b"\n")
        }
        Format::Csv => {
            let line = csv_line(&record.to_csv());
            dest.write_all(line.as_bytes())?;
            dest.flush()
        }
    }
}

fn csv_line(fields: &[String]) -> String {
    let mut line = fields.iter().map(|f| csv_field(f)).collect::<Vec<_>>().join(",");
    line.push('\n');
    line
}

// Standard CSV quoting: fields containing a comma, quote or line break are
// wrapped in double quotes, embedded quotes doubled.
fn csv_field(field: &str) -> String {
    if field.contains(['"', ',', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

fn open_trace_destination(path: &str) -> Result<Box<dyn Write + Send>> {
    if path.is_empty() || path == "-" {
        return Ok(Box::new(io::stdout()));
    }
    let abspath = if Path::new(path).is_absolute() {
        path.to_string()
    } else {
        std::env::current_dir()
            .with_context(|| format!("could not retrieve absolute path for '{path}'"))?
            .join(path)
            .to_string_lossy()
            .into_owned()
    };
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .mode(0o640)
        .open(&abspath)
        .with_context(|| format!("could not open file '{path}' for writing"))?;
    Ok(Box::new(file))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{OpFields, ProcessInfo, Record};
    use chrono::Utc;

    #[derive(Clone)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct FailingSink;

    impl Write for FailingSink {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::from_raw_os_error(libc::ENOSPC))
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn record(path: &str) -> Record {
        let mut rec = Record::new(
            ProcessInfo { uid: 0, gid: 0, pid: 1 },
            Utc::now(),
            path,
            false,
            OpFields::Flush,
        );
        rec.set_time_end();
        rec
    }

    #[test]
    fn json_records_are_newline_delimited_in_fifo_order() {
        let buf = SharedBuf(Arc::new(Mutex::new(Vec::new())));
        let tracer = Tracer::with_writer(Format::Json, Box::new(buf.clone()));
        for i in 0..10 {
            tracer.trace(record(&format!("/p/{i}")));
        }
        tracer.close();

        let out = buf.0.lock().unwrap().clone();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 10);
        for (i, line) in lines.iter().enumerate() {
            let value: serde_json::Value = serde_json::from_str(line).unwrap();
            assert_eq!(value["op"]["path"], format!("/p/{i}"));
        }
    }

    #[test]
    fn csv_records_are_quoted_and_flushed_per_record() {
        let buf = SharedBuf(Arc::new(Mutex::new(Vec::new())));
        let tracer = Tracer::with_writer(Format::Csv, Box::new(buf.clone()));
        tracer.trace(record("/with,comma"));
        tracer.trace(record("/with\"quote"));
        tracer.close();

        let out = buf.0.lock().unwrap().clone();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("\"/with,comma\""));
        assert!(lines[1].contains("\"/with\"\"quote\""));
    }

    #[test]
    fn close_drains_queued_records() {
        let buf = SharedBuf(Arc::new(Mutex::new(Vec::new())));
        let tracer = Tracer::with_writer(Format::Json, Box::new(buf.clone()));
        for i in 0..500 {
            tracer.trace(record(&format!("/drain/{i}")));
        }
        tracer.close();
        let out = buf.0.lock().unwrap().clone();
        assert_eq!(String::from_utf8(out).unwrap().lines().count(), 500);
    }

    #[test]
    fn tracing_after_close_is_a_no_op() {
        let buf = SharedBuf(Arc::new(Mutex::new(Vec::new())));
        let tracer = Tracer::with_writer(Format::Json, Box::new(buf.clone()));
        tracer.close();
        tracer.trace(record("/late"));
        assert!(buf.0.lock().unwrap().is_empty());
    }

    #[test]
    fn destination_failures_drop_records_silently() {
        let tracer = Tracer::with_writer(Format::Json, Box::new(FailingSink));
        for _ in 0..5 {
            tracer.trace(record("/lost"));
        }
        tracer.close();
        assert_eq!(tracer.dropped_records(), 5);
    }

    #[test]
    fn csv_field_quoting_rules() {
        assert_eq!(csv_field("plain"), "plain");
        assert_eq!(csv_field("a,b"), "\"a,b\"");
        assert_eq!(csv_field("say \"hi\""), "\"say \"\"hi\"\"\"");
        assert_eq!(csv_field("line\nbreak"), "\"line\nbreak\"");
    }

    #[test]
    fn stdout_destination_token() {
        // '-' selects standard output and must not fail
        assert!(open_trace_destination("-").is_ok());
        assert!(open_trace_destination("").is_ok());
    }
}
