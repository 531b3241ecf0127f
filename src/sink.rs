//! On-disk outputs: the flow log, the raw packet dump, and the error log.
//!
//! The flow log and the packet dump rotate on the local calendar date; both
//! take their file stem from the wall clock at write time, so a run that
//! crosses midnight splits its output across two dated files.

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, Utc};
use tracing::info;

use crate::capture::Frame;
use crate::core::{FlowStats, Ticks, TICKS_PER_SECOND};

const SOFTWARE_HEADER: &str = "#Software: NetMon";
const VERSION_HEADER: &str = "#Version: 1.1.0000";
const FIELDS_HEADER: &str = "#Fields: Start\tDuration (ms)\tSource IP\tSource Port\tDestination IP\tDestination Port\tIP Protocol\tPackets\tOctets";

/// Bytes of each frame kept in the dump under normal operation.
pub const DUMP_SNAP_BYTES: usize = 64;

fn ticks_to_local(ticks: Ticks) -> DateTime<Local> {
    let secs = ticks.div_euclid(TICKS_PER_SECOND);
    let nanos = (ticks.rem_euclid(TICKS_PER_SECOND) * 100) as u32;
    DateTime::<Utc>::from_timestamp(secs, nanos)
        .unwrap_or_default()
        .with_timezone(&Local)
}

fn today_stem() -> String {
    Local::now().format("%Y%m%d").to_string()
}

/// Tab-separated log of completed flows, one file per calendar day.
///
/// A freshly created file starts with three `#`-prefixed header lines;
/// reopening an existing day's file appends rows without repeating them.
pub struct FlowLog {
    dir: PathBuf,
    stem: String,
    writer: Option<BufWriter<File>>,
}

impl FlowLog {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            stem: String::new(),
            writer: None,
        }
    }

    /// Append one completed flow as a log row.
    pub fn write_flow(&mut self, stats: &FlowStats) -> io::Result<()> {
        let stem = today_stem();
        if self.writer.is_none() || stem != self.stem {
            self.roll(&stem)?;
        }
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| io::Error::other("flow log writer missing after roll"))?;
        writeln!(
            writer,
            "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
            ticks_to_local(stats.first_seen).format("%Y-%m-%d %H:%M:%S%.3f"),
            stats.duration_ms(),
            stats.key.src_addr,
            stats.key.src_port,
            stats.key.dst_addr,
            stats.key.dst_port,
            u8::from(stats.key.protocol),
            stats.packets,
            stats.bytes,
        )
    }

    pub fn flush(&mut self) -> io::Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush()?;
        }
        Ok(())
    }

    pub fn close(&mut self) -> io::Result<()> {
        self.flush()?;
        self.writer = None;
        Ok(())
    }

    fn roll(&mut self, stem: &str) -> io::Result<()> {
        self.close()?;
        std::fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(format!("{stem}.log"));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let is_new = file.metadata()?.len() == 0;
        let mut writer = BufWriter::new(file);
        if is_new {
            writeln!(writer, "{SOFTWARE_HEADER}")?;
            writeln!(writer, "{VERSION_HEADER}")?;
            writeln!(writer, "{FIELDS_HEADER}")?;
        }
        info!(path = %path.display(), "flow log rolled");
        self.stem = stem.to_string();
        self.writer = Some(writer);
        Ok(())
    }
}

/// Binary dump of raw frames, one file per calendar day next to the flow log.
///
/// Record layout: little-endian i64 capture timestamp in ticks, i32 wire
/// length, i32 stored length, then the stored bytes. Frames are normally
/// snapped to [`DUMP_SNAP_BYTES`]; frames that failed dissection are stored
/// whole so the offending bytes can be replayed.
pub struct PacketDump {
    dir: PathBuf,
    stem: String,
    file: Option<File>,
}

impl PacketDump {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            stem: String::new(),
            file: None,
        }
    }

    /// Record a frame, keeping at most [`DUMP_SNAP_BYTES`] of payload.
    pub fn write_frame(&mut self, frame: &Frame) -> io::Result<()> {
        let keep = frame.data.len().min(DUMP_SNAP_BYTES);
        self.write_record(frame, &frame.data[..keep])
    }

    /// Record a frame in full, ignoring the snap limit.
    pub fn write_frame_uncapped(&mut self, frame: &Frame) -> io::Result<()> {
        self.write_record(frame, &frame.data)
    }

    fn write_record(&mut self, frame: &Frame, stored: &[u8]) -> io::Result<()> {
        let stem = today_stem();
        if self.file.is_none() || stem != self.stem {
            self.roll(&stem)?;
        }
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::other("packet dump file missing after roll"))?;
        file.write_all(&frame.timestamp.to_le_bytes())?;
        file.write_all(&(frame.declared_len as i32).to_le_bytes())?;
        file.write_all(&(stored.len() as i32).to_le_bytes())?;
        file.write_all(stored)?;
        // Each record is flushed so a crash loses at most the frame in hand.
        file.flush()
    }

    pub fn close(&mut self) -> io::Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush()?;
        }
        Ok(())
    }

    fn roll(&mut self, stem: &str) -> io::Result<()> {
        self.close()?;
        std::fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(format!("{stem}.dat"));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        info!(path = %path.display(), "packet dump rolled");
        self.stem = stem.to_string();
        self.file = Some(file);
        Ok(())
    }
}

/// Append-only record of per-frame processing failures.
///
/// One line per failure: wall-clock time, capture timestamp in ticks, and
/// the error text. Lives at `error.log` in the flow log directory and is
/// never rotated.
pub struct ErrorLog {
    path: PathBuf,
    file: Option<File>,
}

impl ErrorLog {
    pub fn new(dir: &Path) -> Self {
        Self {
            path: dir.join("error.log"),
            file: None,
        }
    }

    pub fn record(&mut self, frame_time: Ticks, message: &str) -> io::Result<()> {
        if self.file.is_none() {
            if let Some(parent) = self.path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            self.file = Some(
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&self.path)?,
            );
        }
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::other("error log file missing"))?;
        writeln!(
            file,
            "{}\t{}\t{}",
            Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            frame_time,
            message,
        )?;
        file.flush()
    }
}
