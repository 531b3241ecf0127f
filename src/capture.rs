//! Frame acquisition.
//!
//! The monitor loop consumes frames through the [`FrameSource`] trait so the
//! same loop runs against a live pcap device or a recorded packet dump. Both
//! sources deliver timestamps as 100 ns ticks since the Unix epoch.

use std::fs::File;
use std::io::{self, BufReader, ErrorKind, Read};
use std::path::Path;

use tracing::{debug, info};

use crate::core::Ticks;

/// One captured frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Capture timestamp in ticks.
    pub timestamp: Ticks,
    /// On-the-wire length, which may exceed `data.len()` when the capture
    /// snaplen truncated the frame.
    pub declared_len: u32,
    /// Captured bytes, starting at the Ethernet header.
    pub data: Vec<u8>,
}

/// Outcome of one poll of a frame source.
#[derive(Debug)]
pub enum Poll {
    Frame(Frame),
    /// The read timeout elapsed with no traffic. Not an error; the caller
    /// gets control back to check its termination flag.
    TimedOut,
    /// The source is exhausted (end of a replay file).
    EndOfStream,
}

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("failed to open capture source: {0}")]
    Open(#[source] pcap::Error),
    #[error("capture read failed: {0}")]
    Read(#[source] pcap::Error),
    #[error("replay read failed: {0}")]
    Io(#[from] io::Error),
}

/// A blocking, single-consumer stream of frames.
pub trait FrameSource: Send {
    /// Block until a frame arrives, the read timeout fires, or the stream
    /// ends. Never blocks longer than the source's read timeout.
    fn next_frame(&mut self) -> Result<Poll, CaptureError>;

    /// Release the underlying handle. Further polls are undefined.
    fn close(&mut self);
}

/// Live capture from a network interface.
pub struct DeviceSource {
    capture: Option<pcap::Capture<pcap::Active>>,
    device: String,
}

impl DeviceSource {
    /// Open `device` with the given snaplen and read timeout.
    pub fn open(
        device: &str,
        snaplen: i32,
        read_timeout_ms: i32,
        promiscuous: bool,
    ) -> Result<Self, CaptureError> {
        let capture = pcap::Capture::from_device(device)
            .map_err(CaptureError::Open)?
            .promisc(promiscuous)
            .snaplen(snaplen)
            .timeout(read_timeout_ms)
            .open()
            .map_err(CaptureError::Open)?;
        info!(device, snaplen, read_timeout_ms, "capture opened");
        Ok(Self {
            capture: Some(capture),
            device: device.to_string(),
        })
    }
}

impl FrameSource for DeviceSource {
    fn next_frame(&mut self) -> Result<Poll, CaptureError> {
        let capture = match self.capture.as_mut() {
            Some(c) => c,
            None => return Ok(Poll::EndOfStream),
        };
        match capture.next_packet() {
            Ok(packet) => Ok(Poll::Frame(Frame {
                timestamp: timeval_to_ticks(
                    packet.header.ts.tv_sec as i64,
                    packet.header.ts.tv_usec as i64,
                ),
                declared_len: packet.header.len,
                data: packet.data.to_vec(),
            })),
            Err(pcap::Error::TimeoutExpired) => Ok(Poll::TimedOut),
            Err(pcap::Error::NoMorePackets) => Ok(Poll::EndOfStream),
            Err(e) => Err(CaptureError::Read(e)),
        }
    }

    fn close(&mut self) {
        if self.capture.take().is_some() {
            debug!(device = %self.device, "capture closed");
        }
    }
}

/// Replays frames from a packet dump written by a previous run.
///
/// Record layout matches the dump writer: little-endian i64 timestamp,
/// i32 declared length, i32 captured length, then the captured bytes.
pub struct ReplaySource {
    reader: Option<BufReader<File>>,
}

/// Upper bound on a stored record's length. Dump records hold at most one
/// frame, so anything past jumbo-frame scale marks a corrupt file.
const MAX_REPLAY_RECORD_BYTES: i32 = 262_144;

impl ReplaySource {
    pub fn open(path: &Path) -> Result<Self, CaptureError> {
        let file = File::open(path)?;
        info!(path = %path.display(), "replaying packet dump");
        Ok(Self {
            reader: Some(BufReader::new(file)),
        })
    }
}

impl FrameSource for ReplaySource {
    fn next_frame(&mut self) -> Result<Poll, CaptureError> {
        let reader = match self.reader.as_mut() {
            Some(r) => r,
            None => return Ok(Poll::EndOfStream),
        };
        let mut ts_buf = [0u8; 8];
        // Clean end of file lands between records.
        match reader.read_exact(&mut ts_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(Poll::EndOfStream),
            Err(e) => return Err(e.into()),
        }
        let mut len_buf = [0u8; 4];
        reader.read_exact(&mut len_buf)?;
        let declared_len = i32::from_le_bytes(len_buf) as u32;
        reader.read_exact(&mut len_buf)?;
        let captured_len = i32::from_le_bytes(len_buf);
        if !(0..=MAX_REPLAY_RECORD_BYTES).contains(&captured_len) {
            return Err(io::Error::new(
                ErrorKind::InvalidData,
                format!("corrupt dump record: stored length {captured_len}"),
            )
            .into());
        }
        let mut data = vec![0u8; captured_len as usize];
        reader.read_exact(&mut data)?;
        Ok(Poll::Frame(Frame {
            timestamp: i64::from_le_bytes(ts_buf),
            declared_len,
            data,
        }))
    }

    fn close(&mut self) {
        self.reader = None;
    }
}

/// Capture timestamps arrive as a timeval; expiry math runs on ticks.
fn timeval_to_ticks(tv_sec: i64, tv_usec: i64) -> Ticks {
    tv_sec * 10_000_000 + tv_usec * 10
}

/// Names of capture-capable interfaces on this host.
pub fn list_devices() -> Result<Vec<String>, CaptureError> {
    let devices = pcap::Device::list().map_err(CaptureError::Open)?;
    Ok(devices.into_iter().map(|d| d.name).collect())
}
