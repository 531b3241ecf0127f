//! The accounting loop.
//!
//! One thread pulls frames from a [`FrameSource`], dissects them, charges
//! them to flows, and sweeps idle flows out to the flow log. Expiry is
//! driven entirely by capture timestamps: a flow is written out the first
//! time a later frame (or the final drain) observes it has been quiet for
//! the configured window. No background timer exists; with no traffic,
//! nothing expires until shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use tracing::{debug, info, warn};

use crate::capture::{Frame, FrameSource, Poll};
use crate::core::{dissect, DissectError, Dissected, FlowKey, Ticks};
use crate::flow::FlowTable;
use crate::sink::{ErrorLog, FlowLog, PacketDump};

/// Lifecycle of a monitor. States advance one way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    /// Constructed, not yet polling.
    Opening,
    /// Polling the frame source.
    Running,
    /// Source released or stop requested; flushing resident flows.
    Draining,
    /// All outputs flushed and closed.
    Closed,
}

/// Counters accumulated over one monitor run.
#[derive(Debug, Clone, Default)]
pub struct MonitorReport {
    /// Frames pulled from the source.
    pub frames: u64,
    /// Frames that were not IPv4 TCP or UDP.
    pub ignored: u64,
    /// Frames whose headers could not be read.
    pub dissect_errors: u64,
    /// Flow rows written, expiry and drain combined.
    pub flows_logged: u64,
}

pub struct Monitor {
    source: Box<dyn FrameSource>,
    table: FlowTable,
    log: FlowLog,
    dump: Option<PacketDump>,
    errors: ErrorLog,
    expiry_ticks: Ticks,
    stop: Arc<AtomicBool>,
    state: MonitorState,
    report: MonitorReport,
}

impl Monitor {
    pub fn new(
        source: Box<dyn FrameSource>,
        log: FlowLog,
        dump: Option<PacketDump>,
        errors: ErrorLog,
        expiry_ticks: Ticks,
    ) -> Self {
        Self {
            source,
            table: FlowTable::new(),
            log,
            dump,
            errors,
            expiry_ticks,
            stop: Arc::new(AtomicBool::new(false)),
            state: MonitorState::Opening,
            report: MonitorReport::default(),
        }
    }

    /// Shared flag that asks the running loop to wind down. The loop notices
    /// within one source read timeout.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn state(&self) -> MonitorState {
        self.state
    }

    /// Run to completion: poll until the source ends or a stop is requested,
    /// then drain every resident flow to the log and close all outputs.
    ///
    /// A capture failure still drains and closes before the error surfaces,
    /// so flows observed up to the failure are not lost.
    pub fn run(&mut self) -> anyhow::Result<MonitorReport> {
        self.state = MonitorState::Running;
        info!(expiry_ticks = self.expiry_ticks, "monitor running");
        let loop_result = self.run_loop();

        self.state = MonitorState::Draining;
        info!(resident = self.table.len(), "draining flow table");
        let drain_result = self.drain();

        self.source.close();
        if let Err(e) = self.log.close() {
            warn!(error = %e, "flow log close failed");
        }
        if let Some(dump) = self.dump.as_mut() {
            if let Err(e) = dump.close() {
                warn!(error = %e, "packet dump close failed");
            }
        }
        self.state = MonitorState::Closed;
        info!(
            frames = self.report.frames,
            flows = self.report.flows_logged,
            "monitor closed"
        );

        loop_result?;
        drain_result?;
        Ok(self.report.clone())
    }

    fn run_loop(&mut self) -> anyhow::Result<()> {
        while !self.stop.load(Ordering::Relaxed) {
            match self.source.next_frame() {
                Ok(Poll::Frame(frame)) => self.process_frame(&frame)?,
                Ok(Poll::TimedOut) => continue,
                Ok(Poll::EndOfStream) => {
                    debug!("frame source exhausted");
                    break;
                }
                Err(e) => return Err(e).context("frame source failed"),
            }
        }
        Ok(())
    }

    fn process_frame(&mut self, frame: &Frame) -> anyhow::Result<()> {
        self.report.frames += 1;
        if let Some(dump) = self.dump.as_mut() {
            dump.write_frame(frame).context("packet dump write failed")?;
        }

        match dissect(&frame.data) {
            Ok(Dissected::Tcp { ip, tcp }) => {
                let key = FlowKey::from_tcp(&ip, &tcp);
                self.account(&key, frame.timestamp, u64::from(ip.total_len()));
            }
            Ok(Dissected::Udp { ip, udp }) => {
                let key = FlowKey::from_udp(&ip, &udp);
                self.account(&key, frame.timestamp, u64::from(ip.total_len()));
            }
            Ok(Dissected::NotApplicable) => {
                self.report.ignored += 1;
            }
            Err(e) => {
                self.record_dissect_error(frame, &e)?;
            }
        }

        self.sweep(frame.timestamp)?;
        self.log.flush().context("flow log flush failed")
    }

    fn account(&mut self, key: &FlowKey, packet_time: Ticks, ip_bytes: u64) {
        let stats = self.table.resolve(key, packet_time);
        stats.last_seen = packet_time;
        stats.packets += 1;
        stats.bytes += ip_bytes;
    }

    /// A malformed frame is logged and preserved whole in the dump; it never
    /// stops the loop or touches the flow table.
    fn record_dissect_error(&mut self, frame: &Frame, err: &DissectError) -> anyhow::Result<()> {
        self.report.dissect_errors += 1;
        self.errors
            .record(frame.timestamp, &err.to_string())
            .context("error log write failed")?;
        if let Some(dump) = self.dump.as_mut() {
            dump.write_frame_uncapped(frame)
                .context("packet dump write failed")?;
        }
        Ok(())
    }

    fn sweep(&mut self, now: Ticks) -> anyhow::Result<()> {
        let cutoff = now - self.expiry_ticks;
        while let Some(stats) = self.table.expire_tail(cutoff) {
            debug!(flow = %stats.key, packets = stats.packets, "flow expired");
            self.log
                .write_flow(&stats)
                .context("flow log write failed")?;
            self.report.flows_logged += 1;
        }
        Ok(())
    }

    fn drain(&mut self) -> anyhow::Result<()> {
        while let Some(stats) = self.table.pop_tail() {
            self.log
                .write_flow(&stats)
                .context("flow log write failed")?;
            self.report.flows_logged += 1;
        }
        self.log.flush().context("flow log flush failed")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::CaptureError;
    use crate::core::TICKS_PER_SECOND;
    use std::collections::VecDeque;

    /// Feeds a prepared poll sequence, then ends the stream or fails.
    struct ScriptedSource {
        polls: VecDeque<Poll>,
        fail_at_end: bool,
        closed: bool,
    }

    impl ScriptedSource {
        fn new(polls: Vec<Poll>) -> Self {
            Self {
                polls: polls.into(),
                fail_at_end: false,
                closed: false,
            }
        }

        fn failing(polls: Vec<Poll>) -> Self {
            Self {
                polls: polls.into(),
                fail_at_end: true,
                closed: false,
            }
        }
    }

    impl FrameSource for ScriptedSource {
        fn next_frame(&mut self) -> Result<Poll, CaptureError> {
            match self.polls.pop_front() {
                Some(poll) => Ok(poll),
                None if self.fail_at_end => Err(CaptureError::Read(pcap::Error::PcapError(
                    "device went away".to_string(),
                ))),
                None => Ok(Poll::EndOfStream),
            }
        }

        fn close(&mut self) {
            self.closed = true;
        }
    }

    fn udp_frame(sport: u16, dport: u16, payload_len: usize) -> Vec<u8> {
        let total_len = 20 + 8 + payload_len;
        let mut frame = Vec::new();
        frame.extend_from_slice(&[0u8; 12]); // MACs
        frame.extend_from_slice(&0x0800u16.to_be_bytes());
        let mut ip = vec![0u8; 20];
        ip[0] = 0x45;
        ip[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
        ip[9] = 17;
        ip[12..16].copy_from_slice(&[10, 0, 0, 1]);
        ip[16..20].copy_from_slice(&[10, 0, 0, 2]);
        frame.extend_from_slice(&ip);
        frame.extend_from_slice(&sport.to_be_bytes());
        frame.extend_from_slice(&dport.to_be_bytes());
        frame.extend_from_slice(&((8 + payload_len) as u16).to_be_bytes());
        frame.extend_from_slice(&[0, 0]); // checksum
        frame.extend_from_slice(&vec![0xEE; payload_len]);
        frame
    }

    fn frame_at(t: Ticks, data: Vec<u8>) -> Poll {
        Poll::Frame(Frame {
            timestamp: t,
            declared_len: data.len() as u32,
            data,
        })
    }

    fn monitor_over(dir: &std::path::Path, polls: Vec<Poll>, expiry: Ticks) -> Monitor {
        Monitor::new(
            Box::new(ScriptedSource::new(polls)),
            FlowLog::new(dir),
            Some(PacketDump::new(dir)),
            ErrorLog::new(dir),
            expiry,
        )
    }

    fn log_rows(dir: &std::path::Path) -> Vec<String> {
        let stem = chrono::Local::now().format("%Y%m%d").to_string();
        let text = std::fs::read_to_string(dir.join(format!("{stem}.log"))).unwrap();
        text.lines()
            .filter(|l| !l.starts_with('#'))
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_expiry_writes_accumulated_flow() {
        // Two packets of one flow 100 ms apart, then an unrelated frame far
        // enough in the future to expire it.
        let dir = tempfile::tempdir().unwrap();
        let t0 = 1_700_000_000 * TICKS_PER_SECOND;
        let polls = vec![
            frame_at(t0, udp_frame(5000, 53, 40)),
            frame_at(t0 + TICKS_PER_SECOND / 10, udp_frame(5000, 53, 60)),
            frame_at(t0 + 60 * TICKS_PER_SECOND, udp_frame(7000, 53, 10)),
        ];
        let mut monitor = monitor_over(dir.path(), polls, 30 * TICKS_PER_SECOND);
        let report = monitor.run().unwrap();

        assert_eq!(report.frames, 3);
        assert_eq!(report.flows_logged, 2); // one expired, one drained
        let rows = log_rows(dir.path());
        assert_eq!(rows.len(), 2);
        let fields: Vec<&str> = rows[0].split('\t').collect();
        assert_eq!(fields[1], "100"); // duration ms
        assert_eq!(fields[3], "5000");
        assert_eq!(fields[6], "17");
        assert_eq!(fields[7], "2");
        // Octets are IP-layer lengths: (20+8+40) + (20+8+60).
        assert_eq!(fields[8], "156");
    }

    #[test]
    fn test_request_and_reply_are_two_rows() {
        let dir = tempfile::tempdir().unwrap();
        let mut reply = udp_frame(53, 5000, 40);
        reply[26..30].copy_from_slice(&[10, 0, 0, 2]);
        reply[30..34].copy_from_slice(&[10, 0, 0, 1]);
        let polls = vec![
            frame_at(0, udp_frame(5000, 53, 40)),
            frame_at(1, reply),
        ];
        let mut monitor = monitor_over(dir.path(), polls, 30 * TICKS_PER_SECOND);
        let report = monitor.run().unwrap();
        assert_eq!(report.flows_logged, 2);
    }

    #[test]
    fn test_malformed_frame_is_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let mut short = udp_frame(5000, 53, 0);
        short.truncate(20); // cut into the IPv4 header
        let polls = vec![
            frame_at(0, udp_frame(6000, 53, 10)),
            frame_at(1, short),
            frame_at(2, udp_frame(6000, 53, 10)),
        ];
        let mut monitor = monitor_over(dir.path(), polls, 30 * TICKS_PER_SECOND);
        let report = monitor.run().unwrap();

        assert_eq!(report.dissect_errors, 1);
        assert_eq!(report.flows_logged, 1);
        let rows = log_rows(dir.path());
        let fields: Vec<&str> = rows[0].split('\t').collect();
        assert_eq!(fields[7], "2"); // both good frames counted

        let errors = std::fs::read_to_string(dir.path().join("error.log")).unwrap();
        assert_eq!(errors.lines().count(), 1);
    }

    #[test]
    fn test_non_ip_frames_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let mut arp = vec![0u8; 42];
        arp[12] = 0x08;
        arp[13] = 0x06;
        let polls = vec![frame_at(0, arp)];
        let mut monitor = monitor_over(dir.path(), polls, 30 * TICKS_PER_SECOND);
        let report = monitor.run().unwrap();
        assert_eq!(report.ignored, 1);
        assert_eq!(report.flows_logged, 0);
        assert_eq!(report.dissect_errors, 0);
    }

    #[test]
    fn test_timeout_has_no_side_effects() {
        // A timeout returns control but must not advance expiry or counters.
        let dir = tempfile::tempdir().unwrap();
        let polls = vec![
            frame_at(0, udp_frame(5000, 53, 10)),
            Poll::TimedOut,
            Poll::TimedOut,
            frame_at(1, udp_frame(5000, 53, 10)),
        ];
        let mut monitor = monitor_over(dir.path(), polls, 30 * TICKS_PER_SECOND);
        let report = monitor.run().unwrap();
        assert_eq!(report.frames, 2);
        assert_eq!(report.flows_logged, 1);
    }

    #[test]
    fn test_drain_flushes_every_resident_flow() {
        let dir = tempfile::tempdir().unwrap();
        let polls = vec![
            frame_at(0, udp_frame(1000, 53, 10)),
            frame_at(1, udp_frame(2000, 53, 10)),
            frame_at(2, udp_frame(3000, 53, 10)),
        ];
        let mut monitor = monitor_over(dir.path(), polls, 30 * TICKS_PER_SECOND);
        let report = monitor.run().unwrap();
        assert_eq!(report.flows_logged, 3);
        assert_eq!(monitor.state(), MonitorState::Closed);
        // Drain writes oldest flow first.
        let rows = log_rows(dir.path());
        let first_port: Vec<&str> = rows[0].split('\t').collect();
        assert_eq!(first_port[3], "1000");
    }

    #[test]
    fn test_stop_flag_halts_loop_and_drains() {
        let dir = tempfile::tempdir().unwrap();
        let polls = vec![frame_at(0, udp_frame(1000, 53, 10))];
        let mut monitor = monitor_over(dir.path(), polls, 30 * TICKS_PER_SECOND);
        monitor.stop_flag().store(true, Ordering::Relaxed);
        let report = monitor.run().unwrap();
        // Loop exits before polling; the resident table is still empty,
        // but state must still reach Closed.
        assert_eq!(report.frames, 0);
        assert_eq!(monitor.state(), MonitorState::Closed);
    }

    #[test]
    fn test_capture_failure_drains_before_propagating() {
        // A fatal source error surfaces from run(), but flows accounted up
        // to that point must still reach the log.
        let dir = tempfile::tempdir().unwrap();
        let polls = vec![frame_at(0, udp_frame(4000, 53, 10))];
        let mut monitor = Monitor::new(
            Box::new(ScriptedSource::failing(polls)),
            FlowLog::new(dir.path()),
            None,
            ErrorLog::new(dir.path()),
            30 * TICKS_PER_SECOND,
        );
        let err = monitor.run().unwrap_err();
        assert!(err.to_string().contains("frame source failed"));
        assert_eq!(monitor.state(), MonitorState::Closed);

        let rows = log_rows(dir.path());
        assert_eq!(rows.len(), 1);
        let fields: Vec<&str> = rows[0].split('\t').collect();
        assert_eq!(fields[3], "4000");
    }

    #[test]
    fn test_dump_records_every_frame() {
        let dir = tempfile::tempdir().unwrap();
        let polls = vec![
            frame_at(0, udp_frame(1000, 53, 100)),
            frame_at(1, udp_frame(1000, 53, 100)),
        ];
        let mut monitor = monitor_over(dir.path(), polls, 30 * TICKS_PER_SECOND);
        monitor.run().unwrap();

        let stem = chrono::Local::now().format("%Y%m%d").to_string();
        let bytes = std::fs::read(dir.path().join(format!("{stem}.dat"))).unwrap();
        // Two snapped records: header 16 bytes + 64 stored bytes each.
        assert_eq!(bytes.len(), 2 * (16 + 64));
    }
}
