//! Per-flow network traffic accountant.
//!
//! Captures Ethernet frames, dissects IPv4 TCP and UDP headers, charges
//! each packet to a directional 5-tuple flow, and writes flows that go
//! idle to a date-rotated tab-separated log. Optionally keeps a raw
//! binary dump of every frame that can be replayed through the same
//! accounting pipeline.

pub mod capture;
pub mod cli;
pub mod config;
pub mod core;
pub mod flow;
pub mod monitor;
pub mod sink;

pub use capture::{DeviceSource, Frame, FrameSource, Poll, ReplaySource};
pub use config::Config;
pub use core::{FlowKey, FlowStats, IpProtocol, Ticks, TICKS_PER_SECOND};
pub use flow::FlowTable;
pub use monitor::{Monitor, MonitorReport, MonitorState};
