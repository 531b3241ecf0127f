//! Core packet and flow types.
//!
//! Stateless frame dissection plus the value types shared by the
//! flow table and the log sink.

pub mod dissect;
pub mod flow;

pub use dissect::{dissect, Dissected, DissectError, EthernetView, Ipv4View, TcpView, UdpView};
pub use flow::{FlowKey, FlowStats, IpProtocol, Ticks, TICKS_PER_SECOND};
