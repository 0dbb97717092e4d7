//! Core library for PPP Multilink bundling.
//!
//! This library splits outbound packets across several physical links and puts
//! inbound fragments back together, whatever order the links deliver them in.
//!
//! # Architecture
//!
//! The library is organized into several key modules:
//!
//! - `sequence`: Fragment sequence numbers and the wrap-aware ordering between them
//! - `proto`: Multilink fragment header codec (short and long sequence formats)
//! - `link`: Member link state and peer identity
//! - `reorder`: Reassembly of inbound fragments into whole packets
//! - `scheduler`: Distribution of outbound packets over idle member links
//! - `session`: Bundle-wide state, link join/leave and the entry points above
//! - `transport`: The send path the scheduler drives, with a UDP implementation
//! - `handoff`: Passing a link to the process that already owns its session
//! - `control`: Engine and daemon configuration
//!
//! # Example
//!
//! ```
//! use multilink_core::{LinkParams, MultilinkConfig, MultilinkSession, PeerId, SeqWidth};
//!
//! let mut session = MultilinkSession::new(MultilinkConfig::default());
//! let params = LinkParams {
//!     seq_width: SeqWidth::Long,
//!     mrru: 1500,
//!     peer: PeerId::default(),
//! };
//! session.join(1, "ppp0", &params, 1500).unwrap();
//!
//! // A single unfragmented packet: begin and end set, sequence 0.
//! let mut delivered: Vec<Vec<u8>> = Vec::new();
//! session.accept_fragment(1, &[0xC0, 0x00, 0x00, 0x00, 0xAA, 0xBB], &mut delivered);
//! assert_eq!(delivered, vec![vec![0xAA, 0xBB]]);
//! ```

pub mod control;
#[cfg(unix)]
pub mod handoff;
pub mod link;
pub mod proto;
pub mod reorder;
pub mod scheduler;
pub mod sequence;
pub mod session;
pub mod transport;

pub use control::{ConfigError, DaemonConfig, LinkConfig, MultilinkConfig};
pub use link::{DiscriminatorClass, EndpointDiscriminator, LinkId, LinkParams, MemberLink, PeerId};
pub use proto::{Fragment, FragmentHeader, ProtocolError};
pub use reorder::{Dispatch, Reassembler};
pub use scheduler::Distributor;
pub use sequence::SeqWidth;
pub use session::{JoinError, JoinOutcome, LeaveOutcome, MultilinkSession, SessionStats};
pub use transport::{LinkTransport, TransportError, UdpLink};
