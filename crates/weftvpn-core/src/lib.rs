//! weftvpn node coordinator
//!
//! The coordination core of a peer-to-peer VPN node:
//! - Resolves and contacts configured peers on a periodic schedule
//! - Drives the per-peer session lifecycle from secure-channel callbacks
//! - Enforces address-based admission and certificate-chain trust
//! - Binds per-peer fabric ports and demultiplexes authenticated data

pub mod admission;
pub mod channel;
pub mod config;
pub mod core;
pub mod dispatch;
pub mod endpoint;
pub mod error;
pub mod event;
pub mod fabric;
pub mod gather;
pub mod peer;
pub mod ports;
pub mod resolver;

pub use admission::{AddressFilter, IpNetwork};
pub use channel::{AlgorithmInfo, ChannelEngine, CipherSuite};
pub use config::{AdapterMode, CoreConfig, SecurityConfig};
pub use self::core::{Collaborators, Core, CoreState};
pub use dispatch::{ControlMessage, Demultiplexer, MessageHandler};
pub use endpoint::{Endpoint, PeerAddress, DEFAULT_PORT};
pub use error::{ChannelError, CoreError, CoreResult};
pub use event::CoreEvent;
pub use fabric::{EndpointPort, Fabric, FrameSink, PortGroup, PortHandle};
pub use gather::ResultsGatherer;
pub use peer::{PeerIdentity, PeerRecord, PeerState, PeerTable};
pub use ports::PortRegistry;
pub use resolver::{DnsResolver, Resolve, ResolutionPreference, ResolveMode};

use std::time::Duration;

/// Static contact loop period
pub const CONTACT_PERIOD: Duration = Duration::from_secs(30);

/// Dynamic contact loop period
pub const DYNAMIC_CONTACT_PERIOD: Duration = Duration::from_secs(45);

/// Channel number carrying Ethernet/IP frames
pub const CHANNEL_FRAMES: u8 = 0;

/// Channel number carrying control messages
pub const CHANNEL_MESSAGES: u8 = 1;
