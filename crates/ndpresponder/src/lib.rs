//! IPv6 Neighbor Discovery responder
//!
//! Answers Neighbor Solicitations on one link for addresses that live behind
//! this host: statically configured prefixes, and the IPv6 addresses of
//! containers attached to selected Docker networks. Newly attached container
//! addresses are announced right away so upstream neighbor caches fill
//! before the first packet arrives.
//!
//! # NIST 800-53 Rev 5 Control Mappings
//!
//! | Control | Description | Implementation |
//! |---------|-------------|----------------|
//! | AC-3 | Access Enforcement | Packet and netlink sockets require CAP_NET_RAW / CAP_NET_ADMIN |
//! | AU-3 | Content of Audit Records | Structured logging of every decision |
//! | CM-6 | Configuration Settings | Validated command line and environment |
//! | CM-8 | System Component Inventory | Tracks container endpoint addresses |
//! | CP-10 | System Recovery | All state rebuilt from the environment on start |
//! | SC-5 | DoS Protection | Kernel BPF filter, bounded queues |
//! | SC-7 | Boundary Protection | Only configured targets are answered |
//! | SI-10 | Input Validation | Every captured frame is validated layer by layer |
//! | SI-11 | Error Handling | Structured error types |
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  NeighSolicitation  ┌────────────────┐   frames   ┌──────────────┐
//! │ CaptureSocket│────── mpsc(1) ─────▶│                │───────────▶│ FrameSender  │
//! └──────────────┘                     │ ResponderLoop  │            └──────────────┘
//! ┌──────────────┐  new Ipv6Addr       │                │
//! │ Dynamic      │── broadcast(64) ───▶│  HostInfo      │
//! │ SourceWatcher│── watch(Arc<Set>) ─▶│  static set    │
//! └──────▲───────┘                     └────────────────┘
//!        │ events / inspect                    ▲
//! ┌──────┴───────┐                     ┌───────┴────────┐
//! │ DockerSource │                     │ GatewayResolver│ (once, at startup)
//! └──────────────┘                     └────────────────┘
//! ```

pub mod config;
pub mod docker;
pub mod error;
pub mod gateway;
pub mod ipset;
pub mod netlink;
pub mod packet;
pub mod responder;
pub mod transport;
pub mod types;
pub mod watcher;

pub use config::{Args, Config, InterfaceInfo};
pub use docker::DockerSource;
pub use error::{NdpError, Result};
pub use gateway::{GatewayResolver, GatewayWait, NeighborScan, Resolution, ResolverState};
pub use ipset::{AddressSet, AddressSetBuilder};
pub use netlink::{NeighborTable, NetlinkNeighborTable};
pub use responder::{Decision, ResponderLoop, decide};
pub use transport::{CaptureSocket, FrameSender, FrameSink, spawn_capture};
pub use types::{HostInfo, MacAddress, NeighSolicitation, NeighborEntry, NeighborState};
pub use watcher::{
    DynamicMembership, DynamicSourceWatcher, EndpointSelector, NetworkEvent, NetworkSnapshot,
    NetworkSource,
};
