//! The single consumer: answers solicitations and announces new addresses
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - SC-7: Boundary Protection - Only configured targets are answered
//! - SI-11: Error Handling - Per-frame failures are logged, never fatal

use crate::ipset::AddressSet;
use crate::packet;
use crate::transport::FrameSink;
use crate::types::{HostInfo, NeighSolicitation};
use std::net::Ipv6Addr;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Respond,
    Ignore,
}

/// Dynamic targets are answered for any destination. Static targets only
/// for multicast "who-has" queries.
pub fn decide(ns: &NeighSolicitation, dynamic: &AddressSet, statics: &AddressSet) -> Decision {
    if dynamic.contains(&ns.target_ip) || (ns.is_multicast() && statics.contains(&ns.target_ip)) {
        Decision::Respond
    } else {
        Decision::Ignore
    }
}

pub struct ResponderLoop<K> {
    host: HostInfo,
    statics: AddressSet,
    active: watch::Receiver<Arc<AddressSet>>,
    sink: K,
}

impl<K: FrameSink> ResponderLoop<K> {
    pub fn new(
        host: HostInfo,
        statics: AddressSet,
        active: watch::Receiver<Arc<AddressSet>>,
        sink: K,
    ) -> Self {
        Self {
            host,
            statics,
            active,
            sink,
        }
    }

    /// Decide on one solicitation and send the advertisement if warranted
    pub fn on_solicitation(&self, ns: &NeighSolicitation) -> Decision {
        let dynamic = self.active.borrow().clone();
        let decision = decide(ns, &dynamic, &self.statics);
        match decision {
            Decision::Ignore => debug!("IGNORE {ns}"),
            Decision::Respond => {
                debug!("RESPOND {ns}");
                match packet::encode_advertisement(ns, self.host.host_mac) {
                    Ok(frame) => self.send(&frame, "advertisement", ns.target_ip),
                    Err(e) => warn!(target_ip = %ns.target_ip, error = %e, "Failed to encode advertisement"),
                }
            }
        }
        decision
    }

    /// Announce a newly observed address, and tell the gateway about it
    pub fn on_new_address(&self, addr: Ipv6Addr) {
        match packet::encode_gratuitous_solicitation(self.host.host_mac, addr) {
            Ok(frame) => self.send(&frame, "gratuitous solicitation", addr),
            Err(e) => warn!(ip = %addr, error = %e, "Failed to encode gratuitous solicitation"),
        }

        let Some(gateway) = self.host.gateway else {
            return;
        };
        match packet::encode_gateway_solicitation(self.host.host_mac, addr, gateway) {
            Ok(frame) => self.send(&frame, "gateway solicitation", addr),
            Err(e) => warn!(ip = %addr, error = %e, "Failed to encode gateway solicitation"),
        }
    }

    fn send(&self, frame: &[u8], what: &str, addr: Ipv6Addr) {
        if let Err(e) = self.sink.send_frame(frame) {
            warn!(ip = %addr, error = %e, "Failed to send {what}");
        }
    }

    /// Multiplex both producers until cancelled or capture ends
    pub async fn run(
        self,
        mut solicitations: mpsc::Receiver<NeighSolicitation>,
        mut notifications: broadcast::Receiver<Ipv6Addr>,
        cancel: CancellationToken,
    ) {
        info!(
            mac = %self.host.host_mac,
            gateway = ?self.host.gateway,
            "Responder started"
        );
        let mut notifications_open = true;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                ns = solicitations.recv() => match ns {
                    Some(ns) => {
                        self.on_solicitation(&ns);
                    }
                    None => {
                        warn!("Capture ended");
                        break;
                    }
                },
                addr = notifications.recv(), if notifications_open => match addr {
                    Ok(addr) => {
                        info!(ip = %addr, "New address");
                        self.on_new_address(addr);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Dropped new-address notifications");
                    }
                    Err(RecvError::Closed) => {
                        debug!("Dynamic watcher finished");
                        notifications_open = false;
                    }
                },
            }
        }
        info!("Responder stopped");
    }
}
