//! Docker Engine API as a [`NetworkSource`]

use crate::error::Result;
use crate::watcher::{Endpoint, EventKind, NetworkEvent, NetworkSnapshot, NetworkSource};
use async_trait::async_trait;
use bollard::Docker;
use bollard::models::{EventMessage, Network};
use bollard::network::InspectNetworkOptions;
use bollard::system::EventsOptions;
use futures::StreamExt;
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::net::Ipv6Addr;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, instrument};

/// Client for the local Docker daemon
pub struct DockerSource {
    docker: Docker,
}

impl DockerSource {
    /// Connect using `DOCKER_HOST` or the local socket, and check the daemon
    /// answers
    #[instrument]
    pub async fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()?;
        let version = docker.ping().await?;
        info!(ping = %version, "Connected to Docker");
        Ok(Self { docker })
    }
}

#[async_trait]
impl NetworkSource for DockerSource {
    async fn inspect(&self, network: &str) -> Result<NetworkSnapshot> {
        let info = self
            .docker
            .inspect_network(network, None::<InspectNetworkOptions<String>>)
            .await?;
        Ok(snapshot_from_network(network, info))
    }

    fn events(
        &self,
        networks: &[String],
        since: SystemTime,
    ) -> BoxStream<'_, Result<NetworkEvent>> {
        self.docker
            .events(Some(events_options(networks, since)))
            .filter_map(|item| async move {
                match item {
                    Ok(msg) => parse_event(&msg).map(Ok),
                    Err(e) => Some(Err(e.into())),
                }
            })
            .boxed()
    }
}

/// Network connect/disconnect events for `networks`, replayed from `since`
fn events_options(networks: &[String], since: SystemTime) -> EventsOptions<String> {
    let filters = HashMap::from([
        ("type".to_string(), vec!["network".to_string()]),
        (
            "event".to_string(),
            vec!["connect".to_string(), "disconnect".to_string()],
        ),
        ("network".to_string(), networks.to_vec()),
    ]);
    // Whole seconds, rounded down, so the replay never starts late
    let since = since
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_secs());

    EventsOptions {
        since: Some(since.to_string()),
        filters,
        ..Default::default()
    }
}

fn snapshot_from_network(requested: &str, info: Network) -> NetworkSnapshot {
    let endpoints = info
        .containers
        .unwrap_or_default()
        .into_iter()
        .map(|(id, container)| Endpoint {
            id,
            address: container.ipv6_address.as_deref().and_then(parse_endpoint_addr),
        })
        .collect();

    NetworkSnapshot {
        id: info.id.unwrap_or_else(|| requested.to_string()),
        name: info.name.unwrap_or_else(|| requested.to_string()),
        endpoints,
    }
}

/// Docker reports endpoint addresses in CIDR form; keep the address part
fn parse_endpoint_addr(cidr: &str) -> Option<Ipv6Addr> {
    let addr = cidr.split_once('/').map_or(cidr, |(addr, _)| addr);
    if addr.is_empty() {
        return None;
    }
    match addr.parse() {
        Ok(addr) => Some(addr),
        Err(_) => {
            debug!(address = %cidr, "Skipping unparseable endpoint address");
            None
        }
    }
}

fn parse_event(msg: &EventMessage) -> Option<NetworkEvent> {
    let kind = match msg.action.as_deref()? {
        "connect" => EventKind::Connect,
        "disconnect" => EventKind::Disconnect,
        _ => return None,
    };
    let attributes = msg.actor.as_ref()?.attributes.as_ref()?;
    Some(NetworkEvent {
        kind,
        network: attributes.get("name")?.clone(),
        endpoint: attributes.get("container")?.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bollard::models::{EventActor, NetworkContainer};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_endpoint_addr() {
        assert_eq!(
            parse_endpoint_addr("2001:db8::5/64"),
            Some("2001:db8::5".parse().unwrap())
        );
        assert_eq!(
            parse_endpoint_addr("2001:db8::6"),
            Some("2001:db8::6".parse().unwrap())
        );
        assert_eq!(parse_endpoint_addr(""), None);
        assert_eq!(parse_endpoint_addr("172.18.0.2/16"), None);
    }

    #[test]
    fn test_snapshot_from_network() {
        let info = Network {
            id: Some("abc123".into()),
            name: Some("backend".into()),
            containers: Some(HashMap::from([
                (
                    "c1".to_string(),
                    NetworkContainer {
                        ipv6_address: Some("2001:db8::5/64".into()),
                        ..Default::default()
                    },
                ),
                (
                    "c2".to_string(),
                    NetworkContainer {
                        ipv6_address: Some(String::new()),
                        ..Default::default()
                    },
                ),
            ])),
            ..Default::default()
        };

        let mut snapshot = snapshot_from_network("backend", info);
        snapshot.endpoints.sort_by(|a, b| a.id.cmp(&b.id));
        assert_eq!(snapshot.id, "abc123");
        assert_eq!(snapshot.name, "backend");
        assert_eq!(
            snapshot.endpoints,
            vec![
                Endpoint {
                    id: "c1".into(),
                    address: Some("2001:db8::5".parse().unwrap()),
                },
                Endpoint {
                    id: "c2".into(),
                    address: None,
                },
            ]
        );
    }

    #[test]
    fn test_events_options_replay_from_subscription_time() {
        let since = UNIX_EPOCH + std::time::Duration::from_millis(1_700_000_000_900);
        let options = events_options(&["backend".to_string()], since);

        assert_eq!(options.since.as_deref(), Some("1700000000"));
        assert_eq!(options.until, None);
        assert_eq!(options.filters["type"], vec!["network"]);
        assert_eq!(options.filters["event"], vec!["connect", "disconnect"]);
        assert_eq!(options.filters["network"], vec!["backend"]);
    }

    #[test]
    fn test_parse_event() {
        let msg = EventMessage {
            action: Some("connect".into()),
            actor: Some(EventActor {
                id: Some("abc123".into()),
                attributes: Some(HashMap::from([
                    ("name".to_string(), "backend".to_string()),
                    ("container".to_string(), "c1".to_string()),
                ])),
            }),
            ..Default::default()
        };
        assert_eq!(
            parse_event(&msg),
            Some(NetworkEvent {
                kind: EventKind::Connect,
                network: "backend".into(),
                endpoint: "c1".into(),
            })
        );

        let destroy = EventMessage {
            action: Some("destroy".into()),
            ..msg.clone()
        };
        assert_eq!(parse_event(&destroy), None);

        let no_actor = EventMessage {
            action: Some("disconnect".into()),
            ..Default::default()
        };
        assert_eq!(parse_event(&no_actor), None);
    }
}
