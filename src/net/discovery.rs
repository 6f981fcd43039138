// UDP discovery: a responder bound to the well-known port answers
// matching-workgroup broadcast requests with the local context's TCP
// endpoint. Contexts in other workgroups stay silent, which realises a
// lightweight visibility scope (not a security boundary).

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::Instant;

use crate::error::Error;
use crate::message::PROTOCOL_VERSION;
use crate::worker::Worker;

const DATAGRAM_BUFFER_SIZE: usize = 2048;

/// Discovery datagram payloads, JSON-encoded on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum DiscoveryPacket {
    /// Request: all contexts of the named workgroup should answer.
    Discover { workgroup: String },
    /// Response: the answering context's identity and TCP endpoint.
    Here {
        workgroup: String,
        context: String,
        host: String,
        port: u16,
        protocol_version: u32,
    },
    /// Request orderly shutdown of the receiving context. Sent by the
    /// process-management tooling, broadcast or targeted at one context.
    Kill {
        #[serde(default)]
        context: Option<String>,
    },
}

/// A context that answered a discovery request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredContext {
    pub context: String,
    pub host: String,
    pub port: u16,
    pub protocol_version: u32,
}

/// Identity advertised by the local responder.
#[derive(Debug, Clone)]
pub struct ResponderIdentity {
    pub context: String,
    pub workgroup: String,
    pub advertise_host: String,
    pub tcp_port: u16,
}

/// Create a UDP socket bound to the discovery port that tolerates other
/// contexts on the same host being bound to the same port.
fn bind_discovery_socket(bind_host: &str, port: u16) -> Result<std::net::UdpSocket, Error> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    // Not available on every platform; reuse-address alone is enough there.
    #[cfg(unix)]
    let _ = socket.set_reuse_port(true);
    let ip: IpAddr = bind_host
        .parse()
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    socket.bind(&SocketAddr::new(ip, port).into())?;
    let std_socket: std::net::UdpSocket = socket.into();
    std_socket.set_nonblocking(true)?;
    Ok(std_socket)
}

/// The UDP discovery responder. One per context; answers discovery
/// requests for the local workgroup and honours kill requests by invoking
/// the shutdown callback.
pub struct DiscoveryResponder {
    worker: Worker,
}

impl DiscoveryResponder {
    /// Bind the responder socket and start the answering worker.
    /// `on_kill` runs on the responder worker and must not block.
    pub fn start(
        identity: ResponderIdentity,
        bind_host: &str,
        port: u16,
        on_kill: Arc<dyn Fn() + Send + Sync>,
    ) -> Result<DiscoveryResponder, Error> {
        let std_socket = bind_discovery_socket(bind_host, port)?;
        let socket = UdpSocket::from_std(std_socket)?;
        info!(
            "discovery responder for context {} listening on port {}",
            identity.context, port
        );
        let worker = Worker::spawn("discovery-responder", move |stop| async move {
            let mut buf = vec![0u8; DATAGRAM_BUFFER_SIZE];
            loop {
                let (len, src) = tokio::select! {
                    _ = stop.wait() => break,
                    received = socket.recv_from(&mut buf) => match received {
                        Ok(received) => received,
                        Err(err) => {
                            warn!("discovery responder receive failed: {}", err);
                            continue;
                        }
                    },
                };
                let packet: DiscoveryPacket = match serde_json::from_slice(&buf[..len]) {
                    Ok(packet) => packet,
                    // Not a discovery datagram; ignore silently.
                    Err(_) => continue,
                };
                match packet {
                    DiscoveryPacket::Discover { workgroup } => {
                        if workgroup != identity.workgroup {
                            continue;
                        }
                        let response = DiscoveryPacket::Here {
                            workgroup: identity.workgroup.clone(),
                            context: identity.context.clone(),
                            host: identity.advertise_host.clone(),
                            port: identity.tcp_port,
                            protocol_version: PROTOCOL_VERSION,
                        };
                        let encoded = serde_json::to_vec(&response)
                            .map_err(|err| anyhow::anyhow!("encode discovery response: {}", err))?;
                        if let Err(err) = socket.send_to(&encoded, src).await {
                            warn!("failed to answer discovery request from {}: {}", src, err);
                        }
                    }
                    DiscoveryPacket::Kill { context } => {
                        let targeted = match context {
                            Some(name) => name == identity.context,
                            None => true,
                        };
                        if targeted {
                            info!("received kill request from {}", src);
                            on_kill();
                        }
                    }
                    DiscoveryPacket::Here { .. } => {
                        // Responses from other contexts on the shared port.
                    }
                }
            }
            Ok(())
        });
        Ok(DiscoveryResponder { worker })
    }

    pub async fn stop(&self) -> Result<(), Error> {
        self.worker.stop_and_join(Some(Duration::from_secs(2))).await
    }
}

/// Broadcast a discovery request and collect the contexts of `workgroup`
/// that answer within `window`.
pub async fn discover(
    workgroup: &str,
    port: u16,
    window: Duration,
) -> Result<Vec<DiscoveredContext>, Error> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    socket.set_broadcast(true)?;
    let request = serde_json::to_vec(&DiscoveryPacket::Discover {
        workgroup: workgroup.to_string(),
    })
    .map_err(|err| Error::application(format!("encode discovery request: {}", err)))?;
    // Broadcast plus loopback; the latter covers hosts that refuse
    // broadcast traffic while contexts share the port locally.
    let mut sent = false;
    match socket.send_to(&request, (Ipv4Addr::BROADCAST, port)).await {
        Ok(_) => sent = true,
        Err(err) => debug!("discovery broadcast send failed: {}", err),
    }
    match socket.send_to(&request, (Ipv4Addr::LOCALHOST, port)).await {
        Ok(_) => sent = true,
        Err(err) => debug!("discovery loopback send failed: {}", err),
    }
    if !sent {
        return Err(Error::unknown_peer(
            "discovery request could not be sent on any interface",
        ));
    }

    let deadline = Instant::now() + window;
    let mut seen: HashSet<String> = HashSet::new();
    let mut found = Vec::new();
    let mut buf = vec![0u8; DATAGRAM_BUFFER_SIZE];
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        let (len, src) = match tokio::time::timeout(remaining, socket.recv_from(&mut buf)).await {
            Ok(Ok(received)) => received,
            Ok(Err(err)) => {
                warn!("discovery receive failed: {}", err);
                continue;
            }
            Err(_) => break,
        };
        match serde_json::from_slice::<DiscoveryPacket>(&buf[..len]) {
            Ok(DiscoveryPacket::Here {
                workgroup: answered_workgroup,
                context,
                host,
                port,
                protocol_version,
            }) => {
                if answered_workgroup != workgroup {
                    debug!("ignoring discovery answer for workgroup {}", answered_workgroup);
                    continue;
                }
                if seen.insert(context.clone()) {
                    found.push(DiscoveredContext {
                        context,
                        host,
                        port,
                        protocol_version,
                    });
                }
            }
            Ok(_) => {}
            Err(_) => debug!("ignoring non-discovery datagram from {}", src),
        }
    }
    Ok(found)
}

/// Locate one named context via discovery. Fails with `UnknownPeer` when
/// the context does not answer within the window.
pub async fn locate_context(
    name: &str,
    workgroup: &str,
    port: u16,
    window: Duration,
) -> Result<SocketAddr, Error> {
    let found = discover(workgroup, port, window).await?;
    for peer in found {
        if peer.context == name {
            let ip: IpAddr = peer
                .host
                .parse()
                .map_err(|_| Error::unknown_peer(format!("bad discovered host {:?}", peer.host)))?;
            return Ok(SocketAddr::new(ip, peer.port));
        }
    }
    Err(Error::unknown_peer(format!(
        "context {} not found in workgroup {}",
        name, workgroup
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_json_uses_op_tags() {
        let request = DiscoveryPacket::Discover {
            workgroup: "lab".to_string(),
        };
        let text = serde_json::to_string(&request).unwrap();
        assert!(text.contains("\"op\":\"discover\""));

        let response = DiscoveryPacket::Here {
            workgroup: "lab".to_string(),
            context: "ctx1".to_string(),
            host: "127.0.0.1".to_string(),
            port: 40001,
            protocol_version: PROTOCOL_VERSION,
        };
        let text = serde_json::to_string(&response).unwrap();
        assert!(text.contains("\"op\":\"here\""));

        let decoded: DiscoveryPacket = serde_json::from_str(&text).unwrap();
        match decoded {
            DiscoveryPacket::Here { context, port, .. } => {
                assert_eq!(context, "ctx1");
                assert_eq!(port, 40001);
            }
            other => panic!("unexpected packet {:?}", other),
        }
    }

    #[test]
    fn kill_packet_without_target_parses() {
        let decoded: DiscoveryPacket = serde_json::from_str("{\"op\":\"kill\"}").unwrap();
        match decoded {
            DiscoveryPacket::Kill { context } => assert!(context.is_none()),
            other => panic!("unexpected packet {:?}", other),
        }
    }

    #[tokio::test]
    async fn responder_answers_matching_workgroup_only() {
        let identity = ResponderIdentity {
            context: "disco1".to_string(),
            workgroup: "wg-resp".to_string(),
            advertise_host: "127.0.0.1".to_string(),
            tcp_port: 41999,
        };
        // High port to avoid clashing with a real responder.
        let port = 45999;
        let responder =
            DiscoveryResponder::start(identity, "127.0.0.1", port, Arc::new(|| {})).unwrap();

        let found = discover("wg-resp", port, Duration::from_millis(300)).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].context, "disco1");
        assert_eq!(found[0].port, 41999);

        let none = discover("wg-other", port, Duration::from_millis(200)).await.unwrap();
        assert!(none.is_empty());

        responder.stop().await.unwrap();
    }
}
