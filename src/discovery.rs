//! UDP discovery responder.
//!
//! Stateless by design: it answers `announce` datagrams with an `ack`
//! carrying the server's TCP address and keeps no per-peer bookkeeping at
//! all. A peer that never gets a reply (dropped datagram, peer gone before
//! the ack lands) just retries its own announce loop; this side does
//! nothing special to help it.

use crate::error::BindError;
use coordinator_protocol::{Ack, UdpMessage};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{Ipv4Addr, SocketAddr};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub async fn run(
    bind_port: u16,
    server_ip: Ipv4Addr,
    tcp_port: u16,
    shutdown: CancellationToken,
) -> Result<(), BindError> {
    let socket = bind_socket(bind_port).await?;
    info!(port = bind_port, %server_ip, "discovery responder listening");
    let mut buf = [0u8; 2048];
    loop {
        tokio::select! {
            () = shutdown.cancelled() => {
                info!("discovery responder stopping");
                return Ok(());
            }
            received = socket.recv_from(&mut buf) => {
                match received {
                    Ok((len, peer)) => handle_datagram(&socket, &buf[..len], peer, server_ip, tcp_port).await,
                    Err(error) => warn!(%error, "udp recv error"),
                }
            }
        }
    }
}

async fn bind_socket(port: u16) -> Result<UdpSocket, BindError> {
    let to_bind_error = |source| BindError::Udp { port, source };
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(to_bind_error)?;
    socket.set_reuse_address(true).map_err(to_bind_error)?;
    let addr: SocketAddr = (Ipv4Addr::UNSPECIFIED, port).into();
    socket.bind(&addr.into()).map_err(to_bind_error)?;
    socket.set_nonblocking(true).map_err(to_bind_error)?;
    UdpSocket::from_std(socket.into()).map_err(to_bind_error)
}

async fn handle_datagram(socket: &UdpSocket, bytes: &[u8], peer: SocketAddr, server_ip: Ipv4Addr, tcp_port: u16) {
    let text = match std::str::from_utf8(bytes) {
        Ok(text) => text,
        Err(error) => {
            warn!(%error, %peer, "discovery datagram is not valid UTF-8");
            return;
        }
    };
    let message: UdpMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(error) => {
            warn!(%error, %peer, raw = %text, "failed to parse discovery datagram");
            return;
        }
    };
    let UdpMessage::Announce(announce) = message else {
        debug!(%peer, "ignoring a discovery datagram that isn't an announce");
        return;
    };

    let ack = UdpMessage::Ack(Ack {
        server_ip: server_ip.to_string(),
        tcp_port,
    });
    let payload = match serde_json::to_vec(&ack) {
        Ok(payload) => payload,
        Err(error) => {
            warn!(%error, "failed to serialize discovery ack");
            return;
        }
    };
    // The socket may be mid-teardown on shutdown; a send failure here is
    // always benign and never worth surfacing past a log line.
    match socket.send_to(&payload, peer).await {
        Ok(_) => info!(target_id = %announce.target_id, %peer, "answered discovery announce"),
        Err(error) => warn!(%error, %peer, target_id = %announce.target_id, "failed to send discovery ack"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UdpSocket as TokioUdpSocket;

    #[tokio::test]
    async fn answers_an_announce_with_an_ack_carrying_the_tcp_port() {
        let server_socket = TokioUdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server_socket.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let server_ip = Ipv4Addr::new(192, 168, 1, 10);

        let shutdown_clone = shutdown.clone();
        let task = tokio::spawn(async move {
            let socket = server_socket;
            let mut buf = [0u8; 2048];
            tokio::select! {
                () = shutdown_clone.cancelled() => {}
                received = socket.recv_from(&mut buf) => {
                    if let Ok((len, peer)) = received {
                        handle_datagram(&socket, &buf[..len], peer, server_ip, 5001).await;
                    }
                }
            }
        });

        let client = TokioUdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.connect(server_addr).await.unwrap();
        let announce = UdpMessage::Announce(coordinator_protocol::Announce {
            target_id: "PicoW1".to_owned(),
            ip: "127.0.0.1".to_owned(),
        });
        client.send(&serde_json::to_vec(&announce).unwrap()).await.unwrap();

        let mut buf = [0u8; 2048];
        let len = tokio::time::timeout(std::time::Duration::from_secs(2), client.recv(&mut buf))
            .await
            .expect("ack should arrive")
            .unwrap();
        let reply: UdpMessage = serde_json::from_slice(&buf[..len]).unwrap();
        assert_eq!(
            reply,
            UdpMessage::Ack(Ack {
                server_ip: "192.168.1.10".to_owned(),
                tcp_port: 5001,
            })
        );

        shutdown.cancel();
        let _ = task.await;
    }

    #[tokio::test]
    async fn malformed_datagram_is_logged_and_does_not_reply() {
        let socket = TokioUdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let client = TokioUdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.connect(addr).await.unwrap();
        client.send(b"not json at all").await.unwrap();

        let mut buf = [0u8; 64];
        let (len, peer) = socket.recv_from(&mut buf).await.unwrap();
        handle_datagram(&socket, &buf[..len], peer, Ipv4Addr::LOCALHOST, 5001).await;

        let result = tokio::time::timeout(std::time::Duration::from_millis(200), client.recv(&mut buf)).await;
        assert!(result.is_err(), "no reply should be sent for a malformed datagram");
    }
}
