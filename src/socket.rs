use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tokio::net::UdpSocket;
use tracing::{error, trace};

/// Receive buffer size. IPbus datagrams are bounded by the deployment's UDP
///  MTU, which this client does not know; sizing for the largest possible
///  UDP payload means no reply is ever truncated.
pub const RECV_BUFFER_SIZE: usize = 65535;

/// Abstraction over the actor's UDP socket, introduced to make the I/O part
///  replaceable for testing. A device client owns exactly one of these; no
///  other task sends or receives on it.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TargetSocket: Send + Sync + 'static {
    async fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]);

    async fn recv_packet(&self) -> anyhow::Result<(Vec<u8>, SocketAddr)>;
}

#[async_trait]
impl TargetSocket for Arc<UdpSocket> {
    async fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]) {
        trace!("UDP socket: sending packet to {:?}", to);

        // a failed send is indistinguishable from a lost datagram to the rest
        //  of the client, so it is logged but not propagated
        if let Err(e) = self.send_to(packet_buf, to).await {
            error!("error sending UDP packet to {:?}: {}", to, e);
        }
    }

    async fn recv_packet(&self) -> anyhow::Result<(Vec<u8>, SocketAddr)> {
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        let (num_read, from) = self.recv_from(&mut buf).await?;
        buf.truncate(num_read);
        Ok((buf, from))
    }
}
