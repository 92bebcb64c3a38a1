use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::BufMut;
use tokio::sync::{mpsc, Mutex};

use crate::socket::TargetSocket;
use crate::status::STATUS_WORD;

/// Channel-backed socket for scenario tests: outgoing packets are observable
///  on a channel, incoming datagrams are injected by the test. A receive on
///  an exhausted channel suspends forever, like a quiet socket.
pub struct FakeTargetSocket {
    sent_tx: mpsc::UnboundedSender<(SocketAddr, Vec<u8>)>,
    incoming: Mutex<mpsc::UnboundedReceiver<(Vec<u8>, SocketAddr)>>,
}

pub fn fake_socket() -> (
    Arc<FakeTargetSocket>,
    mpsc::UnboundedReceiver<(SocketAddr, Vec<u8>)>,
    mpsc::UnboundedSender<(Vec<u8>, SocketAddr)>,
) {
    let (sent_tx, sent_rx) = mpsc::unbounded_channel();
    let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();

    let socket = Arc::new(FakeTargetSocket {
        sent_tx,
        incoming: Mutex::new(incoming_rx),
    });
    (socket, sent_rx, incoming_tx)
}

#[async_trait]
impl TargetSocket for FakeTargetSocket {
    async fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]) {
        self.sent_tx.send((to, packet_buf.to_vec())).ok();
    }

    async fn recv_packet(&self) -> anyhow::Result<(Vec<u8>, SocketAddr)> {
        let mut incoming = self.incoming.lock().await;
        match incoming.recv().await {
            Some(datagram) => Ok(datagram),
            // the test hung up; behave like a socket that never receives
            None => std::future::pending().await,
        }
    }
}

/// A well-formed status reply as the target would send it.
pub fn status_reply(nr_response_buffers: u32, next_expected_id: u16) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16);
    buf.put_u32(STATUS_WORD);
    buf.put_u32(0);
    buf.put_u32(nr_response_buffers);
    buf.put_u8(0x20);
    buf.put_u16(next_expected_id);
    buf.put_u8(0xF0);
    buf
}
