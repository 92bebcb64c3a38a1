use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BufMut;
use bytes_varint::try_get_fixed::TryGetFixedSupport;
use thiserror::Error;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, trace, warn};

use crate::packet_id::PacketId;
use crate::socket::TargetSocket;

/// Every word of a status request, and the leading word of a status reply.
pub const STATUS_WORD: u32 = 0x2000_00F1;
/// A status request is this many repeated big-endian status words (64 bytes).
pub const STATUS_REQUEST_WORDS: usize = 16;

/// What the target reports on its status port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetStatus {
    /// Number of response buffers the target retains for resending.
    pub nr_response_buffers: u32,
    /// The packet id the target expects on the next control request.
    pub next_expected_id: PacketId,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum StatusProbeError {
    #[error("no status reply within the retry budget")]
    Timeout,
    #[error("malformed status reply")]
    Malformed,
}

pub fn status_request() -> Vec<u8> {
    let mut buf = Vec::with_capacity(STATUS_REQUEST_WORDS * 4);
    for _ in 0..STATUS_REQUEST_WORDS {
        buf.put_u32(STATUS_WORD);
    }
    buf
}

/// Parse a status reply. The fixed prefix is the status word, an ignored
///  word, the buffer count, and the next expected id wrapped in the `0x20`
///  version byte and the `0xF0` control type byte; trailing bytes are
///  ignored. Any mismatch, including a reserved zero id, is malformed.
pub fn parse_status_response(reply: &[u8]) -> Result<TargetStatus, StatusProbeError> {
    let buf = &mut &reply[..];

    let magic = buf.try_get_u32().map_err(|_| StatusProbeError::Malformed)?;
    if magic != STATUS_WORD {
        return Err(StatusProbeError::Malformed);
    }
    let _ = buf.try_get_u32().map_err(|_| StatusProbeError::Malformed)?;
    let nr_response_buffers = buf.try_get_u32().map_err(|_| StatusProbeError::Malformed)?;

    if buf.try_get_u8().map_err(|_| StatusProbeError::Malformed)? != 0x20 {
        return Err(StatusProbeError::Malformed);
    }
    let raw_next_id = buf.try_get_u16().map_err(|_| StatusProbeError::Malformed)?;
    if buf.try_get_u8().map_err(|_| StatusProbeError::Malformed)? != 0xF0 {
        return Err(StatusProbeError::Malformed);
    }

    let next_expected_id = PacketId::from_raw(raw_next_id).ok_or(StatusProbeError::Malformed)?;

    Ok(TargetStatus {
        nr_response_buffers,
        next_expected_id,
    })
}

/// Synchronous request/reply on the target's status port, with a per-send
///  timeout and a bounded number of attempts.
pub struct StatusProber {
    socket: Arc<dyn TargetSocket>,
    status_addr: SocketAddr,
    response_timeout: Duration,
    attempts: u32,
    request: Vec<u8>,
}

impl StatusProber {
    pub fn new(
        socket: Arc<dyn TargetSocket>,
        status_addr: SocketAddr,
        response_timeout: Duration,
        attempts: u32,
    ) -> StatusProber {
        StatusProber {
            socket,
            status_addr,
            response_timeout,
            attempts,
            request: status_request(),
        }
    }

    /// Query the status port. Datagrams from other ports that arrive while
    ///  waiting are not consumed; they are pushed to `deferred` for the
    ///  caller to process once the probe is done.
    pub async fn probe(
        &self,
        deferred: &mut VecDeque<(Vec<u8>, SocketAddr)>,
    ) -> Result<TargetStatus, StatusProbeError> {
        for attempt in 1..=self.attempts {
            trace!(
                "status query to {:?}, attempt {}/{}",
                self.status_addr,
                attempt,
                self.attempts
            );
            self.socket.do_send_packet(self.status_addr, &self.request).await;

            let deadline = Instant::now() + self.response_timeout;
            loop {
                let received = match timeout_at(deadline, self.socket.recv_packet()).await {
                    Ok(received) => received,
                    Err(_) => break, // this attempt is used up
                };

                match received {
                    Ok((bytes, from)) if from == self.status_addr => {
                        return match parse_status_response(&bytes) {
                            Ok(status) => {
                                trace!("status reply from {:?}: {:?}", from, status);
                                Ok(status)
                            }
                            Err(e) => {
                                warn!("malformed status reply from {:?}: {:?}", from, bytes);
                                Err(e)
                            }
                        };
                    }
                    Ok((bytes, from)) => {
                        debug!("datagram from {:?} during status probe - deferring", from);
                        deferred.push_back((bytes, from));
                    }
                    Err(e) => {
                        warn!("socket error while awaiting status reply: {}", e);
                        break;
                    }
                }
            }
        }

        debug!(
            "status query to {:?} went unanswered after {} attempts",
            self.status_addr, self.attempts
        );
        Err(StatusProbeError::Timeout)
    }
}
