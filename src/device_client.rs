use std::collections::VecDeque;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use anyhow::{anyhow, Context};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, info_span, span, trace, warn, Instrument, Level};
use uuid::Uuid;

use crate::config::{ClientConfig, MAX_CONTROL_RETRIES};
use crate::packet_header::{rewrite_packet_id, IpbusVersion, PacketHeader, HEADER_LEN};
use crate::packet_id::PacketId;
use crate::recovery::{classify_timeout, resend_request, RecoveryAction};
use crate::socket::TargetSocket;
use crate::status::{StatusProbeError, StatusProber};
use crate::target::TargetAddr;

/// Error code delivered to the requester, stable values on the upstream wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    Success = 0,
    /// No reply within the status-assisted retry budget.
    ControlTimeout = 1,
    /// The recovery status probe itself went unanswered.
    StatusTimeout = 2,
    /// The status reply had the wrong shape, or reported an id that matches
    ///  neither "request lost" nor "reply lost".
    MalformedStatus = 3,
}

impl ErrorCode {
    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

impl From<StatusProbeError> for ErrorCode {
    fn from(e: StatusProbeError) -> ErrorCode {
        match e {
            StatusProbeError::Timeout => ErrorCode::StatusTimeout,
            StatusProbeError::Malformed => ErrorCode::MalformedStatus,
        }
    }
}

/// What a requester receives, exactly once per enqueued request.
#[derive(Debug, PartialEq, Eq)]
pub struct DeviceResponse {
    pub target: TargetAddr,
    pub error_code: ErrorCode,
    /// Empty whenever `error_code` is not `Success`. For stamped v2 traffic
    ///  the first four bytes are the requester's original header, not the
    ///  id-rewritten one that went over the wire.
    pub payload: Vec<u8>,
}

pub type ReplyTo = oneshot::Sender<DeviceResponse>;

struct QueuedRequest {
    bytes: Vec<u8>,
    reply_to: ReplyTo,
}

/// Handle to the long-lived actor owning all communication with one target.
///
/// Cloning the handle shares the actor; the actor shuts down when the last
///  handle is dropped (best-effort: queued and in-flight requesters observe
///  a closed reply channel, nothing else).
#[derive(Clone)]
pub struct DeviceClient {
    target: TargetAddr,
    mailbox_tx: mpsc::UnboundedSender<QueuedRequest>,
}

impl DeviceClient {
    /// Open an ephemeral UDP socket for `target` and spawn the actor.
    pub async fn start(target: TargetAddr, config: ClientConfig) -> anyhow::Result<DeviceClient> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
            .await
            .with_context(|| format!("failed to open a UDP socket for target {}", target))?;
        Self::start_with_socket(target, config, Arc::new(Arc::new(socket)))
    }

    pub(crate) fn start_with_socket(
        target: TargetAddr,
        config: ClientConfig,
        socket: Arc<dyn TargetSocket>,
    ) -> anyhow::Result<DeviceClient> {
        config.validate()?;

        let (mailbox_tx, mailbox_rx) = mpsc::unbounded_channel();
        let actor = DeviceClientActor::new(target, config, socket);
        tokio::spawn(
            actor
                .run(mailbox_rx)
                .instrument(info_span!("device_client", target = %target)),
        );

        Ok(DeviceClient { target, mailbox_tx })
    }

    pub fn target(&self) -> TargetAddr {
        self.target
    }

    /// Submit a request. Returns immediately; the response arrives on
    ///  `reply_to` once the exchange with the hardware is resolved.
    pub fn enqueue(&self, request: Vec<u8>, reply_to: ReplyTo) -> anyhow::Result<()> {
        self.mailbox_tx
            .send(QueuedRequest {
                bytes: request,
                reply_to,
            })
            .map_err(|_| anyhow!("device client for {} is no longer running", self.target))
    }

    #[cfg(test)]
    pub(crate) fn same_actor(&self, other: &DeviceClient) -> bool {
        self.mailbox_tx.same_channel(&other.mailbox_tx)
    }
}

struct StampedRequest {
    /// The four header bytes as the requester submitted them. The reply is
    ///  delivered with this header, not the rewritten one.
    original_header: [u8; HEADER_LEN],
    packet_id: PacketId,
}

struct InFlight {
    /// The bytes that actually went over the wire (id rewritten for v2).
    packet: Vec<u8>,
    /// `Some` iff the packet was stamped, i.e. is v2 control traffic.
    stamped: Option<StampedRequest>,
    sent_at: Instant,
    retry_count: u32,
    reply_to: ReplyTo,
}

struct DeviceClientActor {
    target: TargetAddr,
    config: ClientConfig,
    socket: Arc<dyn TargetSocket>,
    prober: StatusProber,
    version: IpbusVersion,
    next_id: Option<PacketId>,
    in_flight: Option<InFlight>,
    queue: VecDeque<QueuedRequest>,
    deadline: Option<Instant>,
    /// Control-port datagrams that a status probe pulled off the socket;
    ///  processed before the actor suspends again.
    deferred: VecDeque<(Vec<u8>, SocketAddr)>,
}

impl DeviceClientActor {
    fn new(target: TargetAddr, config: ClientConfig, socket: Arc<dyn TargetSocket>) -> DeviceClientActor {
        let prober = StatusProber::new(
            Arc::clone(&socket),
            target.status_addr(),
            config.response_timeout,
            config.status_attempts,
        );
        DeviceClientActor {
            target,
            config,
            socket,
            prober,
            version: IpbusVersion::Unknown,
            next_id: None,
            in_flight: None,
            queue: VecDeque::new(),
            deadline: None,
            deferred: VecDeque::new(),
        }
    }

    async fn run(mut self, mut mailbox: mpsc::UnboundedReceiver<QueuedRequest>) {
        info!("device client for {} started", self.target);

        loop {
            while let Some((bytes, from)) = self.deferred.pop_front() {
                self.on_datagram(bytes, from).await;
            }

            let socket = Arc::clone(&self.socket);
            let deadline = self.deadline;

            tokio::select! {
                queued = mailbox.recv() => match queued {
                    Some(request) => self.on_request(request).await,
                    None => break,
                },
                received = socket.recv_packet() => match received {
                    Ok((bytes, from)) => {
                        let correlation_id = Uuid::new_v4();
                        self.on_datagram(bytes, from)
                            .instrument(span!(Level::TRACE, "datagram_received", ?correlation_id))
                            .await;
                    }
                    Err(e) => error!("socket error: {}", e),
                },
                _ = Self::response_deadline(deadline) => self.on_timeout().await,
            }
        }

        debug!("all handles for {} dropped - shutting down", self.target);
    }

    async fn response_deadline(deadline: Option<Instant>) {
        match deadline {
            Some(deadline) => sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    }

    async fn on_request(&mut self, request: QueuedRequest) {
        trace!("enqueueing request of length {}", request.bytes.len());
        self.queue.push_back(request);

        // In the awaiting state the armed deadline keeps governing: a request
        //  queued behind a stuck exchange must not extend that exchange's
        //  timeout budget.
        if self.in_flight.is_none() {
            self.service_queue_head().await;
        }
    }

    /// Dispatch the queue head, if any: stamp the next packet id into v2
    ///  requests (learning it from the status port on the first exchange),
    ///  send to the control port and arm the response timer.
    async fn service_queue_head(&mut self) {
        debug_assert!(self.in_flight.is_none());

        let Some(request) = self.queue.pop_front() else {
            return;
        };

        let header = PacketHeader::parse(&request.bytes);
        if header.version == IpbusVersion::V2_0 && self.next_id.is_none() {
            match self.prober.probe(&mut self.deferred).await {
                Ok(status) => {
                    debug!(
                        "target {} expects packet id {} next",
                        self.target, status.next_expected_id
                    );
                    self.next_id = Some(status.next_expected_id);
                }
                Err(e) => {
                    warn!(
                        "cannot learn the next packet id for target {}: {}",
                        self.target, e
                    );
                    self.version = IpbusVersion::Unknown;
                    self.next_id = None;
                    Self::deliver(request.reply_to, self.target, e.into(), Vec::new());
                    return;
                }
            }
        }

        let mut original_header = [0u8; HEADER_LEN];
        if let Some(head) = request.bytes.get(..HEADER_LEN) {
            original_header.copy_from_slice(head);
        }

        let rewritten = match rewrite_packet_id(request.bytes, self.next_id) {
            Ok(rewritten) => rewritten,
            Err(e) => {
                error!("dropping request for {}: {}", self.target, e);
                self.version = IpbusVersion::Unknown;
                self.next_id = None;
                Self::deliver(request.reply_to, self.target, ErrorCode::StatusTimeout, Vec::new());
                return;
            }
        };

        // latched on the first successfully parsed request
        if self.version == IpbusVersion::Unknown && rewritten.version != IpbusVersion::Unknown {
            debug!("target {} speaks IPbus {:?}", self.target, rewritten.version);
            self.version = rewritten.version;
        }
        let stamped = rewritten.stamped_id.map(|packet_id| {
            self.next_id = Some(packet_id.next());
            StampedRequest {
                original_header,
                packet_id,
            }
        });

        trace!(
            "sending request to {:?} (stamped id {:?})",
            self.target.control_addr(),
            rewritten.stamped_id,
        );
        self.socket
            .do_send_packet(self.target.control_addr(), &rewritten.bytes)
            .await;

        let now = Instant::now();
        self.in_flight = Some(InFlight {
            packet: rewritten.bytes,
            stamped,
            sent_at: now,
            retry_count: 0,
            reply_to: request.reply_to,
        });
        self.deadline = Some(now + self.config.response_timeout);
    }

    /// A datagram from the control port resolves the in-flight exchange; the
    ///  packet id is the single demultiplexer and only one reply is ever
    ///  outstanding, so the datagram is accepted as-is.
    async fn on_datagram(&mut self, bytes: Vec<u8>, from: SocketAddr) {
        if from != self.target.control_addr() {
            debug!("datagram from unexpected endpoint {:?} - ignoring", from);
            return;
        }
        let Some(in_flight) = self.in_flight.take() else {
            debug!("datagram with no request in flight - ignoring");
            return;
        };

        trace!(
            "reply of length {} after {:?}",
            bytes.len(),
            in_flight.sent_at.elapsed()
        );

        let payload = match in_flight.stamped {
            Some(stamped) => {
                let reply_header = PacketHeader::parse(&bytes);
                if reply_header.packet_id != Some(stamped.packet_id) {
                    debug!(
                        "reply id {:?} does not match in-flight id {} - delivering anyway",
                        reply_header.packet_id, stamped.packet_id
                    );
                }

                let mut payload = Vec::with_capacity(bytes.len());
                payload.extend_from_slice(&stamped.original_header);
                payload.extend_from_slice(bytes.get(HEADER_LEN..).unwrap_or(&[]));
                payload
            }
            None => bytes,
        };

        self.deadline = None;
        Self::deliver(in_flight.reply_to, self.target, ErrorCode::Success, payload);

        self.service_queue_head().await;
    }

    /// The response timer fired. For stamped v2 traffic, consult the status
    ///  port to decide between "request lost" and "reply lost"; give up with
    ///  a control timeout once the retry budget is spent.
    ///
    /// Giving up does not dispatch the next queued request; the queue is
    ///  drained by the next enqueue.
    async fn on_timeout(&mut self) {
        self.deadline = None;

        let Some(mut in_flight) = self.in_flight.take() else {
            // stale timer after a reply
            return;
        };

        let Some(stamped) = in_flight.stamped.as_ref() else {
            debug!(
                "timeout on passthrough request for {} - no status channel to consult",
                self.target
            );
            Self::deliver(
                in_flight.reply_to,
                self.target,
                ErrorCode::ControlTimeout,
                Vec::new(),
            );
            return;
        };
        let sent_id = stamped.packet_id;

        if in_flight.retry_count >= MAX_CONTROL_RETRIES {
            warn!(
                "request {} to {} timed out after {} status-assisted retries",
                sent_id, self.target, MAX_CONTROL_RETRIES
            );
            Self::deliver(
                in_flight.reply_to,
                self.target,
                ErrorCode::ControlTimeout,
                Vec::new(),
            );
            return;
        }

        debug!(
            "request {} to {} timed out (retry {}) - probing target status",
            sent_id, self.target, in_flight.retry_count
        );
        let probe_outcome = self.prober.probe(&mut self.deferred).await;

        match classify_timeout(probe_outcome, sent_id) {
            RecoveryAction::ResendRequest => {
                debug!("target never saw request {} - resending", sent_id);
                self.socket
                    .do_send_packet(self.target.control_addr(), &in_flight.packet)
                    .await;
                self.rearm(in_flight);
            }
            RecoveryAction::RequestReplyResend => {
                debug!(
                    "reply to request {} was lost - asking for a retransmission",
                    sent_id
                );
                self.socket
                    .do_send_packet(self.target.resend_addr(), &resend_request())
                    .await;
                self.rearm(in_flight);
            }
            RecoveryAction::GiveUp(error_code) => {
                warn!(
                    "giving up on request {} to {}: {:?}",
                    sent_id, self.target, error_code
                );
                Self::deliver(in_flight.reply_to, self.target, error_code, Vec::new());
            }
        }
    }

    fn rearm(&mut self, mut in_flight: InFlight) {
        in_flight.retry_count += 1;
        in_flight.sent_at = Instant::now();
        self.deadline = Some(in_flight.sent_at + self.config.response_timeout);
        self.in_flight = Some(in_flight);
    }

    fn deliver(reply_to: ReplyTo, target: TargetAddr, error_code: ErrorCode, payload: Vec<u8>) {
        let response = DeviceResponse {
            target,
            error_code,
            payload,
        };
        if reply_to.send(response).is_err() {
            debug!("requester for {} went away before the response was ready", target);
        }
    }
}
