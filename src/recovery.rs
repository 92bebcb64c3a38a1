use bytes::BufMut;

use crate::device_client::ErrorCode;
use crate::packet_id::PacketId;
use crate::status::{StatusProbeError, TargetStatus};

/// Payload of a resend request: this single word sent to the target's resend
///  port asks it to retransmit its most recent reply.
pub const RESEND_MAGIC: u32 = 0xDEAD_BEEF;

pub fn resend_request() -> Vec<u8> {
    let mut buf = Vec::with_capacity(4);
    buf.put_u32(RESEND_MAGIC);
    buf
}

/// What to do about a timed-out in-flight packet, derived from the outcome
///  of a status probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// The target never saw the request: send the saved packet bytes to the
    ///  control port again.
    ResendRequest,
    /// The target processed the request but the reply was lost: ask the
    ///  resend port for a retransmission of the previous reply.
    RequestReplyResend,
    /// This mechanism cannot recover the exchange.
    GiveUp(ErrorCode),
}

/// The decision table for a timed-out v2 packet with stamped id `sent_id`.
///
/// The target reports the id it expects next. If that is still `sent_id`,
///  our request never arrived. If it is the id after `sent_id`, the request
///  was processed and the reply was lost. Any other value means the exchange
///  is out of step in a way this mechanism cannot repair.
pub fn classify_timeout(
    probe_outcome: Result<TargetStatus, StatusProbeError>,
    sent_id: PacketId,
) -> RecoveryAction {
    match probe_outcome {
        Ok(status) if status.next_expected_id == sent_id => RecoveryAction::ResendRequest,
        Ok(status) if status.next_expected_id == sent_id.next() => {
            RecoveryAction::RequestReplyResend
        }
        Ok(_) => RecoveryAction::GiveUp(ErrorCode::MalformedStatus),
        Err(StatusProbeError::Malformed) => RecoveryAction::GiveUp(ErrorCode::MalformedStatus),
        Err(StatusProbeError::Timeout) => RecoveryAction::GiveUp(ErrorCode::StatusTimeout),
    }
}
