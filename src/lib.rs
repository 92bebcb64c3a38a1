//! A client for IPbus 2.0 register-access hardware over UDP.
//!
//! Many software clients talk to one hardware target through a single
//!  long-lived *device client*: an actor that owns one ephemeral UDP socket,
//!  serialises all requesters onto a single-flight exchange with the target,
//!  and recovers lost datagrams through the target's out-of-band channels.
//!
//! ## Design goals
//!
//! * One actor per target, created on first use and alive until the process
//!   exits. The actor is the only owner of its socket; requesters never
//!   touch the wire themselves.
//! * At most one request in flight per target. The hardware keeps a single
//!   response buffer per packet id, so pipelining would make loss recovery
//!   ambiguous; fairness between requesters comes from a FIFO queue instead.
//! * Loss detection without acknowledgements: UDP gives no delivery signal,
//!   so a missing reply is diagnosed after the fact by asking the target's
//!   status port which packet id it expects next. That distinguishes "the
//!   request never arrived" (re-send it) from "the reply was dropped" (ask
//!   the resend port for a retransmission) without re-executing the
//!   transaction on the hardware.
//! * Requesters see their own bytes: the client stamps its running packet id
//!   into outgoing requests, but replies are delivered with the requester's
//!   original header restored.
//!
//! ## Target endpoints
//!
//! A target listening on control port `P` serves three UDP endpoints:
//!
//! ```ascii
//! P    control  IPbus request/response traffic
//! P+1  status   status query -> (response buffer count, next expected id)
//! P+2  resend   retransmission request for the previous reply
//! ```
//!
//! ## Packet header
//!
//! Every IPbus 2.0 packet starts with a 4-byte header; the id is a u16 in
//!  `1..=0xFFFF` (zero is reserved) that wraps around skipping zero:
//!
//! ```ascii
//! 0:  0x20 - protocol version nibble (2) and reserved nibble (0)
//! 1:  packet id, high byte
//! 2:  packet id, low byte
//! 3:  packet type: 0xF0 control, 0xF1 status, 0xF2 resend
//! ```
//!
//! The header is observed on the wire in either byte order; the swapped form
//!  is `type, id-low, id-high, 0x20`. Whatever order the requester used is
//!  preserved when the id is rewritten and on the delivered reply. Legacy
//!  IPbus 1.3 headers (version nibble 1, type byte 0xF8) are tolerated and
//!  passed through without id stamping or recovery.
//!
//! ## Status query
//!
//! The status request is sixteen big-endian words of `0x200000F1` (64
//!  bytes). The reply echoes the status word, then reports the number of
//!  response buffers the target retains and the packet id it expects next:
//!
//! ```ascii
//! 0:  0x200000F1
//! 4:  (ignored)
//! 8:  number of response buffers (u32 BE)
//! 12: 0x20, next expected id (u16 BE), 0xF0
//! 15: arbitrary trailing bytes
//! ```
//!
//! ## Recovery
//!
//! When an in-flight packet with stamped id `N` times out, the status port
//!  decides what happened:
//!
//! ```ascii
//! next expected id == N      the request was lost    re-send it to P
//! next expected id == N+1    the reply was lost      send 0xDEADBEEF to P+2
//! anything else              out of step             fail (malformed status)
//! no status reply            target unresponsive     fail (status timeout)
//! ```
//!
//! Up to three status-assisted retries are attempted before the request
//!  fails with a control timeout. Failures are reported to the one requester
//!  concerned; the actor itself never dies from them.

pub mod config;
pub mod device_client;
pub mod packet_header;
pub mod packet_id;
pub mod registry;
pub mod target;

mod recovery;
mod socket;
mod status;

#[cfg(test)]
mod test_util;

#[cfg(test)]
mod tests {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
