use anyhow::bail;

use crate::packet_id::PacketId;

/// Size of the IPbus packet header in bytes.
pub const HEADER_LEN: usize = 4;

/// Byte carrying the protocol version nibble (2) and the reserved nibble (0)
///  of an IPbus 2.0 header.
const V2_VERSION_BYTE: u8 = 0x20;
/// Packet type byte of an IPbus 1.3 header.
const V1_TYPE_BYTE: u8 = 0xF8;

/// The three packet type bytes defined by IPbus 2.0: 0xF0 control,
///  0xF1 status, 0xF2 resend.
fn is_v2_type_byte(byte: u8) -> bool {
    matches!(byte, 0xF0..=0xF2)
}

fn is_v1_version_byte(byte: u8) -> bool {
    byte >> 4 == 0x1
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IpbusVersion {
    V2_0,
    /// Tolerated as passthrough traffic only - no id stamping, no recovery.
    V1_3,
    Unknown,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Endianness {
    Big,
    Little,
    Unknown,
}

/// Parse result of the first [HEADER_LEN] bytes of a packet.
///
/// An IPbus 2.0 header is observed on the wire in either byte order:
///  canonical form is `20 ii ii TT`, swapped form is `TT ii ii 20` with the
///  id read little-endian. The observed endianness is preserved when the id
///  of an outgoing packet is rewritten.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PacketHeader {
    pub version: IpbusVersion,
    /// `None` both for non-v2 headers and for a v2 header carrying the
    ///  reserved id zero.
    pub packet_id: Option<PacketId>,
    pub endianness: Endianness,
}

impl PacketHeader {
    /// Total function over arbitrary byte slices: anything that is not a
    ///  recognised IPbus header (including slices shorter than 4 bytes)
    ///  parses as `Unknown`.
    pub fn parse(buf: &[u8]) -> PacketHeader {
        let Some(header) = buf.get(..HEADER_LEN) else {
            return PacketHeader {
                version: IpbusVersion::Unknown,
                packet_id: None,
                endianness: Endianness::Unknown,
            };
        };

        if header[0] == V2_VERSION_BYTE && is_v2_type_byte(header[3]) {
            return PacketHeader {
                version: IpbusVersion::V2_0,
                packet_id: PacketId::from_raw(u16::from_be_bytes([header[1], header[2]])),
                endianness: Endianness::Big,
            };
        }
        if is_v2_type_byte(header[0]) && header[3] == V2_VERSION_BYTE {
            return PacketHeader {
                version: IpbusVersion::V2_0,
                packet_id: PacketId::from_raw(u16::from_le_bytes([header[1], header[2]])),
                endianness: Endianness::Little,
            };
        }
        if is_v1_version_byte(header[0]) && header[3] == V1_TYPE_BYTE {
            return PacketHeader {
                version: IpbusVersion::V1_3,
                packet_id: None,
                endianness: Endianness::Big,
            };
        }
        if header[0] == V1_TYPE_BYTE && is_v1_version_byte(header[3]) {
            return PacketHeader {
                version: IpbusVersion::V1_3,
                packet_id: None,
                endianness: Endianness::Little,
            };
        }

        PacketHeader {
            version: IpbusVersion::Unknown,
            packet_id: None,
            endianness: Endianness::Unknown,
        }
    }
}

#[derive(Debug, Eq, PartialEq)]
pub struct RewrittenRequest {
    pub version: IpbusVersion,
    pub bytes: Vec<u8>,
    /// The id written into the header, or `None` if the request was passed
    ///  through unchanged.
    pub stamped_id: Option<PacketId>,
}

/// Stamp `new_id` into the header of an outgoing request, preserving the
///  observed endianness.
///
/// Non-v2 requests (legacy 1.3 and unrecognised headers) are passed through
///  unchanged. The only error case is a v2 request with `new_id = None`,
///  i.e. the caller does not know the target's next expected id yet.
pub fn rewrite_packet_id(
    mut request: Vec<u8>,
    new_id: Option<PacketId>,
) -> anyhow::Result<RewrittenRequest> {
    let header = PacketHeader::parse(&request);
    if header.version != IpbusVersion::V2_0 {
        return Ok(RewrittenRequest {
            version: header.version,
            bytes: request,
            stamped_id: None,
        });
    }

    let Some(new_id) = new_id else {
        bail!("cannot stamp a v2 request: next packet id is not known");
    };

    // a header that parsed as v2 always has a concrete endianness
    let id_bytes = match header.endianness {
        Endianness::Little => new_id.to_raw().to_le_bytes(),
        _ => new_id.to_raw().to_be_bytes(),
    };
    request[1..3].copy_from_slice(&id_bytes);

    Ok(RewrittenRequest {
        version: IpbusVersion::V2_0,
        bytes: request,
        stamped_id: Some(new_id),
    })
}
