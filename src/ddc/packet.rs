//! DDC/CI packet framing and parsing.
//!
//! The wire format is bit-exact: `[dest, source, len|0x80, data.., checksum]`.
//! Requests are built with destination `0x6e` (monitor slave) and source
//! `0x51` (host); responses are received with source `0x6e` and a
//! destination byte that real hardware never actually sends — we synthesize
//! `0x6f` for it before computing the checksum.

use nom::bytes::complete::take;
use nom::number::complete::le_u8;
use nom::{IResult, Parser};

use super::error::DdcError;

/// I2C slave address every DDC/CI monitor answers at.
pub const SLAVE_ADDRESS: u8 = 0x37;

const REQ_DEST: u8 = 0x6e;
const RESP_DEST_SYNTH: u8 = 0x6f;
const REQ_SRC: u8 = 0x51;
const RESP_SRC: u8 = 0x6e;
const LEN_PREFIX: u8 = 0x80;
const RESP_CHECKSUM_SEED: u8 = 0x50;

const OP_GET_VCP: u8 = 0x01;
const OP_SET_VCP: u8 = 0x03;
const OP_SAVE_SETTINGS: u8 = 0x0c;
const OP_CAPABILITIES_REQUEST: u8 = 0xf3;
const OP_CAPABILITIES_REPLY: u8 = 0xe3;
const OP_TABLE_READ_REQUEST: u8 = 0xe2;
const OP_TABLE_READ_REPLY: u8 = 0xe4;
const OP_TABLE_WRITE: u8 = 0xe7;
const OP_VCP_REPLY: u8 = 0x02;

/// The exact 4-byte Null Response sentinel.
pub const NULL_RESPONSE_WIRE: [u8; 4] = [RESP_DEST_SYNTH, RESP_SRC, 0x80, 0xbe];

/// Maximum data-byte payload in any single DDC/CI fragment.
pub const MAX_FRAGMENT_LEN: usize = 32;

/// Tagged kind of a packet, request or response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    GetVcpRequest,
    SetVcpRequest,
    SaveSettingsRequest,
    CapabilitiesRequest,
    TableReadRequest,
    TableWriteRequest,
    NonTableVcpResponse,
    MultiPartReadResponse,
}

/// Which multi-part protocol a fragment reply belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MultiPartKind {
    Capabilities,
    TableRead,
}

/// A parsed non-table VCP reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NonTableVcpResponse {
    pub vcp_code: u8,
    pub result_code: u8,
    pub type_code: u8,
    pub max_hi: u8,
    pub max_lo: u8,
    pub cur_hi: u8,
    pub cur_lo: u8,
}

impl NonTableVcpResponse {
    pub fn max_value(&self) -> u16 {
        (self.max_hi as u16) << 8 | self.max_lo as u16
    }

    pub fn cur_value(&self) -> u16 {
        (self.cur_hi as u16) << 8 | self.cur_lo as u16
    }

    /// `result_code == 0x00`: a genuine, usable reply.
    pub fn valid_response(&self) -> bool {
        self.result_code == 0x00
    }

    /// `result_code != 0x01`: the opcode itself was recognized (it may still
    /// be invalid for another reason, see `valid_response`).
    pub fn supported_opcode(&self) -> bool {
        self.result_code != 0x01
    }
}

/// A parsed multi-part fragment (capabilities or table read reply).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultiPartFragment {
    pub fragment_kind: MultiPartKind,
    pub offset: u16,
    pub payload: Vec<u8>,
}

/// The decoded view attached to a parsed response packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedResponse {
    /// The canonical Null Response sentinel.
    Null,
    NonTableVcp(NonTableVcpResponse),
    MultiPart(MultiPartFragment),
}

/// A heap-owned packet: the exact wire bytes plus, for responses, the
/// decoded view.
#[derive(Debug, Clone)]
pub struct Packet {
    bytes: Vec<u8>,
    kind: PacketKind,
    parsed: Option<ParsedResponse>,
}

impl Packet {
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn kind(&self) -> PacketKind {
        self.kind
    }

    pub fn parsed(&self) -> Option<&ParsedResponse> {
        self.parsed.as_ref()
    }

    fn request(kind: PacketKind, data: &[u8]) -> Self {
        debug_assert!(data.len() <= MAX_FRAGMENT_LEN);
        let mut bytes = Vec::with_capacity(3 + data.len() + 1);
        bytes.push(REQ_DEST);
        bytes.push(REQ_SRC);
        bytes.push(LEN_PREFIX | data.len() as u8);
        bytes.extend_from_slice(data);
        let chk = checksum(&bytes, REQ_DEST);
        bytes.push(chk);
        Packet {
            bytes,
            kind,
            parsed: None,
        }
    }

    /// `GetVcp(code)`.
    pub fn get_vcp_request(code: u8) -> Self {
        Self::request(PacketKind::GetVcpRequest, &[OP_GET_VCP, code])
    }

    /// `SetVcp(code, value)`.
    pub fn set_vcp_request(code: u8, value: u16) -> Self {
        Self::request(
            PacketKind::SetVcpRequest,
            &[OP_SET_VCP, code, (value >> 8) as u8, (value & 0xff) as u8],
        )
    }

    /// `SaveSettings`.
    pub fn save_settings_request() -> Self {
        Self::request(PacketKind::SaveSettingsRequest, &[OP_SAVE_SETTINGS])
    }

    /// `CapabilitiesRequest(offset)`.
    ///
    /// The source computes the offset high byte with `offset >> 16`, which
    /// truncates any offset above 16 bits to zero — a quirk of the original
    /// implementation. It is preserved here
    /// literally. In practice the multi-part transfer (`ddc::multipart`)
    /// only ever calls this builder with `offset == 0` — the first request
    /// of a capabilities read — where `>>16` and the "correct" `>>8` agree,
    /// so the bug never manifests; subsequent offsets go through
    /// `update_offset`, which uses `>>8`. See DESIGN.md.
    pub fn capabilities_request(offset: u32) -> Self {
        Self::request(
            PacketKind::CapabilitiesRequest,
            &[
                OP_CAPABILITIES_REQUEST,
                (offset >> 16) as u8,
                (offset & 0xff) as u8,
            ],
        )
    }

    /// `TableReadRequest(code, offset)`. Same `>>16` quirk as above.
    pub fn table_read_request(code: u8, offset: u32) -> Self {
        Self::request(
            PacketKind::TableReadRequest,
            &[OP_TABLE_READ_REQUEST, code, (offset >> 16) as u8, (offset & 0xff) as u8],
        )
    }

    /// `TableWriteRequest(code, offset, payload)`, `payload.len() <= 31`.
    pub fn table_write_request(code: u8, offset: u32, payload: &[u8]) -> Result<Self, DdcError> {
        if payload.len() > MAX_FRAGMENT_LEN - 1 {
            return Err(DdcError::MalformedData("table write payload too long"));
        }
        let mut data = Vec::with_capacity(4 + payload.len());
        data.push(OP_TABLE_WRITE);
        data.push(code);
        data.push((offset >> 16) as u8);
        data.push((offset & 0xff) as u8);
        data.extend_from_slice(payload);
        Ok(Self::request(PacketKind::TableWriteRequest, &data))
    }

    /// Mutate the two offset bytes of a capabilities/table-read request in
    /// place and recompute the checksum, without re-encoding the rest of the
    /// packet. Uses the correct
    /// `offset >> 8` / `offset & 0xff` split.
    pub fn update_offset(&mut self, offset: u16) {
        debug_assert!(matches!(
            self.kind,
            PacketKind::CapabilitiesRequest | PacketKind::TableReadRequest
        ));
        // data layout: [opcode, (code,) off_hi, off_lo, ...]; offset bytes
        // are always the last two bytes before the checksum.
        let n = self.bytes.len();
        self.bytes[n - 3] = (offset >> 8) as u8;
        self.bytes[n - 2] = (offset & 0xff) as u8;
        let chk = checksum(&self.bytes, REQ_DEST);
        *self.bytes.last_mut().unwrap() = chk;
    }

    /// Parse a received buffer.1 "Response parse".
    ///
    /// `expected_opcode` is `0x02` for a VCP reply, `0xe4` for a table read
    /// reply, or `0xe3` for a capabilities reply. `requested_vcp_code` is
    /// `Some(code)` for a VCP reply, checked against `data[2]` per step 6;
    /// it is ignored for every other `expected_opcode`.
    pub fn parse_response(
        raw: &[u8],
        expected_opcode: u8,
        requested_vcp_code: Option<u8>,
    ) -> Result<Self, DdcError> {
        if raw.len() < 4 {
            return Err(DdcError::MalformedData("response too short"));
        }
        if raw[0..4] == NULL_RESPONSE_WIRE {
            // The Null Response sentinel is the one reply that carries the
            // synthesized destination byte (0x6F) on the wire rather than
            // omitting it. Recognized on the leading 4
            // bytes alone; a block read may pad the rest with zeros.
            return Ok(Packet {
                bytes: NULL_RESPONSE_WIRE.to_vec(),
                kind: PacketKind::NonTableVcpResponse,
                parsed: Some(ParsedResponse::Null),
            });
        }
        if raw[0] != RESP_SRC {
            return Err(DdcError::MalformedData("unexpected source byte"));
        }
        let len_byte = raw[1];
        let data_len = (len_byte & 0x7f) as usize;
        if data_len > MAX_FRAGMENT_LEN {
            return Err(DdcError::MalformedData("length field too large"));
        }
        if len_byte == raw[0] {
            // "double-byte" hardware artifact: length byte equals source byte.
            return Err(DdcError::MalformedData("double-byte artifact"));
        }

        let total = 2 + data_len + 1; // source, length, data.., checksum
        if raw.len() < total {
            return Err(DdcError::MalformedData("response truncated"));
        }

        // Synthesize the canonical buffer and verify the checksum with seed 0x50.
        let mut synth = Vec::with_capacity(2 + total);
        synth.push(RESP_DEST_SYNTH);
        synth.push(RESP_SRC);
        synth.push(len_byte);
        synth.extend_from_slice(&raw[2..2 + data_len]);
        let checksum_byte = raw[2 + data_len];
        synth.push(checksum_byte);
        let computed = checksum(&synth, RESP_CHECKSUM_SEED);
        if computed != checksum_byte {
            return Err(DdcError::MalformedData("checksum mismatch"));
        }

        if data_len == 0 {
            return Ok(Packet {
                bytes: NULL_RESPONSE_WIRE.to_vec(),
                kind: PacketKind::NonTableVcpResponse,
                parsed: Some(ParsedResponse::Null),
            });
        }

        let data = &synth[3..3 + data_len];
        let (_, first_byte) = le_u8::<&[u8], nom::error::Error<_>>
            .parse(data)
            .map_err(|_| DdcError::MalformedData("empty data"))?;
        if first_byte != expected_opcode {
            return Err(DdcError::MalformedData("unexpected opcode"));
        }

        match expected_opcode {
            OP_VCP_REPLY => parse_non_table_vcp(&synth, data, requested_vcp_code),
            OP_TABLE_READ_REPLY => parse_multi_part(&synth, data, MultiPartKind::TableRead),
            OP_CAPABILITIES_REPLY => parse_multi_part(&synth, data, MultiPartKind::Capabilities),
            _ => Err(DdcError::MalformedData("unsupported expected opcode")),
        }
    }
}

fn parse_non_table_vcp(
    synth: &[u8],
    data: &[u8],
    requested_vcp_code: Option<u8>,
) -> Result<Packet, DdcError> {
    if data.len() != 8 {
        return Err(DdcError::MalformedData("non-table VCP reply must have 8 data bytes"));
    }
    let (rest, _opcode) = le_u8::<&[u8], nom::error::Error<_>>
        .parse(data)
        .map_err(|_| DdcError::MalformedData("parse error"))?;
    let (rest, result_code) = le_u8::<&[u8], nom::error::Error<_>>
        .parse(rest)
        .map_err(|_| DdcError::MalformedData("parse error"))?;
    if result_code != 0x00 && result_code != 0x01 {
        return Err(DdcError::MalformedData("invalid result code"));
    }
    let (rest, req_code) = le_u8::<&[u8], nom::error::Error<_>>
        .parse(rest)
        .map_err(|_| DdcError::MalformedData("parse error"))?;
    if let Some(requested) = requested_vcp_code {
        if req_code != requested {
            return Err(DdcError::MalformedData("vcp code mismatch"));
        }
    }
    let (rest, type_code) = le_u8::<&[u8], nom::error::Error<_>>
        .parse(rest)
        .map_err(|_| DdcError::MalformedData("parse error"))?;
    let (rest, max_hi) = le_u8::<&[u8], nom::error::Error<_>>
        .parse(rest)
        .map_err(|_| DdcError::MalformedData("parse error"))?;
    let (rest, max_lo) = le_u8::<&[u8], nom::error::Error<_>>
        .parse(rest)
        .map_err(|_| DdcError::MalformedData("parse error"))?;
    let (rest, cur_hi) = le_u8::<&[u8], nom::error::Error<_>>
        .parse(rest)
        .map_err(|_| DdcError::MalformedData("parse error"))?;
    let (_rest, cur_lo) = le_u8::<&[u8], nom::error::Error<_>>
        .parse(rest)
        .map_err(|_| DdcError::MalformedData("parse error"))?;

    let resp = NonTableVcpResponse {
        vcp_code: req_code,
        result_code,
        type_code,
        max_hi,
        max_lo,
        cur_hi,
        cur_lo,
    };

    Ok(Packet {
        bytes: synth.to_vec(),
        kind: PacketKind::NonTableVcpResponse,
        parsed: Some(ParsedResponse::NonTableVcp(resp)),
    })
}

fn parse_multi_part(synth: &[u8], data: &[u8], kind: MultiPartKind) -> Result<Packet, DdcError> {
    if data.len() < 3 || data.len() > 35 {
        return Err(DdcError::MalformedData("multi-part fragment length out of range"));
    }
    let (rest, _opcode) = le_u8::<&[u8], nom::error::Error<_>>
        .parse(data)
        .map_err(|_| DdcError::MalformedData("parse error"))?;
    let (rest, off_hi) = le_u8::<&[u8], nom::error::Error<_>>
        .parse(rest)
        .map_err(|_| DdcError::MalformedData("parse error"))?;
    let (rest, off_lo) = le_u8::<&[u8], nom::error::Error<_>>
        .parse(rest)
        .map_err(|_| DdcError::MalformedData("parse error"))?;
    let offset = (off_hi as u16) << 8 | off_lo as u16;
    let payload_len = data.len() - 3;
    let (_rest, payload) = take::<usize, &[u8], nom::error::Error<_>>(payload_len)
        .parse(rest)
        .map_err(|_| DdcError::MalformedData("parse error"))?;

    Ok(Packet {
        bytes: synth.to_vec(),
        kind: PacketKind::MultiPartReadResponse,
        parsed: Some(ParsedResponse::MultiPart(MultiPartFragment {
            fragment_kind: kind,
            offset,
            payload: payload.to_vec(),
        })),
    })
}

/// XOR checksum with the given seed, over `bytes[1..len-1]`.
/// For a request, pass `bytes[0]` (`0x6e`) as the seed — since `bytes[0]`
/// equals the seed in that case, this is equivalent to XORing the whole
/// buffer except the trailing checksum byte. For a synthesized response
/// buffer, pass `0x50`, which does not equal `bytes[0]` (`0x6f`).
fn checksum(bytes: &[u8], seed: u8) -> u8 {
    let mut c = seed;
    for &b in &bytes[1..bytes.len() - 1] {
        c ^= b;
    }
    c
}
