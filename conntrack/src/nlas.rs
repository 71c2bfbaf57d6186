use std::net::{Ipv4Addr, Ipv6Addr};

use netlink_packet_utils::{
    nla::{Nla, NlaBuffer, NlasIterator},
    parsers::{parse_u16, parse_u16_be, parse_u32_be, parse_u64, parse_u8},
    DecodeError, Emitable,
};

pub const CTA_TUPLE_ORIG: u16 = 1;
pub const CTA_TUPLE_REPLY: u16 = 2;
pub const CTA_PROTOINFO: u16 = 4;
pub const CTA_TIMEOUT: u16 = 7;
pub const CTA_MARK: u16 = 8;
pub const CTA_COUNTERS_ORIG: u16 = 9;
pub const CTA_COUNTERS_REPLY: u16 = 10;
pub const CTA_SECMARK: u16 = 17;
pub const CTA_ZONE: u16 = 18;

pub const CTA_TUPLE_IP: u16 = 1;
pub const CTA_TUPLE_PROTO: u16 = 2;
pub const CTA_TUPLE_ZONE: u16 = 3;

pub const CTA_IP_V4_SRC: u16 = 1;
pub const CTA_IP_V4_DST: u16 = 2;
pub const CTA_IP_V6_SRC: u16 = 3;
pub const CTA_IP_V6_DST: u16 = 4;

pub const CTA_PROTO_NUM: u16 = 1;
pub const CTA_PROTO_SRC_PORT: u16 = 2;
pub const CTA_PROTO_DST_PORT: u16 = 3;
pub const CTA_PROTO_ICMP_ID: u16 = 4;
pub const CTA_PROTO_ICMP_TYPE: u16 = 5;
pub const CTA_PROTO_ICMP_CODE: u16 = 6;

pub const CTA_PROTOINFO_TCP: u16 = 1;
pub const CTA_PROTOINFO_TCP_STATE: u16 = 1;

pub const CTA_COUNTERS_PACKETS: u16 = 1;
pub const CTA_COUNTERS_BYTES: u16 = 2;
pub const CTA_COUNTERS32_PACKETS: u16 = 3;
pub const CTA_COUNTERS32_BYTES: u16 = 4;

/// Top-level conntrack attributes.
///
/// Byte-order policy: 64-bit counters and the u32 scalars arrive
/// big-endian and are converted to host order. Ports are kept in their
/// on-wire representation; consumers convert at the boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnNla {
    OrigTuple(Vec<TupleNla>),
    ReplyTuple(Vec<TupleNla>),
    CountersOrig(Vec<CounterNla>),
    CountersReply(Vec<CounterNla>),
    ProtoInfo(Vec<ProtoInfoNla>),
    Timeout(u32),
    Mark(u32),
    SecMark(u32),
    Zone(u16),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TupleNla {
    Ip(Vec<IpNla>),
    Proto(Vec<ProtoNla>),
    // Kept as received; only the top-level zone takes part in gating.
    Zone(u16),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpNla {
    V4Src(Ipv4Addr),
    V4Dst(Ipv4Addr),
    V6Src(Ipv6Addr),
    V6Dst(Ipv6Addr),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtoNla {
    Num(u8),
    /// Wire byte order.
    SrcPort(u16),
    /// Wire byte order.
    DstPort(u16),
    IcmpId(u16),
    IcmpType(u8),
    IcmpCode(u8),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtoInfoNla {
    Tcp(Vec<TcpInfoNla>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpInfoNla {
    State(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterNla {
    Packets(u64),
    Bytes(u64),
    Packets32(u32),
    Bytes32(u32),
}

fn parse_addr4(payload: &[u8]) -> Result<Ipv4Addr, DecodeError> {
    let octets: [u8; 4] = payload
        .try_into()
        .map_err(|_| DecodeError::from(format!("invalid IPv4 address length: {}", payload.len())))?;
    Ok(Ipv4Addr::from(octets))
}

fn parse_addr6(payload: &[u8]) -> Result<Ipv6Addr, DecodeError> {
    let octets: [u8; 16] = payload
        .try_into()
        .map_err(|_| DecodeError::from(format!("invalid IPv6 address length: {}", payload.len())))?;
    Ok(Ipv6Addr::from(octets))
}

fn parse_u64_be(payload: &[u8]) -> Result<u64, DecodeError> {
    Ok(u64::from_be(parse_u64(payload)?))
}

/// Walks one attribute level, parsing the kinds listed for that context
/// with a strict payload-shape check. Kinds outside the table are
/// skipped silently for forward compatibility; a known kind with the
/// wrong shape poisons the whole message.
macro_rules! parse_nlas {
    ($payload:expr, $ty:ident) => {{
        let mut nlas: Vec<$ty> = Vec::new();
        for nla in NlasIterator::new($payload) {
            let buf = nla?;
            if let Some(parsed) = $ty::parse(&buf)? {
                nlas.push(parsed);
            }
        }
        Ok::<Vec<$ty>, DecodeError>(nlas)
    }};
}

pub fn parse_conn_nlas(payload: &[u8]) -> Result<Vec<ConnNla>, DecodeError> {
    parse_nlas!(payload, ConnNla)
}

impl ConnNla {
    fn parse(buf: &NlaBuffer<&[u8]>) -> Result<Option<Self>, DecodeError> {
        let payload = buf.value();
        let nla = match buf.kind() {
            CTA_TUPLE_ORIG => ConnNla::OrigTuple(parse_nlas!(payload, TupleNla)?),
            CTA_TUPLE_REPLY => ConnNla::ReplyTuple(parse_nlas!(payload, TupleNla)?),
            CTA_COUNTERS_ORIG => ConnNla::CountersOrig(parse_nlas!(payload, CounterNla)?),
            CTA_COUNTERS_REPLY => ConnNla::CountersReply(parse_nlas!(payload, CounterNla)?),
            CTA_PROTOINFO => ConnNla::ProtoInfo(parse_nlas!(payload, ProtoInfoNla)?),
            CTA_TIMEOUT => ConnNla::Timeout(parse_u32_be(payload)?),
            CTA_MARK => ConnNla::Mark(parse_u32_be(payload)?),
            CTA_SECMARK => ConnNla::SecMark(parse_u32_be(payload)?),
            CTA_ZONE => ConnNla::Zone(parse_u16_be(payload)?),
            _ => return Ok(None),
        };
        Ok(Some(nla))
    }
}

impl TupleNla {
    fn parse(buf: &NlaBuffer<&[u8]>) -> Result<Option<Self>, DecodeError> {
        let payload = buf.value();
        let nla = match buf.kind() {
            CTA_TUPLE_IP => TupleNla::Ip(parse_nlas!(payload, IpNla)?),
            CTA_TUPLE_PROTO => TupleNla::Proto(parse_nlas!(payload, ProtoNla)?),
            CTA_TUPLE_ZONE => TupleNla::Zone(parse_u16(payload)?),
            _ => return Ok(None),
        };
        Ok(Some(nla))
    }
}

impl IpNla {
    fn parse(buf: &NlaBuffer<&[u8]>) -> Result<Option<Self>, DecodeError> {
        let payload = buf.value();
        let nla = match buf.kind() {
            CTA_IP_V4_SRC => IpNla::V4Src(parse_addr4(payload)?),
            CTA_IP_V4_DST => IpNla::V4Dst(parse_addr4(payload)?),
            CTA_IP_V6_SRC => IpNla::V6Src(parse_addr6(payload)?),
            CTA_IP_V6_DST => IpNla::V6Dst(parse_addr6(payload)?),
            _ => return Ok(None),
        };
        Ok(Some(nla))
    }
}

impl ProtoNla {
    fn parse(buf: &NlaBuffer<&[u8]>) -> Result<Option<Self>, DecodeError> {
        let payload = buf.value();
        let nla = match buf.kind() {
            CTA_PROTO_NUM => ProtoNla::Num(parse_u8(payload)?),
            CTA_PROTO_SRC_PORT => ProtoNla::SrcPort(parse_u16(payload)?),
            CTA_PROTO_DST_PORT => ProtoNla::DstPort(parse_u16(payload)?),
            CTA_PROTO_ICMP_ID => ProtoNla::IcmpId(parse_u16(payload)?),
            CTA_PROTO_ICMP_TYPE => ProtoNla::IcmpType(parse_u8(payload)?),
            CTA_PROTO_ICMP_CODE => ProtoNla::IcmpCode(parse_u8(payload)?),
            _ => return Ok(None),
        };
        Ok(Some(nla))
    }
}

impl ProtoInfoNla {
    fn parse(buf: &NlaBuffer<&[u8]>) -> Result<Option<Self>, DecodeError> {
        let payload = buf.value();
        let nla = match buf.kind() {
            CTA_PROTOINFO_TCP => ProtoInfoNla::Tcp(parse_nlas!(payload, TcpInfoNla)?),
            _ => return Ok(None),
        };
        Ok(Some(nla))
    }
}

impl TcpInfoNla {
    fn parse(buf: &NlaBuffer<&[u8]>) -> Result<Option<Self>, DecodeError> {
        let payload = buf.value();
        let nla = match buf.kind() {
            CTA_PROTOINFO_TCP_STATE => TcpInfoNla::State(parse_u8(payload)?),
            _ => return Ok(None),
        };
        Ok(Some(nla))
    }
}

impl CounterNla {
    fn parse(buf: &NlaBuffer<&[u8]>) -> Result<Option<Self>, DecodeError> {
        let payload = buf.value();
        let nla = match buf.kind() {
            CTA_COUNTERS_PACKETS => CounterNla::Packets(parse_u64_be(payload)?),
            CTA_COUNTERS_BYTES => CounterNla::Bytes(parse_u64_be(payload)?),
            CTA_COUNTERS32_PACKETS => CounterNla::Packets32(parse_u32_be(payload)?),
            CTA_COUNTERS32_BYTES => CounterNla::Bytes32(parse_u32_be(payload)?),
            _ => return Ok(None),
        };
        Ok(Some(nla))
    }
}

impl Nla for ConnNla {
    fn value_len(&self) -> usize {
        match self {
            ConnNla::OrigTuple(nlas) | ConnNla::ReplyTuple(nlas) => nlas.as_slice().buffer_len(),
            ConnNla::CountersOrig(nlas) | ConnNla::CountersReply(nlas) => {
                nlas.as_slice().buffer_len()
            }
            ConnNla::ProtoInfo(nlas) => nlas.as_slice().buffer_len(),
            ConnNla::Timeout(_) | ConnNla::Mark(_) | ConnNla::SecMark(_) => 4,
            ConnNla::Zone(_) => 2,
        }
    }

    fn kind(&self) -> u16 {
        match self {
            ConnNla::OrigTuple(_) => CTA_TUPLE_ORIG,
            ConnNla::ReplyTuple(_) => CTA_TUPLE_REPLY,
            ConnNla::CountersOrig(_) => CTA_COUNTERS_ORIG,
            ConnNla::CountersReply(_) => CTA_COUNTERS_REPLY,
            ConnNla::ProtoInfo(_) => CTA_PROTOINFO,
            ConnNla::Timeout(_) => CTA_TIMEOUT,
            ConnNla::Mark(_) => CTA_MARK,
            ConnNla::SecMark(_) => CTA_SECMARK,
            ConnNla::Zone(_) => CTA_ZONE,
        }
    }

    fn emit_value(&self, buffer: &mut [u8]) {
        match self {
            ConnNla::OrigTuple(nlas) | ConnNla::ReplyTuple(nlas) => nlas.as_slice().emit(buffer),
            ConnNla::CountersOrig(nlas) | ConnNla::CountersReply(nlas) => {
                nlas.as_slice().emit(buffer)
            }
            ConnNla::ProtoInfo(nlas) => nlas.as_slice().emit(buffer),
            ConnNla::Timeout(v) | ConnNla::Mark(v) | ConnNla::SecMark(v) => {
                buffer[..4].copy_from_slice(&v.to_be_bytes())
            }
            ConnNla::Zone(v) => buffer[..2].copy_from_slice(&v.to_be_bytes()),
        }
    }
}

impl Nla for TupleNla {
    fn value_len(&self) -> usize {
        match self {
            TupleNla::Ip(nlas) => nlas.as_slice().buffer_len(),
            TupleNla::Proto(nlas) => nlas.as_slice().buffer_len(),
            TupleNla::Zone(_) => 2,
        }
    }

    fn kind(&self) -> u16 {
        match self {
            TupleNla::Ip(_) => CTA_TUPLE_IP,
            TupleNla::Proto(_) => CTA_TUPLE_PROTO,
            TupleNla::Zone(_) => CTA_TUPLE_ZONE,
        }
    }

    fn emit_value(&self, buffer: &mut [u8]) {
        match self {
            TupleNla::Ip(nlas) => nlas.as_slice().emit(buffer),
            TupleNla::Proto(nlas) => nlas.as_slice().emit(buffer),
            TupleNla::Zone(v) => buffer[..2].copy_from_slice(&v.to_ne_bytes()),
        }
    }
}

impl Nla for IpNla {
    fn value_len(&self) -> usize {
        match self {
            IpNla::V4Src(_) | IpNla::V4Dst(_) => 4,
            IpNla::V6Src(_) | IpNla::V6Dst(_) => 16,
        }
    }

    fn kind(&self) -> u16 {
        match self {
            IpNla::V4Src(_) => CTA_IP_V4_SRC,
            IpNla::V4Dst(_) => CTA_IP_V4_DST,
            IpNla::V6Src(_) => CTA_IP_V6_SRC,
            IpNla::V6Dst(_) => CTA_IP_V6_DST,
        }
    }

    fn emit_value(&self, buffer: &mut [u8]) {
        match self {
            IpNla::V4Src(a) | IpNla::V4Dst(a) => buffer[..4].copy_from_slice(&a.octets()),
            IpNla::V6Src(a) | IpNla::V6Dst(a) => buffer[..16].copy_from_slice(&a.octets()),
        }
    }
}

impl Nla for ProtoNla {
    fn value_len(&self) -> usize {
        match self {
            ProtoNla::Num(_) | ProtoNla::IcmpType(_) | ProtoNla::IcmpCode(_) => 1,
            ProtoNla::SrcPort(_) | ProtoNla::DstPort(_) | ProtoNla::IcmpId(_) => 2,
        }
    }

    fn kind(&self) -> u16 {
        match self {
            ProtoNla::Num(_) => CTA_PROTO_NUM,
            ProtoNla::SrcPort(_) => CTA_PROTO_SRC_PORT,
            ProtoNla::DstPort(_) => CTA_PROTO_DST_PORT,
            ProtoNla::IcmpId(_) => CTA_PROTO_ICMP_ID,
            ProtoNla::IcmpType(_) => CTA_PROTO_ICMP_TYPE,
            ProtoNla::IcmpCode(_) => CTA_PROTO_ICMP_CODE,
        }
    }

    fn emit_value(&self, buffer: &mut [u8]) {
        match self {
            ProtoNla::Num(v) | ProtoNla::IcmpType(v) | ProtoNla::IcmpCode(v) => buffer[0] = *v,
            // Ports are stored as received, so a native store restores the wire bytes.
            ProtoNla::SrcPort(v) | ProtoNla::DstPort(v) | ProtoNla::IcmpId(v) => {
                buffer[..2].copy_from_slice(&v.to_ne_bytes())
            }
        }
    }
}

impl Nla for ProtoInfoNla {
    fn value_len(&self) -> usize {
        match self {
            ProtoInfoNla::Tcp(nlas) => nlas.as_slice().buffer_len(),
        }
    }

    fn kind(&self) -> u16 {
        match self {
            ProtoInfoNla::Tcp(_) => CTA_PROTOINFO_TCP,
        }
    }

    fn emit_value(&self, buffer: &mut [u8]) {
        match self {
            ProtoInfoNla::Tcp(nlas) => nlas.as_slice().emit(buffer),
        }
    }
}

impl Nla for TcpInfoNla {
    fn value_len(&self) -> usize {
        match self {
            TcpInfoNla::State(_) => 1,
        }
    }

    fn kind(&self) -> u16 {
        match self {
            TcpInfoNla::State(_) => CTA_PROTOINFO_TCP_STATE,
        }
    }

    fn emit_value(&self, buffer: &mut [u8]) {
        match self {
            TcpInfoNla::State(v) => buffer[0] = *v,
        }
    }
}

impl Nla for CounterNla {
    fn value_len(&self) -> usize {
        match self {
            CounterNla::Packets(_) | CounterNla::Bytes(_) => 8,
            CounterNla::Packets32(_) | CounterNla::Bytes32(_) => 4,
        }
    }

    fn kind(&self) -> u16 {
        match self {
            CounterNla::Packets(_) => CTA_COUNTERS_PACKETS,
            CounterNla::Bytes(_) => CTA_COUNTERS_BYTES,
            CounterNla::Packets32(_) => CTA_COUNTERS32_PACKETS,
            CounterNla::Bytes32(_) => CTA_COUNTERS32_BYTES,
        }
    }

    fn emit_value(&self, buffer: &mut [u8]) {
        match self {
            CounterNla::Packets(v) | CounterNla::Bytes(v) => {
                buffer[..8].copy_from_slice(&v.to_be_bytes())
            }
            CounterNla::Packets32(v) | CounterNla::Bytes32(v) => {
                buffer[..4].copy_from_slice(&v.to_be_bytes())
            }
        }
    }
}
