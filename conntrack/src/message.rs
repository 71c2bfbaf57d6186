use std::time::{SystemTime, UNIX_EPOCH};

use netlink_packet_core::{
    NetlinkDeserializable, NetlinkHeader, NetlinkMessage, NetlinkPayload, NetlinkSerializable,
    NLM_F_DUMP, NLM_F_REQUEST,
};
use netlink_packet_utils::{DecodeError, Emitable};

use crate::{
    nlas::{parse_conn_nlas, ConnNla},
    Family,
};

pub const NFNL_SUBSYS_CTNETLINK: u16 = 1;
pub const IPCTNL_MSG_CT_NEW: u16 = 0;
pub const IPCTNL_MSG_CT_GET: u16 = 1;
pub const NFNETLINK_V0: u8 = 0;

/// The generic netfilter header following the netlink header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetfilterHeader {
    pub family: u8,
    pub version: u8,
    pub res_id: u16,
}

impl NetfilterHeader {
    pub const LEN: usize = 4;

    pub fn new(family: u8) -> NetfilterHeader {
        NetfilterHeader {
            family,
            version: NFNETLINK_V0,
            res_id: 0,
        }
    }

    fn parse(payload: &[u8]) -> Result<NetfilterHeader, DecodeError> {
        if payload.len() < Self::LEN {
            return Err(DecodeError::from(format!(
                "netfilter header too short: {}",
                payload.len()
            )));
        }
        Ok(NetfilterHeader {
            family: payload[0],
            version: payload[1],
            res_id: u16::from_be_bytes([payload[2], payload[3]]),
        })
    }
}

impl Emitable for NetfilterHeader {
    fn buffer_len(&self) -> usize {
        Self::LEN
    }

    fn emit(&self, buffer: &mut [u8]) {
        buffer[0] = self.family;
        buffer[1] = self.version;
        buffer[2..4].copy_from_slice(&self.res_id.to_be_bytes());
    }
}

/// One ctnetlink message: table dumps arrive as `New` entries, dump
/// requests leave as `Get`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CtNetlinkMessage {
    pub header: NetfilterHeader,
    pub op: CtOp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CtOp {
    New(Vec<ConnNla>),
    Get,
}

impl CtNetlinkMessage {
    pub fn new(header: NetfilterHeader, op: CtOp) -> CtNetlinkMessage {
        CtNetlinkMessage { header, op }
    }
}

impl NetlinkSerializable for CtNetlinkMessage {
    fn message_type(&self) -> u16 {
        let subtype = match self.op {
            CtOp::New(_) => IPCTNL_MSG_CT_NEW,
            CtOp::Get => IPCTNL_MSG_CT_GET,
        };
        (NFNL_SUBSYS_CTNETLINK << 8) | subtype
    }

    fn buffer_len(&self) -> usize {
        let payload = match &self.op {
            CtOp::New(nlas) => nlas.as_slice().buffer_len(),
            CtOp::Get => 0,
        };
        NetfilterHeader::LEN + payload
    }

    fn serialize(&self, buffer: &mut [u8]) {
        self.header.emit(&mut buffer[..NetfilterHeader::LEN]);
        if let CtOp::New(nlas) = &self.op {
            nlas.as_slice().emit(&mut buffer[NetfilterHeader::LEN..]);
        }
    }
}

impl NetlinkDeserializable for CtNetlinkMessage {
    type Error = DecodeError;

    fn deserialize(header: &NetlinkHeader, payload: &[u8]) -> Result<Self, Self::Error> {
        let subsys = header.message_type >> 8;
        if subsys != NFNL_SUBSYS_CTNETLINK {
            return Err(DecodeError::from(format!(
                "unexpected netfilter subsystem: {subsys}"
            )));
        }
        let nf_header = NetfilterHeader::parse(payload)?;
        let op = match header.message_type & 0x00ff {
            IPCTNL_MSG_CT_NEW => {
                CtOp::New(parse_conn_nlas(&payload[NetfilterHeader::LEN..])?)
            }
            IPCTNL_MSG_CT_GET => CtOp::Get,
            subtype => {
                return Err(DecodeError::from(format!(
                    "unsupported ctnetlink message type: {subtype}"
                )))
            }
        };
        Ok(CtNetlinkMessage::new(nf_header, op))
    }
}

/// Builds the full-table dump request for one address family.
#[derive(Debug, Clone, Copy)]
pub(super) struct DumpRequest {
    family: Family,
}

impl DumpRequest {
    pub(super) fn new(family: Family) -> DumpRequest {
        DumpRequest { family }
    }

    pub(super) fn message(&self) -> NetlinkMessage<CtNetlinkMessage> {
        let mut hdr = NetlinkHeader::default();
        hdr.flags = NLM_F_REQUEST | NLM_F_DUMP;
        hdr.sequence_number = wall_clock_secs();
        let mut msg = NetlinkMessage::new(
            hdr,
            NetlinkPayload::InnerMessage(CtNetlinkMessage::new(
                NetfilterHeader::new(self.family.into()),
                CtOp::Get,
            )),
        );
        msg.finalize();
        msg
    }
}

fn wall_clock_secs() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}
