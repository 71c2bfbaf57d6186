use std::fmt;
use std::net::IpAddr;

use serde::Serialize;
use tracing::trace;

use crate::{
    nlas::{ConnNla, CounterNla, IpNla, ProtoInfoNla, ProtoNla, TcpInfoNla, TupleNla},
    Family,
};

pub const IPPROTO_UDP: u8 = 17;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum TcpState {
    None,
    SynSent,
    SynRecv,
    Established,
    FinWait,
    CloseWait,
    LastAck,
    TimeWait,
    Close,
    Listen,
    Max,
    Ignore,
    Retrans,
    Unack,
    TimeoutMax,
}

impl TryFrom<u8> for TcpState {
    type Error = u8;

    fn try_from(s: u8) -> Result<Self, Self::Error> {
        match s {
            0 => Ok(TcpState::None),
            1 => Ok(TcpState::SynSent),
            2 => Ok(TcpState::SynRecv),
            3 => Ok(TcpState::Established),
            4 => Ok(TcpState::FinWait),
            5 => Ok(TcpState::CloseWait),
            6 => Ok(TcpState::LastAck),
            7 => Ok(TcpState::TimeWait),
            8 => Ok(TcpState::Close),
            9 => Ok(TcpState::Listen),
            10 => Ok(TcpState::Max),
            11 => Ok(TcpState::Ignore),
            12 => Ok(TcpState::Retrans),
            13 => Ok(TcpState::Unack),
            14 => Ok(TcpState::TimeoutMax),
            _ => Err(s),
        }
    }
}

impl TcpState {
    /// States in which a tracked connection is being set up or carries
    /// traffic.
    pub fn starts_flow(self) -> bool {
        matches!(
            self,
            TcpState::SynSent | TcpState::SynRecv | TcpState::Established
        )
    }

    /// States in which a tracked connection is winding down.
    pub fn ends_flow(self) -> bool {
        matches!(
            self,
            TcpState::FinWait
                | TcpState::CloseWait
                | TcpState::LastAck
                | TcpState::TimeWait
                | TcpState::Close
                | TcpState::TimeoutMax
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Layer3Info {
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    /// Wire byte order, as received; consumers convert at the boundary.
    pub src_port: u16,
    /// Wire byte order, as received.
    pub dst_port: u16,
    pub proto: u8,
    pub family: Family,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PktCounters {
    pub packets: u64,
    pub bytes: u64,
}

/// One directional counter observation taken from a conntrack entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CtFlow {
    pub layer3: Layer3Info,
    pub counters: PktCounters,
    pub ct_zone: u16,
    pub start: bool,
    pub end: bool,
}

impl fmt::Display for CtFlow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "proto={} src={}:{} dst={}:{} packets={} bytes={}",
            self.layer3.proto,
            self.layer3.src_ip,
            u16::from_be(self.layer3.src_port),
            self.layer3.dst_ip,
            u16::from_be(self.layer3.dst_port),
            self.counters.packets,
            self.counters.bytes,
        )
    }
}

/// Turns one parsed conntrack entry into 0, 1 or 2 directional flow
/// samples. Entries outside `ct_zone` and entries missing a required
/// attribute produce nothing.
pub fn flows_from_entry(nlas: &[ConnNla], ct_zone: u16) -> Vec<CtFlow> {
    let mut zone = None;
    let mut orig = None;
    let mut reply = None;
    let mut counters_orig = None;
    let mut counters_reply = None;
    let mut protoinfo = None;
    for nla in nlas {
        match nla {
            ConnNla::Zone(z) => zone = Some(*z),
            ConnNla::OrigTuple(t) => orig = Some(t),
            ConnNla::ReplyTuple(t) => reply = Some(t),
            ConnNla::CountersOrig(c) => counters_orig = Some(c),
            ConnNla::CountersReply(c) => counters_reply = Some(c),
            ConnNla::ProtoInfo(p) => protoinfo = Some(p),
            _ => {}
        }
    }

    // Zone 0 flows do not carry the zone attribute.
    let zone = zone.unwrap_or(0);
    if zone != ct_zone {
        return Vec::new();
    }

    let Some(fwd_l3) = orig.and_then(|t| layer3_from_tuple(t)) else {
        return Vec::new();
    };
    let Some(rev_l3) = reply.and_then(|t| layer3_from_tuple(t)) else {
        return Vec::new();
    };
    let mut fwd = CtFlow {
        layer3: fwd_l3,
        counters: PktCounters::default(),
        ct_zone: zone,
        start: false,
        end: false,
    };
    let mut rev = CtFlow {
        layer3: rev_l3,
        counters: PktCounters::default(),
        ct_zone: zone,
        start: false,
        end: false,
    };

    // A broadcast-looking IPv4 source has no usable reverse direction.
    // Everything else gets its destinations rewritten so the pair reads
    // orig-src -> reply-src and reply-src -> orig-src.
    let mut collapsed = false;
    if let (IpAddr::V4(fwd_src), IpAddr::V4(rev_src)) = (fwd.layer3.src_ip, rev.layer3.src_ip) {
        if fwd_src.octets()[0] == 0xff {
            collapsed = true;
        } else {
            fwd.layer3.dst_ip = IpAddr::V4(rev_src);
            rev.layer3.dst_ip = IpAddr::V4(fwd_src);
        }
    }

    if fwd.layer3.proto != IPPROTO_UDP {
        let Some(protoinfo) = protoinfo else {
            trace!("missing protocol info, dropping conntrack flow");
            return Vec::new();
        };
        if let Some(state) = tcp_state_from_protoinfo(protoinfo) {
            match TcpState::try_from(state) {
                Ok(s) if s.starts_flow() => {
                    fwd.start = true;
                    trace!("tcp flow started");
                }
                Ok(s) if s.ends_flow() => {
                    fwd.end = true;
                    trace!("tcp flow ended");
                }
                _ => {}
            }
        }
    }

    let Some(counters_orig) = counters_orig else {
        return Vec::new();
    };
    fwd.counters = counters_from(counters_orig);

    let mut flows = vec![fwd];
    if collapsed {
        return flows;
    }
    let Some(counters_reply) = counters_reply else {
        return flows;
    };
    rev.counters = counters_from(counters_reply);
    flows.push(rev);
    flows
}

fn layer3_from_tuple(nlas: &[TupleNla]) -> Option<Layer3Info> {
    let mut src_ip = None;
    let mut dst_ip = None;
    let mut src_port = 0;
    let mut dst_port = 0;
    let mut proto = 0;
    for nla in nlas {
        match nla {
            TupleNla::Ip(ip_nlas) => {
                for ip in ip_nlas {
                    match ip {
                        IpNla::V4Src(a) => src_ip = Some(IpAddr::V4(*a)),
                        IpNla::V4Dst(a) => dst_ip = Some(IpAddr::V4(*a)),
                        IpNla::V6Src(a) => src_ip = Some(IpAddr::V6(*a)),
                        IpNla::V6Dst(a) => dst_ip = Some(IpAddr::V6(*a)),
                    }
                }
            }
            TupleNla::Proto(proto_nlas) => {
                for p in proto_nlas {
                    match p {
                        ProtoNla::Num(n) => proto = *n,
                        ProtoNla::SrcPort(p) => src_port = *p,
                        ProtoNla::DstPort(p) => dst_port = *p,
                        // ICMP identifiers are validated but not surfaced.
                        ProtoNla::IcmpId(_) | ProtoNla::IcmpType(_) | ProtoNla::IcmpCode(_) => {}
                    }
                }
            }
            TupleNla::Zone(zone) => {
                trace!(tuple_zone = u16::from_be(*zone), "tuple zone");
            }
        }
    }
    let src_ip = src_ip?;
    let dst_ip = dst_ip?;
    let family = match src_ip {
        IpAddr::V4(_) => Family::Ipv4,
        IpAddr::V6(_) => Family::Ipv6,
    };
    Some(Layer3Info {
        src_ip,
        dst_ip,
        src_port,
        dst_port,
        proto,
        family,
    })
}

fn tcp_state_from_protoinfo(nlas: &[ProtoInfoNla]) -> Option<u8> {
    let mut state = None;
    for nla in nlas {
        let ProtoInfoNla::Tcp(tcp_nlas) = nla;
        for tcp in tcp_nlas {
            let TcpInfoNla::State(s) = tcp;
            state = Some(*s);
        }
    }
    state
}

fn counters_from(nlas: &[CounterNla]) -> PktCounters {
    let mut counters = PktCounters::default();
    // 32-bit fallbacks first; the 64-bit counters win when both exist.
    for nla in nlas {
        match nla {
            CounterNla::Packets32(v) => counters.packets = u64::from(*v),
            CounterNla::Bytes32(v) => counters.bytes = u64::from(*v),
            _ => {}
        }
    }
    for nla in nlas {
        match nla {
            CounterNla::Packets(v) => counters.packets = *v,
            CounterNla::Bytes(v) => counters.bytes = *v,
            _ => {}
        }
    }
    counters
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn ip_tuple(src: &str, dst: &str) -> TupleNla {
        let src: IpAddr = src.parse().unwrap();
        let dst: IpAddr = dst.parse().unwrap();
        match (src, dst) {
            (IpAddr::V4(s), IpAddr::V4(d)) => {
                TupleNla::Ip(vec![IpNla::V4Src(s), IpNla::V4Dst(d)])
            }
            (IpAddr::V6(s), IpAddr::V6(d)) => {
                TupleNla::Ip(vec![IpNla::V6Src(s), IpNla::V6Dst(d)])
            }
            _ => panic!("mixed families"),
        }
    }

    fn tuple(src: &str, dst: &str, sport: u16, dport: u16, proto: u8) -> Vec<TupleNla> {
        vec![
            ip_tuple(src, dst),
            TupleNla::Proto(vec![
                ProtoNla::Num(proto),
                ProtoNla::SrcPort(sport.to_be()),
                ProtoNla::DstPort(dport.to_be()),
            ]),
        ]
    }

    fn counters(packets: u64, bytes: u64) -> Vec<CounterNla> {
        vec![CounterNla::Packets(packets), CounterNla::Bytes(bytes)]
    }

    fn tcp_protoinfo(state: TcpState) -> ConnNla {
        let raw = match state {
            TcpState::Established => 3,
            TcpState::TimeWait => 7,
            s => panic!("unsupported test state {s:?}"),
        };
        ConnNla::ProtoInfo(vec![ProtoInfoNla::Tcp(vec![TcpInfoNla::State(raw)])])
    }

    fn udp_zone0_entry() -> Vec<ConnNla> {
        vec![
            ConnNla::OrigTuple(tuple("10.0.0.1", "8.8.8.8", 1000, 53, IPPROTO_UDP)),
            ConnNla::ReplyTuple(tuple("8.8.8.8", "10.0.0.1", 53, 1000, IPPROTO_UDP)),
            ConnNla::CountersOrig(counters(42, 3200)),
            ConnNla::CountersReply(counters(41, 60000)),
        ]
    }

    fn tcp_entry(state: TcpState) -> Vec<ConnNla> {
        vec![
            ConnNla::OrigTuple(tuple("10.0.0.1", "8.8.8.8", 54321, 443, 6)),
            ConnNla::ReplyTuple(tuple("8.8.8.8", "10.0.0.1", 443, 54321, 6)),
            tcp_protoinfo(state),
            ConnNla::CountersOrig(counters(42, 3200)),
            ConnNla::CountersReply(counters(41, 60000)),
        ]
    }

    #[test]
    fn test_udp_flow_zone0() {
        let flows = flows_from_entry(&udp_zone0_entry(), 0);
        assert_eq!(flows.len(), 2);
        let (fwd, rev) = (&flows[0], &flows[1]);
        assert!(!fwd.start && !fwd.end);
        assert!(!rev.start && !rev.end);
        assert_eq!(fwd.counters, PktCounters { packets: 42, bytes: 3200 });
        assert_eq!(rev.counters, PktCounters { packets: 41, bytes: 60000 });
        assert_eq!(fwd.layer3.src_ip, "10.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(fwd.layer3.dst_ip, "8.8.8.8".parse::<IpAddr>().unwrap());
        assert_eq!(rev.layer3.src_ip, "8.8.8.8".parse::<IpAddr>().unwrap());
        assert_eq!(rev.layer3.dst_ip, "10.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(u16::from_be(fwd.layer3.src_port), 1000);
        assert_eq!(u16::from_be(fwd.layer3.dst_port), 53);
    }

    #[test]
    fn test_tcp_established_marks_start() {
        let flows = flows_from_entry(&tcp_entry(TcpState::Established), 0);
        assert_eq!(flows.len(), 2);
        assert!(flows[0].start);
        assert!(!flows[0].end);
        assert!(!flows[1].start && !flows[1].end);
    }

    #[test]
    fn test_tcp_time_wait_marks_end() {
        let flows = flows_from_entry(&tcp_entry(TcpState::TimeWait), 0);
        assert_eq!(flows.len(), 2);
        assert!(!flows[0].start);
        assert!(flows[0].end);
    }

    #[test]
    fn test_natted_pair_gets_destinations_rewritten() {
        // DNAT: the reply source is not the original destination.
        let entry = vec![
            ConnNla::OrigTuple(tuple("10.0.0.1", "203.0.113.5", 40000, 80, 6)),
            ConnNla::ReplyTuple(tuple("192.168.1.9", "10.0.0.1", 80, 40000, 6)),
            tcp_protoinfo(TcpState::Established),
            ConnNla::CountersOrig(counters(5, 500)),
            ConnNla::CountersReply(counters(4, 400)),
        ];
        let flows = flows_from_entry(&entry, 0);
        assert_eq!(flows.len(), 2);
        // fwd reads orig-src -> reply-src, rev reads reply-src -> orig-src.
        assert_eq!(flows[0].layer3.src_ip, "10.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(
            flows[0].layer3.dst_ip,
            "192.168.1.9".parse::<IpAddr>().unwrap()
        );
        assert_eq!(
            flows[1].layer3.src_ip,
            "192.168.1.9".parse::<IpAddr>().unwrap()
        );
        assert_eq!(flows[1].layer3.dst_ip, "10.0.0.1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_zone_mismatch_yields_nothing() {
        let mut entry = udp_zone0_entry();
        entry.push(ConnNla::Zone(7));
        assert!(flows_from_entry(&entry, 0).is_empty());
        assert_eq!(flows_from_entry(&entry, 7).len(), 2);
    }

    #[test]
    fn test_broadcast_source_collapses_to_one_direction() {
        let entry = vec![
            ConnNla::OrigTuple(tuple("255.255.255.255", "10.0.0.2", 68, 67, IPPROTO_UDP)),
            ConnNla::ReplyTuple(tuple("10.0.0.2", "255.255.255.255", 67, 68, IPPROTO_UDP)),
            ConnNla::CountersOrig(counters(1, 300)),
            ConnNla::CountersReply(counters(1, 300)),
        ];
        let flows = flows_from_entry(&entry, 0);
        assert_eq!(flows.len(), 1);
        // The collapse skips the destination rewrite as well.
        assert_eq!(
            flows[0].layer3.src_ip,
            "255.255.255.255".parse::<IpAddr>().unwrap()
        );
        assert_eq!(flows[0].layer3.dst_ip, "10.0.0.2".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_tcp_without_protoinfo_is_dropped() {
        let mut entry = tcp_entry(TcpState::Established);
        entry.retain(|nla| !matches!(nla, ConnNla::ProtoInfo(_)));
        assert!(flows_from_entry(&entry, 0).is_empty());
    }

    #[test]
    fn test_ipv6_udp_flow() {
        let entry = vec![
            ConnNla::OrigTuple(tuple("fd00::1", "fd00::2", 1000, 53, IPPROTO_UDP)),
            ConnNla::ReplyTuple(tuple("fd00::2", "fd00::1", 53, 1000, IPPROTO_UDP)),
            ConnNla::CountersOrig(counters(10, 900)),
            ConnNla::CountersReply(counters(9, 800)),
        ];
        let flows = flows_from_entry(&entry, 0);
        assert_eq!(flows.len(), 2);
        assert_eq!(flows[0].layer3.family, Family::Ipv6);
        assert_eq!(flows[1].layer3.family, Family::Ipv6);
        // IPv6 pairs keep their tuples as received.
        assert_eq!(flows[0].layer3.dst_ip, "fd00::2".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_missing_orig_tuple_yields_nothing() {
        let mut entry = udp_zone0_entry();
        entry.retain(|nla| !matches!(nla, ConnNla::OrigTuple(_)));
        assert!(flows_from_entry(&entry, 0).is_empty());
    }

    #[test]
    fn test_missing_reply_tuple_yields_nothing() {
        let mut entry = udp_zone0_entry();
        entry.retain(|nla| !matches!(nla, ConnNla::ReplyTuple(_)));
        assert!(flows_from_entry(&entry, 0).is_empty());
    }

    #[test]
    fn test_missing_orig_counters_yields_nothing() {
        let mut entry = udp_zone0_entry();
        entry.retain(|nla| !matches!(nla, ConnNla::CountersOrig(_)));
        assert!(flows_from_entry(&entry, 0).is_empty());
    }

    #[test]
    fn test_missing_reply_counters_yields_forward_only() {
        let mut entry = udp_zone0_entry();
        entry.retain(|nla| !matches!(nla, ConnNla::CountersReply(_)));
        let flows = flows_from_entry(&entry, 0);
        assert_eq!(flows.len(), 1);
    }

    #[test]
    fn test_tuple_without_addresses_yields_nothing() {
        let entry = vec![
            ConnNla::OrigTuple(vec![TupleNla::Proto(vec![ProtoNla::Num(IPPROTO_UDP)])]),
            ConnNla::ReplyTuple(tuple("8.8.8.8", "10.0.0.1", 53, 1000, IPPROTO_UDP)),
            ConnNla::CountersOrig(counters(1, 1)),
        ];
        assert!(flows_from_entry(&entry, 0).is_empty());
    }

    #[test]
    fn test_counters_prefer_64bit_values() {
        let mut entry = udp_zone0_entry();
        entry.retain(|nla| !matches!(nla, ConnNla::CountersOrig(_)));
        entry.push(ConnNla::CountersOrig(vec![
            CounterNla::Packets(42),
            CounterNla::Packets32(7),
            CounterNla::Bytes32(100),
        ]));
        let flows = flows_from_entry(&entry, 0);
        assert_eq!(flows[0].counters, PktCounters { packets: 42, bytes: 100 });
    }

    #[test]
    fn test_unknown_tcp_state_sets_no_flags() {
        let mut entry = tcp_entry(TcpState::Established);
        entry.retain(|nla| !matches!(nla, ConnNla::ProtoInfo(_)));
        entry.push(ConnNla::ProtoInfo(vec![ProtoInfoNla::Tcp(vec![
            TcpInfoNla::State(200),
        ])]));
        let flows = flows_from_entry(&entry, 0);
        assert_eq!(flows.len(), 2);
        assert!(!flows[0].start && !flows[0].end);
    }

    #[rstest(
        state,
        start,
        end,
        case(1, true, false),
        case(2, true, false),
        case(3, true, false),
        case(4, false, true),
        case(5, false, true),
        case(6, false, true),
        case(7, false, true),
        case(8, false, true),
        case(14, false, true),
        case(0, false, false),
        case(9, false, false),
        case(12, false, false)
    )]
    fn test_tcp_state_flags(state: u8, start: bool, end: bool) {
        let s = TcpState::try_from(state).unwrap();
        assert_eq!(s.starts_flow(), start);
        assert_eq!(s.ends_flow(), end);
        // A sample is never both opening and closing.
        assert!(!(s.starts_flow() && s.ends_flow()));
    }
}
