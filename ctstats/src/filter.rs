use conntrack::flow::CtFlow;
use serde::Serialize;

use crate::{config::CollectorConfig, neighbor::MacAddr};

/// Textual view of a sample handed to the external filter engine. IPs
/// are numeric strings, ports are converted to host order here, MACs
/// are formatted even when the neighbor lookup missed (all zeroes).
#[derive(Debug, Clone, Serialize)]
pub struct FilterRequest {
    pub src_mac: String,
    pub dst_mac: String,
    pub src_ip: String,
    pub dst_ip: String,
    pub sport: u16,
    pub dport: u16,
    pub proto: u8,
    pub ip_version: u8,
    pub packets: u64,
    pub bytes: u64,
}

impl FilterRequest {
    pub(crate) fn new(flow: &CtFlow, smac: &MacAddr, dmac: &MacAddr) -> FilterRequest {
        FilterRequest {
            src_mac: smac.to_string(),
            dst_mac: dmac.to_string(),
            src_ip: flow.layer3.src_ip.to_string(),
            dst_ip: flow.layer3.dst_ip.to_string(),
            sport: u16::from_be(flow.layer3.src_port),
            dport: u16::from_be(flow.layer3.dst_port),
            proto: flow.layer3.proto,
            ip_version: flow.layer3.family.ip_version(),
            packets: flow.counters.packets,
            bytes: flow.counters.bytes,
        }
    }
}

/// The external filter engine deciding which samples are kept.
pub trait FlowFilter {
    fn apply(&self, filter_name: &str, req: &FilterRequest) -> bool;

    /// Called at plugin init and before each report.
    fn init_context(&self, _cfg: &CollectorConfig) {}
}
