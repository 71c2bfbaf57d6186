use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use conntrack::flow::CtFlow;
use tracing::debug;

use crate::{
    error::Error,
    filter::FlowFilter,
    neighbor::{MacAddr, NeighborTable},
};

/// Accounting shape requested from the aggregator: `Absolute` for
/// cumulative host reports, `Relative` for deltas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportType {
    Absolute,
    Relative,
}

/// Settings handed to the external aggregator allocator.
pub struct AggregatorConfig {
    pub node_id: String,
    pub location_id: String,
    pub report_type: ReportType,
    pub num_windows: usize,
    /// Accumulator time-to-live, seconds.
    pub acc_ttl: u64,
    pub report_filter: Arc<dyn FlowFilter + Send + Sync>,
    pub neighbor_table: Arc<dyn NeighborTable + Send + Sync>,
}

/// Key shape for one directional sample. Address bytes are copied out
/// of the sample so the key owns its storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowKey {
    pub ip_version: u8,
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub proto: u8,
    /// Wire byte order, as carried by the sample.
    pub sport: u16,
    /// Wire byte order, as carried by the sample.
    pub dport: u16,
    pub smac: Option<MacAddr>,
    pub dmac: Option<MacAddr>,
    pub fstart: bool,
    pub fend: bool,
}

impl FlowKey {
    pub(crate) fn new(flow: &CtFlow, smac: Option<MacAddr>, dmac: Option<MacAddr>) -> FlowKey {
        FlowKey {
            ip_version: flow.layer3.family.ip_version(),
            src_ip: flow.layer3.src_ip,
            dst_ip: flow.layer3.dst_ip,
            proto: flow.layer3.proto,
            sport: flow.layer3.src_port,
            dport: flow.layer3.dst_port,
            smac,
            dmac,
            fstart: flow.start,
            fend: flow.end,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlowCounters {
    pub packets: u64,
    pub bytes: u64,
}

/// The external flow-metadata aggregator consumed as an opaque sink.
pub trait Aggregator: Send {
    fn activate_window(&mut self) -> bool;
    fn close_active_window(&mut self) -> bool;
    fn add_sample(&mut self, key: &FlowKey, counters: &FlowCounters) -> bool;
    fn total_flows(&self) -> usize;
    fn reset(&mut self);
    fn send_report(&mut self, topic: &str) -> bool;
    /// Applies a pre-encoded update blob produced by a peer process.
    fn update_from_encoded(&mut self, buf: &[u8]);
}

pub type SharedAggregator = Arc<Mutex<Box<dyn Aggregator>>>;

pub(crate) fn lock(aggr: &SharedAggregator) -> MutexGuard<'_, Box<dyn Aggregator>> {
    match aggr.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub(crate) fn activate_window(aggr: &SharedAggregator) -> Result<(), Error> {
    if !lock(aggr).activate_window() {
        debug!("aggregator window activation failed");
        return Err(Error::WindowActivation);
    }
    Ok(())
}

pub(crate) fn close_window(aggr: &SharedAggregator) {
    if !lock(aggr).close_active_window() {
        debug!("aggregator close window failed");
    }
}

pub(crate) fn send_aggr_report(aggr: &SharedAggregator, topic: &str) {
    let mut aggr = lock(aggr);
    if aggr.total_flows() == 0 {
        aggr.reset();
        return;
    }
    if !aggr.send_report(topic) {
        debug!("aggregator send report failed");
    }
}
