//! Conntrack flow statistics collector: periodically dumps the
//! kernel's connection-tracking table, turns entries into directional
//! flow samples, enriches them with neighbor MACs, filters them, and
//! feeds the surviving samples into an external flow-metadata
//! aggregator.

use std::sync::{Arc, Mutex};

use conntrack::{flow::CtFlow, Conntrack, Family};
use futures::TryStreamExt;
use tokio::runtime::Handle;
use tracing::{debug, error, trace, warn};

use aggregator::{
    Aggregator, AggregatorConfig, FlowCounters, FlowKey, ReportType, SharedAggregator,
};
use config::{CollectorConfig, ReportFormat};
use error::Error;
use filter::{FilterRequest, FlowFilter};
use ipc::{IpcBackend, IpcServer, RecvHandler, FLOW_TAGS_ENDPOINT};
use neighbor::{MacAddr, NeighborTable};
use pending::PendingFlows;

pub mod aggregator;
pub mod config;
pub mod error;
pub mod filter;
pub mod ipc;
pub mod neighbor;
pub mod pending;

pub type AggregatorAllocator =
    Box<dyn Fn(&AggregatorConfig) -> Option<Box<dyn Aggregator>> + Send>;

/// External collaborators wired in by the host at init.
pub struct CtStatsDeps {
    pub allocate_aggregator: AggregatorAllocator,
    pub neighbor_table: Arc<dyn NeighborTable + Send + Sync>,
    pub filter_engine: Arc<dyn FlowFilter + Send + Sync>,
    /// `None` when no IPC transport is installed; flow-tag updates are
    /// then silently disabled.
    pub ipc_backend: Option<Box<dyn IpcBackend>>,
    pub handle: Handle,
}

/// Collector state, owned by the host plugin handle.
pub struct CtStats {
    pending: PendingFlows,
    ct_zone: u16,
    collect_filter: Option<String>,
    aggr: SharedAggregator,
    neighbor_table: Arc<dyn NeighborTable + Send + Sync>,
    filter_engine: Arc<dyn FlowFilter + Send + Sync>,
    handle: Handle,
    ipc_server: Option<IpcServer>,
}

impl CtStats {
    /// Brings the collector up: allocates the aggregator, opens the
    /// first accounting window and starts the flow-tag receiver. Any
    /// failure past allocation releases the aggregator again.
    pub fn init(cfg: &CollectorConfig, deps: CtStatsDeps) -> Result<CtStats, Error> {
        deps.filter_engine.init_context(cfg);

        let report_type = match cfg.format {
            ReportFormat::Cumulative => ReportType::Absolute,
            ReportFormat::Delta => ReportType::Relative,
        };
        let aggr_cfg = AggregatorConfig {
            node_id: cfg.node_id.clone(),
            location_id: cfg.location_id.clone(),
            report_type,
            num_windows: 1,
            acc_ttl: 2 * cfg.report_interval,
            report_filter: deps.filter_engine.clone(),
            neighbor_table: deps.neighbor_table.clone(),
        };
        let aggr = (deps.allocate_aggregator)(&aggr_cfg).ok_or_else(|| {
            debug!("aggregator allocation failed");
            Error::AggregatorAlloc
        })?;

        let ct_zone = cfg.ct_zone();
        debug!(ct_zone, "configured zone");

        let mut mgr = CtStats {
            pending: PendingFlows::new(),
            ct_zone,
            collect_filter: None,
            aggr: Arc::new(Mutex::new(aggr)),
            neighbor_table: deps.neighbor_table,
            filter_engine: deps.filter_engine,
            handle: deps.handle,
            ipc_server: None,
        };

        aggregator::activate_window(&mgr.aggr)?;

        mgr.ipc_server = match deps.ipc_backend {
            None => None,
            Some(backend) => {
                let aggr = mgr.aggr.clone();
                let recv: RecvHandler =
                    Box::new(move |buf| aggregator::lock(&aggr).update_from_encoded(buf));
                Some(backend.init_server(FLOW_TAGS_ENDPOINT, &mgr.handle, recv)?)
            }
        };

        Ok(mgr)
    }

    /// Periodic collection: dump both families (a failed family does
    /// not skip the other), pick up the current filter name and flush
    /// everything gathered into the aggregator.
    pub async fn collect_periodic(&mut self, cfg: &CollectorConfig) {
        for family in [Family::Ipv4, Family::Ipv6] {
            if let Err(e) = self.sweep(family).await {
                error!(?family, error = %e, "conntrack flow collection error");
            }
        }
        self.collect_filter = cfg.collect_filter.clone();
        self.add_samples();
    }

    async fn sweep(&mut self, family: Family) -> Result<(), Error> {
        let mut ct = Conntrack::new(self.ct_zone).map_err(Error::Conntrack)?;
        ct.request(family).await.map_err(Error::Conntrack)?;
        // Buffered locally so a failed dump contributes nothing.
        let mut collected = Vec::new();
        while let Some(flows) = ct.try_next().await.map_err(Error::Conntrack)? {
            collected.extend(flows);
        }
        trace!(?family, total = collected.len(), "conntrack flows collected");
        for flow in collected {
            trace!(%flow, "collected");
            self.pending.push(flow);
        }
        Ok(())
    }

    /// Drains the pending list through the enrichment and filter stage
    /// into the aggregator. A rejected submission stops the flush; the
    /// remaining samples of this sweep are discarded.
    fn add_samples(&mut self) {
        let samples = self.pending.drain();
        let total = samples.len();
        let mut sample_count = 0usize;
        let mut aggr = aggregator::lock(&self.aggr);
        for flow in &samples {
            let smac = self.neighbor_table.lookup(&flow.layer3.src_ip);
            if smac.is_none() {
                debug!("failed to get mac for src ip of the flow");
            }
            let dmac = self.neighbor_table.lookup(&flow.layer3.dst_ip);
            if dmac.is_none() {
                debug!("failed to get mac for dst ip of the flow");
            }

            if !self.apply_filter(flow, smac, dmac) {
                continue;
            }

            let key = FlowKey::new(flow, smac, dmac);
            let counters = FlowCounters {
                packets: flow.counters.packets,
                bytes: flow.counters.bytes,
            };
            sample_count += 1;
            if !aggr.add_sample(&key, &counters) {
                warn!("aggregator rejected flow sample");
                break;
            }
        }
        trace!(sample_count, total, "samples submitted");
    }

    fn apply_filter(&self, flow: &CtFlow, smac: Option<MacAddr>, dmac: Option<MacAddr>) -> bool {
        let Some(name) = &self.collect_filter else {
            return true;
        };
        let req = FilterRequest::new(flow, &smac.unwrap_or_default(), &dmac.unwrap_or_default());
        self.filter_engine.apply(name, &req)
    }

    /// Report boundary: close the window, ship the report, open the
    /// next window. Zone changes are accepted only here, never
    /// mid-collection.
    pub fn send_report(&mut self, cfg: &CollectorConfig) {
        let Some(topic) = cfg.mqtt_topic.as_deref() else {
            return;
        };
        self.filter_engine.init_context(cfg);
        aggregator::close_window(&self.aggr);
        aggregator::send_aggr_report(&self.aggr, topic);
        let _ = aggregator::activate_window(&self.aggr);

        let zone = cfg.ct_zone();
        if zone != self.ct_zone {
            self.ct_zone = zone;
            debug!(ct_zone = zone, "updated zone");
        }
    }

    /// Tears the collector down; the aggregator is released with
    /// `self`.
    pub fn close(mut self) {
        debug!("conntrack stats collector stopped");
        aggregator::close_window(&self.aggr);
        if let Some(server) = self.ipc_server.take() {
            server.terminate();
        }
    }
}
