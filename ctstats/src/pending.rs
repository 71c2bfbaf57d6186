use std::collections::VecDeque;

use conntrack::flow::CtFlow;
use tracing::trace;

/// Samples parked between a collection sweep and aggregator
/// submission. `node_count` shadows the queue length and must match it
/// at every quiescent point.
#[derive(Debug, Default)]
pub struct PendingFlows {
    list: VecDeque<CtFlow>,
    node_count: usize,
}

impl PendingFlows {
    pub fn new() -> PendingFlows {
        PendingFlows::default()
    }

    pub fn push(&mut self, flow: CtFlow) {
        self.list.push_back(flow);
        self.node_count += 1;
    }

    pub fn len(&self) -> usize {
        debug_assert_eq!(self.node_count, self.list.len());
        self.node_count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bulk destructive drain, FIFO order.
    pub fn drain(&mut self) -> Vec<CtFlow> {
        let drained: Vec<CtFlow> = self.list.drain(..).collect();
        self.node_count -= drained.len();
        trace!(
            del_count = drained.len(),
            node_count = self.node_count,
            "drained pending flows"
        );
        drained
    }
}

#[cfg(test)]
mod tests {
    use conntrack::{
        flow::{Layer3Info, PktCounters},
        Family,
    };

    use super::*;

    fn flow(sport: u16) -> CtFlow {
        CtFlow {
            layer3: Layer3Info {
                src_ip: "10.0.0.1".parse().unwrap(),
                dst_ip: "8.8.8.8".parse().unwrap(),
                src_port: sport.to_be(),
                dst_port: 53u16.to_be(),
                proto: 17,
                family: Family::Ipv4,
            },
            counters: PktCounters::default(),
            ct_zone: 0,
            start: false,
            end: false,
        }
    }

    #[test]
    fn test_drain_empties_and_preserves_order() {
        let mut pending = PendingFlows::new();
        assert!(pending.is_empty());
        for sport in [1, 2, 3] {
            pending.push(flow(sport));
        }
        assert_eq!(pending.len(), 3);

        let drained = pending.drain();
        assert_eq!(pending.len(), 0);
        assert!(pending.is_empty());
        let sports: Vec<u16> = drained
            .iter()
            .map(|f| u16::from_be(f.layer3.src_port))
            .collect();
        assert_eq!(sports, vec![1, 2, 3]);

        assert!(pending.drain().is_empty());
    }
}
