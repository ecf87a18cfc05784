//! Final record decoration before export.

use std::net::IpAddr;
use std::sync::Arc;

use tokio::sync::mpsc;

use super::Record;
use crate::ifaces::InterfaceNamer;

/// Stamps the agent IP and the resolved interface name on every
/// record leaving the pipeline.
pub struct Decorator {
    agent_ip: Option<IpAddr>,
    namer: Arc<InterfaceNamer>,
}

impl Decorator {
    pub fn new(agent_ip: Option<IpAddr>, namer: Arc<InterfaceNamer>) -> Self {
        Self { agent_ip, namer }
    }

    pub fn decorate(&self, batch: &mut [Record]) {
        for record in batch {
            record.agent_ip = self.agent_ip;
            record.interface = self.namer.name_of(record.id.if_index);
        }
    }
}

/// Drive the decoration stage until the input closes.
pub async fn run(
    decorator: Decorator,
    mut input: mpsc::Receiver<Vec<Record>>,
    output: mpsc::Sender<Vec<Record>>,
) {
    while let Some(mut batch) = input.recv().await {
        decorator.decorate(&mut batch);
        if output.send(batch).await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{Direction, FlowId, FlowMetrics};

    #[test]
    fn test_decoration_stamps_ip_and_name() {
        let namer = Arc::new(InterfaceNamer::new());
        namer.insert(3, "eth0");

        let agent_ip: IpAddr = "192.0.2.10".parse().unwrap();
        let decorator = Decorator::new(Some(agent_ip), namer);

        let mut batch = vec![Record::new(
            FlowId {
                eth_protocol: 0x0800,
                direction: Direction::Ingress,
                src_addr: "10.0.0.1".parse().unwrap(),
                dst_addr: "10.0.0.2".parse().unwrap(),
                src_port: 80,
                dst_port: 55000,
                transport_protocol: 6,
                icmp_type: 0,
                icmp_code: 0,
                if_index: 3,
            },
            FlowMetrics::default(),
        )];

        decorator.decorate(&mut batch);
        assert_eq!(batch[0].agent_ip, Some(agent_ip));
        assert_eq!(batch[0].interface, "eth0");
    }

    #[test]
    fn test_unknown_interface_gets_fallback_name() {
        let decorator = Decorator::new(None, Arc::new(InterfaceNamer::new()));
        let mut batch = vec![Record::new(
            FlowId {
                eth_protocol: 0x0800,
                direction: Direction::Egress,
                src_addr: "10.0.0.1".parse().unwrap(),
                dst_addr: "10.0.0.2".parse().unwrap(),
                src_port: 80,
                dst_port: 55000,
                transport_protocol: 6,
                icmp_type: 0,
                icmp_code: 0,
                if_index: 99,
            },
            FlowMetrics::default(),
        )];

        decorator.decorate(&mut batch);
        assert_eq!(batch[0].agent_ip, None);
        assert_eq!(batch[0].interface, "[if:99]");
    }
}
