use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use flowmeter::flow::account::Accounter;
use flowmeter::flow::{
    decode_raw_record, encode_raw_record, Direction, FlowId, FlowMetrics, Record,
};
use flowmeter::metrics::Metrics;

fn sample_id(src_port: u16) -> FlowId {
    FlowId {
        eth_protocol: 0x0800,
        direction: Direction::Ingress,
        src_addr: "10.0.0.1".parse::<IpAddr>().unwrap(),
        dst_addr: "10.0.0.2".parse::<IpAddr>().unwrap(),
        src_port,
        dst_port: 443,
        transport_protocol: 6,
        icmp_type: 0,
        icmp_code: 0,
        if_index: 2,
    }
}

fn sample_metrics() -> FlowMetrics {
    FlowMetrics {
        bytes: 1500,
        packets: 1,
        flags: 0x10,
        start_mono_ts: 1_000_000_000,
        end_mono_ts: 1_000_500_000,
        ..Default::default()
    }
}

fn bench_decode(c: &mut Criterion) {
    let raw = encode_raw_record(&sample_id(40_000), &sample_metrics());

    c.bench_function("decode_raw_record", |b| {
        b.iter(|| decode_raw_record(black_box(&raw)).unwrap())
    });
}

fn bench_account(c: &mut Criterion) {
    let metrics = Arc::new(Metrics::new(":0").unwrap());

    // Repeated updates of a small working set, the steady-state shape.
    c.bench_function("accounter_account_hot", |b| {
        let mut accounter = Accounter::new(10_000, Duration::from_secs(5), Arc::clone(&metrics));
        let records: Vec<Record> = (0..64)
            .map(|i| Record::new(sample_id(40_000 + i), sample_metrics()))
            .collect();
        let mut i = 0;
        b.iter(|| {
            let record = records[i % records.len()].clone();
            i += 1;
            black_box(accounter.account(record))
        })
    });

    // Every record is a new flow; measures the insert path.
    c.bench_function("accounter_account_insert", |b| {
        let mut accounter =
            Accounter::new(usize::MAX, Duration::from_secs(5), Arc::clone(&metrics));
        let mut port = 0u16;
        b.iter(|| {
            port = port.wrapping_add(1);
            let record = Record::new(sample_id(port), sample_metrics());
            black_box(accounter.account(record))
        })
    });
}

criterion_group!(benches, bench_decode, bench_account);
criterion_main!(benches);
