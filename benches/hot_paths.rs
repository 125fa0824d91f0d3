use bytes::BytesMut;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use tcpagg::cluster::wire::{decode_header, decode_payload, encode_frame, Frame, HEADER_LEN};
use tcpagg::stats::ProcessStatistics;
use tcpagg::tracer::event::EventKind;
use tcpagg::tracer::parse::parse_line;

const LIFE_LINE: &str = "4012,geth,4,10.0.0.1,30303,10.0.0.7,48122,1532,20481,86400.25";
const CONNECT_LINE: &str = "4012 geth worker 4 10.0.0.1 10.0.0.7 30303";
const CONNLAT_LINE: &str = "4012 geth 6 fe80::1 fe80::2 30303 0.37";

fn bench_parse_line(c: &mut Criterion) {
    c.bench_function("parse_line/life", |b| {
        b.iter(|| parse_line(EventKind::Life, black_box(LIFE_LINE)).expect("parse life"))
    });

    c.bench_function("parse_line/connect_spaced_comm", |b| {
        b.iter(|| parse_line(EventKind::Connect, black_box(CONNECT_LINE)).expect("parse connect"))
    });

    c.bench_function("parse_line/connlat_v6", |b| {
        b.iter(|| parse_line(EventKind::ConnLat, black_box(CONNLAT_LINE)).expect("parse connlat"))
    });
}

fn bench_aggregate(c: &mut Criterion) {
    let events: Vec<_> = (0..256u32)
        .map(|i| {
            let line = format!(
                "{},svc{},4,10.0.0.1,8080,10.0.1.{},40000,{},{},{}.5",
                10_000 + i % 64,
                i % 64,
                i % 250,
                i,
                i * 2,
                i
            );
            parse_line(EventKind::Life, &line).expect("parse life")
        })
        .collect();

    c.bench_function("stats/add_and_summarize_256", |b| {
        b.iter(|| {
            let mut stats = ProcessStatistics::new();
            for e in &events {
                stats.add(black_box(e));
            }
            black_box(stats.summaries(0).count())
        })
    });
}

fn bench_wire(c: &mut Criterion) {
    let mut stats = ProcessStatistics::new();
    for i in 0..128u32 {
        let line = format!("{} svc{} 4 10.0.0.1 10.0.0.2 443 1.5", 20_000 + i, i);
        let event = parse_line(EventKind::ConnLat, &line).expect("parse connlat");
        stats.add(&event);
    }
    let frame = Frame::Records(stats.summaries(3).collect());
    let mut buf = BytesMut::new();

    c.bench_function("wire/records_128_roundtrip", |b| {
        b.iter(|| {
            buf.clear();
            encode_frame(3, black_box(&frame), &mut buf).expect("encode");
            let mut bytes = buf.split().freeze();
            let header = decode_header(&bytes).expect("header");
            let payload = bytes.split_off(HEADER_LEN);
            black_box(decode_payload(&header, payload).expect("payload"))
        })
    });
}

fn bench_suite(c: &mut Criterion) {
    bench_parse_line(c);
    bench_aggregate(c);
    bench_wire(c);
}

criterion_group!(benches, bench_suite);
criterion_main!(benches);
