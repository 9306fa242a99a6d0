//! Framing benchmarks for pushwire-protocol.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use pushwire_protocol::{comet, direct, websocket, DirectParser, FrameParser};

fn sample_json() -> String {
    format!(r#"{{"topic":"AAPL","price":"101.5","pad":"{}"}}"#, "x".repeat(64))
}

fn bench_encode(c: &mut Criterion) {
    let json = sample_json();

    let mut group = c.benchmark_group("encode");
    group.throughput(Throughput::Bytes(json.len() as u64));
    group.bench_function("direct", |b| b.iter(|| direct::encode(black_box(&json))));
    group.bench_function("websocket", |b| {
        b.iter(|| websocket::encode(black_box(&json)))
    });
    group.bench_function("comet", |b| b.iter(|| comet::wrap_script(black_box(&json))));
    group.finish();
}

fn bench_parse_stream(c: &mut Criterion) {
    let json = sample_json();
    let mut direct_stream = Vec::new();
    let mut ws_stream = Vec::new();
    for _ in 0..100 {
        direct_stream.extend_from_slice(&direct::encode(&json));
        ws_stream.extend_from_slice(&websocket::encode(&json));
    }

    let mut group = c.benchmark_group("parse_100");
    group.throughput(Throughput::Bytes(direct_stream.len() as u64));
    group.bench_function("direct_chunked_512", |b| {
        b.iter(|| {
            let mut parser = DirectParser::new();
            let mut count = 0;
            for chunk in direct_stream.chunks(512) {
                count += parser.push(black_box(chunk)).len();
            }
            count
        })
    });
    group.bench_function("websocket", |b| {
        b.iter(|| FrameParser::new().push(black_box(&ws_stream)).len())
    });
    group.finish();
}

criterion_group!(benches, bench_encode, bench_parse_stream);
criterion_main!(benches);
