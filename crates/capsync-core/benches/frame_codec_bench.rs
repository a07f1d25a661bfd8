//! Criterion benchmarks for the CapSync frame codec.
//!
//! Measures framing and classification cost for the message kinds that
//! dominate steady-state traffic: heartbeats, sensor batches, file chunks,
//! and preview frames.
//!
//! Run with:
//! ```bash
//! cargo bench --package capsync-core --bench frame_codec_bench
//! ```

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use capsync_core::protocol::codec::{decode_frame, encode_frame};
use capsync_core::protocol::messages::{DeviceMessage, Message};
use serde_json::{json, Map, Value};

// ── Message fixtures ──────────────────────────────────────────────────────────

fn object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

fn make_heartbeat() -> Message {
    Message::new("heartbeat", Map::new())
}

fn make_sensor_batch() -> Message {
    let values: Map<String, Value> = (0..16)
        .map(|i| (format!("channel_{i}"), json!(i as f64 * 0.125)))
        .collect();
    Message::new("sensor_data", object(json!({ "values": values })))
}

fn make_file_chunk() -> Message {
    Message::new(
        "file_chunk",
        object(json!({"name": "session.mp4", "seq": 17, "data": "QUJD".repeat(16 * 1024)})),
    )
}

fn make_preview_frame() -> Message {
    Message::new(
        "preview_frame",
        object(json!({
            "frame_type": "rgb",
            "image_data": "/9j/".repeat(32 * 1024),
            "width": 640,
            "height": 480
        })),
    )
}

fn fixtures() -> Vec<(&'static str, Message)> {
    vec![
        ("heartbeat", make_heartbeat()),
        ("sensor_data", make_sensor_batch()),
        ("file_chunk", make_file_chunk()),
        ("preview_frame", make_preview_frame()),
    ]
}

// ── Benchmarks ────────────────────────────────────────────────────────────────

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode_frame");
    for (name, msg) in fixtures() {
        group.bench_with_input(BenchmarkId::from_parameter(name), &msg, |b, m| {
            b.iter(|| encode_frame(black_box(m)).expect("encode"))
        });
    }
    group.finish();
}

fn bench_decode_and_classify(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_frame_and_classify");
    for (name, msg) in fixtures() {
        let frame = encode_frame(&msg).expect("encode");
        group.bench_with_input(BenchmarkId::from_parameter(name), &frame, |b, bytes| {
            b.iter(|| {
                let (wire, _) = decode_frame(black_box(bytes)).expect("decode");
                DeviceMessage::decode(wire)
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode_and_classify);
criterion_main!(benches);
