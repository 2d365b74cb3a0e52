use beacon_protocol::{codec, Event, RelayMessage};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn event(content_len: usize) -> Event {
    Event {
        id: "a".repeat(64),
        pubkey: "b".repeat(64),
        created_at: 1_700_000_000,
        kind: 1,
        tags: vec![vec!["e".into(), "c".repeat(64)]],
        content: "x".repeat(content_len),
        sig: "d".repeat(128),
    }
}

fn bench_encode(c: &mut Criterion) {
    let message = RelayMessage::event("sub-1", event(256));

    c.bench_function("encode_event_envelope", |b| {
        b.iter(|| codec::encode(black_box(&message)))
    });
}

fn bench_decode(c: &mut Criterion) {
    let raw = serde_json::to_vec(&serde_json::json!(["EVENT", event(256)])).unwrap();

    c.bench_function("decode_event_envelope", |b| {
        b.iter(|| codec::decode(black_box(&raw)))
    });
}

criterion_group!(benches, bench_encode, bench_decode);
criterion_main!(benches);
