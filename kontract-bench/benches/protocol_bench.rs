//! Protocol encoding/decoding benchmarks.

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use kontract_protocol::{
    random_nonce, CipherSuite, Decoder, Encoder, Frame, MessageType, RpcCall, RpcResponse,
    SessionKeys,
};

fn create_test_call(payload_size: usize) -> RpcCall {
    RpcCall::new(
        "bench-1",
        "state.set",
        serde_json::json!(["todo:1", {"title": "x".repeat(payload_size), "done": false}]),
    )
    .with_metadata("x-owner", "bench")
}

fn create_test_response(payload_size: usize) -> RpcResponse {
    RpcResponse::ok(
        "bench-1",
        serde_json::json!({"title": "x".repeat(payload_size), "done": false}),
    )
    .with_session_id("4f1c2a3b-0000-4000-8000-000000000000")
}

fn session_keys(suite: CipherSuite) -> SessionKeys {
    SessionKeys::derive(suite, b"benchmark-master-secret", &random_nonce(), &random_nonce())
}

fn bench_frame_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_encode");

    for size in [100, 1000, 10000] {
        let payload = Bytes::from("x".repeat(size));
        let frame = Frame::new(MessageType::RpcCall, payload);

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &frame, |b, frame| {
            b.iter(|| black_box(frame.encode().unwrap()));
        });
    }

    group.finish();
}

fn bench_frame_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_decode");

    for size in [100, 1000, 10000] {
        let payload = Bytes::from("x".repeat(size));
        let frame = Frame::new(MessageType::RpcCall, payload);
        let encoded = frame.encode().unwrap();

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &encoded, |b, encoded| {
            b.iter(|| {
                let mut buf = encoded.clone();
                black_box(Frame::decode(&mut buf).unwrap())
            });
        });
    }

    group.finish();
}

fn bench_call_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("call_encode");
    let plain = Encoder::new();

    for size in [100, 1000, 10000] {
        let call = create_test_call(size);

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::new("plain", size), &call, |b, call| {
            b.iter(|| black_box(plain.encode_json(MessageType::RpcCall, call).unwrap()));
        });

        for suite in CipherSuite::ALL {
            let mut sealed = Encoder::new();
            sealed.install_keys(session_keys(suite));
            group.bench_with_input(BenchmarkId::new(suite.as_str(), size), &call, |b, call| {
                b.iter(|| black_box(sealed.encode_json(MessageType::RpcCall, call).unwrap()));
            });
        }
    }

    group.finish();
}

fn bench_response_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("response_decode");

    for size in [100, 1000, 10000] {
        let response = create_test_response(size);

        let encoded = Encoder::new()
            .encode_json(MessageType::RpcResponse, &response)
            .unwrap();
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::new("plain", size), &encoded, |b, encoded| {
            b.iter(|| {
                let mut decoder = Decoder::new();
                decoder.extend(encoded);
                let frame = decoder.decode_frame().unwrap().unwrap();
                black_box(frame.parse::<RpcResponse>().unwrap())
            });
        });

        for suite in CipherSuite::ALL {
            let keys = session_keys(suite);
            let mut encoder = Encoder::new();
            encoder.install_keys(keys.clone());
            let encoded = encoder
                .encode_json(MessageType::RpcResponse, &response)
                .unwrap();

            group.bench_with_input(
                BenchmarkId::new(suite.as_str(), size),
                &encoded,
                |b, encoded| {
                    b.iter(|| {
                        let mut decoder = Decoder::new();
                        decoder.install_keys(keys.clone());
                        decoder.extend(encoded);
                        let frame = decoder.decode_frame().unwrap().unwrap();
                        black_box(frame.parse::<RpcResponse>().unwrap())
                    });
                },
            );
        }
    }

    group.finish();
}

fn bench_key_derivation(c: &mut Criterion) {
    let client_nonce = random_nonce();
    let server_nonce = random_nonce();

    c.bench_function("session_keys_derive", |b| {
        b.iter(|| {
            black_box(SessionKeys::derive(
                CipherSuite::ChaCha20Poly1305,
                b"benchmark-master-secret",
                &client_nonce,
                &server_nonce,
            ))
        });
    });
}

criterion_group!(
    benches,
    bench_frame_encode,
    bench_frame_decode,
    bench_call_encode,
    bench_response_decode,
    bench_key_derivation,
);

criterion_main!(benches);
