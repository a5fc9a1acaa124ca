//! Performance benchmarks for message processing.
//!
//! These benchmarks measure the hot paths in the daemon:
//! - Encoding session-data events into NDJSON lines
//! - Splitting inbound socket reads into lines
//! - Appending output to a detached session's window

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::json;
use termhost_protocol::{
    encode_line, LineDecoder, OutputWindow, Request, SessionData, SessionEvent, WireMessage,
    Command, DEFAULT_OUTPUT_LIMIT,
};

fn data_event(size: usize) -> WireMessage {
    let event = SessionEvent::Data(SessionData {
        session_id: "0b6f2c1e-7a43-4d0e-9d55-3f1c2b8e9a10".to_string(),
        data: "x".repeat(size),
    });
    WireMessage::Event(event.to_wire().unwrap())
}

/// Benchmark event encoding for typical output chunk sizes.
fn bench_event_encoding(c: &mut Criterion) {
    let mut group = c.benchmark_group("event_encoding");

    for size in [1usize, 4096, 65536] {
        let message = data_event(size);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &message, |b, message| {
            b.iter(|| encode_line(black_box(message)).unwrap());
        });
    }

    group.finish();
}

/// Benchmark line splitting of inbound writes.
fn bench_line_decoding(c: &mut Criterion) {
    let mut group = c.benchmark_group("line_decoding");

    let request = WireMessage::Request(Request::new(
        1u64,
        Command::WriteSession,
        json!({"sessionId": "0b6f2c1e", "data": "ls -la\n"}),
    ));
    let line = encode_line(&request).unwrap();
    let batch: Vec<u8> = line.iter().copied().cycle().take(line.len() * 256).collect();

    group.throughput(Throughput::Bytes(batch.len() as u64));
    group.bench_function("256_requests_one_read", |b| {
        b.iter(|| {
            let mut decoder = LineDecoder::new();
            decoder.push(black_box(&batch));
            let mut count = 0;
            while let Some(line) = decoder.next_line() {
                black_box(line.unwrap());
                count += 1;
            }
            count
        });
    });

    group.bench_function("256_requests_small_reads", |b| {
        b.iter(|| {
            let mut decoder = LineDecoder::new();
            let mut count = 0;
            for chunk in batch.chunks(64) {
                decoder.push(black_box(chunk));
                while let Some(line) = decoder.next_line() {
                    black_box(line.unwrap());
                    count += 1;
                }
            }
            count
        });
    });

    group.finish();
}

/// Benchmark appending to a full output window.
fn bench_output_window(c: &mut Criterion) {
    let mut group = c.benchmark_group("output_window");

    for chunk_size in [64usize, 4096] {
        let chunk = "y".repeat(chunk_size);
        group.throughput(Throughput::Bytes(chunk_size as u64));
        group.bench_with_input(
            BenchmarkId::new("append_when_full", chunk_size),
            &chunk,
            |b, chunk| {
                let mut window = OutputWindow::new(DEFAULT_OUTPUT_LIMIT);
                while window.len_chars() < DEFAULT_OUTPUT_LIMIT {
                    window.append(chunk);
                }
                b.iter(|| window.append(black_box(chunk)));
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_event_encoding,
    bench_line_decoding,
    bench_output_window
);
criterion_main!(benches);
