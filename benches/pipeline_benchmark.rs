//! Performance benchmarks for the per-uplink hot path
//!
//! Covers the work done for every uplink before it reaches a device queue:
//! frame parsing, MIC verification, FRMPayload decryption and counter
//! inference.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use lorans_rs::fcnt::infer_fcnt32;
use lorans_rs::lorawan::crypto::{compute_data_mic, crypt_frm_payload};
use lorans_rs::lorawan::frame::{encode_data_frame, DataFrameFields};
use lorans_rs::lorawan::{parse_phy_payload, AesKey, DevAddr, Direction, FCtrl, MType, PhyPayload, SessionKeys};
use std::time::Duration;

const PAYLOAD_SIZES: [usize; 4] = [4, 16, 51, 222];

fn keys() -> SessionKeys {
    SessionKeys {
        nwk_s_key: AesKey::new([0x2B; 16]),
        app_s_key: AesKey::new([0x7E; 16]),
    }
}

fn uplink(size: usize) -> Vec<u8> {
    let payload: Vec<u8> = (0..size).map(|i| (i % 256) as u8).collect();
    encode_data_frame(
        &DataFrameFields {
            mtype: MType::ConfirmedDataUp,
            dev_addr: DevAddr(0x2601_1BDA),
            fctrl: FCtrl::ADR,
            fcnt: 0x0001_0042,
            fopts: &[0x02],
            fport: Some(1),
            frm_payload: &payload,
        },
        &keys(),
    )
    .expect("benchmark frame encodes")
}

/// Benchmark LoRaWAN data MIC over growing frames
fn bench_data_mic(c: &mut Criterion) {
    let mut group = c.benchmark_group("data_mic");
    group.measurement_time(Duration::from_secs(5));
    let key = keys().nwk_s_key;

    for size in PAYLOAD_SIZES {
        let frame = uplink(size);
        group.throughput(Throughput::Bytes(frame.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &frame, |b, frame| {
            b.iter(|| {
                compute_data_mic(
                    black_box(&key),
                    Direction::Up,
                    DevAddr(0x2601_1BDA),
                    0x0001_0042,
                    black_box(&frame[..frame.len() - 4]),
                )
            })
        });
    }

    group.finish();
}

/// Benchmark parse plus MIC check, as done while resolving the device
fn bench_parse_and_verify(c: &mut Criterion) {
    let mut group = c.benchmark_group("parse_and_verify");
    let key = keys().nwk_s_key;

    for size in PAYLOAD_SIZES {
        let frame = uplink(size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &frame, |b, frame| {
            b.iter(|| match parse_phy_payload(black_box(frame)) {
                Ok(PhyPayload::Data(data)) => data.verify_mic(&key, infer_fcnt32(0x0001_0040, data.fcnt)),
                _ => false,
            })
        });
    }

    group.finish();
}

fn bench_frm_payload_decrypt(c: &mut Criterion) {
    let mut group = c.benchmark_group("frm_payload_decrypt");
    let key = keys().app_s_key;

    for size in PAYLOAD_SIZES {
        let payload = vec![0xA5u8; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &payload, |b, payload| {
            b.iter(|| crypt_frm_payload(black_box(&key), Direction::Up, DevAddr(0x2601_1BDA), 42, black_box(payload)))
        });
    }

    group.finish();
}

fn bench_infer_fcnt32(c: &mut Criterion) {
    c.bench_function("infer_fcnt32", |b| {
        b.iter(|| {
            let mut acc = 0u32;
            for wire in (0..=u16::MAX).step_by(257) {
                acc = acc.wrapping_add(infer_fcnt32(black_box(0x0002_FFF0), wire));
            }
            acc
        })
    });
}

criterion_group!(
    benches,
    bench_data_mic,
    bench_parse_and_verify,
    bench_frm_payload_decrypt,
    bench_infer_fcnt32
);
criterion_main!(benches);
