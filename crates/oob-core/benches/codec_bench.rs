//! Criterion benchmarks for the LAN message codec and session framing.
//!
//! Every management operation pays for one encode and one decode per round
//! trip, plus the session envelope around each.
//!
//! Run with:
//! ```bash
//! cargo bench --package oob-core --bench codec_bench
//! ```

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use oob_core::protocol::session::{PayloadType, SessionPacket};
use oob_core::protocol::{
    decode_request, decode_response, encode_request, encode_response, parse_cipher_suite_records,
    AuthenticationType, Command, CommandKind, CompletionCode, IpmiVersion,
};

fn chassis_status() -> Command {
    Command::new(
        IpmiVersion::V20,
        AuthenticationType::RmcpPlus,
        CommandKind::GetChassisStatus,
    )
    .expect("valid command")
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");
    let cmd = chassis_status();

    group.bench_function("GetChassisStatus", |b| {
        b.iter(|| encode_request(black_box(&cmd), black_box(17)))
    });

    group.bench_function("GetChassisStatus_in_session_packet", |b| {
        b.iter(|| {
            let frame = encode_request(black_box(&cmd), black_box(17));
            SessionPacket::v20(PayloadType::Ipmi, 0x1234_5678, 9, frame)
                .encode()
                .expect("encode")
        })
    });

    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");
    let cmd = chassis_status();
    let request = decode_request(&encode_request(&cmd, 17)).expect("decode request");
    let frame = encode_response(&request, CompletionCode::Ok, &[0x01, 0x00, 0x40, 0x00]);
    let datagram = SessionPacket::v20(PayloadType::Ipmi, 0x1234_5678, 9, frame.clone())
        .encode()
        .expect("encode");

    group.bench_function("ChassisStatus_response", |b| {
        b.iter(|| {
            let response = decode_response(black_box(&frame)).expect("decode");
            cmd.parse_response(&response).expect("parse")
        })
    });

    group.bench_function("ChassisStatus_datagram", |b| {
        b.iter(|| {
            let packet = SessionPacket::decode(black_box(&datagram)).expect("decode");
            let response = decode_response(&packet.payload).expect("decode");
            cmd.parse_response(&response).expect("parse")
        })
    });

    // Eight standard suites: one full page set from a typical controller.
    let records: Vec<u8> = (0u8..8)
        .flat_map(|id| [0xC0, id, id % 3, 0x40 | (id % 2), 0x80 | (id % 2)])
        .collect();
    group.bench_function("cipher_suite_records_8", |b| {
        b.iter(|| parse_cipher_suite_records(black_box(&records)).expect("parse"))
    });

    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode);
criterion_main!(benches);
