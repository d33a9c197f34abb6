// Benchmark for telemetry decoding and the INO control step
// Run with: cargo bench

use criterion::{criterion_group, criterion_main, Criterion};
use ino_host::config::HeaterConfig;
use ino_host::heater::InoHeater;
use ino_host::host::FaultLog;
use ino_host::link::{protocol, FrameDecoder};
use ino_host::sensor::OutboundQueue;
use ino_shared::{HeaterCapability, TemperatureSample};
use std::sync::Arc;

fn bench_telemetry_decode(c: &mut Criterion) {
    let mut stream = Vec::new();
    for i in 0..1_000 {
        stream.extend_from_slice(
            format!("tick:{}, T_a:{}, T_set:200, pwr:0.512, err:000000\0", i, 19_950 + i % 100).as_bytes(),
        );
    }
    c.bench_function("decode 1k telemetry frames", |b| {
        b.iter(|| {
            let mut decoder = FrameDecoder::new();
            decoder.push(&stream);
            let mut count = 0;
            while let Some(frame) = decoder.next_frame() {
                if frame.ok().and_then(|f| protocol::parse_telemetry(&f).ok()).is_some() {
                    count += 1;
                }
            }
            assert_eq!(count, 1_000);
        });
    });
}

fn bench_control_step(c: &mut Criterion) {
    let config = HeaterConfig::ino("/dev/ttyACM1", 10.0, 450.0);
    let (outbound, mut rx) = OutboundQueue::channel();
    let mut heater = InoHeater::new("extruder", &config, outbound, Arc::new(FaultLog::new())).unwrap();
    heater.set_temp(200.0).unwrap();
    let mut t = 0.0;
    c.bench_function("INO compute_power", |b| {
        b.iter(|| {
            t += 0.1;
            let temp = 199.0 + (t * 0.7_f64).sin();
            heater.compute_power(&TemperatureSample::reading(t, temp), 200.0, t);
            while rx.try_recv().is_ok() {}
        });
    });
}

criterion_group!(benches, bench_telemetry_decode, bench_control_step);
criterion_main!(benches);
