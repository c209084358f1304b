use criterion::{black_box, criterion_group, criterion_main, Criterion};
use klingt_context::{AudioContext, RENDER_QUANTUM_FRAMES};

pub fn criterion_benchmark(c: &mut Criterion) {
    c.bench_function("render_quantum(oscillator -> gain)", |b| {
        let (context, mut renderer) = AudioContext::new(48_000);
        let osc = context.create_oscillator();
        let gain = context.create_gain();
        osc.connect(&gain, 0, 0).unwrap();
        gain.connect(&context.destination(), 0, 0).unwrap();
        osc.start(0.0).unwrap();

        let mut out = vec![0.0; 2 * RENDER_QUANTUM_FRAMES];
        b.iter(|| renderer.render_quantum(black_box(&mut out), None, RENDER_QUANTUM_FRAMES))
    });

    c.bench_function("render_quantum(64 oscillators, automated gain)", |b| {
        let (context, mut renderer) = AudioContext::new(48_000);
        let gain = context.create_gain();
        gain.connect(&context.destination(), 0, 0).unwrap();
        gain.gain()
            .set_value_at_time(0.0, 0.0)
            .unwrap()
            .linear_ramp_to_value_at_time(1.0, 3600.0)
            .unwrap();

        let oscillators: Vec<_> = (0..64)
            .map(|i| {
                let osc = context.create_oscillator();
                osc.frequency().set_value(110.0 * (i + 1) as f32);
                osc.connect(&gain, 0, 0).unwrap();
                osc.start(0.0).unwrap();
                osc
            })
            .collect();

        let mut out = vec![0.0; 2 * RENDER_QUANTUM_FRAMES];
        b.iter(|| renderer.render_quantum(black_box(&mut out), None, RENDER_QUANTUM_FRAMES));
        drop(oscillators);
    });

    c.bench_function("connect/disconnect", |b| {
        let (context, _renderer) = AudioContext::new(48_000);
        let osc = context.create_oscillator();
        let gain = context.create_gain();

        b.iter(|| {
            osc.connect(&gain, 0, 0).unwrap();
            osc.disconnect(0).unwrap();
        })
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
