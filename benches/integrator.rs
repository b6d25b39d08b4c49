use criterion::{black_box, criterion_group, criterion_main, Criterion};

use aworld::core::physics::{simulate, step, MoveIntent, MovementState, PhysicsConfig};
use aworld::core::vec3::Vec3;

fn walking_intents(n: usize) -> Vec<MoveIntent> {
    (0..n)
        .map(|i| MoveIntent {
            forward: i % 4 != 3,
            left: i % 7 == 0,
            jump: i % 30 == 0,
            sprint: i % 11 < 5,
            camera_rotation: (i as f64 * 0.05).sin(),
            ..Default::default()
        })
        .collect()
}

fn bench_step(c: &mut Criterion) {
    let config = PhysicsConfig::default();
    let state = MovementState::at(Vec3::ZERO, &config);
    let intent = MoveIntent { forward: true, sprint: true, ..Default::default() };
    let dt = config.fixed_dt();

    c.bench_function("step", |b| {
        b.iter(|| step(black_box(&config), black_box(&state), black_box(&intent), dt))
    });
}

fn bench_replay(c: &mut Criterion) {
    let config = PhysicsConfig::default();
    let start = MovementState::at(Vec3::ZERO, &config);
    // 3 seconds of unacknowledged history at 20Hz
    let intents = walking_intents(60);

    c.bench_function("replay_60", |b| {
        b.iter(|| simulate(black_box(&config), start, black_box(&intents)))
    });
}

criterion_group!(benches, bench_step, bench_replay);
criterion_main!(benches);
