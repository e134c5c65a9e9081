use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use framebatch::streaming::stitcher::{lcs_merge_into, longest_common_subsequence_merge};
use framebatch::streaming::{Alignment, ScriptedModel, TokenId, Vocabulary};
use framebatch::{Config, StreamingEngine};
use ndarray::Array2;
use std::hint::black_box;

const BLANK: TokenId = 0;

/// Frame-level CTC-like track: short tokens separated by blank runs.
fn token_track(len: usize) -> Vec<TokenId> {
    (0..len)
        .map(|i| if i % 4 == 3 { BLANK } else { (i / 2 % 97) as TokenId + 1 })
        .collect()
}

fn bench_lcs_table(c: &mut Criterion) {
    let mut group = c.benchmark_group("lcs_table");

    for &lookback in &[16usize, 64, 256] {
        let history = token_track(lookback * 2);
        let x = &history[history.len() - lookback..];
        let y: Vec<TokenId> = history[history.len() - lookback / 2..]
            .iter()
            .copied()
            .chain(token_track(lookback))
            .collect();

        group.throughput(Throughput::Elements((x.len() * y.len()) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(lookback), &lookback, |b, _| {
            b.iter(|| longest_common_subsequence_merge(black_box(x), black_box(&y), Some(BLANK), 1))
        });
    }

    group.finish();
}

fn bench_merge_into(c: &mut Criterion) {
    let mut group = c.benchmark_group("lcs_merge_into");

    for &delay in &[8usize, 32, 120] {
        let history = token_track(1024);
        let data: Vec<TokenId> = history[history.len() - delay..]
            .iter()
            .copied()
            .chain(token_track(delay))
            .collect();

        group.bench_with_input(BenchmarkId::from_parameter(delay), &delay, |b, &delay| {
            b.iter_batched(
                || history.clone(),
                |mut buffer| {
                    lcs_merge_into(&mut buffer, black_box(&data), delay, 1, Some(BLANK), 1);
                    buffer
                },
                criterion::BatchSize::SmallInput,
            )
        });
    }

    group.finish();
}

fn bench_engine_steps(c: &mut Criterion) {
    let config = Config::parse(
        r#"
        [buffer]
        feature_count = 80
        window_length = 400
        frame_length = 160

        [merge]
        mode = "lcs"
        delay = 30
        lcs_delay = 30
        max_steps_per_timestep = 1
        blank_id = 0
    "#,
    )
    .and_then(|config| config.engine_config());
    let Ok(config) = config else {
        eprintln!("Skipping engine benchmark: invalid configuration");
        return;
    };

    let mut group = c.benchmark_group("engine_batch");
    for &streams in &[1usize, 4, 16] {
        group.bench_with_input(BenchmarkId::from_parameter(streams), &streams, |b, &streams| {
            b.iter(|| {
                let track = token_track(4096);
                let model = ScriptedModel::new(move |stream, step| {
                    let start = (step as usize * 20 + stream.index()) % 2048;
                    Alignment::from_labels(track[start..start + 50].iter().copied())
                });
                let Ok(mut engine) =
                    StreamingEngine::new(config.clone(), model, Vocabulary::default())
                else {
                    return;
                };
                for _ in 0..streams {
                    if engine
                        .register_features(Array2::zeros((80, 160 * 10)))
                        .is_err()
                    {
                        return;
                    }
                }
                black_box(engine.run_to_completion().map(|finals| finals.len()).unwrap_or_default());
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_lcs_table, bench_merge_into, bench_engine_steps);
criterion_main!(benches);
