use std::hint::black_box;

use criterion::BenchmarkId;
use criterion::Criterion;
use criterion::criterion_group;
use criterion::criterion_main;
use diversify_rs::portfolio::PortfolioEngine;
use diversify_rs::portfolio::PortfolioEngineConfig;
use diversify_rs::portfolio::ReturnMatrix;
use diversify_rs::portfolio::RiskTolerance;
use diversify_rs::portfolio::StrategyType;
use ndarray::Array2;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::Distribution;
use rand_distr::Normal;

const PERIODS: usize = 252;

fn universe(n: usize) -> ReturnMatrix {
  let mut rng = StdRng::seed_from_u64(7);
  let dist = Normal::new(0.0, 1.0).unwrap();
  let factor: Vec<f64> = (0..PERIODS).map(|_| dist.sample(&mut rng)).collect();
  let data = Array2::from_shape_fn((PERIODS, n), |(t, i)| {
    let beta = 0.3 + 0.4 * (i % 3) as f64 / 2.0;
    let vol = 0.15 + 0.1 * (i % 4) as f64 / 3.0;
    let shock = beta * factor[t] + (1.0 - beta * beta).sqrt() * dist.sample(&mut rng);
    (0.04 + 0.01 * (i % 5) as f64) / 252.0 + vol / 252f64.sqrt() * shock
  });
  let ids = (0..n).map(|i| format!("B{i}")).collect();
  ReturnMatrix::new(ids, data).unwrap()
}

fn bench_optimize(c: &mut Criterion) {
  let mut group = c.benchmark_group("two_stage_optimize");
  group.sample_size(10);

  for &n in &[10, 25, 50] {
    let returns = universe(n);
    for strategy in [StrategyType::MaxSharpe, StrategyType::MinVolatility] {
      let engine = PortfolioEngine::new(PortfolioEngineConfig {
        strategy,
        risk_tolerance: RiskTolerance::Moderate,
        ..PortfolioEngineConfig::default()
      });
      group.bench_with_input(BenchmarkId::new(strategy.to_string(), n), &n, |b, _| {
        b.iter(|| black_box(engine.optimize(&returns, None).unwrap()));
      });
    }
  }

  group.finish();
}

fn bench_tiers(c: &mut Criterion) {
  let mut group = c.benchmark_group("construct_tiers");
  group.sample_size(10);
  let returns = universe(30);
  let engine = PortfolioEngine::new(PortfolioEngineConfig::default());

  group.bench_function("parallel_30", |b| {
    b.iter(|| black_box(engine.construct_tiers(&returns, &RiskTolerance::ALL, None).unwrap()));
  });

  group.finish();
}

criterion_group!(benches, bench_optimize, bench_tiers);
criterion_main!(benches);
