use anyhow::Result;
use diversify_rs::portfolio::PortfolioEngine;
use diversify_rs::portfolio::PortfolioEngineConfig;
use diversify_rs::portfolio::ReturnMatrix;
use diversify_rs::portfolio::RiskTolerance;
use diversify_rs::portfolio::log_returns_series;
use diversify_rs::portfolio::trade_quantities;
use diversify_rs::portfolio::turnover;
use prettytable::Table;
use prettytable::row;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::Distribution;
use rand_distr::Normal;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const N_ASSETS: usize = 24;
const N_PERIODS: usize = 504;
const PERIODS_PER_YEAR: f64 = 252.0;
const EQUITY: f64 = 1_000_000.0;

/// One-factor synthetic price universe.
fn simulate_prices(rng: &mut StdRng) -> Result<(Vec<String>, Vec<Vec<f64>>)> {
  let normal = Normal::new(0.0, 1.0)?;
  let factor: Vec<f64> = (0..N_PERIODS).map(|_| normal.sample(rng)).collect();

  let mut ids = Vec::with_capacity(N_ASSETS);
  let mut prices = Vec::with_capacity(N_ASSETS);
  for i in 0..N_ASSETS {
    let mu = 0.03 + 0.10 * (i % 6) as f64 / 5.0;
    let vol = 0.12 + 0.25 * (i % 4) as f64 / 3.0;
    let beta = 0.3 + 0.5 * (i % 5) as f64 / 4.0;

    let mut path = Vec::with_capacity(N_PERIODS + 1);
    path.push(100.0);
    for f in &factor {
      let shock = beta * f + (1.0 - beta * beta).sqrt() * normal.sample(rng);
      let r = mu / PERIODS_PER_YEAR + vol / PERIODS_PER_YEAR.sqrt() * shock;
      let last = path[path.len() - 1];
      path.push(last * r.exp());
    }

    ids.push(format!("SYN{i:02}"));
    prices.push(path);
  }

  Ok((ids, prices))
}

fn main() -> Result<()> {
  tracing_subscriber::registry()
    .with(tracing_subscriber::fmt::layer())
    .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  let mut rng = StdRng::seed_from_u64(42);
  let (ids, prices) = simulate_prices(&mut rng)?;
  let series: Vec<Vec<f64>> = prices.iter().map(|p| log_returns_series(p)).collect();
  let returns = ReturnMatrix::from_series(ids, &series)?;
  info!(
    assets = returns.n_assets(),
    periods = returns.n_periods(),
    "synthetic universe ready"
  );

  let engine = PortfolioEngine::new(PortfolioEngineConfig {
    risk_free: 0.02,
    ..PortfolioEngineConfig::from_keys("max_sharpe", "moderate")?
  });
  let reports = engine.construct_tiers(&returns, &RiskTolerance::ALL, None)?;

  let mut table = Table::new();
  table.add_row(row![
    "tier", "eff. holdings", "meaningful", "max pos", "top 3", "return", "vol", "sharpe",
    "max dd", "kept", "wisdom", "degraded"
  ]);
  for report in &reports {
    let r = &report.result;
    let d = &r.diagnostics;
    table.add_row(row![
      r.risk_tolerance,
      format!("{:.1}", d.effective_holdings),
      d.meaningful_positions,
      format!("{:.1}%", d.max_position * 100.0),
      format!("{:.1}%", d.top_3_concentration * 100.0),
      format!("{:.1}%", d.expected_return * 100.0),
      format!("{:.1}%", d.volatility * 100.0),
      format!("{:.2}", d.sharpe),
      format!("{:.1}%", d.max_drawdown * 100.0),
      format!("{:.1}%", r.performance_ratio() * 100.0),
      report.validation.score,
      r.degraded
    ]);
  }
  table.printstd();

  for report in &reports {
    println!("\n[{}] {}", report.result.risk_tolerance, report.explanation.summary.headline);
    if let Some(tradeoff) = &report.explanation.tradeoff {
      println!("  {}", tradeoff.statement);
    }
    for binding in &report.explanation.binding_constraints {
      println!(
        "  binding {:?}: {:.4} vs limit {:.4}",
        binding.kind, binding.value, binding.limit
      );
    }
    for violation in &report.validation.violations {
      println!("  wisdom {:?}: {}", violation.severity, violation.message);
    }
  }

  // Move the aggressive book toward the conservative tier in one bounded step.
  let aggressive = &reports[2].result;
  let step = engine
    .with_tolerance(RiskTolerance::Conservative)
    .optimize(&returns, Some(aggressive.weights.as_slice()))?;
  let last_prices: Vec<f64> = prices.iter().map(|p| p[p.len() - 1]).collect();
  let trades = trade_quantities(&step.weights, &aggressive.weights, EQUITY, &last_prices)?;

  let mut trade_table = Table::new();
  trade_table.add_row(row!["asset", "current", "target", "units"]);
  for (i, id) in step.asset_ids.iter().enumerate() {
    if trades[i].abs() > 1e-9 {
      trade_table.add_row(row![
        id,
        format!("{:.2}%", aggressive.weights[i] * 100.0),
        format!("{:.2}%", step.weights[i] * 100.0),
        format!("{:+.1}", trades[i])
      ]);
    }
  }
  println!(
    "\nrebalance aggressive -> conservative, turnover {:.1}%",
    turnover(&step.weights, &aggressive.weights) * 100.0
  );
  trade_table.printstd();

  Ok(())
}
