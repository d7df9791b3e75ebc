//! Progressive block pruning of a GRU during a simulated training run.
//!
//! Run with: `RUST_LOG=blocksparse_export=debug cargo run --example sparsify_schedule`

use blocksparse_export::{
    gru_flops_per_step, GateSet, GruWeights, SchedulerConfig, SparsificationScheduler,
    SparsificationTask,
};
use candle_core::{Device, Tensor};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    println!("=== blocksparse-export Schedule Example ===\n");

    let device = Device::Cpu;
    let (inputs, hidden) = (64, 96);

    println!("1. Configuration");
    let config = SchedulerConfig::new()
        .with_start(200)
        .with_stop(1000)
        .with_interval(50)
        .with_exponent(3.0);
    let gates = GateSet::recurrent_default();
    println!("   Start/stop: {}/{}", config.start, config.stop);
    println!("   Interval: {}", config.interval);
    println!(
        "   Dense cost: {:.0} flops/step",
        gru_flops_per_step(inputs, hidden, &GateSet::new(), false)
    );
    println!(
        "   Target cost: {:.0} flops/step",
        gru_flops_per_step(inputs, hidden, &gates, false)
    );

    println!("\n2. Creating GRU weights");
    let w_ih = Tensor::randn(0.0f32, 0.2, (3 * hidden, inputs), &device)?;
    let w_hh = Tensor::randn(0.0f32, 0.2, (3 * hidden, hidden), &device)?;
    let mut units = vec![GruWeights::from_tensors("gru1", &w_ih, &w_hh, None, None)?];

    let task = SparsificationTask::new("gru1", gates);
    let mut scheduler = SparsificationScheduler::new(vec![task], config)?;

    println!("\n3. Training steps");
    for _ in 0..1200 {
        // An optimizer step would update `units` here.
        let report = scheduler.step(&mut units)?;
        if report.acted() && report.step % 200 == 0 {
            println!(
                "   step {:>5}: alpha={:.3} recurrent sparsity={:.1}% input sparsity={:.1}%",
                report.step,
                report.alpha.unwrap_or_default(),
                units[0].recurrent.sparsity() * 100.0,
                units[0].input.sparsity() * 100.0,
            );
        }
        for change in &report.mask_changes {
            println!("   mask of {} {} changed at step {}", change.unit, change.gate, change.step);
        }
    }

    println!("\n=== Example Complete ===");
    Ok(())
}
