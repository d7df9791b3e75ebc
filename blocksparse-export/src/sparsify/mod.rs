//! Progressive block sparsification.
//!
//! This module provides:
//! - **Block pruning**: [`sparsify_matrix`] zeroes low-energy blocks of a matrix
//! - **Scheduling**: [`SparsificationScheduler`] raises sparsity over training
//! - **Cost estimate**: [`gru_flops_per_step`] for a pruned recurrent unit

mod mask;
mod scheduler;

pub use mask::{block_energies, sparsify_matrix, survivor_count, BlockMask};
pub use scheduler::{
    GruWeights, MaskChange, SparsificationScheduler, SparsificationTask, StepReport,
};

use crate::config::{Gate, GateSet};

/// Approximate floating point operations per time step of a GRU whose gates
/// are pruned to the target densities in `gates`.
///
/// Gates missing from `gates` count as dense. Activations are budgeted at ten
/// operations each.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn gru_flops_per_step(
    input_size: usize,
    hidden_size: usize,
    gates: &GateSet,
    drop_input: bool,
) -> f64 {
    let density = |g: Gate| gates.get(g).map_or(1.0, |c| c.target_density);
    let input_density = (density(Gate::InputReset)
        + density(Gate::InputNew)
        + density(Gate::InputUpdate))
        / 3.0;
    let recurrent_density = (density(Gate::RecurrentReset)
        + density(Gate::RecurrentNew)
        + density(Gate::RecurrentUpdate))
        / 3.0;

    let (i, h) = (input_size as f64, hidden_size as f64);
    let mut flops = 0.0;
    if !drop_input {
        flops += 2.0 * 3.0 * i * h * input_density;
    }
    flops += 2.0 * 3.0 * h * h * recurrent_density;
    // biases
    flops += 6.0 * h;
    // activations
    flops += 30.0 * h;
    flops
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GateConfig;

    #[test]
    fn test_dense_gru_flops() {
        let flops = gru_flops_per_step(16, 32, &GateSet::new(), false);
        let expected = 6.0 * 16.0 * 32.0 + 6.0 * 32.0 * 32.0 + 36.0 * 32.0;
        assert!((flops - expected).abs() < 1e-9);
    }

    #[test]
    fn test_sparse_gru_flops() {
        let gates = GateSet::new()
            .with_gate(Gate::RecurrentReset, GateConfig::new(0.1, (4, 4), true))
            .with_gate(Gate::RecurrentUpdate, GateConfig::new(0.2, (4, 4), true))
            .with_gate(Gate::RecurrentNew, GateConfig::new(0.3, (4, 4), true));
        let flops = gru_flops_per_step(16, 32, &gates, true);
        let expected = 6.0 * 32.0 * 32.0 * 0.2 + 36.0 * 32.0;
        assert!((flops - expected).abs() < 1e-6);
    }
}
