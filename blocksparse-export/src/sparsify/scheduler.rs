//! Progressive sparsification of recurrent units during training.

use std::collections::HashMap;

use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use crate::config::{Gate, GateSet, SchedulerConfig};
use crate::error::{ExportError, Result};
use crate::matrix::WeightMatrix;
use crate::sparsify::mask::{sparsify_matrix, BlockMask};

/// Live weights of one gated recurrent unit, gates stacked as reset, update, new.
///
/// `input` is `3H x inputs`, `recurrent` is `3H x H`. Biases are carried along
/// for export and are never pruned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GruWeights {
    /// Unit name, used to bind sparsification tasks.
    pub name: String,
    /// Hidden size `H`.
    pub hidden_size: usize,
    /// Input weight, `3H x inputs`.
    pub input: WeightMatrix,
    /// Recurrent weight, `3H x H`.
    pub recurrent: WeightMatrix,
    /// Input bias, `3H`.
    pub input_bias: Option<Vec<f32>>,
    /// Recurrent bias, `3H`.
    pub recurrent_bias: Option<Vec<f32>>,
}

impl GruWeights {
    /// Bundle unit weights, checking the stacked-gate layout.
    ///
    /// # Errors
    ///
    /// Returns a shape error if the matrices or biases are not `3H` tall.
    pub fn new(
        name: impl Into<String>,
        input: WeightMatrix,
        recurrent: WeightMatrix,
        input_bias: Option<Vec<f32>>,
        recurrent_bias: Option<Vec<f32>>,
    ) -> Result<Self> {
        let hidden_size = recurrent.cols();
        if recurrent.rows() != 3 * hidden_size {
            return Err(ExportError::shape(
                recurrent.rows(),
                recurrent.cols(),
                "recurrent weight must be 3H x H",
            ));
        }
        if input.rows() != 3 * hidden_size {
            return Err(ExportError::shape(
                input.rows(),
                input.cols(),
                format!("input weight must have {} rows", 3 * hidden_size),
            ));
        }
        for bias in [&input_bias, &recurrent_bias].into_iter().flatten() {
            if bias.len() != 3 * hidden_size {
                return Err(ExportError::shape(
                    bias.len(),
                    1,
                    format!("bias must have {} entries", 3 * hidden_size),
                ));
            }
        }
        Ok(Self {
            name: name.into(),
            hidden_size,
            input,
            recurrent,
            input_bias,
            recurrent_bias,
        })
    }

    /// Build from candle tensors laid out `[3H, inputs]`, `[3H, H]`, `[3H]`.
    ///
    /// # Errors
    ///
    /// Returns error if a tensor has the wrong rank or shape.
    pub fn from_tensors(
        name: impl Into<String>,
        input: &Tensor,
        recurrent: &Tensor,
        input_bias: Option<&Tensor>,
        recurrent_bias: Option<&Tensor>,
    ) -> Result<Self> {
        let to_vec = |t: &Tensor| -> Result<Vec<f32>> {
            Ok(t.to_dtype(candle_core::DType::F32)?.flatten_all()?.to_vec1::<f32>()?)
        };
        Self::new(
            name,
            WeightMatrix::from_tensor(input)?,
            WeightMatrix::from_tensor(recurrent)?,
            input_bias.map(to_vec).transpose()?,
            recurrent_bias.map(to_vec).transpose()?,
        )
    }

    fn weight_mut(&mut self, gate: Gate) -> &mut WeightMatrix {
        if gate.is_recurrent() {
            &mut self.recurrent
        } else {
            &mut self.input
        }
    }
}

/// Binds a recurrent unit (by name) to its per-gate pruning targets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SparsificationTask {
    /// Name of the [`GruWeights`] this task prunes.
    pub unit: String,
    /// Per-gate targets.
    pub gates: GateSet,
}

impl SparsificationTask {
    /// Create a task.
    #[must_use]
    pub fn new(unit: impl Into<String>, gates: GateSet) -> Self {
        Self {
            unit: unit.into(),
            gates,
        }
    }
}

/// A gate whose mask changed after the schedule finished.
///
/// Informational: a changing mask late in training hints at instability, it
/// never aborts the step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaskChange {
    /// Unit name.
    pub unit: String,
    /// Gate whose mask changed.
    pub gate: Gate,
    /// Step at which the change was observed.
    pub step: usize,
}

/// Outcome of one [`SparsificationScheduler::step`] call.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StepReport {
    /// Step counter after this call.
    pub step: usize,
    /// Interpolation factor, `None` if the step did not prune.
    pub alpha: Option<f64>,
    /// Effective density applied per `(unit, gate)`.
    pub densities: Vec<(String, Gate, f64)>,
    /// Masks that changed after `stop`.
    pub mask_changes: Vec<MaskChange>,
}

impl StepReport {
    /// Whether this step modified any weights.
    #[must_use]
    pub const fn acted(&self) -> bool {
        self.alpha.is_some()
    }
}

/// Progressive block sparsifier for gated recurrent units.
///
/// Call [`step`](Self::step) once after every optimizer step. Before `start`
/// nothing happens; between `start` and `stop` the gates are pruned every
/// `interval` steps toward their targets; from `stop` on the targets are
/// re-applied on every call so the pruned blocks stay at zero.
///
/// # Example
///
/// ```ignore
/// use blocksparse_export::{GateSet, SchedulerConfig, SparsificationScheduler, SparsificationTask};
///
/// let tasks = vec![SparsificationTask::new("gru1", GateSet::recurrent_default())];
/// let mut scheduler = SparsificationScheduler::new(tasks, SchedulerConfig::default())?;
///
/// for _ in 0..total_steps {
///     optimizer.step()?;
///     let report = scheduler.step(&mut units)?;
/// }
/// ```
#[derive(Debug)]
pub struct SparsificationScheduler {
    config: SchedulerConfig,
    tasks: Vec<SparsificationTask>,
    step_counter: usize,
    last_masks: HashMap<(String, Gate), BlockMask>,
}

impl SparsificationScheduler {
    /// Create a scheduler.
    ///
    /// # Errors
    ///
    /// Returns error if the timeline or a gate target is invalid.
    pub fn new(tasks: Vec<SparsificationTask>, config: SchedulerConfig) -> Result<Self> {
        config.validate()?;
        for task in &tasks {
            task.gates.validate()?;
        }
        Ok(Self {
            config,
            tasks,
            step_counter: 0,
            last_masks: HashMap::new(),
        })
    }

    /// Number of `step` calls so far.
    #[must_use]
    pub const fn step_count(&self) -> usize {
        self.step_counter
    }

    /// Scheduler timeline.
    #[must_use]
    pub const fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Registered tasks.
    #[must_use]
    pub fn tasks(&self) -> &[SparsificationTask] {
        &self.tasks
    }

    /// Interpolation factor for `step`, or `None` if that step does not prune.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn alpha_at(&self, step: usize) -> Option<f64> {
        let SchedulerConfig {
            start,
            stop,
            interval,
            exponent,
        } = self.config;

        if step < start {
            None
        } else if step < stop {
            if step % interval != 0 {
                return None;
            }
            let progress = (stop - step) as f64 / (stop - start) as f64;
            Some(progress.powf(exponent))
        } else {
            Some(0.0)
        }
    }

    /// Advance the counter and prune every bound gate if the schedule says so.
    ///
    /// # Errors
    ///
    /// Returns error if a task's unit is missing from `units` or a gate's block
    /// shape does not fit its weight band. Weights of gates processed before the
    /// failure stay pruned.
    pub fn step(&mut self, units: &mut [GruWeights]) -> Result<StepReport> {
        self.step_counter += 1;
        let step = self.step_counter;

        let mut report = StepReport {
            step,
            ..StepReport::default()
        };

        let Some(alpha) = self.alpha_at(step) else {
            return Ok(report);
        };
        report.alpha = Some(alpha);

        for task in &self.tasks {
            let unit = units
                .iter_mut()
                .find(|u| u.name == task.unit)
                .ok_or_else(|| ExportError::MissingUnit(task.unit.clone()))?;
            let hidden = unit.hidden_size;

            for (gate, gate_config) in task.gates.iter() {
                let density = alpha + (1.0 - alpha) * gate_config.target_density;
                tracing::debug!(step, unit = %task.unit, %gate, density, "sparsifying gate");

                let weight = unit.weight_mut(gate);
                let row = gate.band() * hidden;
                let mut band = weight.row_band(row, row + hidden)?;
                let mask = sparsify_matrix(&mut band, density, gate_config)?;
                weight.set_row_band(row, &band)?;

                let key = (task.unit.clone(), gate);
                if let Some(previous) = self.last_masks.get(&key) {
                    if step > self.config.stop && *previous != mask {
                        tracing::warn!(
                            step,
                            unit = %task.unit,
                            %gate,
                            "sparsification mask changed after schedule end"
                        );
                        report.mask_changes.push(MaskChange {
                            unit: task.unit.clone(),
                            gate,
                            step,
                        });
                    }
                }
                self.last_masks.insert(key, mask);
                report.densities.push((task.unit.clone(), gate, density));
            }
        }

        Ok(report)
    }
}
