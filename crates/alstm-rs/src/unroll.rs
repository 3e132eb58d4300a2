//! Unrolls the attention-LSTM cell description into an explicit dataflow graph.
//!
//! The unroller makes a single synchronous pass over `t = 1..=T`. Each step
//! emits the attention sub-network (previous hidden state -> spatial mask),
//! applies the mask to the step's input features, projects masked input and
//! boundary-gated hidden state into gate-preactivation space, and emits the
//! cell-update node that threads `(c, h)` into the next step. After the loop
//! the per-step hidden states (and masks) are concatenated into whole-sequence
//! outputs and the final cell state is exported for truncated-backprop
//! chaining.
//!
//! Construction is pure and deterministic: no I/O, no shared state between
//! invocations, and every call with the same configuration yields a
//! structurally identical [`Graph`].

use anyhow::Result;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::builder::GraphBuilder;
use crate::spec::{
    ConcatSpec, EltwiseSumSpec, FillerSpec, Graph, LinearProjectionSpec, Operation, ParamGroupId,
    ReshapeSpec, Shape, SliceSpec, SoftmaxSpec, TensorId,
};

/// Configuration consumed once at construction time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlstmConfig {
    /// Hidden/cell width H; gate preactivations are `4 * num_output` wide.
    pub num_output: usize,
    /// Number of unrolled timesteps T.
    pub timesteps: usize,
    /// Batch size N, used to shape the recurrent-state bindings.
    pub batch_size: usize,
    /// Per-timestep input feature dims after the leading `[T, N]` axes
    /// (e.g. `[C, S, S]`). Must end with the `attn_side x attn_side` grid the
    /// attention mask is reshaped to.
    pub feature_shape: Vec<usize>,
    /// Side length S of the spatial attention mask; logits are `S*S` wide.
    pub attn_side: usize,
    /// Enables the static-context gate term; `x_static` is `[N, dims...]`.
    /// `None` omits the whole chain.
    pub static_shape: Option<Vec<usize>>,
    /// Ties the input-projection weights across timesteps. `false` keeps one
    /// parameter group per step, matching the reference configuration; the
    /// recurrent and attention projections are shared regardless.
    pub tie_input_weights: bool,
    /// Also concatenate the per-step attention masks into a second output.
    pub collect_masks: bool,
    /// Filler forwarded verbatim to every new weight parameter group.
    pub weight_filler: FillerSpec,
    /// Filler forwarded verbatim to every new bias parameter group.
    pub bias_filler: FillerSpec,
}

impl Default for AlstmConfig {
    fn default() -> Self {
        Self {
            num_output: 256,
            timesteps: 16,
            batch_size: 1,
            feature_shape: vec![512, 6, 6],
            attn_side: 6,
            static_shape: None,
            tie_input_weights: false,
            collect_masks: true,
            weight_filler: FillerSpec::Uniform {
                min: -0.08,
                max: 0.08,
            },
            bias_filler: FillerSpec::Constant { value: 0.0 },
        }
    }
}

/// Rejected configurations, detected before any node is created.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("num_output must be positive")]
    NonPositiveNumOutput,
    #[error("timesteps must be positive")]
    NonPositiveTimesteps,
    #[error("batch_size must be positive")]
    NonPositiveBatchSize,
    #[error("attention side length must be positive")]
    NonPositiveAttnSide,
    #[error("feature shape must not be empty")]
    EmptyFeatureShape,
    #[error("feature shape {shape:?} does not end with the {side}x{side} attention grid")]
    FeatureGridMismatch { shape: Vec<usize>, side: usize },
    #[error("static input enabled with an empty shape")]
    EmptyStaticShape,
}

impl AlstmConfig {
    /// Width of the concatenated gate preactivations `[i', f', o', g']`.
    pub fn gate_width(&self) -> usize {
        4 * self.num_output
    }

    /// Validates the configuration without building anything.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_output == 0 {
            return Err(ConfigError::NonPositiveNumOutput);
        }
        if self.timesteps == 0 {
            return Err(ConfigError::NonPositiveTimesteps);
        }
        if self.batch_size == 0 {
            return Err(ConfigError::NonPositiveBatchSize);
        }
        if self.attn_side == 0 {
            return Err(ConfigError::NonPositiveAttnSide);
        }
        if self.feature_shape.is_empty() {
            return Err(ConfigError::EmptyFeatureShape);
        }
        let side = self.attn_side;
        let grid_match = self.feature_shape.len() >= 2
            && self.feature_shape[self.feature_shape.len() - 2..] == [side, side];
        if !grid_match {
            return Err(ConfigError::FeatureGridMismatch {
                shape: self.feature_shape.clone(),
                side,
            });
        }
        if matches!(&self.static_shape, Some(dims) if dims.is_empty()) {
            return Err(ConfigError::EmptyStaticShape);
        }
        Ok(())
    }
}

/// Unrolls `cfg` into an explicit dataflow graph covering `cfg.timesteps`
/// steps. Fails fast on configuration errors (downcastable to
/// [`ConfigError`]) with no partial graph observable.
pub fn unroll(cfg: &AlstmConfig) -> Result<Graph> {
    cfg.validate()?;
    Unroller {
        cfg,
        builder: GraphBuilder::new(),
    }
    .build()
}

/// External and state input ids declared before any node exists.
struct IoBindings {
    x: TensorId,
    cont: TensorId,
    x_static: Option<TensorId>,
    h_0: TensorId,
    c_0: TensorId,
}

/// Tensors a single step hands to its successors.
struct StepOutputs {
    c: TensorId,
    h: TensorId,
    mask: TensorId,
}

struct Unroller<'a> {
    cfg: &'a AlstmConfig,
    builder: GraphBuilder,
}

impl Unroller<'_> {
    fn build(mut self) -> Result<Graph> {
        let timesteps = self.cfg.timesteps;
        let io = self.declare_io()?;
        let cont_steps = self.slice_sequence("cont_slice", io.cont, "cont")?;
        let x_steps = self.slice_sequence("x_slice", io.x, "x")?;
        let static_term = match io.x_static {
            Some(x_static) => Some(self.static_projection(x_static)?),
            None => None,
        };

        let mut h_prev = io.h_0;
        let mut c_prev = io.c_0;
        let mut hidden_steps = Vec::with_capacity(timesteps);
        let mut mask_steps = Vec::with_capacity(timesteps);
        for t in 1..=timesteps {
            let step = self.step(
                t,
                h_prev,
                c_prev,
                x_steps[t - 1],
                cont_steps[t - 1],
                static_term,
            )?;
            hidden_steps.push(step.h);
            mask_steps.push(step.mask);
            h_prev = step.h;
            c_prev = step.c;
        }

        self.export_state(h_prev, c_prev)?;
        self.collect_outputs(&hidden_steps, &mask_steps)?;
        Ok(self.builder.finish())
    }

    fn declare_io(&mut self) -> Result<IoBindings> {
        let cfg = self.cfg;
        let mut x_dims = vec![cfg.timesteps, cfg.batch_size];
        x_dims.extend_from_slice(&cfg.feature_shape);
        let x = self.builder.declare_input("x", Shape::new(x_dims))?;
        let cont = self
            .builder
            .declare_input("cont", Shape::new([cfg.timesteps, cfg.batch_size]))?;
        let x_static = match &cfg.static_shape {
            Some(dims) => {
                let mut static_dims = vec![cfg.batch_size];
                static_dims.extend_from_slice(dims);
                Some(
                    self.builder
                        .declare_input("x_static", Shape::new(static_dims))?,
                )
            }
            None => None,
        };

        let state_shape = Shape::new([1, cfg.batch_size, cfg.num_output]);
        let h_0 = self.builder.declare_state_input("h_0", state_shape.clone())?;
        let c_0 = self.builder.declare_state_input("c_0", state_shape)?;
        Ok(IoBindings {
            x,
            cont,
            x_static,
            h_0,
            c_0,
        })
    }

    /// Splits a whole-sequence `[T, N, ...]` tensor into T `[1, N, ...]`
    /// slices named `{prefix}_1 .. {prefix}_T`.
    fn slice_sequence(
        &mut self,
        node_name: &str,
        source: TensorId,
        prefix: &str,
    ) -> Result<Vec<TensorId>> {
        let mut step_dims = self.builder.shape(source).dims().to_vec();
        step_dims[0] = 1;
        let step_shape = Shape::new(step_dims);
        let outputs = (1..=self.cfg.timesteps)
            .map(|t| (format!("{prefix}_{t}"), step_shape.clone()))
            .collect();
        let ids = self.builder.emit(
            node_name,
            Operation::Slice(SliceSpec { axis: 0 }),
            &[source],
            outputs,
            &[],
        )?;
        Ok(ids.into_vec())
    }

    /// Projects the batch-level static context to gate width once, outside
    /// the loop; the result is the broadcast term added to every step's gate
    /// sum.
    fn static_projection(&mut self, x_static: TensorId) -> Result<TensorId> {
        let cfg = self.cfg;
        let gate_width = cfg.gate_width();
        let group = self.builder.param_group("x_static_w");
        let flat = self.emit_single(
            "x_static_transform",
            self.projection(gate_width, false, 1),
            &[x_static],
            "x_static_proj_flat",
            Shape::new([cfg.batch_size, gate_width]),
            &[group],
        )?;
        let shape = Shape::new([1, cfg.batch_size, gate_width]);
        self.emit_single(
            "x_static_reshape",
            Operation::Reshape(ReshapeSpec {
                shape: shape.clone(),
            }),
            &[flat],
            "x_static_proj",
            shape,
            &[],
        )
    }

    fn step(
        &mut self,
        t: usize,
        h_prev: TensorId,
        c_prev: TensorId,
        x_t: TensorId,
        cont_t: TensorId,
        static_term: Option<TensorId>,
    ) -> Result<StepOutputs> {
        let p = t - 1;
        let cfg = self.cfg;
        let n = cfg.batch_size;
        let side = cfg.attn_side;
        let gate_width = cfg.gate_width();

        // Attention logits from the previous hidden state; the projection
        // parameters are one group for all t.
        let att_w = self.builder.param_group("att_w");
        let att_b = self.builder.param_group("att_b");
        let logits = self.emit_single(
            format!("att_proj_{p}"),
            self.projection(side * side, true, 2),
            &[h_prev],
            format!("att_{p}"),
            Shape::new([1, n, side * side]),
            &[att_w, att_b],
        )?;
        let mask_flat = self.emit_single(
            format!("att_softmax_{p}"),
            Operation::Softmax(SoftmaxSpec { axis: -1 }),
            &[logits],
            format!("mask_{p}"),
            Shape::new([1, n, side * side]),
            &[],
        )?;
        let grid_shape = Shape::new([1, n, side, side]);
        let mask_grid = self.emit_single(
            format!("mask_reshape_{p}"),
            Operation::Reshape(ReshapeSpec {
                shape: grid_shape.clone(),
            }),
            &[mask_flat],
            format!("mask_grid_{p}"),
            grid_shape,
            &[],
        )?;

        // The mask derived from h_{t-1} gates the step-t features: the
        // one-step lag is intended.
        let x_shape = self.builder.shape(x_t).clone();
        let x_masked = self.emit_single(
            format!("mask_apply_{t}"),
            Operation::ElementwiseScale,
            &[x_t, mask_grid],
            format!("x_masked_{t}"),
            x_shape,
            &[],
        )?;

        let (x_w, x_b) = self.input_groups(t);
        let x_proj = self.emit_single(
            format!("x_transform_{t}"),
            self.projection(gate_width, true, 2),
            &[x_masked],
            format!("x_proj_{t}"),
            Shape::new([1, n, gate_width]),
            &[x_w, x_b],
        )?;

        // cont_t * h_{t-1}: zeroes carried hidden state at the start of a new
        // sub-sequence packed into the same batch slot.
        let h_gated = self.emit_single(
            format!("h_gated_{p}"),
            Operation::ElementwiseSum(EltwiseSumSpec {
                coeff_operand: true,
            }),
            &[h_prev, cont_t],
            format!("h_gated_{p}"),
            Shape::new([1, n, cfg.num_output]),
            &[],
        )?;

        let h_w = self.builder.param_group("h_w");
        let h_proj = self.emit_single(
            format!("h_transform_{t}"),
            self.projection(gate_width, false, 2),
            &[h_gated],
            format!("h_proj_{p}"),
            Shape::new([1, n, gate_width]),
            &[h_w],
        )?;

        // Operand order is part of the contract: recurrent term, input term,
        // then the optional static term.
        let mut gate_operands = vec![h_proj, x_proj];
        if let Some(static_term) = static_term {
            gate_operands.push(static_term);
        }
        let gate_input = self.emit_single(
            format!("gate_input_{t}"),
            Operation::ElementwiseSum(EltwiseSumSpec {
                coeff_operand: false,
            }),
            &gate_operands,
            format!("gate_input_{t}"),
            Shape::new([1, n, gate_width]),
            &[],
        )?;

        let state_shape = Shape::new([1, n, cfg.num_output]);
        let outputs = self.builder.emit(
            format!("cell_{t}"),
            Operation::RecurrentCellUpdate,
            &[c_prev, gate_input, cont_t],
            vec![
                (format!("c_{t}"), state_shape.clone()),
                (format!("h_{t}"), state_shape),
            ],
            &[],
        )?;
        Ok(StepOutputs {
            c: outputs[0],
            h: outputs[1],
            mask: mask_grid,
        })
    }

    /// Surfaces the terminal state: `h_T` directly, `c_T` through an identity
    /// copy so the binding survives independently of the in-loop chain.
    fn export_state(&mut self, h_final: TensorId, c_final: TensorId) -> Result<()> {
        let shape = self.builder.shape(c_final).clone();
        let c_export = self.emit_single(
            "c_export",
            Operation::StateSplit,
            &[c_final],
            "c_T",
            shape,
            &[],
        )?;
        self.builder.mark_state_output(h_final);
        self.builder.mark_state_output(c_export);
        Ok(())
    }

    fn collect_outputs(&mut self, hidden_steps: &[TensorId], mask_steps: &[TensorId]) -> Result<()> {
        let cfg = self.cfg;
        let hidden = self.emit_single(
            "h_concat",
            Operation::Concat(ConcatSpec { axis: 0 }),
            hidden_steps,
            "h",
            Shape::new([cfg.timesteps, cfg.batch_size, cfg.num_output]),
            &[],
        )?;
        self.builder.mark_output(hidden);

        if cfg.collect_masks {
            let masks = self.emit_single(
                "mask_concat",
                Operation::Concat(ConcatSpec { axis: 0 }),
                mask_steps,
                "mask",
                Shape::new([cfg.timesteps, cfg.batch_size, cfg.attn_side, cfg.attn_side]),
                &[],
            )?;
            self.builder.mark_output(masks);
        }
        Ok(())
    }

    fn projection(&self, output_width: usize, bias: bool, axis: usize) -> Operation {
        Operation::LinearProjection(LinearProjectionSpec {
            output_width,
            bias,
            axis,
            weight_filler: self.cfg.weight_filler.clone(),
            bias_filler: bias.then(|| self.cfg.bias_filler.clone()),
        })
    }

    fn input_groups(&mut self, t: usize) -> (ParamGroupId, ParamGroupId) {
        if self.cfg.tie_input_weights {
            (
                self.builder.param_group("x_w"),
                self.builder.param_group("x_b"),
            )
        } else {
            (
                self.builder.param_group(format!("x_w_{t}")),
                self.builder.param_group(format!("x_b_{t}")),
            )
        }
    }

    fn emit_single(
        &mut self,
        node_name: impl Into<String>,
        op: Operation,
        inputs: &[TensorId],
        output_name: impl Into<String>,
        shape: Shape,
        param_groups: &[ParamGroupId],
    ) -> Result<TensorId> {
        let outputs =
            self.builder
                .emit(node_name, op, inputs, vec![(output_name.into(), shape)], param_groups)?;
        Ok(outputs[0])
    }
}
