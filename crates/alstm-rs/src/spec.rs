use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Unique identifier for a node in the unrolled graph.
///
/// Ids issued by the builder are dense indices into [`Graph::nodes`], so they
/// stay unique across all timesteps without relying on name equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u32);

/// Unique identifier for a tensor value flowing between nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TensorId(pub u32);

/// Interned identifier for a shared-parameter group.
///
/// Any two nodes carrying the same group id must be bound to one underlying
/// parameter store by the execution engine; this is the mechanism by which the
/// recurrent and attention weights are reused at every timestep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ParamGroupId(pub u32);

/// Logical tensor shape as an ordered list of static extents.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    dims: Vec<usize>,
}

impl Shape {
    pub fn new(dims: impl Into<Vec<usize>>) -> Self {
        Self { dims: dims.into() }
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// Returns the element count unless it overflows `usize`.
    pub fn element_count(&self) -> Option<usize> {
        let mut count = 1usize;
        for &dim in &self.dims {
            count = count.checked_mul(dim)?;
        }
        Some(count)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, dim) in self.dims.iter().enumerate() {
            if index > 0 {
                write!(f, "x")?;
            }
            write!(f, "{dim}")?;
        }
        Ok(())
    }
}

/// Initialization spec forwarded verbatim to the execution engine for the
/// parameter groups a node introduces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FillerSpec {
    Constant { value: f64 },
    Uniform { min: f64, max: f64 },
    Gaussian { mean: f64, std: f64 },
    Xavier,
}

/// Attribute payload for [`Operation::Slice`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SliceSpec {
    /// Axis split into one slice per output.
    pub axis: usize,
}

/// Attribute payload for [`Operation::LinearProjection`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearProjectionSpec {
    /// Width of the projected feature axis.
    pub output_width: usize,
    /// Whether the projection adds a learned bias.
    pub bias: bool,
    /// Feature axis the projection contracts over; leading axes broadcast.
    pub axis: usize,
    pub weight_filler: FillerSpec,
    /// Present exactly when `bias` is set.
    pub bias_filler: Option<FillerSpec>,
}

/// Attribute payload for [`Operation::ElementwiseSum`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EltwiseSumSpec {
    /// When set, the trailing operand supplies per-batch-slot coefficients
    /// applied to the sum of the preceding operands instead of joining it.
    /// The continuation gate uses this to compute `cont_t * h_{t-1}`.
    pub coeff_operand: bool,
}

/// Attribute payload for [`Operation::Softmax`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SoftmaxSpec {
    /// Normalized axis; negative values index from the last axis.
    pub axis: isize,
}

/// Attribute payload for [`Operation::Reshape`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReshapeSpec {
    pub shape: Shape,
}

/// Attribute payload for [`Operation::Concat`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcatSpec {
    pub axis: usize,
}

/// Declarative form of the operations emitted by the unroller.
///
/// Operand order is semantically significant everywhere it is ambiguous:
/// see the per-variant docs and the stage functions in [`crate::unroll`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operation {
    /// Splits the sliced axis into one equal slice per declared output.
    Slice(SliceSpec),
    /// `y = W x (+ b)` over the configured feature axis.
    LinearProjection(LinearProjectionSpec),
    /// Elementwise sum, optionally coefficient-weighted by the last operand.
    ElementwiseSum(EltwiseSumSpec),
    /// Scales the first operand by the second, broadcasting the second over
    /// the axes it lacks (the mask broadcasts across the channel axis).
    ElementwiseScale,
    Softmax(SoftmaxSpec),
    Reshape(ReshapeSpec),
    Concat(ConcatSpec),
    /// Identity copy used to surface an interior tensor under a binding name.
    StateSplit,
    /// The recurrent state transition. Inputs `(c_prev, gate_input, cont)`,
    /// outputs `(c, h)`, with gate_input read as four equal slices
    /// `[i', f', o', g']`:
    ///
    /// ```text
    /// c = cont * (sigmoid(f') .* c_prev) + sigmoid(i') .* tanh(g')
    /// h = sigmoid(o') .* tanh(c)
    /// ```
    RecurrentCellUpdate,
}

impl Operation {
    /// Stable name of the operation kind, used for rendering and by the
    /// engine-side kernel registry.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Operation::Slice(_) => "Slice",
            Operation::LinearProjection(_) => "LinearProjection",
            Operation::ElementwiseSum(_) => "ElementwiseSum",
            Operation::ElementwiseScale => "ElementwiseScale",
            Operation::Softmax(_) => "Softmax",
            Operation::Reshape(_) => "Reshape",
            Operation::Concat(_) => "Concat",
            Operation::StateSplit => "StateSplit",
            Operation::RecurrentCellUpdate => "RecurrentCellUpdate",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Slice(spec) => write!(f, "Slice(axis={})", spec.axis),
            Operation::LinearProjection(spec) => write!(
                f,
                "LinearProjection(width={}, bias={}, axis={})",
                spec.output_width, spec.bias, spec.axis
            ),
            Operation::ElementwiseSum(spec) if spec.coeff_operand => {
                write!(f, "ElementwiseSum(coeff)")
            }
            Operation::ElementwiseSum(_) => write!(f, "ElementwiseSum"),
            Operation::ElementwiseScale => write!(f, "ElementwiseScale"),
            Operation::Softmax(spec) => write!(f, "Softmax(axis={})", spec.axis),
            Operation::Reshape(spec) => write!(f, "Reshape({})", spec.shape),
            Operation::Concat(spec) => write!(f, "Concat(axis={})", spec.axis),
            Operation::StateSplit => write!(f, "StateSplit"),
            Operation::RecurrentCellUpdate => write!(f, "RecurrentCellUpdate"),
        }
    }
}

/// Named tensor value declared in the graph, with the shape contract it is
/// expected to satisfy at that point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorDecl {
    pub name: String,
    pub shape: Shape,
    /// Node producing this tensor; `None` for external and state inputs.
    pub producer: Option<NodeId>,
}

/// Shared-parameter group record referenced by [`Node::param_groups`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamGroup {
    pub name: String,
}

/// Immutable description of one computation step in the unrolled graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    /// Human-readable name, unique within the graph (step index suffixed).
    pub name: String,
    pub op: Operation,
    pub inputs: SmallVec<[TensorId; 3]>,
    pub outputs: SmallVec<[TensorId; 2]>,
    /// Parameter groups bound by this node, in weight-then-bias order.
    pub param_groups: SmallVec<[ParamGroupId; 2]>,
}

/// Fully unrolled dataflow graph handed to the execution engine.
///
/// The graph is constructed once per configuration by [`crate::unroll::unroll`]
/// and immutable thereafter; the engine evaluates it repeatedly without it
/// being rebuilt. Nodes appear in dependency order: every input of a node is
/// produced by an earlier node or declared as an external/state input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    pub(crate) nodes: Vec<Node>,
    pub(crate) tensors: Vec<TensorDecl>,
    pub(crate) param_groups: Vec<ParamGroup>,
    pub(crate) inputs: Vec<TensorId>,
    pub(crate) outputs: Vec<TensorId>,
    pub(crate) state_inputs: Vec<TensorId>,
    pub(crate) state_outputs: Vec<TensorId>,
}

impl Graph {
    /// All nodes in emission (dependency) order.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0 as usize]
    }

    pub fn tensors(&self) -> &[TensorDecl] {
        &self.tensors
    }

    pub fn tensor(&self, id: TensorId) -> &TensorDecl {
        &self.tensors[id.0 as usize]
    }

    /// Looks a tensor up by its engine-facing binding name.
    pub fn tensor_by_name(&self, name: &str) -> Option<TensorId> {
        self.tensors
            .iter()
            .position(|decl| decl.name == name)
            .map(|index| TensorId(index as u32))
    }

    pub fn param_groups(&self) -> &[ParamGroup] {
        &self.param_groups
    }

    pub fn param_group(&self, id: ParamGroupId) -> &ParamGroup {
        &self.param_groups[id.0 as usize]
    }

    /// Declared external inputs (`x`, `cont`, optionally `x_static`).
    pub fn inputs(&self) -> &[TensorId] {
        &self.inputs
    }

    /// External outputs, one entry per concatenated sequence tensor.
    pub fn outputs(&self) -> &[TensorId] {
        &self.outputs
    }

    /// Recurrent-state input bindings (`h_0`, `c_0`).
    pub fn state_inputs(&self) -> &[TensorId] {
        &self.state_inputs
    }

    /// Recurrent-state output bindings (`h_T`, `c_T`), in that order.
    pub fn state_outputs(&self) -> &[TensorId] {
        &self.state_outputs
    }

    /// Node producing `tensor`, or `None` for external and state inputs.
    pub fn producer(&self, tensor: TensorId) -> Option<NodeId> {
        self.tensor(tensor).producer
    }
}

impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "graph {{")?;
        for &id in &self.inputs {
            let decl = self.tensor(id);
            writeln!(f, "  input %{}: {}", decl.name, decl.shape)?;
        }
        for &id in &self.state_inputs {
            let decl = self.tensor(id);
            writeln!(f, "  state %{}: {}", decl.name, decl.shape)?;
        }
        for node in &self.nodes {
            write!(f, "  ")?;
            for (index, &output) in node.outputs.iter().enumerate() {
                if index > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "%{}", self.tensor(output).name)?;
            }
            write!(f, " = {} {}(", node.name, node.op)?;
            for (index, &input) in node.inputs.iter().enumerate() {
                if index > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "%{}", self.tensor(input).name)?;
            }
            write!(f, ")")?;
            if !node.param_groups.is_empty() {
                write!(f, " {{")?;
                for (index, &group) in node.param_groups.iter().enumerate() {
                    if index > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", self.param_group(group).name)?;
                }
                write!(f, "}}")?;
            }
            writeln!(f)?;
        }
        for &id in &self.outputs {
            writeln!(f, "  output %{}", self.tensor(id).name)?;
        }
        for &id in &self.state_outputs {
            writeln!(f, "  state_output %{}", self.tensor(id).name)?;
        }
        write!(f, "}}")
    }
}
