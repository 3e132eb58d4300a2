//! Mutable builder used to stage nodes while the unroller walks the timeline.

use std::collections::{HashMap, HashSet};

use anyhow::{ensure, Result};
use smallvec::SmallVec;

use crate::spec::{
    Graph, Node, NodeId, Operation, ParamGroup, ParamGroupId, Shape, TensorDecl, TensorId,
};

/// Staging area for graph construction.
///
/// Tensor and parameter-group identifiers are dense arena indices. A node can
/// only reference tensors that were already declared, so the finished graph is
/// causally ordered by construction; uniqueness of node and tensor names is
/// checked here so the engine's by-name binding interface stays unambiguous.
#[derive(Debug, Default)]
pub struct GraphBuilder {
    nodes: Vec<Node>,
    tensors: Vec<TensorDecl>,
    tensor_lookup: HashMap<String, TensorId>,
    node_names: HashSet<String>,
    param_groups: Vec<ParamGroup>,
    param_lookup: HashMap<String, ParamGroupId>,
    inputs: Vec<TensorId>,
    outputs: Vec<TensorId>,
    state_inputs: Vec<TensorId>,
    state_outputs: Vec<TensorId>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a named external input with its shape contract.
    pub fn declare_input(&mut self, name: impl Into<String>, shape: Shape) -> Result<TensorId> {
        let id = self.declare_tensor(name.into(), shape, None)?;
        self.inputs.push(id);
        Ok(id)
    }

    /// Declares a recurrent-state input binding (`h_0`, `c_0`).
    pub fn declare_state_input(
        &mut self,
        name: impl Into<String>,
        shape: Shape,
    ) -> Result<TensorId> {
        let id = self.declare_tensor(name.into(), shape, None)?;
        self.state_inputs.push(id);
        Ok(id)
    }

    /// Interns a shared-parameter group. Requesting the same name twice yields
    /// the same id, which is exactly what sharing a group across timesteps
    /// means to the execution engine.
    pub fn param_group(&mut self, name: impl Into<String>) -> ParamGroupId {
        let name = name.into();
        if let Some(&id) = self.param_lookup.get(&name) {
            return id;
        }
        let id = ParamGroupId(self.param_groups.len() as u32);
        self.param_groups.push(ParamGroup { name: name.clone() });
        self.param_lookup.insert(name, id);
        id
    }

    /// Emits a node, allocating one tensor id per `(name, shape)` output.
    /// Returns the output ids in declaration order.
    pub fn emit(
        &mut self,
        name: impl Into<String>,
        op: Operation,
        inputs: &[TensorId],
        outputs: Vec<(String, Shape)>,
        param_groups: &[ParamGroupId],
    ) -> Result<SmallVec<[TensorId; 2]>> {
        let name = name.into();
        ensure!(
            self.node_names.insert(name.clone()),
            "duplicate node name `{name}`"
        );
        for &input in inputs {
            ensure!(
                (input.0 as usize) < self.tensors.len(),
                "node `{name}` references unknown tensor {input:?}"
            );
        }
        for &group in param_groups {
            ensure!(
                (group.0 as usize) < self.param_groups.len(),
                "node `{name}` references unknown parameter group {group:?}"
            );
        }
        let node_id = NodeId(self.nodes.len() as u32);
        let mut output_ids = SmallVec::new();
        for (output_name, shape) in outputs {
            output_ids.push(self.declare_tensor(output_name, shape, Some(node_id))?);
        }
        self.nodes.push(Node {
            id: node_id,
            name,
            op,
            inputs: SmallVec::from_slice(inputs),
            outputs: output_ids.clone(),
            param_groups: SmallVec::from_slice(param_groups),
        });
        Ok(output_ids)
    }

    /// Marks a tensor as an external graph output.
    pub fn mark_output(&mut self, tensor: TensorId) {
        self.outputs.push(tensor);
    }

    /// Marks a tensor as a recurrent-state output binding.
    pub fn mark_state_output(&mut self, tensor: TensorId) {
        self.state_outputs.push(tensor);
    }

    /// Shape recorded for an already-declared tensor.
    pub fn shape(&self, tensor: TensorId) -> &Shape {
        &self.tensors[tensor.0 as usize].shape
    }

    /// Freezes the staged state into an immutable [`Graph`].
    pub fn finish(self) -> Graph {
        Graph {
            nodes: self.nodes,
            tensors: self.tensors,
            param_groups: self.param_groups,
            inputs: self.inputs,
            outputs: self.outputs,
            state_inputs: self.state_inputs,
            state_outputs: self.state_outputs,
        }
    }

    fn declare_tensor(
        &mut self,
        name: String,
        shape: Shape,
        producer: Option<NodeId>,
    ) -> Result<TensorId> {
        ensure!(!name.is_empty(), "tensor name cannot be empty");
        ensure!(
            !self.tensor_lookup.contains_key(&name),
            "duplicate tensor name `{name}`"
        );
        let id = TensorId(self.tensors.len() as u32);
        self.tensor_lookup.insert(name.clone(), id);
        self.tensors.push(TensorDecl {
            name,
            shape,
            producer,
        });
        Ok(id)
    }
}
