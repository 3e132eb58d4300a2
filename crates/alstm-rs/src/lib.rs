//! Expands a compact attention-augmented LSTM cell description into an
//! explicit, fully-unrolled dataflow graph covering T timesteps.
//!
//! The crate produces a graph *specification* only: an ordered list of
//! operation nodes with typed tensor wiring, shared-parameter-group bindings,
//! and named external/state inputs and outputs. Numeric evaluation,
//! differentiation, kernel dispatch, and parameter initialization are the
//! execution engine's side of the contract.
//!
//! ```text
//! AlstmConfig ---> unroll() ---> Graph
//!                     |
//!      Slicer -> (Attention -> Mask -> Projections
//!                 -> Continuation gate -> Cell update) x T -> Collector
//! ```
//!
//! See [`unroll::unroll`] for the entry point and [`spec::Graph`] for the
//! handed-off data model.

pub mod builder;
pub mod spec;
pub mod unroll;

pub use spec::{FillerSpec, Graph, Node, NodeId, Operation, ParamGroupId, Shape, TensorId};
pub use unroll::{unroll, AlstmConfig, ConfigError};
