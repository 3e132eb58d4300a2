use std::collections::{HashMap, HashSet};

use alstm_rs::spec::Operation;
use alstm_rs::{unroll, AlstmConfig, ConfigError, Graph};

/// T=3, N=2, H=4, S=6, no static input.
fn scenario_a() -> AlstmConfig {
    AlstmConfig {
        num_output: 4,
        timesteps: 3,
        batch_size: 2,
        feature_shape: vec![8, 6, 6],
        attn_side: 6,
        ..AlstmConfig::default()
    }
}

fn kind_count(graph: &Graph, kind: &str) -> usize {
    graph
        .nodes()
        .iter()
        .filter(|node| node.op.kind_name() == kind)
        .count()
}

fn node_by_name<'g>(graph: &'g Graph, name: &str) -> &'g alstm_rs::Node {
    graph
        .nodes()
        .iter()
        .find(|node| node.name == name)
        .unwrap_or_else(|| panic!("graph should contain node `{name}`"))
}

fn input_names(graph: &Graph, node: &alstm_rs::Node) -> Vec<String> {
    node.inputs
        .iter()
        .map(|&id| graph.tensor(id).name.clone())
        .collect()
}

#[test]
fn unrolled_graph_contains_one_stage_set_per_timestep() {
    let graph = unroll(&scenario_a()).expect("scenario A should unroll");
    let timesteps = 3;

    assert_eq!(kind_count(&graph, "Slice"), 2, "one slicer pair");
    assert_eq!(
        kind_count(&graph, "LinearProjection"),
        3 * timesteps,
        "attention, input and recurrent projections per step"
    );
    assert_eq!(kind_count(&graph, "Softmax"), timesteps);
    assert_eq!(kind_count(&graph, "Reshape"), timesteps);
    assert_eq!(kind_count(&graph, "ElementwiseScale"), timesteps);
    assert_eq!(
        kind_count(&graph, "ElementwiseSum"),
        2 * timesteps,
        "continuation gate plus gate summation per step"
    );
    assert_eq!(kind_count(&graph, "RecurrentCellUpdate"), timesteps);
    assert_eq!(kind_count(&graph, "StateSplit"), 1);
    assert_eq!(kind_count(&graph, "Concat"), 2);
}

#[test]
fn node_ids_names_and_tensor_names_are_unique() {
    let graph = unroll(&scenario_a()).expect("scenario A should unroll");

    let ids: HashSet<_> = graph.nodes().iter().map(|node| node.id).collect();
    assert_eq!(ids.len(), graph.nodes().len());

    let names: HashSet<_> = graph.nodes().iter().map(|node| node.name.as_str()).collect();
    assert_eq!(names.len(), graph.nodes().len());

    let tensor_names: HashSet<_> = graph.tensors().iter().map(|t| t.name.as_str()).collect();
    assert_eq!(tensor_names.len(), graph.tensors().len());
}

#[test]
fn recurrent_and_attention_projections_share_one_group_across_steps() {
    let graph = unroll(&scenario_a()).expect("scenario A should unroll");

    let recurrent_groups: HashSet<_> = graph
        .nodes()
        .iter()
        .filter(|node| node.name.starts_with("h_transform_"))
        .flat_map(|node| node.param_groups.iter().copied())
        .collect();
    assert_eq!(
        recurrent_groups.len(),
        1,
        "recurrent weights must be one shared group"
    );

    let attention_groups: HashSet<_> = graph
        .nodes()
        .iter()
        .filter(|node| node.name.starts_with("att_proj_"))
        .map(|node| node.param_groups.clone())
        .collect();
    assert_eq!(
        attention_groups.len(),
        1,
        "every attention projection must carry the identical group pair"
    );
}

#[test]
fn input_projection_weights_are_untied_by_default() {
    let graph = unroll(&scenario_a()).expect("scenario A should unroll");
    let weight_groups: HashSet<_> = graph
        .nodes()
        .iter()
        .filter(|node| node.name.starts_with("x_transform_"))
        .map(|node| node.param_groups[0])
        .collect();
    assert_eq!(weight_groups.len(), 3, "one weight group per timestep");
}

#[test]
fn input_projection_weights_can_be_tied() {
    let cfg = AlstmConfig {
        tie_input_weights: true,
        ..scenario_a()
    };
    let graph = unroll(&cfg).expect("tied configuration should unroll");
    let groups: HashSet<_> = graph
        .nodes()
        .iter()
        .filter(|node| node.name.starts_with("x_transform_"))
        .map(|node| node.param_groups.clone())
        .collect();
    assert_eq!(groups.len(), 1, "tied input weights collapse to one pair");
}

#[test]
fn state_bindings_name_initial_and_final_state() {
    let graph = unroll(&scenario_a()).expect("scenario A should unroll");

    let state_in: Vec<_> = graph
        .state_inputs()
        .iter()
        .map(|&id| graph.tensor(id).name.as_str())
        .collect();
    assert_eq!(state_in, ["h_0", "c_0"]);
    for &id in graph.state_inputs() {
        assert_eq!(graph.tensor(id).shape.dims(), [1, 2, 4]);
    }

    let state_out: Vec<_> = graph
        .state_outputs()
        .iter()
        .map(|&id| graph.tensor(id).name.as_str())
        .collect();
    assert_eq!(state_out, ["h_3", "c_T"]);
}

#[test]
fn collector_covers_every_timestep_with_one_name_per_output() {
    let graph = unroll(&scenario_a()).expect("scenario A should unroll");

    let h_concat = node_by_name(&graph, "h_concat");
    assert_eq!(h_concat.inputs.len(), 3);
    assert_eq!(input_names(&graph, h_concat), ["h_1", "h_2", "h_3"]);

    let outputs: Vec<_> = graph
        .outputs()
        .iter()
        .map(|&id| graph.tensor(id).name.as_str())
        .collect();
    assert_eq!(outputs, ["h", "mask"]);
    let h_out = graph.tensor_by_name("h").expect("h output declared");
    assert_eq!(graph.tensor(h_out).shape.dims(), [3, 2, 4]);
}

#[test]
fn masks_can_be_left_uncollected() {
    let cfg = AlstmConfig {
        collect_masks: false,
        ..scenario_a()
    };
    let graph = unroll(&cfg).expect("mask-less configuration should unroll");
    let outputs: Vec<_> = graph
        .outputs()
        .iter()
        .map(|&id| graph.tensor(id).name.as_str())
        .collect();
    assert_eq!(outputs, ["h"]);
    assert!(
        !graph.nodes().iter().any(|node| node.name == "mask_concat"),
        "no mask collector when masks are not requested"
    );
}

#[test]
fn cell_update_consumes_previous_step_state_only() {
    let graph = unroll(&scenario_a()).expect("scenario A should unroll");

    for t in 1..=3usize {
        let cell = node_by_name(&graph, &format!("cell_{t}"));
        assert_eq!(
            input_names(&graph, cell),
            [
                format!("c_{}", t - 1),
                format!("gate_input_{t}"),
                format!("cont_{t}")
            ],
            "cell update operand order is (c_prev, gate_input, cont)"
        );
        let c_prev = cell.inputs[0];
        match graph.producer(c_prev) {
            None => assert_eq!(t, 1, "only c_0 is producer-less"),
            Some(producer) => {
                assert_eq!(graph.node(producer).name, format!("cell_{}", t - 1));
            }
        }
    }

    // Arena ordering makes causality global: every operand of every node is
    // either an input binding or produced by an earlier node.
    for node in graph.nodes() {
        for &input in &node.inputs {
            if let Some(producer) = graph.producer(input) {
                assert!(producer < node.id, "node {} consumes a later value", node.name);
            }
        }
    }
}

#[test]
fn cell_state_chain_is_single_threaded() {
    let graph = unroll(&scenario_a()).expect("scenario A should unroll");

    let mut consumers: HashMap<&str, Vec<&str>> = HashMap::new();
    for node in graph.nodes() {
        for &input in &node.inputs {
            consumers
                .entry(graph.tensor(input).name.as_str())
                .or_default()
                .push(node.name.as_str());
        }
    }

    assert_eq!(consumers["c_0"], ["cell_1"]);
    assert_eq!(consumers["c_1"], ["cell_2"]);
    assert_eq!(consumers["c_2"], ["cell_3"]);
    assert_eq!(
        consumers["c_3"],
        ["c_export"],
        "the final cell state leaves the loop only through the export copy"
    );
}

#[test]
fn continuation_gate_is_a_coefficient_weighted_sum() {
    let graph = unroll(&scenario_a()).expect("scenario A should unroll");
    let gate = node_by_name(&graph, "h_gated_0");
    match &gate.op {
        Operation::ElementwiseSum(spec) => {
            assert!(spec.coeff_operand, "cont_t supplies the sum coefficients")
        }
        other => panic!("continuation gate should be an elementwise sum, got {other:?}"),
    }
    assert_eq!(input_names(&graph, gate), ["h_0", "cont_1"]);
}

#[test]
fn attention_mask_lags_the_input_by_one_step() {
    let graph = unroll(&scenario_a()).expect("scenario A should unroll");
    for t in 1..=3usize {
        let apply = node_by_name(&graph, &format!("mask_apply_{t}"));
        assert_eq!(
            input_names(&graph, apply),
            [format!("x_{t}"), format!("mask_grid_{}", t - 1)],
            "step-t features are gated by the mask derived from h_{}",
            t - 1
        );
    }
}

#[test]
fn identical_configurations_unroll_identically() {
    let cfg = scenario_a();
    let first = unroll(&cfg).expect("first unroll");
    let second = unroll(&cfg).expect("second unroll");
    assert_eq!(first, second);
}

#[test]
fn zero_num_output_is_rejected_before_any_node_is_created() {
    let cfg = AlstmConfig {
        num_output: 0,
        ..scenario_a()
    };
    let err = unroll(&cfg).expect_err("num_output = 0 must be rejected");
    assert_eq!(
        err.downcast_ref::<ConfigError>(),
        Some(&ConfigError::NonPositiveNumOutput)
    );
}

#[test]
fn zero_timesteps_is_rejected() {
    let cfg = AlstmConfig {
        timesteps: 0,
        ..scenario_a()
    };
    let err = unroll(&cfg).expect_err("timesteps = 0 must be rejected");
    assert_eq!(
        err.downcast_ref::<ConfigError>(),
        Some(&ConfigError::NonPositiveTimesteps)
    );
}

#[test]
fn feature_grid_must_match_the_attention_side() {
    let cfg = AlstmConfig {
        feature_shape: vec![8, 5, 5],
        ..scenario_a()
    };
    let err = unroll(&cfg).expect_err("a 5x5 grid cannot host a 6x6 mask");
    assert_eq!(
        err.downcast_ref::<ConfigError>(),
        Some(&ConfigError::FeatureGridMismatch {
            shape: vec![8, 5, 5],
            side: 6
        })
    );
}

#[test]
fn static_input_adds_projection_chain_and_gate_operand() {
    let cfg = AlstmConfig {
        static_shape: Some(vec![16]),
        ..scenario_a()
    };
    let graph = unroll(&cfg).expect("static configuration should unroll");

    let transform = node_by_name(&graph, "x_static_transform");
    assert_eq!(input_names(&graph, transform), ["x_static"]);
    node_by_name(&graph, "x_static_reshape");

    let external: Vec<_> = graph
        .inputs()
        .iter()
        .map(|&id| graph.tensor(id).name.as_str())
        .collect();
    assert_eq!(external, ["x", "cont", "x_static"]);

    for t in 1..=3usize {
        let gate = node_by_name(&graph, &format!("gate_input_{t}"));
        assert_eq!(
            input_names(&graph, gate),
            [
                format!("h_proj_{}", t - 1),
                format!("x_proj_{t}"),
                "x_static_proj".to_string()
            ],
            "the broadcast static term joins every step's gate sum"
        );
    }
}

#[test]
fn gate_sum_has_two_operands_without_static_input() {
    let graph = unroll(&scenario_a()).expect("scenario A should unroll");
    for t in 1..=3usize {
        let gate = node_by_name(&graph, &format!("gate_input_{t}"));
        assert_eq!(
            input_names(&graph, gate),
            [format!("h_proj_{}", t - 1), format!("x_proj_{t}")]
        );
    }
}
