use super::*;
use crate::onnx::{Attribute, ElemType, Graph, Initializer};

fn input(name: &str, shape: Vec<usize>) -> ValueInfo {
    ValueInfo::new(name, ElemType::Float, shape)
}

fn graph(nodes: Vec<Node>, inputs: Vec<ValueInfo>, outputs: &[&str]) -> Graph {
    Graph {
        name: "test".into(),
        nodes,
        initializers: Vec::new(),
        inputs,
        outputs: outputs
            .iter()
            .map(|o| ValueInfo::new(*o, ElemType::Float, Vec::new()))
            .collect(),
        value_info: Vec::new(),
    }
}

fn conv_graph() -> Graph {
    let mut g = graph(
        vec![
            Node::new("Conv")
                .named("conv1")
                .input("x")
                .input("w")
                .input("b")
                .output("c")
                .attr("pads", Attribute::Ints(vec![1, 1, 1, 1])),
            Node::new("Relu").input("c").output("r"),
        ],
        vec![input("x", vec![1, 1, 4, 4])],
        &["r"],
    );
    g.initializers = vec![
        Initializer::float("w", vec![2, 1, 3, 3], vec![0.1; 18]),
        Initializer::float("b", vec![2], vec![0.0; 2]),
    ];
    g
}

#[test]
fn test_node_kind_round_trips_names() {
    assert_eq!(NodeKind::parse("LRN"), Some(NodeKind::Lrn));
    assert_eq!(NodeKind::Lrn.as_str(), "LRN");
    assert_eq!(NodeKind::parse("Gather"), None);
}

#[test]
fn test_standard_registry_claims_conv() {
    let registry = LowerRegistry::standard();
    let node = Node::new("Conv").input("x").input("w").output("y");
    let lower = registry.find(&node).unwrap();
    assert_eq!(lower.kind(), NodeKind::Conv);
    assert!(registry.supports(NodeKind::ReduceProd));
    assert!(registry.find(&Node::new("Gather")).is_none());
}

#[test]
fn test_conv_with_3d_kernel_is_not_mine() {
    let registry = LowerRegistry::standard();
    let node = Node::new("Conv")
        .input("x")
        .input("w")
        .output("y")
        .attr("kernel_shape", Attribute::Ints(vec![3, 3, 3]));
    assert!(registry.find(&node).is_none());
}

#[test]
fn test_lower_conv_relu_chain() {
    let lowered = lower_graph(
        &conv_graph(),
        &LowerRegistry::standard(),
        UnsupportedPolicy::Abort,
    )
    .unwrap();
    let g = &lowered.graph;
    assert!(lowered.diagnostics.is_empty());
    assert_eq!(g.ops().len(), 2);
    match &g.ops()[0].kind {
        OpKind::Conv(attrs) => {
            assert_eq!(attrs.kernel, [3, 3]);
            assert_eq!(attrs.pads, [1, 1, 1, 1]);
            assert_eq!(attrs.group, 1);
        }
        other => panic!("expected Conv, got {}", other),
    }
    assert_eq!(g.ops()[1].kind, OpKind::Relu);
    assert_eq!(g.layer_name(OpId(0)), "c");
    assert_eq!(g.ops()[1].inputs, g.ops()[0].outputs);
    let w = g.find("w").unwrap();
    assert_eq!(g.tensor(w).kind, TensorKind::Initializer);
    assert_eq!(g.data_input().unwrap(), g.find("x").unwrap());
    assert_eq!(g.outputs(), &[g.find("r").unwrap()]);
}

#[test]
fn test_nodes_are_lowered_in_dependency_order() {
    let g = graph(
        vec![
            Node::new("Relu").input("a").output("b"),
            Node::new("Relu").input("x").output("a"),
        ],
        vec![input("x", vec![1, 4])],
        &["b"],
    );
    let lowered = lower_graph(&g, &LowerRegistry::standard(), UnsupportedPolicy::Abort).unwrap();
    assert_eq!(lowered.graph.layer_name(OpId(0)), "a");
    assert_eq!(lowered.graph.layer_name(OpId(1)), "b");
}

#[test]
fn test_cycle_is_fatal() {
    let g = graph(
        vec![
            Node::new("Relu").named("p").input("q_out").output("p_out"),
            Node::new("Relu").named("q").input("p_out").output("q_out"),
        ],
        vec![input("x", vec![1])],
        &[],
    );
    let err = lower_graph(&g, &LowerRegistry::standard(), UnsupportedPolicy::Abort).unwrap_err();
    assert!(matches!(err, LowerError::Cycle { .. }));
}

#[test]
fn test_unsupported_node_aborts_by_default() {
    let g = graph(
        vec![Node::new("Gather").named("g").input("x").output("y")],
        vec![input("x", vec![4])],
        &["y"],
    );
    let err = lower_graph(&g, &LowerRegistry::standard(), UnsupportedPolicy::default())
        .unwrap_err();
    assert_eq!(
        err,
        LowerError::Unsupported {
            node: "g".into(),
            op_type: "Gather".into()
        }
    );
}

#[test]
fn test_unsupported_node_skipped_with_warning() {
    let g = graph(
        vec![
            Node::new("Relu").input("x").output("y"),
            Node::new("Gather").named("g").input("y").output("z"),
        ],
        vec![input("x", vec![4])],
        &["y"],
    );
    let lowered = lower_graph(&g, &LowerRegistry::standard(), UnsupportedPolicy::Skip).unwrap();
    assert_eq!(lowered.graph.ops().len(), 1);
    assert_eq!(lowered.diagnostics.len(), 1);
    assert_eq!(lowered.diagnostics[0].subject.as_deref(), Some("g"));
}

#[test]
fn test_wrong_arity_skips_node() {
    let g = graph(
        vec![
            Node::new("Relu").input("x").output("y"),
            Node::new("Relu").named("bad").input("x").input("y").output("z"),
        ],
        vec![input("x", vec![4])],
        &["y"],
    );
    let lowered = lower_graph(&g, &LowerRegistry::standard(), UnsupportedPolicy::Abort).unwrap();
    assert_eq!(lowered.graph.ops().len(), 1);
    assert!(lowered.graph.find("z").is_none());
    let diag = &lowered.diagnostics[0];
    assert_eq!(diag.subject.as_deref(), Some("bad"));
    assert!(diag.message.contains("expected 1 inputs, found 2"));
}

#[test]
fn test_missing_required_attribute_skips_node() {
    let g = graph(
        vec![
            Node::new("Relu").input("x").output("y"),
            Node::new("MaxPool").named("pool").input("y").output("p"),
        ],
        vec![input("x", vec![1, 1, 4, 4])],
        &["y"],
    );
    let lowered = lower_graph(&g, &LowerRegistry::standard(), UnsupportedPolicy::Abort).unwrap();
    assert_eq!(lowered.graph.ops().len(), 1);
    assert!(lowered.diagnostics[0]
        .message
        .contains("missing required attribute 'kernel_shape'"));
}

#[test]
fn test_activation_failure_leaves_graph_untouched() {
    let registry = LowerRegistry::standard();
    let node = Node::new("Concat").input("x").output("y");
    let hints = HashMap::new();
    let mut graph = ComputeGraph::new("g");
    let mut builder = IrBuilder::new(&mut graph, &hints);
    let err = registry
        .find(&node)
        .unwrap()
        .activate(&mut builder, &node)
        .unwrap_err();
    assert!(err.is_validation());
    assert!(graph.tensors().is_empty());
    assert!(graph.ops().is_empty());
}

#[test]
fn test_conv_kernel_inferred_from_weight() {
    let mut g = conv_graph();
    g.nodes[0].attributes.remove("pads");
    g.nodes[0] = g.nodes[0]
        .clone()
        .attr("auto_pad", Attribute::String("SAME_UPPER".into()));
    let lowered = lower_graph(&g, &LowerRegistry::standard(), UnsupportedPolicy::Abort).unwrap();
    match &lowered.graph.ops()[0].kind {
        OpKind::Conv(attrs) => {
            assert_eq!(attrs.kernel, [3, 3]);
            assert_eq!(attrs.pads, [1, 1, 1, 1]);
        }
        other => panic!("expected Conv, got {}", other),
    }
}

#[test]
fn test_conv_with_empty_weight_kernel_skips_node() {
    let mut g = conv_graph();
    g.initializers[0] = Initializer::float("w", vec![2, 1, 0, 3], Vec::new());
    g.nodes[0].attributes.remove("pads");
    g.nodes[0] = g.nodes[0]
        .clone()
        .attr("auto_pad", Attribute::String("SAME_UPPER".into()));
    g.outputs = vec![ValueInfo::new("c", ElemType::Float, Vec::new())];
    g.nodes.truncate(1);
    let lowered = lower_graph(&g, &LowerRegistry::standard(), UnsupportedPolicy::Abort).unwrap();
    assert!(lowered
        .graph
        .ops()
        .iter()
        .all(|op| !matches!(op.kind, OpKind::Conv(_))));
    let diag = &lowered.diagnostics[0];
    assert_eq!(diag.subject.as_deref(), Some("conv1"));
    assert!(diag.message.contains("kernel_shape"));
}

#[test]
fn test_skipped_node_leaves_consumer_unproduced() {
    let g = graph(
        vec![
            Node::new("Gather").named("g").input("x").output("y"),
            Node::new("Relu").input("y").output("z"),
        ],
        vec![input("x", vec![4])],
        &["z"],
    );
    let err = lower_graph(&g, &LowerRegistry::standard(), UnsupportedPolicy::Skip).unwrap_err();
    assert!(matches!(err, LowerError::Graph(GraphError::Unproduced { .. })));
}

#[test]
fn test_reshape_reads_constant_shape_input() {
    let mut g = graph(
        vec![Node::new("Reshape").input("x").input("shape").output("y")],
        vec![input("x", vec![1, 2, 2])],
        &["y"],
    );
    g.initializers
        .push(Initializer::int64("shape", vec![2], vec![1, 4]));
    let lowered = lower_graph(&g, &LowerRegistry::standard(), UnsupportedPolicy::Abort).unwrap();
    assert_eq!(
        lowered.graph.ops()[0].kind,
        OpKind::Reshape { shape: vec![1, 4] }
    );
}

struct ClipLower;

impl Lower for ClipLower {
    fn kind(&self) -> NodeKind {
        NodeKind::Relu
    }

    fn is_me(&self, node: &Node) -> Match {
        if node.name == "clipped" {
            Match::Standard
        } else {
            Match::NotMine
        }
    }

    fn activate(&self, builder: &mut IrBuilder<'_>, node: &Node) -> Result<OpId, LowerError> {
        Ok(builder.operator(OpKind::Dropout { ratio: 0.0 }, &node.inputs, &node.outputs))
    }
}

#[test]
fn test_registered_first_matcher_wins() {
    let mut registry = LowerRegistry::standard();
    registry.register_first(Box::new(ClipLower));
    let g = graph(
        vec![
            Node::new("Relu").named("clipped").input("x").output("a"),
            Node::new("Relu").named("plain").input("a").output("b"),
        ],
        vec![input("x", vec![4])],
        &["b"],
    );
    let lowered = lower_graph(&g, &registry, UnsupportedPolicy::Abort).unwrap();
    assert_eq!(lowered.graph.ops()[0].kind, OpKind::Dropout { ratio: 0.0 });
    assert_eq!(lowered.graph.ops()[1].kind, OpKind::Relu);
}
