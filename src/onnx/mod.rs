//! Interchange graph model.
//!
//! An in-memory mirror of the interchange format: a model owns one graph,
//! the graph owns nodes with typed attributes, named initializers, and the
//! declared input/output values. Reading the on-disk protobuf is someone
//! else's job; the types are serde-derived so tools can hand them over as
//! JSON.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

// ─── Element types ────────────────────────────────────────────────

/// Element type of a value or initializer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElemType {
    #[default]
    Float,
    Uint8,
    Int8,
    Int16,
    Int32,
    Int64,
}

// ─── Attributes ───────────────────────────────────────────────────

/// A typed node attribute.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Attribute {
    Float(f32),
    Int(i64),
    String(String),
    Floats(Vec<f32>),
    Ints(Vec<i64>),
}

// ─── Values and initializers ──────────────────────────────────────

/// A declared graph value: name, element type, and static shape.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ValueInfo {
    pub name: String,
    #[serde(default)]
    pub elem_type: ElemType,
    #[serde(default)]
    pub shape: Vec<usize>,
}

impl ValueInfo {
    pub fn new(name: impl Into<String>, elem_type: ElemType, shape: Vec<usize>) -> Self {
        Self {
            name: name.into(),
            elem_type,
            shape,
        }
    }
}

/// Raw initializer payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitData {
    Float(Vec<f32>),
    Int64(Vec<i64>),
}

impl InitData {
    pub fn len(&self) -> usize {
        match self {
            InitData::Float(v) => v.len(),
            InitData::Int64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A constant tensor baked into the graph (weights, biases, shapes).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Initializer {
    pub name: String,
    #[serde(default)]
    pub elem_type: ElemType,
    pub dims: Vec<usize>,
    pub data: InitData,
}

impl Initializer {
    pub fn float(name: impl Into<String>, dims: Vec<usize>, data: Vec<f32>) -> Self {
        Self {
            name: name.into(),
            elem_type: ElemType::Float,
            dims,
            data: InitData::Float(data),
        }
    }

    pub fn int64(name: impl Into<String>, dims: Vec<usize>, data: Vec<i64>) -> Self {
        Self {
            name: name.into(),
            elem_type: ElemType::Int64,
            dims,
            data: InitData::Int64(data),
        }
    }
}

// ─── Nodes ────────────────────────────────────────────────────────

/// One operator application in the interchange graph.
///
/// An empty string in `inputs` marks an omitted optional input.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Node {
    #[serde(default)]
    pub name: String,
    pub op_type: String,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, Attribute>,
}

impl Node {
    pub fn new(op_type: impl Into<String>) -> Self {
        Self {
            name: String::new(),
            op_type: op_type.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn input(mut self, name: impl Into<String>) -> Self {
        self.inputs.push(name.into());
        self
    }

    pub fn output(mut self, name: impl Into<String>) -> Self {
        self.outputs.push(name.into());
        self
    }

    pub fn attr(mut self, key: impl Into<String>, value: Attribute) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    /// Human-readable identity used in diagnostics: the node name, or
    /// the first output when the node is anonymous.
    pub fn label(&self) -> String {
        if !self.name.is_empty() {
            return self.name.clone();
        }
        match self.outputs.first() {
            Some(out) if !out.is_empty() => out.clone(),
            _ => format!("<{}>", self.op_type),
        }
    }

    /// Inputs that are actually wired (omitted optional inputs dropped
    /// from the tail).
    pub fn present_inputs(&self) -> &[String] {
        let mut end = self.inputs.len();
        while end > 0 && self.inputs[end - 1].is_empty() {
            end -= 1;
        }
        &self.inputs[..end]
    }

    pub fn has_attr(&self, key: &str) -> bool {
        self.attributes.contains_key(key)
    }

    pub fn attr_i(&self, key: &str) -> Option<i64> {
        match self.attributes.get(key) {
            Some(Attribute::Int(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn attr_f(&self, key: &str) -> Option<f32> {
        match self.attributes.get(key) {
            Some(Attribute::Float(v)) => Some(*v),
            Some(Attribute::Int(v)) => Some(*v as f32),
            _ => None,
        }
    }

    pub fn attr_s(&self, key: &str) -> Option<&str> {
        match self.attributes.get(key) {
            Some(Attribute::String(v)) => Some(v.as_str()),
            _ => None,
        }
    }

    pub fn attr_ints(&self, key: &str) -> Option<&[i64]> {
        match self.attributes.get(key) {
            Some(Attribute::Ints(v)) => Some(v.as_slice()),
            _ => None,
        }
    }

    pub fn attr_floats(&self, key: &str) -> Option<&[f32]> {
        match self.attributes.get(key) {
            Some(Attribute::Floats(v)) => Some(v.as_slice()),
            _ => None,
        }
    }
}

// ─── Graph and model ──────────────────────────────────────────────

/// A computation graph in the interchange format.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    #[serde(default)]
    pub name: String,
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub initializers: Vec<Initializer>,
    pub inputs: Vec<ValueInfo>,
    pub outputs: Vec<ValueInfo>,
    #[serde(default)]
    pub value_info: Vec<ValueInfo>,
}

impl Graph {
    pub fn initializer(&self, name: &str) -> Option<&Initializer> {
        self.initializers.iter().find(|i| i.name == name)
    }
}

/// Top-level model container.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Model {
    #[serde(default)]
    pub producer_name: String,
    #[serde(default)]
    pub opset_version: i64,
    pub graph: Graph,
}

impl Model {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_builder_and_accessors() {
        let node = Node::new("Conv")
            .input("x")
            .input("w")
            .input("")
            .output("y")
            .attr("kernel_shape", Attribute::Ints(vec![3, 3]))
            .attr("group", Attribute::Int(1))
            .attr("alpha", Attribute::Float(0.5));
        assert_eq!(node.present_inputs(), &["x".to_string(), "w".to_string()]);
        assert_eq!(node.attr_ints("kernel_shape"), Some(&[3i64, 3][..]));
        assert_eq!(node.attr_i("group"), Some(1));
        assert_eq!(node.attr_f("alpha"), Some(0.5));
        assert_eq!(node.attr_f("group"), Some(1.0));
        assert!(node.attr_s("auto_pad").is_none());
        assert_eq!(node.label(), "y");
    }

    #[test]
    fn test_model_json_shape() {
        let text = r#"{
            "graph": {
                "nodes": [
                    {"op_type": "Relu", "inputs": ["x"], "outputs": ["y"]}
                ],
                "inputs": [{"name": "x", "shape": [1, 4]}],
                "outputs": [{"name": "y"}]
            }
        }"#;
        let model = Model::from_json(text).unwrap();
        assert_eq!(model.graph.nodes.len(), 1);
        assert_eq!(model.graph.inputs[0].elem_type, ElemType::Float);
        assert_eq!(model.graph.inputs[0].shape, vec![1, 4]);
        assert!(model.graph.outputs[0].shape.is_empty());
    }

    #[test]
    fn test_attribute_json_encoding() {
        let node = Node::new("MaxPool").attr("strides", Attribute::Ints(vec![2, 2]));
        let json = serde_json::to_string(&node).unwrap();
        assert!(json.contains(r#""strides":{"ints":[2,2]}"#));
    }
}
