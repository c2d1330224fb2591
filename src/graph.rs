//! Mutable graph IR the surgeon edits.
//!
//! Nodes refer to tensors by name. Every non-empty name a node mentions has
//! an entry in [`Graph::tensors`]; the empty name is ONNX's marker for an
//! omitted optional input and is never stored.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use crate::{
    error::{Error, Result},
    onnx::{
        self, tensor_shape_proto::dimension, type_proto, AttributeProto, AttributeType, DataType,
        ModelProto, TensorProto,
    },
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

#[derive(Clone, Debug, PartialEq)]
pub enum AttrValue {
    Int(i64),
    Float(f32),
    Bool(bool),
    String(String),
    Ints(Vec<i64>),
    Floats(Vec<f32>),
    Strings(Vec<String>),
    Tensor(TensorProto),
    /// Attribute kinds the surgeon never edits, kept as read.
    Raw(AttributeProto),
}

impl AttrValue {
    fn from_proto(attr: AttributeProto) -> Self {
        match AttributeType::from_i32(attr.r#type) {
            Some(AttributeType::Int) => Self::Int(attr.i),
            Some(AttributeType::Float) => Self::Float(attr.f),
            Some(AttributeType::Ints) => Self::Ints(attr.ints),
            Some(AttributeType::Floats) => Self::Floats(attr.floats),
            Some(AttributeType::String) => match String::from_utf8(attr.s.clone()) {
                Ok(s) => Self::String(s),
                Err(_) => Self::Raw(attr),
            },
            Some(AttributeType::Strings) => {
                match attr
                    .strings
                    .iter()
                    .map(|s| String::from_utf8(s.clone()))
                    .collect::<Result<Vec<_>, _>>()
                {
                    Ok(strings) => Self::Strings(strings),
                    Err(_) => Self::Raw(attr),
                }
            }
            Some(AttributeType::Tensor) => match attr.t.clone() {
                Some(t) => Self::Tensor(t),
                None => Self::Raw(attr),
            },
            _ => Self::Raw(attr),
        }
    }

    fn to_proto(&self, name: &str) -> AttributeProto {
        let mut attr = AttributeProto {
            name: name.to_string(),
            ..Default::default()
        };
        let ty = match self {
            Self::Int(i) => {
                attr.i = *i;
                AttributeType::Int
            }
            Self::Bool(b) => {
                attr.i = *b as i64;
                AttributeType::Int
            }
            Self::Float(f) => {
                attr.f = *f;
                AttributeType::Float
            }
            Self::String(s) => {
                attr.s = s.as_bytes().to_vec();
                AttributeType::String
            }
            Self::Ints(v) => {
                attr.ints = v.clone();
                AttributeType::Ints
            }
            Self::Floats(v) => {
                attr.floats = v.clone();
                AttributeType::Floats
            }
            Self::Strings(v) => {
                attr.strings = v.iter().map(|s| s.as_bytes().to_vec()).collect();
                AttributeType::Strings
            }
            Self::Tensor(t) => {
                attr.t = Some(t.clone());
                AttributeType::Tensor
            }
            Self::Raw(raw) => {
                return AttributeProto {
                    name: name.to_string(),
                    ..raw.clone()
                }
            }
        };
        attr.r#type = ty as i32;
        attr
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Node {
    id: NodeId,
    pub name: String,
    pub op_type: String,
    pub domain: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub attrs: BTreeMap<String, AttrValue>,
    pub doc_string: String,
    pub overload: String,
    pub metadata_props: Vec<onnx::StringStringEntryProto>,
}

impl Node {
    pub fn new(
        op_type: impl Into<String>,
        name: impl Into<String>,
        inputs: Vec<String>,
        outputs: Vec<String>,
    ) -> Self {
        Self {
            id: NodeId(0),
            name: name.into(),
            op_type: op_type.into(),
            domain: String::new(),
            inputs,
            outputs,
            attrs: BTreeMap::new(),
            doc_string: String::new(),
            overload: String::new(),
            metadata_props: Vec::new(),
        }
    }

    pub fn with_attr(mut self, name: impl Into<String>, value: AttrValue) -> Self {
        self.attrs.insert(name.into(), value);
        self
    }

    pub fn id(&self) -> NodeId {
        self.id
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Dim {
    Static(i64),
    Param(String),
    Unknown,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Variable {
    pub elem_type: Option<DataType>,
    pub shape: Option<Vec<Dim>>,
    /// The value_info this variable was read from, if any.
    declared: Option<onnx::ValueInfoProto>,
}

impl Variable {
    pub fn new(elem_type: DataType, shape: Vec<Dim>) -> Self {
        Self {
            elem_type: Some(elem_type),
            shape: Some(shape),
            declared: None,
        }
    }

    fn from_value_info(info: &onnx::ValueInfoProto) -> Self {
        let Some(type_proto::Value::TensorType(t)) =
            info.r#type.as_ref().and_then(|t| t.value.as_ref())
        else {
            return Self {
                declared: Some(info.clone()),
                ..Self::default()
            };
        };
        Self {
            declared: Some(info.clone()),
            elem_type: DataType::from_i32(t.elem_type).filter(|d| *d != DataType::Undefined),
            shape: t.shape.as_ref().map(|s| {
                s.dim
                    .iter()
                    .map(|d| match &d.value {
                        Some(dimension::Value::DimValue(v)) => Dim::Static(*v),
                        Some(dimension::Value::DimParam(p)) => Dim::Param(p.clone()),
                        None => Dim::Unknown,
                    })
                    .collect()
            }),
        }
    }

    /// Writes the variable back, keeping whatever of its declared value_info
    /// the graph IR does not model (docs, metadata, non-tensor types,
    /// dimension denotations).
    fn to_value_info(&self, name: &str) -> onnx::ValueInfoProto {
        let mut info = self.declared.clone().unwrap_or_default();
        info.name = name.to_string();
        let declared_type = info.r#type.take().unwrap_or_default();
        let foreign = matches!(
            &declared_type.value,
            Some(v) if !matches!(v, type_proto::Value::TensorType(_))
        );
        if foreign {
            info.r#type = Some(declared_type);
            return info;
        }
        let declared_dims = match &declared_type.value {
            Some(type_proto::Value::TensorType(t)) => {
                t.shape.as_ref().map_or(&[][..], |s| s.dim.as_slice())
            }
            _ => &[],
        };

        let tensor = type_proto::Tensor {
            elem_type: self.elem_type.map_or(0, |d| d as i32),
            shape: self.shape.as_ref().map(|dims| onnx::TensorShapeProto {
                dim: dims
                    .iter()
                    .enumerate()
                    .map(|(i, d)| onnx::tensor_shape_proto::Dimension {
                        denotation: declared_dims
                            .get(i)
                            .map(|d| d.denotation.clone())
                            .unwrap_or_default(),
                        value: match d {
                            Dim::Static(v) => Some(dimension::Value::DimValue(*v)),
                            Dim::Param(p) => Some(dimension::Value::DimParam(p.clone())),
                            Dim::Unknown => None,
                        },
                    })
                    .collect(),
            }),
        };
        info.r#type = Some(onnx::TypeProto {
            denotation: declared_type.denotation,
            value: Some(type_proto::Value::TensorType(tensor)),
        });
        info
    }

    fn is_known(&self) -> bool {
        self.elem_type.is_some() || self.shape.is_some() || self.declared.is_some()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Tensor {
    Constant(TensorProto),
    Variable(Variable),
}

impl Tensor {
    pub fn shape(&self) -> Option<Vec<Dim>> {
        match self {
            Self::Constant(t) => Some(t.dims.iter().map(|d| Dim::Static(*d)).collect()),
            Self::Variable(v) => v.shape.clone(),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct Graph {
    pub name: String,
    pub doc_string: String,
    pub nodes: Vec<Node>,
    pub tensors: BTreeMap<String, Tensor>,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    /// Model-level fields (opsets, producer, metadata, functions, training
    /// info), written back on export.
    envelope: ModelProto,
    /// Graph-level fields the IR does not model (sparse initializers,
    /// quantization annotations, metadata), written back on export.
    graph_extras: onnx::GraphProto,
    next_id: u64,
}

impl Graph {
    pub fn from_model(mut model: ModelProto) -> Result<Self> {
        let proto = model
            .graph
            .take()
            .ok_or_else(|| Error::ConfigError("ONNX model has no graph".to_string()))?;

        let mut graph = Self {
            name: proto.name,
            doc_string: proto.doc_string,
            envelope: model,
            graph_extras: onnx::GraphProto {
                sparse_initializer: proto.sparse_initializer,
                quantization_annotation: proto.quantization_annotation,
                metadata_props: proto.metadata_props,
                ..Default::default()
            },
            ..Default::default()
        };

        for init in proto.initializer {
            graph
                .tensors
                .insert(init.name.clone(), Tensor::Constant(init));
        }
        for info in proto
            .input
            .iter()
            .chain(&proto.output)
            .chain(&proto.value_info)
        {
            graph
                .tensors
                .entry(info.name.clone())
                .or_insert_with(|| Tensor::Variable(Variable::from_value_info(info)));
        }

        // Older exporters list initializers as graph inputs too.
        graph.inputs = proto
            .input
            .iter()
            .filter(|i| !matches!(graph.tensors.get(&i.name), Some(Tensor::Constant(_))))
            .map(|i| i.name.clone())
            .collect();
        graph.outputs = proto.output.iter().map(|o| o.name.clone()).collect();

        for n in proto.node {
            let mut node = Node::new(n.op_type, n.name, n.input, n.output);
            node.domain = n.domain;
            node.doc_string = n.doc_string;
            node.overload = n.overload;
            node.metadata_props = n.metadata_props;
            node.attrs = n
                .attribute
                .into_iter()
                .map(|a| (a.name.clone(), AttrValue::from_proto(a)))
                .collect();
            graph.push_node(node);
        }

        log::debug!(
            "imported graph {:?}: {} nodes, {} tensors",
            graph.name,
            graph.nodes.len(),
            graph.tensors.len()
        );
        Ok(graph)
    }

    pub fn to_model(&self) -> ModelProto {
        let mut model = self.envelope.clone();

        let referenced: BTreeSet<&str> = self
            .nodes
            .iter()
            .flat_map(|n| n.inputs.iter().chain(&n.outputs))
            .chain(&self.inputs)
            .chain(&self.outputs)
            .map(String::as_str)
            .collect();
        let graph_io: HashSet<&str> = self
            .inputs
            .iter()
            .chain(&self.outputs)
            .map(String::as_str)
            .collect();

        let mut initializer = Vec::new();
        let mut value_info = Vec::new();
        for (name, tensor) in &self.tensors {
            if !referenced.contains(name.as_str()) {
                continue;
            }
            match tensor {
                Tensor::Constant(t) => initializer.push(TensorProto {
                    name: name.clone(),
                    ..t.clone()
                }),
                Tensor::Variable(v) if v.is_known() && !graph_io.contains(name.as_str()) => {
                    value_info.push(v.to_value_info(name))
                }
                Tensor::Variable(_) => {}
            }
        }

        let io_info = |name: &String| match self.tensors.get(name) {
            Some(Tensor::Variable(v)) => v.to_value_info(name),
            _ => Variable::default().to_value_info(name),
        };

        model.graph = Some(onnx::GraphProto {
            node: self
                .nodes
                .iter()
                .map(|n| onnx::NodeProto {
                    input: n.inputs.clone(),
                    output: n.outputs.clone(),
                    name: n.name.clone(),
                    op_type: n.op_type.clone(),
                    domain: n.domain.clone(),
                    overload: n.overload.clone(),
                    attribute: n.attrs.iter().map(|(k, v)| v.to_proto(k)).collect(),
                    doc_string: n.doc_string.clone(),
                    metadata_props: n.metadata_props.clone(),
                })
                .collect(),
            name: self.name.clone(),
            initializer,
            doc_string: self.doc_string.clone(),
            input: self.inputs.iter().map(io_info).collect(),
            output: self.outputs.iter().map(io_info).collect(),
            value_info,
            ..self.graph_extras.clone()
        });
        model
    }

    /// Appends `node`, registering any tensor names it mentions that the
    /// table does not know yet as untyped variables.
    pub fn push_node(&mut self, mut node: Node) -> NodeId {
        self.next_id += 1;
        node.id = NodeId(self.next_id);
        for name in node.inputs.iter().chain(&node.outputs) {
            if !name.is_empty() && !self.tensors.contains_key(name) {
                self.tensors
                    .insert(name.clone(), Tensor::Variable(Variable::default()));
            }
        }
        let id = node.id;
        self.nodes.push(node);
        id
    }

    pub fn node_index(&self, id: NodeId) -> Option<usize> {
        self.nodes.iter().position(|n| n.id == id)
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Index of the node that writes `tensor`.
    pub fn producer(&self, tensor: &str) -> Option<usize> {
        self.nodes
            .iter()
            .position(|n| n.outputs.iter().any(|o| o == tensor))
    }

    pub fn consumers(&self, tensor: &str) -> Vec<usize> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.inputs.iter().any(|i| i == tensor))
            .map(|(i, _)| i)
            .collect()
    }

    /// Integer contents of `tensor`, whether it is an initializer or the
    /// output of a `Constant` node.
    pub fn constant_values(&self, tensor: &str) -> Option<Vec<i64>> {
        match self.tensors.get(tensor)? {
            Tensor::Constant(t) => t.to_i64s(),
            Tensor::Variable(_) => {
                let node = &self.nodes[self.producer(tensor)?];
                if node.op_type != "Constant" {
                    return None;
                }
                match node.attrs.get("value")? {
                    AttrValue::Tensor(t) => t.to_i64s(),
                    AttrValue::Ints(v) => Some(v.clone()),
                    AttrValue::Int(v) => Some(vec![*v]),
                    _ => None,
                }
            }
        }
    }

    pub fn insert_tensor(&mut self, name: impl Into<String>, tensor: Tensor) {
        self.tensors.insert(name.into(), tensor);
    }

    /// Returns `base`, or `base_N` for the first N that is not yet taken.
    pub fn unique_tensor_name(&self, base: &str) -> String {
        if !self.tensors.contains_key(base) {
            return base.to_string();
        }
        (1..)
            .map(|i| format!("{base}_{i}"))
            .find(|n| !self.tensors.contains_key(n))
            .unwrap_or_else(|| base.to_string())
    }

    pub fn input_shape(&self, idx: usize) -> Option<Vec<Dim>> {
        self.tensors.get(self.inputs.get(idx)?)?.shape()
    }

    /// Removes nodes that do not contribute to any graph output, then drops
    /// tensors nothing refers to any more.
    pub fn cleanup(&mut self) {
        let mut live: HashSet<usize> = HashSet::new();
        let mut needed: Vec<&str> = self.outputs.iter().map(String::as_str).collect();
        let mut seen: HashSet<&str> = needed.iter().copied().collect();

        let producers: HashMap<&str, usize> = self
            .nodes
            .iter()
            .enumerate()
            .flat_map(|(i, n)| n.outputs.iter().map(move |o| (o.as_str(), i)))
            .collect();

        while let Some(tensor) = needed.pop() {
            let Some(&idx) = producers.get(tensor) else {
                continue;
            };
            if !live.insert(idx) {
                continue;
            }
            for input in &self.nodes[idx].inputs {
                if !input.is_empty() && seen.insert(input.as_str()) {
                    needed.push(input.as_str());
                }
            }
        }

        let before = self.nodes.len();
        let mut idx = 0;
        self.nodes.retain(|_| {
            let keep = live.contains(&idx);
            idx += 1;
            keep
        });
        if before != self.nodes.len() {
            log::debug!("cleanup removed {} nodes", before - self.nodes.len());
        }
        self.drop_dangling_tensors();
    }

    pub(crate) fn drop_dangling_tensors(&mut self) {
        let referenced: HashSet<String> = self
            .nodes
            .iter()
            .flat_map(|n| n.inputs.iter().chain(&n.outputs))
            .chain(&self.inputs)
            .chain(&self.outputs)
            .cloned()
            .collect();
        self.tensors.retain(|name, _| referenced.contains(name));
    }

    /// Reorders nodes so every producer precedes its consumers, keeping the
    /// current relative order wherever the edges allow it.
    pub fn toposort(&mut self) -> Result<()> {
        let producers: HashMap<&str, usize> = self
            .nodes
            .iter()
            .enumerate()
            .flat_map(|(i, n)| n.outputs.iter().map(move |o| (o.as_str(), i)))
            .collect();

        let mut pending = vec![0usize; self.nodes.len()];
        let mut users: Vec<Vec<usize>> = vec![Vec::new(); self.nodes.len()];
        for (i, node) in self.nodes.iter().enumerate() {
            let deps: BTreeSet<usize> = node
                .inputs
                .iter()
                .filter_map(|t| producers.get(t.as_str()).copied())
                .collect();
            pending[i] = deps.len();
            for d in deps {
                users[d].push(i);
            }
        }

        let mut ready: BTreeSet<usize> = (0..self.nodes.len()).filter(|&i| pending[i] == 0).collect();
        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(i) = ready.pop_first() {
            order.push(i);
            for &u in &users[i] {
                pending[u] -= 1;
                if pending[u] == 0 {
                    ready.insert(u);
                }
            }
        }

        if order.len() != self.nodes.len() {
            let stuck = (0..self.nodes.len())
                .find(|&i| pending[i] > 0)
                .map(|i| self.nodes[i].name.clone())
                .unwrap_or_default();
            return Err(Error::Cycle(stuck));
        }

        let mut slots: Vec<Option<Node>> = std::mem::take(&mut self.nodes)
            .into_iter()
            .map(Some)
            .collect();
        self.nodes = order.into_iter().filter_map(|i| slots[i].take()).collect();
        Ok(())
    }

    /// Verifies that every tensor a node or the graph boundary names exists.
    pub fn check(&self) -> Result<()> {
        for node in &self.nodes {
            for name in node.inputs.iter().chain(&node.outputs) {
                if !name.is_empty() && !self.tensors.contains_key(name) {
                    return Err(Error::DanglingReference {
                        node: node.name.clone(),
                        tensor: name.clone(),
                    });
                }
            }
        }
        for name in self.inputs.iter().chain(&self.outputs) {
            if !self.tensors.contains_key(name) {
                return Err(Error::DanglingReference {
                    node: "<graph>".to_string(),
                    tensor: name.clone(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// `input -> Relu -> Sigmoid -> output`, plus a dead `Neg` branch.
    pub(crate) fn chain_graph() -> Graph {
        let mut g = Graph {
            name: "chain".into(),
            ..Default::default()
        };
        g.insert_tensor(
            "input",
            Tensor::Variable(Variable::new(
                DataType::Float,
                vec![Dim::Static(1), Dim::Static(3), Dim::Static(32), Dim::Static(32)],
            )),
        );
        g.inputs.push("input".into());
        g.push_node(Node::new("Relu", "relu", vec!["input".into()], vec!["a".into()]));
        g.push_node(Node::new("Neg", "dead", vec!["a".into()], vec!["unused".into()]));
        g.push_node(Node::new("Sigmoid", "sig", vec!["a".into()], vec!["output".into()]));
        g.outputs.push("output".into());
        g
    }

    #[test]
    fn cleanup_drops_dead_branch() {
        let mut g = chain_graph();
        g.cleanup();
        let ops: Vec<_> = g.nodes.iter().map(|n| n.op_type.as_str()).collect();
        assert_eq!(ops, ["Relu", "Sigmoid"]);
        assert!(!g.tensors.contains_key("unused"));
        assert!(g.tensors.contains_key("input"));
    }

    #[test]
    fn toposort_moves_producers_first() {
        let mut g = chain_graph();
        g.nodes.reverse();
        g.toposort().unwrap();
        assert_eq!(g.nodes[0].name, "relu");
        let relu = g.producer("a").unwrap();
        assert!(g.consumers("a").iter().all(|&c| c > relu));
    }

    #[test]
    fn toposort_rejects_cycle() {
        let mut g = Graph::default();
        g.push_node(Node::new("Add", "x", vec!["b".into()], vec!["a".into()]));
        g.push_node(Node::new("Add", "y", vec!["a".into()], vec!["b".into()]));
        assert!(matches!(g.toposort(), Err(Error::Cycle(_))));
    }

    #[test]
    fn model_import_export_keeps_structure() {
        let mut g = chain_graph();
        g.insert_tensor(
            "w",
            Tensor::Constant(TensorProto::from_i64s("w", vec![2], vec![1, 2])),
        );
        g.push_node(
            Node::new("Add", "add", vec!["output".into(), "w".into()], vec!["y".into()])
                .with_attr("flag", AttrValue::Bool(true)),
        );
        g.outputs = vec!["y".into()];

        let model = g.to_model();
        let proto = model.graph.as_ref().unwrap();
        assert_eq!(proto.initializer.len(), 1);
        assert_eq!(proto.input[0].name, "input");

        let back = Graph::from_model(model).unwrap();
        assert_eq!(back.nodes.len(), 4);
        assert_eq!(back.inputs, ["input"]);
        assert_eq!(back.outputs, ["y"]);
        assert_eq!(back.constant_values("w"), Some(vec![1, 2]));
        // Booleans go out as INT attributes.
        assert_eq!(back.nodes[3].attrs["flag"], AttrValue::Int(1));
        assert_eq!(
            back.input_shape(0).unwrap(),
            [Dim::Static(1), Dim::Static(3), Dim::Static(32), Dim::Static(32)]
        );
    }

    #[test]
    fn check_reports_missing_tensor() {
        let mut g = chain_graph();
        g.outputs.push("ghost".into());
        assert!(matches!(g.check(), Err(Error::DanglingReference { .. })));
    }
}
