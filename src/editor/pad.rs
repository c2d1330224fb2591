use std::collections::HashSet;

use super::NodeEditor;
use crate::{
    error::{Error, Result},
    graph::{Graph, NodeId, Tensor},
    onnx::TensorProto,
};

/// Collapses the node chain some exporters emit to compute `Pad`'s `pads`
/// input into a single INT64 initializer in ONNX axis order.
pub struct PadFolder;

/// Rearranges per-axis `[before, after]` pairs, innermost axis first, into
/// ONNX's `[x1_begin, .., xr_begin, x1_end, .., xr_end]` for a rank-`rank`
/// input. Axes without a pair get zero padding.
pub fn fold_pads(pairs: &[i64], rank: usize) -> Result<Vec<i64>, String> {
    if pairs.len() % 2 != 0 {
        return Err(format!("odd number of pad values ({})", pairs.len()));
    }
    if pairs.len() / 2 > rank {
        return Err(format!(
            "{} pad pairs for a rank {rank} input",
            pairs.len() / 2
        ));
    }
    let mut out = vec![0; 2 * rank];
    for (k, pair) in pairs.chunks_exact(2).enumerate() {
        out[rank - 1 - k] = pair[0];
        out[2 * rank - 1 - k] = pair[1];
    }
    Ok(out)
}

impl NodeEditor for PadFolder {
    fn name(&self) -> &'static str {
        "Pad"
    }

    fn simplify(&self, graph: &mut Graph, id: NodeId) -> Result<bool> {
        let Some(idx) = graph.node_index(id) else {
            return Ok(false);
        };
        let node = &graph.nodes[idx];
        let node_name = node.name.clone();
        let pads = match node.inputs.get(1) {
            Some(p) if !p.is_empty() => p.clone(),
            _ => {
                log::debug!("{node_name}: pads given as an attribute, nothing to fold");
                return Ok(false);
            }
        };
        if graph.constant_values(&pads).is_some() || graph.producer(&pads).is_none() {
            log::debug!("{node_name}: pads input {pads:?} is already a constant");
            return Ok(false);
        }
        let rank = node
            .inputs
            .first()
            .and_then(|x| graph.tensors.get(x))
            .and_then(Tensor::shape)
            .map_or(4, |s| s.len());

        let unsupported = |reason: String| Error::UnsupportedPattern {
            node: node_name.clone(),
            reason,
        };
        let (chain, values) = trace_pads(graph, &pads).map_err(unsupported)?;
        let ancestors = ancestors_of(graph, &pads);

        let folded_name = graph.unique_tensor_name(&format!(
            "{}_pads",
            if node_name.is_empty() { "pad" } else { &node_name }
        ));
        graph.nodes[idx].inputs[1] = folded_name.clone();

        let dead = dead_nodes(graph, &ancestors);
        if let Some(&shared) = chain.iter().find(|c| !dead.contains(c)) {
            let shared = graph.nodes[shared].name.clone();
            graph.nodes[idx].inputs[1] = pads;
            return Err(unsupported(format!(
                "pads chain node {shared:?} is shared with other nodes"
            )));
        }
        let folded = match fold_pads(&values, rank) {
            Ok(f) => f,
            Err(reason) => {
                graph.nodes[idx].inputs[1] = pads;
                return Err(unsupported(reason));
            }
        };

        log::info!("{node_name}: folded pads {values:?} -> {folded:?}");
        let dims = vec![folded.len() as i64];
        graph.insert_tensor(
            folded_name.clone(),
            Tensor::Constant(TensorProto::from_i64s(folded_name, dims, folded)),
        );

        let dead_ids: HashSet<NodeId> = dead.iter().map(|&i| graph.nodes[i].id()).collect();
        graph.nodes.retain(|n| !dead_ids.contains(&n.id()));
        log::debug!("{node_name}: removed {} pads producer nodes", dead_ids.len());
        graph.drop_dangling_tensors();
        Ok(true)
    }
}

/// Follows the data input (input #0) of each producer back from `pads`
/// until it reaches a `Constant` node or an initializer. Returns the
/// chain's node indices, nearest first, and the integer values found.
fn trace_pads(graph: &Graph, pads: &str) -> Result<(Vec<usize>, Vec<i64>), String> {
    let mut chain = Vec::new();
    let mut tensor = pads.to_string();
    loop {
        let Some(p) = graph.producer(&tensor) else {
            return match graph.constant_values(&tensor) {
                Some(values) => Ok((chain, values)),
                None => Err(format!(
                    "pads chain starts at {tensor:?}, which is not an integer constant"
                )),
            };
        };
        if chain.contains(&p) {
            return Err(format!("pads chain loops through {:?}", graph.nodes[p].name));
        }
        chain.push(p);

        let node = &graph.nodes[p];
        if node.op_type == "Constant" {
            return match graph.constant_values(&tensor) {
                Some(values) => Ok((chain, values)),
                None => Err(format!("{:?} does not hold integers", node.name)),
            };
        }
        match node.inputs.first().filter(|i| !i.is_empty()) {
            Some(data) => tensor = data.clone(),
            None => return Err(format!("{:?} has no data input", node.name)),
        }
    }
}

/// Indices of every node `tensor` transitively depends on.
fn ancestors_of(graph: &Graph, tensor: &str) -> HashSet<usize> {
    let mut found = HashSet::new();
    let mut stack = vec![tensor.to_string()];
    while let Some(t) = stack.pop() {
        let Some(p) = graph.producer(&t) else {
            continue;
        };
        if found.insert(p) {
            stack.extend(graph.nodes[p].inputs.iter().filter(|i| !i.is_empty()).cloned());
        }
    }
    found
}

/// Nodes among `candidates` whose outputs nothing outside the dead set reads.
fn dead_nodes(graph: &Graph, candidates: &HashSet<usize>) -> HashSet<usize> {
    let mut dead = HashSet::new();
    loop {
        let before = dead.len();
        for &c in candidates {
            if dead.contains(&c) {
                continue;
            }
            let unused = graph.nodes[c].outputs.iter().all(|o| {
                !graph.outputs.contains(o)
                    && graph.consumers(o).iter().all(|user| dead.contains(user))
            });
            if unused {
                dead.insert(c);
            }
        }
        if dead.len() == before {
            return dead;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        graph::{AttrValue, Dim, Node, Variable},
        onnx::DataType,
    };

    #[test]
    fn folds_literal_pairs() {
        // [p0b, p0a, p1b, p1a, p2b, p2a, p3b, p3a]
        let pads = [1, 2, 3, 4, 5, 6, 7, 8];
        assert_eq!(fold_pads(&pads, 4).unwrap(), [7, 5, 3, 1, 8, 6, 4, 2]);
    }

    #[test]
    fn short_list_pads_inner_axes() {
        assert_eq!(fold_pads(&[1, 2, 3, 4], 4).unwrap(), [0, 0, 3, 1, 0, 0, 4, 2]);
        assert!(fold_pads(&[1, 2, 3], 4).is_err());
        assert!(fold_pads(&[0; 10], 4).is_err());
    }

    /// `x -> Relu -> Pad -> y`, with pads computed by
    /// `Constant -> Cast -> Reshape(shape) -> Pad`.
    fn exported_pad_graph(pad_list: Vec<i64>) -> Graph {
        let mut g = Graph::default();
        g.insert_tensor(
            "in",
            Tensor::Variable(Variable::new(
                DataType::Float,
                vec![Dim::Static(1), Dim::Static(3), Dim::Static(8), Dim::Static(8)],
            )),
        );
        g.inputs.push("in".into());
        g.insert_tensor(
            "x",
            Tensor::Variable(Variable::new(
                DataType::Float,
                vec![Dim::Static(1), Dim::Static(3), Dim::Static(8), Dim::Static(8)],
            )),
        );
        g.insert_tensor(
            "flat",
            Tensor::Constant(TensorProto::from_i64s("flat", vec![1], vec![-1])),
        );
        let n = pad_list.len() as i64;
        g.push_node(Node::new("Relu", "relu", vec!["in".into()], vec!["x".into()]));
        g.push_node(
            Node::new("Constant", "pad_list", vec![], vec!["p0".into()]).with_attr(
                "value",
                AttrValue::Tensor(TensorProto::from_i64s("", vec![n], pad_list)),
            ),
        );
        g.push_node(Node::new("Cast", "cast", vec!["p0".into()], vec!["p1".into()]));
        g.push_node(Node::new(
            "Reshape",
            "reshape",
            vec!["p1".into(), "flat".into()],
            vec!["p2".into()],
        ));
        g.push_node(
            Node::new("Pad", "pad", vec!["x".into(), "p2".into()], vec!["y".into()])
                .with_attr("mode", AttrValue::String("constant".into())),
        );
        g.outputs.push("y".into());
        g
    }

    #[test]
    fn folds_exported_chain() {
        let mut g = exported_pad_graph(vec![1, 2, 3, 4, 5, 6, 7, 8]);
        let pad = g.nodes[4].id();
        assert!(PadFolder.simplify(&mut g, pad).unwrap());

        let ops: Vec<_> = g.nodes.iter().map(|n| n.op_type.as_str()).collect();
        assert_eq!(ops, ["Relu", "Pad"]);
        let pad = g.node(pad).unwrap();
        assert_eq!(pad.inputs, ["x", "pad_pads"]);
        assert_eq!(g.constant_values("pad_pads").unwrap(), [7, 5, 3, 1, 8, 6, 4, 2]);
        assert!(!g.tensors.contains_key("flat"));
        assert!(!g.tensors.contains_key("p2"));
        g.check().unwrap();
    }

    /// Pads built as `Constant(pairs) -> Reshape(shape) -> Reshape(flat)`,
    /// where the reshape target is itself a `Constant` node placed first.
    #[test]
    fn reshape_target_is_not_mistaken_for_the_pad_list() {
        let mut g = Graph::default();
        g.insert_tensor(
            "x",
            Tensor::Variable(Variable::new(
                DataType::Float,
                vec![Dim::Static(1), Dim::Static(3), Dim::Static(8), Dim::Static(8)],
            )),
        );
        g.inputs.push("x".into());
        g.insert_tensor(
            "flat",
            Tensor::Constant(TensorProto::from_i64s("flat", vec![1], vec![-1])),
        );
        g.push_node(
            Node::new("Constant", "pairs_shape", vec![], vec!["shape".into()]).with_attr(
                "value",
                AttrValue::Tensor(TensorProto::from_i64s("", vec![2], vec![-1, 2])),
            ),
        );
        g.push_node(
            Node::new("Constant", "pad_list", vec![], vec!["p0".into()]).with_attr(
                "value",
                AttrValue::Tensor(TensorProto::from_i64s("", vec![8], vec![1, 2, 3, 4, 5, 6, 7, 8])),
            ),
        );
        g.push_node(Node::new(
            "Reshape",
            "pairs",
            vec!["p0".into(), "shape".into()],
            vec!["p1".into()],
        ));
        g.push_node(Node::new(
            "Reshape",
            "flatten",
            vec!["p1".into(), "flat".into()],
            vec!["p2".into()],
        ));
        let pad = g.push_node(Node::new(
            "Pad",
            "pad",
            vec!["x".into(), "p2".into()],
            vec!["y".into()],
        ));
        g.outputs.push("y".into());

        assert!(PadFolder.simplify(&mut g, pad).unwrap());
        assert_eq!(g.constant_values("pad_pads").unwrap(), [7, 5, 3, 1, 8, 6, 4, 2]);
        let ops: Vec<_> = g.nodes.iter().map(|n| n.op_type.as_str()).collect();
        assert_eq!(ops, ["Pad"]);
        g.check().unwrap();
    }

    #[test]
    fn shared_chain_is_rejected() {
        let mut g = exported_pad_graph(vec![1, 2, 3, 4, 5, 6, 7, 8]);
        g.push_node(Node::new("Identity", "tap", vec!["p1".into()], vec!["t".into()]));
        g.outputs.push("t".into());
        let pad = g.nodes[4].id();

        let err = PadFolder.simplify(&mut g, pad).unwrap_err();
        assert!(matches!(err, Error::UnsupportedPattern { .. }));
        assert_eq!(g.node(pad).unwrap().inputs[1], "p2");
        assert_eq!(g.nodes.len(), 6);
    }

    #[test]
    fn constant_pads_are_left_alone() {
        let mut g = Graph::default();
        g.insert_tensor(
            "pads",
            Tensor::Constant(TensorProto::from_i64s("pads", vec![8], vec![0, 0, 1, 1, 0, 0, 1, 1])),
        );
        let id = g.push_node(Node::new(
            "Pad",
            "pad",
            vec!["x".into(), "pads".into()],
            vec!["y".into()],
        ));
        assert!(!PadFolder.simplify(&mut g, id).unwrap());
        assert_eq!(g.nodes[0].inputs[1], "pads");
    }

    #[test]
    fn non_constant_root_is_rejected_and_graph_restored() {
        let mut g = Graph::default();
        g.push_node(Node::new("Shape", "shape", vec!["x".into()], vec!["s".into()]));
        g.push_node(Node::new("Relu", "main", vec!["x".into()], vec!["r".into()]));
        let id = g.push_node(Node::new(
            "Pad",
            "pad",
            vec!["r".into(), "s".into()],
            vec!["y".into()],
        ));
        g.outputs.push("y".into());

        let err = PadFolder.simplify(&mut g, id).unwrap_err();
        assert!(matches!(err, Error::UnsupportedPattern { .. }));
        assert_eq!(g.node(id).unwrap().inputs[1], "s");
        assert_eq!(g.nodes.len(), 3);
    }
}
