use std::path::PathBuf;

use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};

use super::NodeEditor;
use crate::{
    error::{Error, Result},
    graph::{AttrValue, Dim, Graph, Node, Tensor, Variable},
    onnx::DataType,
    request::AddRequest,
};

/// Op type TensorRT registers the dynamic-batch BatchedNMS plugin under.
pub const PLUGIN_OP: &str = "BatchedNMSDynamic_TRT";

const DEFAULT_INPUTS: [&str; 2] = ["boxes", "confs"];
const DEFAULT_OUTPUTS: [&str; 4] = ["num_detections", "nms_boxes", "nms_scores", "nms_classes"];

/// Replaces the raw box/score outputs of a YOLO graph with the TensorRT
/// BatchedNMS plugin.
pub struct BatchedNms;

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NmsParams {
    #[serde(deserialize_with = "flag")]
    pub share_location: bool,
    pub background_label_id: i64,
    pub num_classes: i64,
    pub num_anchors: i64,
    pub top_k: i64,
    pub keep_top_k: i64,
    pub score_threshold: f32,
    pub iou_threshold: f32,
    #[serde(deserialize_with = "flag")]
    pub is_normalized: bool,
    #[serde(deserialize_with = "flag")]
    pub clip_boxes: bool,
}

impl Default for NmsParams {
    fn default() -> Self {
        Self {
            share_location: true,
            background_label_id: -1,
            num_classes: 80,
            num_anchors: 3,
            top_k: 2000,
            keep_top_k: 200,
            score_threshold: 0.4,
            iou_threshold: 0.6,
            is_normalized: true,
            clip_boxes: true,
        }
    }
}

/// Accepts `true`/`false` as well as `1`/`0`.
fn flag<'de, D: Deserializer<'de>>(de: D) -> Result<bool, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Int(i64),
    }

    Ok(match Flag::deserialize(de)? {
        Flag::Bool(b) => b,
        Flag::Int(i) => i != 0,
    })
}

impl NmsParams {
    pub fn from_param(param: &Map<String, Value>) -> Result<Self> {
        let bad = |reason: String| Error::schema(PathBuf::new(), "add_node_req.node_param", reason);
        let params: Self =
            serde_json::from_value(Value::Object(param.clone())).map_err(|e| bad(e.to_string()))?;

        if params.num_classes <= 0 {
            return Err(bad("numClasses must be positive".to_string()));
        }
        if params.keep_top_k <= 0 || params.keep_top_k > params.top_k {
            return Err(bad(format!(
                "keepTopK ({}) must be in 1..=topK ({})",
                params.keep_top_k, params.top_k
            )));
        }
        Ok(params)
    }

    fn attrs(&self) -> [(&'static str, AttrValue); 10] {
        [
            ("shareLocation", AttrValue::Bool(self.share_location)),
            ("backgroundLabelId", AttrValue::Int(self.background_label_id)),
            ("numClasses", AttrValue::Int(self.num_classes)),
            ("topK", AttrValue::Int(self.top_k)),
            ("keepTopK", AttrValue::Int(self.keep_top_k)),
            ("scoreThreshold", AttrValue::Float(self.score_threshold)),
            ("iouThreshold", AttrValue::Float(self.iou_threshold)),
            ("isNormalized", AttrValue::Bool(self.is_normalized)),
            ("clipBoxes", AttrValue::Bool(self.clip_boxes)),
            ("plugin_version", AttrValue::String("1".to_string())),
        ]
    }
}

fn split_names(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

impl NodeEditor for BatchedNms {
    fn name(&self) -> &'static str {
        PLUGIN_OP
    }

    fn add(&self, graph: &mut Graph, req: &AddRequest) -> Result<()> {
        let params = NmsParams::from_param(&req.node_param)?;
        log::debug!("{PLUGIN_OP} params: {params:?}");

        let inputs = match split_names(&req.input_name) {
            names if names.is_empty() => DEFAULT_INPUTS.map(String::from).to_vec(),
            names if names.len() == 2 => names,
            names => {
                return Err(Error::schema(
                    PathBuf::new(),
                    "add_node_req.input_name",
                    format!("expected \"boxes,scores\", got {} names", names.len()),
                ))
            }
        };
        if let Some(missing) = inputs.iter().find(|n| !graph.tensors.contains_key(*n)) {
            return Err(Error::MissingTensor(missing.clone()));
        }

        let outputs = match req.output_name.as_deref().map(split_names) {
            None => DEFAULT_OUTPUTS.map(|n| graph.unique_tensor_name(n)).to_vec(),
            Some(names) if names.len() == 4 => {
                if let Some(taken) = names.iter().find(|n| graph.tensors.contains_key(*n)) {
                    return Err(Error::schema(
                        PathBuf::new(),
                        "add_node_req.output_name",
                        format!("tensor {taken:?} already exists"),
                    ));
                }
                names
            }
            Some(names) => {
                return Err(Error::schema(
                    PathBuf::new(),
                    "add_node_req.output_name",
                    format!("expected 4 comma-separated names, got {}", names.len()),
                ))
            }
        };

        let input_shape = graph.input_shape(0).unwrap_or_default();
        let batch = input_shape.first().cloned().unwrap_or(Dim::Unknown);
        if let [_, _, h, w] = &input_shape[..] {
            log::info!("network input {h:?} x {w:?}, batch {batch:?}");
        }

        let k = Dim::Static(params.keep_top_k);
        let specs = [
            (DataType::Int32, vec![batch.clone(), Dim::Static(1)]),
            (DataType::Float, vec![batch.clone(), k.clone(), Dim::Static(4)]),
            (DataType::Float, vec![batch.clone(), k.clone()]),
            (DataType::Float, vec![batch, k]),
        ];
        for (name, (dtype, shape)) in outputs.iter().zip(specs) {
            graph.insert_tensor(name.clone(), Tensor::Variable(Variable::new(dtype, shape)));
        }

        let node_name = req.node_name.clone().unwrap_or_else(|| {
            let n = graph
                .nodes
                .iter()
                .filter(|n| n.op_type == PLUGIN_OP)
                .count();
            format!("BatchedNMS_{n}")
        });
        let node = params
            .attrs()
            .into_iter()
            .fold(
                Node::new(PLUGIN_OP, node_name.clone(), inputs, outputs.clone()),
                |node, (key, value)| node.with_attr(key, value),
            );
        graph.push_node(node);
        graph.outputs = outputs;

        graph.cleanup();
        graph.toposort()?;
        log::info!("added {PLUGIN_OP} node {node_name:?}");
        Ok(())
    }
}
