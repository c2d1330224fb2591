use std::path::Path;

use onnx_trt_surgeon::{
    graph::{AttrValue, Dim, Graph},
    onnx::{
        tensor_shape_proto::{dimension, Dimension},
        type_proto, AttributeProto, AttributeType, DataType, FunctionProto, GraphProto,
        ModelProto, NodeProto, OperatorSetIdProto, SparseTensorProto, StringStringEntryProto,
        TensorAnnotation, TensorProto, TensorShapeProto, TrainingInfoProto, TypeProto,
        ValueInfoProto,
    },
    surgeon::{self, read_model, write_model, Surgery},
    Error,
};

fn value_info(name: &str, elem: DataType, dims: &[i64]) -> ValueInfoProto {
    ValueInfoProto {
        name: name.into(),
        r#type: Some(TypeProto {
            denotation: String::new(),
            value: Some(type_proto::Value::TensorType(type_proto::Tensor {
                elem_type: elem as i32,
                shape: Some(TensorShapeProto {
                    dim: dims
                        .iter()
                        .map(|&d| Dimension {
                            denotation: String::new(),
                            value: Some(dimension::Value::DimValue(d)),
                        })
                        .collect(),
                }),
            })),
        }),
        doc_string: String::new(),
        metadata_props: Vec::new(),
    }
}

fn node(op: &str, name: &str, inputs: &[&str], outputs: &[&str]) -> NodeProto {
    NodeProto {
        op_type: op.into(),
        name: name.into(),
        input: inputs.iter().map(|s| s.to_string()).collect(),
        output: outputs.iter().map(|s| s.to_string()).collect(),
        ..Default::default()
    }
}

/// A trimmed YOLO export: a padding chain in front of the head, raw
/// `boxes`/`confs` outputs.
fn yolo_model() -> ModelProto {
    let mut pad_list = node("Constant", "Constant_0", &[], &["pad_list"]);
    pad_list.attribute.push(AttributeProto {
        name: "value".into(),
        r#type: AttributeType::Tensor as i32,
        t: Some(TensorProto::from_i64s("", vec![8], vec![0, 1, 0, 1, 0, 0, 0, 0])),
        ..Default::default()
    });
    let mut pad = node("Pad", "Pad_4", &["input", "pads", ""], &["padded"]);
    pad.attribute.push(AttributeProto {
        name: "mode".into(),
        r#type: AttributeType::String as i32,
        s: b"constant".to_vec(),
        ..Default::default()
    });

    ModelProto {
        ir_version: 6,
        producer_name: "pytorch".into(),
        opset_import: vec![OperatorSetIdProto {
            domain: String::new(),
            version: 11,
        }],
        graph: Some(GraphProto {
            name: "torch-jit-export".into(),
            node: vec![
                pad_list,
                node("Cast", "Cast_1", &["pad_list"], &["pad_i64"]),
                node("Reshape", "Reshape_2", &["pad_i64", "shape"], &["pad_pairs"]),
                node("Reshape", "Reshape_3", &["pad_pairs", "flat"], &["pads"]),
                pad,
                node("Conv", "Conv_5", &["padded", "w"], &["features"]),
                node("Reshape", "Reshape_6", &["features", "box_shape"], &["boxes"]),
                node("Sigmoid", "Sigmoid_7", &["features"], &["confs"]),
            ],
            initializer: vec![
                TensorProto::from_i64s("shape", vec![2], vec![-1, 2]),
                TensorProto::from_i64s("flat", vec![1], vec![-1]),
                TensorProto::from_i64s("box_shape", vec![4], vec![1, -1, 1, 4]),
                TensorProto {
                    name: "w".into(),
                    dims: vec![1, 3, 1, 1],
                    data_type: DataType::Float as i32,
                    float_data: vec![1.0, 1.0, 1.0],
                    ..Default::default()
                },
            ],
            input: vec![value_info("input", DataType::Float, &[1, 3, 416, 416])],
            output: vec![
                value_info("boxes", DataType::Float, &[1, 10647, 1, 4]),
                value_info("confs", DataType::Float, &[1, 10647, 80]),
            ],
            ..Default::default()
        }),
        ..Default::default()
    }
}

const NMS_REQUEST: &str = r#"{
    "add_node_req": {
        "node_optype": "BatchedNMS_TRT",
        "input_name": "boxes,confs",
        "node_param": {
            "shareLocation": 1,
            "backgroundLabelId": -1,
            "numClasses": 80,
            "numAnchors": 3,
            "topK": 2000,
            "keepTopK": 200,
            "scoreThreshold": 0.4,
            "iouThreshold": 0.6,
            "isNormalized": true,
            "clipBoxes": true
        }
    }
}"#;

fn setup(dir: &Path) -> std::path::PathBuf {
    let model = dir.join("yolov4-416.onnx");
    write_model(&model, &yolo_model()).unwrap();
    model
}

#[test]
fn folds_pads_and_inserts_nms() {
    let dir = tempfile::tempdir().unwrap();
    let model = setup(dir.path());
    let request = dir.path().join("nms.json");
    std::fs::write(&request, NMS_REQUEST).unwrap();
    let output = surgeon::tuned_path(&model);

    surgeon::run(&model, &[&request], &output).unwrap();

    let out = read_model(&output).unwrap();
    assert_eq!(out.producer_name, "pytorch");
    assert_eq!(out.opset_import[0].version, 11);

    let g = Graph::from_model(out).unwrap();
    let ops: Vec<_> = g.nodes.iter().map(|n| n.op_type.as_str()).collect();
    assert_eq!(ops, ["Pad", "Conv", "Reshape", "Sigmoid", "BatchedNMSDynamic_TRT"]);
    assert_eq!(
        g.outputs,
        ["num_detections", "nms_boxes", "nms_scores", "nms_classes"]
    );

    let pad = &g.nodes[0];
    assert_eq!(pad.inputs[..2], ["input".to_string(), "Pad_4_pads".to_string()]);
    assert_eq!(
        g.constant_values("Pad_4_pads").unwrap(),
        [0, 0, 0, 0, 0, 0, 1, 1]
    );
    assert_eq!(pad.attrs["mode"], AttrValue::String("constant".into()));

    let boxes = g.tensors["nms_boxes"].shape().unwrap();
    assert_eq!(boxes, [Dim::Static(1), Dim::Static(200), Dim::Static(4)]);
    assert!(!g.tensors.contains_key("pad_list"));
    assert!(!g.tensors.contains_key("shape"));
}

#[test]
fn malformed_request_aborts_before_any_edit() {
    let dir = tempfile::tempdir().unwrap();
    let model = setup(dir.path());
    let good = dir.path().join("0_nms.json");
    let bad = dir.path().join("1_broken.json");
    std::fs::write(&good, NMS_REQUEST).unwrap();
    std::fs::write(
        &bad,
        r#"{"add_node_req": {"input_name": "boxes,confs", "node_param": {}}}"#,
    )
    .unwrap();
    let before = std::fs::read(&model).unwrap();
    let output = dir.path().join("out.onnx");

    let err = surgeon::run(&model, &[&good, &bad], &output).unwrap_err();
    match err {
        Error::SchemaViolation { file, field, .. } => {
            assert_eq!(file, bad);
            assert_eq!(field, "add_node_req.node_optype");
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert!(!output.exists());
    assert_eq!(std::fs::read(&model).unwrap(), before);
}

#[test]
fn failed_edit_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let model = setup(dir.path());
    let request = dir.path().join("nms.json");
    std::fs::write(&request, NMS_REQUEST.replace("boxes,confs", "boxes,scores")).unwrap();
    let output = dir.path().join("out.onnx");

    let err = surgeon::run(&model, &[&request], &output).unwrap_err();
    assert!(matches!(err, Error::MissingTensor(t) if t == "scores"));
    assert!(!output.exists());
}

#[test]
fn simplify_only_session() {
    let dir = tempfile::tempdir().unwrap();
    let model = setup(dir.path());
    let no_requests: [&Path; 0] = [];

    let edited = Surgery::open(&model, &no_requests)
        .unwrap()
        .simplify()
        .unwrap()
        .apply_requests()
        .ok()
        .unwrap();
    let g = edited.graph();
    assert_eq!(g.nodes.len(), 4);
    assert_eq!(g.outputs, ["boxes", "confs"]);
    edited.export().unwrap();
}

#[test]
fn missing_model() {
    let dir = tempfile::tempdir().unwrap();
    let no_requests: [&Path; 0] = [];
    let err = Surgery::open(&dir.path().join("nope.onnx"), &no_requests).err().unwrap();
    assert!(matches!(err, Error::FileNotFound(_)));
}

fn entry(key: &str, value: &str) -> StringStringEntryProto {
    StringStringEntryProto {
        key: key.into(),
        value: value.into(),
    }
}

#[test]
fn unmodelled_fields_survive_surgery() {
    let dir = tempfile::tempdir().unwrap();
    let mut model = yolo_model();
    model.functions.push(FunctionProto {
        name: "mish".into(),
        domain: "custom".into(),
        input: vec!["x".into()],
        output: vec!["y".into()],
        ..Default::default()
    });
    model.training_info.push(TrainingInfoProto {
        update_binding: vec![entry("w", "w_next")],
        ..Default::default()
    });

    let graph = model.graph.as_mut().unwrap();
    let sparse = SparseTensorProto {
        values: Some(TensorProto::from_i64s("sparse_w", vec![1], vec![3])),
        indices: Some(TensorProto::from_i64s("", vec![1], vec![0])),
        dims: vec![4],
    };
    graph.sparse_initializer.push(sparse.clone());
    graph.quantization_annotation.push(TensorAnnotation {
        tensor_name: "features".into(),
        quant_parameter_tensor_names: vec![entry("SCALE_TENSOR", "features_scale")],
    });
    graph.metadata_props.push(entry("stage", "exported"));
    graph.input[0].doc_string = "NCHW image".into();
    graph.input[0].metadata_props.push(entry("layout", "NCHW"));

    let conv = graph.node.iter_mut().find(|n| n.op_type == "Conv").unwrap();
    conv.overload = "v2".into();
    conv.metadata_props.push(entry("origin", "darknet"));
    let elem = TypeProto {
        denotation: String::new(),
        value: Some(type_proto::Value::TensorType(type_proto::Tensor {
            elem_type: DataType::Float as i32,
            shape: None,
        })),
    };
    conv.attribute.push(AttributeProto {
        name: "hint".into(),
        r#type: AttributeType::TypeProto as i32,
        tp: Some(TypeProto {
            denotation: String::new(),
            value: Some(type_proto::Value::SequenceType(type_proto::Sequence {
                elem_type: Some(Box::new(elem)),
            })),
        }),
        ..Default::default()
    });
    conv.attribute.push(AttributeProto {
        name: "mask".into(),
        r#type: AttributeType::SparseTensor as i32,
        sparse_tensor: Some(sparse.clone()),
        ..Default::default()
    });

    let input = dir.path().join("yolov4-416.onnx");
    write_model(&input, &model).unwrap();
    let output = dir.path().join("out.onnx");
    let no_requests: [&Path; 0] = [];
    surgeon::run(&input, &no_requests, &output).unwrap();

    let out = read_model(&output).unwrap();
    assert_eq!(out.functions, model.functions);
    assert_eq!(out.training_info, model.training_info);

    let g = out.graph.unwrap();
    let src = model.graph.unwrap();
    assert_eq!(g.sparse_initializer, src.sparse_initializer);
    assert_eq!(g.quantization_annotation, src.quantization_annotation);
    assert_eq!(g.metadata_props, src.metadata_props);
    assert_eq!(g.input[0], src.input[0]);

    let conv = g.node.iter().find(|n| n.op_type == "Conv").unwrap();
    let src_conv = src.node.iter().find(|n| n.op_type == "Conv").unwrap();
    assert_eq!(conv.overload, "v2");
    assert_eq!(conv.metadata_props, src_conv.metadata_props);
    for name in ["hint", "mask"] {
        let kept = conv.attribute.iter().find(|a| a.name == name);
        let original = src_conv.attribute.iter().find(|a| a.name == name);
        assert_eq!(kept, original, "attribute {name}");
    }
}
