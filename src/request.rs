//! JSON edit requests and their schema check.
//!
//! A request file holds one object with exactly one discriminant key:
//!
//! ```json
//! { "add_node_req": { "node_optype": "BatchedNMS_TRT", "input_name": "boxes,confs", "node_param": { ... } } }
//! ```
//!
//! Every file is checked before any request reaches the graph.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Kind {
    String,
    Object,
}

impl Kind {
    fn matches(self, v: &Value) -> bool {
        match self {
            Kind::String => v.is_string(),
            Kind::Object => v.is_object(),
        }
    }

    fn name(self) -> &'static str {
        match self {
            Kind::String => "a string",
            Kind::Object => "an object",
        }
    }
}

struct Field {
    name: &'static str,
    kind: Kind,
    required: bool,
}

const fn req(name: &'static str, kind: Kind) -> Field {
    Field {
        name,
        kind,
        required: true,
    }
}

const fn opt(name: &'static str, kind: Kind) -> Field {
    Field {
        name,
        kind,
        required: false,
    }
}

const ADD_FIELDS: &[Field] = &[
    req("node_optype", Kind::String),
    req("input_name", Kind::String),
    req("node_param", Kind::Object),
    opt("node_name", Kind::String),
    opt("output_name", Kind::String),
];

const DELETE_FIELDS: &[Field] = &[req("node_name", Kind::String), opt("node_optype", Kind::String)];

const CHANGE_FIELDS: &[Field] = &[
    req("node_name", Kind::String),
    req("node_param", Kind::Object),
    opt("node_optype", Kind::String),
];

const SCHEMA: &[(&str, &[Field])] = &[
    ("add_node_req", ADD_FIELDS),
    ("delete_node_req", DELETE_FIELDS),
    ("change_node_req", CHANGE_FIELDS),
];

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct AddRequest {
    pub node_optype: String,
    pub input_name: String,
    pub node_param: Map<String, Value>,
    #[serde(default)]
    pub node_name: Option<String>,
    #[serde(default)]
    pub output_name: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct DeleteRequest {
    pub node_name: String,
    #[serde(default)]
    pub node_optype: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct ChangeRequest {
    pub node_name: String,
    pub node_param: Map<String, Value>,
    #[serde(default)]
    pub node_optype: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum EditRequest {
    Add(AddRequest),
    Delete(DeleteRequest),
    Change(ChangeRequest),
}

impl EditRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            EditRequest::Add(_) => "add_node_req",
            EditRequest::Delete(_) => "delete_node_req",
            EditRequest::Change(_) => "change_node_req",
        }
    }

    /// Checks `doc` against the request schema and converts it.
    /// `file` only labels errors.
    pub fn from_json(doc: &Value, file: &Path) -> Result<Self> {
        let top = doc
            .as_object()
            .ok_or_else(|| Error::schema(file, "<root>", "expected an object"))?;

        if let Some(extra) = top
            .keys()
            .find(|k| !SCHEMA.iter().any(|(name, _)| *name == k.as_str()))
        {
            return Err(Error::schema(file, extra, "unknown request kind"));
        }

        let mut present = SCHEMA.iter().filter(|(name, _)| top.contains_key(*name));
        let (kind, fields) = match (present.next(), present.next()) {
            (Some(found), None) => found,
            (None, _) => {
                return Err(Error::schema(
                    file,
                    "<root>",
                    "expected one of add_node_req, delete_node_req, change_node_req",
                ))
            }
            (Some((a, _)), Some((b, _))) => {
                return Err(Error::schema(
                    file,
                    *b,
                    format!("conflicts with {a}; one request per file"),
                ))
            }
        };

        let payload = top[*kind]
            .as_object()
            .ok_or_else(|| Error::schema(file, *kind, "expected an object"))?;
        for field in fields.iter() {
            let path = format!("{kind}.{}", field.name);
            match payload.get(field.name) {
                None if field.required => {
                    return Err(Error::schema(file, path, "missing required field"))
                }
                Some(v) if !field.kind.matches(v) => {
                    return Err(Error::schema(
                        file,
                        path,
                        format!("expected {}", field.kind.name()),
                    ))
                }
                _ => {}
            }
        }

        let payload = Value::Object(payload.clone());
        let request = match *kind {
            "add_node_req" => EditRequest::Add(serde_json::from_value(payload)?),
            "delete_node_req" => EditRequest::Delete(serde_json::from_value(payload)?),
            _ => EditRequest::Change(serde_json::from_value(payload)?),
        };
        Ok(request)
    }

    pub fn open(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(Error::FileNotFound(path.to_path_buf()));
        }
        let text = std::fs::read_to_string(path)
            .map_err(Error::io_ctx(format!("reading {path:?}")))?;
        let doc: Value = serde_json::from_str(&text)
            .map_err(|e| Error::schema(path, "<root>", format!("invalid JSON: {e}")))?;
        Self::from_json(&doc, path)
    }
}

/// Loads and validates every request file, in order. Fails on the first
/// bad file, so nothing is returned unless all of them conform.
pub fn load_requests<P: AsRef<Path>>(paths: &[P]) -> Result<Vec<(PathBuf, EditRequest)>> {
    paths
        .iter()
        .map(|p| {
            let request = EditRequest::open(p.as_ref())?;
            log::info!("admitted {} from {:?}", request.kind(), p.as_ref());
            Ok((p.as_ref().to_path_buf(), request))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(v: Value) -> Result<EditRequest> {
        EditRequest::from_json(&v, Path::new("req.json"))
    }

    fn violated_field(r: Result<EditRequest>) -> String {
        match r {
            Err(Error::SchemaViolation { field, .. }) => field,
            other => panic!("expected a schema violation, got {other:?}"),
        }
    }

    #[test]
    fn accepts_add_request() {
        let r = parse(json!({
            "add_node_req": {
                "node_optype": "BatchedNMS_TRT",
                "input_name": "boxes,confs",
                "node_param": { "keepTopK": 200 },
                "node_name": "nms"
            }
        }))
        .unwrap();
        let EditRequest::Add(add) = r else {
            panic!("not an add request")
        };
        assert_eq!(add.node_optype, "BatchedNMS_TRT");
        assert_eq!(add.node_name.as_deref(), Some("nms"));
        assert_eq!(add.output_name, None);
        assert_eq!(add.node_param["keepTopK"], 200);
    }

    #[test]
    fn missing_optype_is_named() {
        let r = parse(json!({
            "add_node_req": { "input_name": "boxes", "node_param": {} }
        }));
        assert_eq!(violated_field(r), "add_node_req.node_optype");
    }

    #[test]
    fn wrong_shape_is_rejected() {
        let r = parse(json!({
            "add_node_req": { "node_optype": "BatchedNMS_TRT", "input_name": "boxes", "node_param": [1, 2] }
        }));
        assert_eq!(violated_field(r), "add_node_req.node_param");

        let r = parse(json!({ "delete_node_req": { "node_name": 3 } }));
        assert_eq!(violated_field(r), "delete_node_req.node_name");
    }

    #[test]
    fn exactly_one_discriminant() {
        assert_eq!(violated_field(parse(json!({}))), "<root>");
        assert_eq!(violated_field(parse(json!({ "rename_req": {} }))), "rename_req");
        let r = parse(json!({
            "delete_node_req": { "node_name": "a" },
            "change_node_req": { "node_name": "a", "node_param": {} }
        }));
        assert_eq!(violated_field(r), "change_node_req");
    }

    #[test]
    fn bad_later_file_rejects_the_batch() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.json");
        let bad = dir.path().join("bad.json");
        std::fs::write(&good, r#"{"delete_node_req": {"node_name": "x"}}"#).unwrap();
        std::fs::write(&bad, r#"{"change_node_req": {"node_name": "x"}}"#).unwrap();

        assert_eq!(load_requests(&[&good]).unwrap().len(), 1);
        let err = load_requests(&[&good, &bad]).unwrap_err();
        assert!(matches!(err, Error::SchemaViolation { ref field, .. } if field == "change_node_req.node_param"));
    }

    #[test]
    fn missing_file() {
        let err = load_requests(&["/nonexistent/req.json"]).unwrap_err();
        assert!(matches!(err, Error::FileNotFound(_)));
    }
}
