//! Drives a surgery session: load, simplify, apply requests, export.
//!
//! The stages are encoded in the type of [`Surgery`], so a session can only
//! move forward and only an edited graph can be exported.

use std::{
    fs::File,
    io::{BufReader, Read, Write},
    marker::PhantomData,
    path::{Path, PathBuf},
};

use prost::Message;
use tempfile::NamedTempFile;

use crate::{
    editor::OpKind,
    error::{Error, Result},
    graph::{Graph, NodeId},
    onnx::ModelProto,
    request::{load_requests, EditRequest},
};

pub struct Loaded;
pub struct Simplified;
pub struct Edited;

pub struct Surgery<S> {
    graph: Graph,
    requests: Vec<(PathBuf, EditRequest)>,
    _stage: PhantomData<S>,
}

pub fn read_model(path: &Path) -> Result<ModelProto> {
    if !path.is_file() {
        return Err(Error::FileNotFound(path.to_path_buf()));
    }
    let f = File::open(path).map_err(Error::io_ctx(format!("opening {path:?}")))?;
    let mut reader = BufReader::new(f);
    let mut buffer = Vec::new();
    reader
        .read_to_end(&mut buffer)
        .map_err(Error::io_ctx(format!("reading {path:?}")))?;
    Ok(ModelProto::decode(&buffer[..])?)
}

/// Writes `model` to a temporary file next to `path` and renames it into
/// place. On failure the temporary file is removed, so no partial model is
/// left behind.
pub fn write_model(path: &Path, model: &ModelProto) -> Result<()> {
    let dir = path
        .parent()
        .filter(|d| !d.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir)
        .map_err(Error::io_ctx(format!("creating a temporary file in {dir:?}")))?;
    tmp.write_all(&model.encode_to_vec())
        .and_then(|_| tmp.flush())
        .map_err(Error::io_ctx(format!("writing {path:?}")))?;
    tmp.persist(path)
        .map_err(|e| Error::IoWhen(e.error, format!("renaming into {path:?}")))?;
    Ok(())
}

/// `models/yolov4.onnx` -> `models/yolov4_tuned.onnx`
pub fn tuned_path(input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    input.with_file_name(format!("{stem}_tuned.onnx"))
}

impl<S> Surgery<S> {
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    fn advance<T>(self) -> Surgery<T> {
        Surgery {
            graph: self.graph,
            requests: self.requests,
            _stage: PhantomData,
        }
    }
}

impl Surgery<Loaded> {
    /// Admits every request file, then loads the model. Nothing is loaded
    /// unless all requests conform to the schema.
    pub fn open<P: AsRef<Path>>(model: &Path, request_files: &[P]) -> Result<Self> {
        let requests = load_requests(request_files)?;
        log::info!("loading {model:?}");
        let graph = Graph::from_model(read_model(model)?)?;
        Ok(Self::new(graph, requests))
    }

    pub fn new(graph: Graph, requests: Vec<(PathBuf, EditRequest)>) -> Self {
        Self {
            graph,
            requests,
            _stage: PhantomData,
        }
    }

    /// Runs the registered editor of every node present right now. Nodes
    /// an earlier editor removed are skipped.
    pub fn simplify(mut self) -> Result<Surgery<Simplified>> {
        let plan: Vec<(NodeId, OpKind)> = self
            .graph
            .nodes
            .iter()
            .map(|n| (n.id(), OpKind::from_op_type(&n.op_type)))
            .collect();
        log::debug!(
            "{} of {} nodes have an editor",
            plan.iter().filter(|(_, kind)| *kind != OpKind::PassThrough).count(),
            plan.len()
        );

        let mut changed = 0;
        for (id, kind) in plan {
            if self.graph.node(id).is_none() {
                continue;
            }
            if kind.editor().simplify(&mut self.graph, id)? {
                changed += 1;
            }
        }
        if changed > 0 {
            self.graph.cleanup();
            self.graph.toposort()?;
        }
        log::info!("simplified {changed} nodes");
        Ok(self.advance())
    }
}

impl Surgery<Simplified> {
    /// Applies the admitted requests in file order. The first failure ends
    /// the session.
    pub fn apply_requests(mut self) -> Result<Surgery<Edited>> {
        let requests = std::mem::take(&mut self.requests);
        for (path, request) in &requests {
            log::info!("applying {} from {path:?}", request.kind());
            apply(&mut self.graph, request).map_err(|e| e.in_file(path))?;
        }
        self.requests = requests;
        Ok(self.advance())
    }
}

fn apply(graph: &mut Graph, request: &EditRequest) -> Result<()> {
    let editor_for = |op: &Option<String>| {
        op.as_deref()
            .map(|op| OpKind::from_op_type(op).editor())
            .ok_or_else(|| Error::NotImplemented(request.kind().to_string()))
    };
    match request {
        EditRequest::Add(add) => OpKind::from_op_type(&add.node_optype)
            .editor()
            .add(graph, add),
        EditRequest::Delete(del) => editor_for(&del.node_optype)?.delete(graph, del),
        EditRequest::Change(change) => editor_for(&change.node_optype)?.change(graph, change),
    }
}

impl Surgery<Edited> {
    pub fn export(&self) -> Result<ModelProto> {
        self.graph.check()?;
        Ok(self.graph.to_model())
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let model = self.export()?;
        write_model(path, &model)?;
        log::info!("fixed ONNX graph saved to {path:?}");
        Ok(())
    }
}

/// Full session from `model` to `output`.
pub fn run<P: AsRef<Path>>(model: &Path, request_files: &[P], output: &Path) -> Result<()> {
    Surgery::open(model, request_files)?
        .simplify()?
        .apply_requests()?
        .save(output)
}
