//! Per-operator graph editors.
//!
//! Every operator tag the surgeon understands resolves to an [`OpKind`];
//! anything else is [`OpKind::PassThrough`], which leaves nodes alone
//! during simplification and refuses explicit requests.

mod nms;
mod pad;

pub use nms::{BatchedNms, NmsParams};
pub use pad::{fold_pads, PadFolder};

use crate::{
    error::{Error, Result},
    graph::{Graph, NodeId},
    request::{AddRequest, ChangeRequest, DeleteRequest},
};

pub trait NodeEditor: Sync {
    /// Operator tag, used in logs and errors.
    fn name(&self) -> &'static str;

    /// Rewrites the node `id` into a form the engine builder accepts.
    /// Returns whether anything changed.
    fn simplify(&self, _graph: &mut Graph, _id: NodeId) -> Result<bool> {
        Ok(false)
    }

    fn add(&self, _graph: &mut Graph, _req: &AddRequest) -> Result<()> {
        Err(Error::NotImplemented(format!("adding {} nodes", self.name())))
    }

    fn delete(&self, _graph: &mut Graph, _req: &DeleteRequest) -> Result<()> {
        Err(Error::NotImplemented(format!("deleting {} nodes", self.name())))
    }

    fn change(&self, _graph: &mut Graph, _req: &ChangeRequest) -> Result<()> {
        Err(Error::NotImplemented(format!("changing {} nodes", self.name())))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpKind {
    Pad,
    BatchedNms,
    PassThrough,
}

impl OpKind {
    pub fn from_op_type(op_type: &str) -> Self {
        match op_type {
            "Pad" => OpKind::Pad,
            "BatchedNMS_TRT" | "BatchedNMSDynamic_TRT" => OpKind::BatchedNms,
            _ => OpKind::PassThrough,
        }
    }

    pub fn editor(self) -> &'static dyn NodeEditor {
        static PAD: PadFolder = PadFolder;
        static NMS: BatchedNms = BatchedNms;
        static PASS: PassThrough = PassThrough;

        match self {
            OpKind::Pad => &PAD,
            OpKind::BatchedNms => &NMS,
            OpKind::PassThrough => &PASS,
        }
    }
}

pub struct PassThrough;

impl NodeEditor for PassThrough {
    fn name(&self) -> &'static str {
        "pass-through"
    }

    fn simplify(&self, graph: &mut Graph, id: NodeId) -> Result<bool> {
        if let Some(node) = graph.node(id) {
            log::debug!("{:?} ({}): no editor, left as is", node.name, node.op_type);
        }
        Ok(false)
    }

    fn add(&self, _graph: &mut Graph, req: &AddRequest) -> Result<()> {
        Err(Error::UnknownOperator(req.node_optype.clone()))
    }

    fn delete(&self, _graph: &mut Graph, req: &DeleteRequest) -> Result<()> {
        Err(Error::UnknownOperator(
            req.node_optype.clone().unwrap_or_default(),
        ))
    }

    fn change(&self, _graph: &mut Graph, req: &ChangeRequest) -> Result<()> {
        Err(Error::UnknownOperator(
            req.node_optype.clone().unwrap_or_default(),
        ))
    }
}
