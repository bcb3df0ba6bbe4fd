use crate::recorder::Recorder;

/// Operations the recorders understand.
///
/// Ops that need a constant carry it inline instead of in a side tensor.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum EOp {
    Add,
    Sub,
    Mul,
    AddBroadcast,
    MulBroadcast,
    MatMul,
    MulScalar(f32),
    AddScalar(f32),
    Exp,
    Tanh,
    Relu,
    Softplus,
    SumCols,
    ReduceSum,
    ReduceMean,
    SliceCols { start: usize, end: usize },
    ConcatCols,
    BatchNormalize { eps: f32 },
}

/// One recorded op. `b` is `None` for unary ops.
#[derive(Clone, Debug)]
pub struct Node {
    pub op: EOp,
    pub a: usize,
    pub b: Option<usize>,
    pub out: usize,
}

/// Forward-only recorder used for inference.
///
/// It keeps the node list (handy for counting ops in tests) but never
/// differentiates, and layers treat it as evaluation mode.
#[derive(Default)]
pub struct Graph {
    nodes: Vec<Node>,
}

impl Recorder for Graph {
    fn record(&mut self, node: Node) {
        self.nodes.push(node);
    }

    fn nodes(&self) -> &[Node] {
        &self.nodes
    }
}

impl Graph {
    #[must_use]
    pub fn new() -> Self {
        Self { nodes: Vec::new() }
    }
}
