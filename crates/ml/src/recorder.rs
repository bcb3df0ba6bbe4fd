use crate::graph::Node;

pub trait Recorder {
    fn record(&mut self, node: Node);
    fn nodes(&self) -> &[Node];

    /// Whether layers should run in training mode (batch statistics,
    /// running-statistic updates) while recording into this recorder.
    fn is_training(&self) -> bool {
        false
    }
}
