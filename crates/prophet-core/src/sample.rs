//! Training sample type shared between the pipeline and the network.

/// One position/move pair extracted from a recorded game.
///
/// Produced by the external board/move encoder, buffered by the pipeline,
/// and discarded once folded into a mini-batch.
#[derive(Debug, Clone)]
pub struct TrainingSample {
    /// Raw integer board vector. Fixed length for a given encoder; the last
    /// element is the side-to-move flag (0/1).
    pub board: Vec<i32>,
    /// Index of the played move in the encoder's move space.
    pub target_move: usize,
    /// Scales this sample's gradient contribution: positive for moves by the
    /// eventual winner, negative for the loser, small and neutral otherwise.
    pub outcome_weight: f32,
}

impl TrainingSample {
    pub fn new(board: Vec<i32>, target_move: usize, outcome_weight: f32) -> Self {
        Self { board, target_move, outcome_weight }
    }
}
