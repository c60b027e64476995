//! Move-prediction network core.
//!
//! A fixed stack of dense affine+ReLU layers with mini-batch SGD training,
//! fork/join-parallel numeric kernels and a flat binary model format.
//! The chess side of the world (legal moves, notation, board encoding) lives
//! outside this crate; it only ever sees integer board vectors and move
//! indices.

pub mod layer;
pub mod model_io;
pub mod network;
pub mod parallel;
pub mod sample;

pub use layer::DenseLayer;
pub use network::Network;
pub use sample::TrainingSample;
