//! Training orchestration for PPG-to-mel voice conversion.
//!
//! The crate drives a sequence-to-sequence mel decoder over phonetic
//! posteriorgram (PPG) and pitch (lf0-uv) inputs: dataset and collation
//! setup, a learning-rate scheduled optimizer wrapper, the step loop with
//! periodic validation and checkpointing, and attention-map rendering for
//! diagnostics. Tensors, autograd and the base optimizer come from candle.
pub mod collate;
pub mod config;
pub mod dataset;
pub mod loader;
pub mod loss;
pub mod model;
pub mod optim;
pub mod plot;
pub mod pretrained;
pub mod solver;
pub mod util;

pub use collate::{Batch, VcCollate};
pub use config::Config;
pub use dataset::{Utterance, VcDataset};
pub use loader::DataLoader;
pub use loss::MaskedLoss;
pub use model::{DecoderOutput, DotAttnDecoder, MelDecoder};
pub use optim::ScheduledOptim;
pub use solver::{Solver, TrainArgs, TrainState, ValidStats};
