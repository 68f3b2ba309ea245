pub mod checkpoint;

pub use checkpoint::{CheckpointStore, JobCheckpoint, JobState, Phase, StateError};
