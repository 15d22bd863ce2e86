//! Pretraining for GPT-style language models on candle.
//!
//! The crate covers the full pretraining loop: a decoder-only transformer
//! with a weight-tied output head, grouped AdamW with weight-decay
//! partitioning, a warmup/cosine learning-rate schedule, gradient
//! accumulation with deferred cross-process synchronization, periodic
//! validation with checkpointing, and an importer for GPT-2 family
//! checkpoints. Tokenization happens outside the crate; every interface
//! speaks token ids.

pub mod config;
pub mod data;
pub mod distributed;
pub mod model;
pub mod optim;
pub mod pretrained;
pub mod sample;
pub mod training;

pub use config::{ModelConfig, RunConfig, TrainConfig};
pub use distributed::DistributedContext;
pub use model::Gpt;
pub use training::Trainer;
