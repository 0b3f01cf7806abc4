//! Multi-stage document processing pipeline.

pub mod classification;
pub mod controller;
pub mod estimate;
pub mod extraction;
pub mod interpretation;
pub mod json;
pub mod reconciliation;
pub mod strategy;

pub use controller::{PipelineController, PipelineOutputs, PipelineResult, PipelineRunner};
pub use strategy::{ChainExhausted, ChainOutcome, FallbackChain, Strategy, StrategyFailure};
