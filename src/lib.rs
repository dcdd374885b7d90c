//! Preference-data preparation and evaluation for federated LLM fine-tuning
//!
//! The SHP (Stanford Human Preferences) comparisons are loaded, their
//! instructions spread over simulated clients with a Dirichlet split, and
//! the result shaped and tokenized into training datasets. Fine-tuned
//! checkpoints can then be chatted with or scored on Reddit TL;DR
//! summarization.

pub mod cache;
pub mod chat;
pub mod config;
pub mod corpus;
pub mod dataset;
pub mod error;
pub mod eval;
pub mod filter;
pub mod jsonl;
pub mod ollama;
pub mod partition;
pub mod prompt;
pub mod records;
pub mod rouge;
pub mod shaper;
pub mod shp;
pub mod tokenizer;

pub use error::{PipelineError, Result};
