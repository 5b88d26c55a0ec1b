//! The Devplan Analyzer (§4.2 of the specification).

pub mod analyzer;
pub mod markdown;
pub mod predictor;
pub mod tree;

pub use analyzer::{AnalyzeSummary, DevplanAnalyzer};
pub use predictor::{FileScopePredictor, LlmPredictor, NullPredictor};
