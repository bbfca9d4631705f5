//! OCR for photographed pages of vertically-written historical text
//!
//! Detects text regions, recognizes each region with a line recognizer,
//! rebuilds the reading order of columns and emits text, JSON or XML.

pub mod config;
pub mod pipeline;
pub mod vision;
pub mod worker;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::AppConfig;
pub use pipeline::{CancelToken, JobConfig, OcrPipeline, OcrResult, OutputFormat, PipelineError, Stage};
pub use worker::{JobEvent, JobTicket, TaskQueue};
