//! Certificate and transcript generation for completed course claims.
//!
//! A claim is turned into a numbered certificate/transcript pair: units are
//! gathered from the curriculum tables, both templates are filled, a
//! registration number is allocated, the rendered documents are converted
//! to PDF by an external tool and the result is stored once per claim.

pub mod config;
pub mod convert;
pub mod curriculum;
pub mod db;
pub mod models;
pub mod pipeline;
pub mod render;
pub mod sequence;
pub mod storage;
pub mod store;
pub mod templates;

pub use crate::config::PipelineConfig;
pub use crate::db::Database;
pub use crate::pipeline::{
    CertificatePipeline, GenerationOutcome, PipelineComponents, PipelineError,
};
