//! Monte Carlo smoothing and inter-comparison of atmospheric radiocarbon records.
//!
//! The core ([`smoother`], [`engine`], [`monthly`], [`analysis`], [`harmonize`])
//! works on typed [`model::Series`] values and reports [`error::AnalysisError`].
//! The application layer ([`config`], [`data`], [`manager`]) reads a run
//! directory and writes CSV and MessagePack results.

pub mod analysis;
pub mod calendar;
pub mod config;
pub mod data;
pub mod engine;
pub mod error;
pub mod harmonize;
pub mod manager;
pub mod model;
pub mod monthly;
pub mod smoother;
pub mod stats;
