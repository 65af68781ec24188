//! Operator-driven graph partitioning for the CV22 accelerator.
//!
//! A dataflow graph is annotated with the backend that supports each
//! operator, same-backend operators are merged into regions, and every
//! region is extracted into a standalone function the host graph calls.
//! Functions can then be exported and handed to an external compiler.

pub mod annotate;
pub mod config;
pub mod core;
pub mod error;
pub mod export;
pub mod interp;
pub mod ir;
pub mod logging;
pub mod merge;
pub mod partition;
pub mod pipeline;
pub mod printer;
pub mod registry;
pub mod toolchain;
