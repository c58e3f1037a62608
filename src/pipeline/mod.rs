//! Pipeline compilation and execution

pub mod compiler;

pub use compiler::{CompiledPipeline, PipelineCompiler, PipelineResult, PipelineStep};
