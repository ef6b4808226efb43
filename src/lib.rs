pub mod analyzer;
pub mod compiler;
pub mod executor;
pub mod graph;
pub mod handle;
pub mod pass;
pub mod registry;
pub mod resource;
pub mod state;
pub mod sync;

pub use analyzer::{AnalysisResult, Dependency, GraphAnalyzer, ResourceAliasGroup};
pub use compiler::{CompilationResult, CompileStage, RenderGraphCompiler};
pub use executor::{RenderContext, RenderGraphExecutor};
pub use graph::RenderGraph;
pub use handle::{RenderPassHandle, ResourceHandle};
pub use pass::{
    DescriptorBinding, ExecuteFn, PassBuilder, PassKind, PipelineBuilder, PipelineFn, RenderPass,
    ResourceUsage,
};
pub use registry::ResourceRegistry;
pub use resource::{
    ActualResource, BufferDescription, ImageDescription, NativeResource, ResourceDescription,
    ResourceLifetime, VirtualResource,
};
pub use state::ResourceState;
pub use sync::{BarrierBatch, BufferBarrier, ImageBarrier, MemoryBarrier, SynchronizationGenerator};

use ash::vk;

#[derive(Debug, thiserror::Error)]
pub enum RenderGraphError {
    #[error("render graph contains cycles")]
    CyclicDependency,

    #[error("pass '{pass}' references an invalid resource handle")]
    InvalidResourceReference { pass: String },

    #[error("unknown resource handle {handle:?}")]
    UnknownResource { handle: ResourceHandle },

    #[error("resource '{resource}' cannot be imported: {reason}")]
    ImportRejected { resource: String, reason: String },

    #[error("resource '{resource}' has no physical backing for frame {frame_index}")]
    ResourceNotRealized {
        resource: String,
        frame_index: usize,
    },

    #[error("{operation} called on {actual_kind} resource '{resource}'")]
    ResourceKindMismatch {
        operation: &'static str,
        actual_kind: &'static str,
        resource: String,
    },

    #[error("frame index {frame_index} out of range ({frames_in_flight} frames in flight)")]
    FrameIndexOutOfRange {
        frame_index: usize,
        frames_in_flight: usize,
    },

    #[error("compilation failed during {stage:?}: {message}")]
    CompilationFailed {
        stage: CompileStage,
        message: String,
    },

    #[error("pipeline creation failed for pass '{pass}'")]
    PipelineCreation { pass: String },

    #[error("Vulkan call failed: {0}")]
    Vulkan(#[from] vk::Result),

    #[error("memory allocation failed: {0}")]
    Allocation(#[from] gpu_allocator::AllocationError),
}

pub type Result<T> = std::result::Result<T, RenderGraphError>;
