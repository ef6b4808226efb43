use std::collections::HashMap;

use crate::analyzer::{AnalysisResult, Dependency, GraphAnalyzer, ResourceAliasGroup};
use crate::handle::{RenderPassHandle, ResourceHandle};
use crate::pass::RenderPass;
use crate::resource::VirtualResource;
use crate::sync::{BarrierBatch, SynchronizationGenerator};

/// Compilation advances through these stages in order. A result that
/// stops at `Failed` keeps the stage it failed in via `error_message`;
/// the stages after `SynchronizationGenerated` involve the device and
/// are advanced by the graph facade rather than the planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CompileStage {
    Uninitialized,
    Validated,
    LifetimesComputed,
    Sorted,
    SynchronizationGenerated,
    ResourcesAllocated,
    NativeObjectsCreated,
    Compiled,
    Failed,
}

/// Everything the executor needs to replay a frame, plus the diagnostics
/// the facade surfaces through `dump_compilation_info`.
#[derive(Debug, Default)]
pub struct CompilationResult {
    pub stage: CompileStage,
    pub execution_order: Vec<RenderPassHandle>,
    pub dependencies: Vec<Dependency>,
    pub barrier_batches: HashMap<RenderPassHandle, BarrierBatch>,
    pub alias_groups: Vec<ResourceAliasGroup>,
    pub unused_resources: Vec<ResourceHandle>,
    pub error_message: Option<String>,
    /// The stage that was running when compilation failed.
    pub failed_during: CompileStage,
}

impl Default for CompileStage {
    fn default() -> Self {
        Self::Uninitialized
    }
}

impl CompilationResult {
    pub fn succeeded(&self) -> bool {
        self.stage == CompileStage::Compiled
    }

    pub fn failed(&self) -> bool {
        self.stage == CompileStage::Failed
    }

    fn fail(mut self, during: CompileStage, message: impl Into<String>) -> Self {
        self.stage = CompileStage::Failed;
        self.failed_during = during;
        self.error_message = Some(message.into());
        self
    }
}

/// Runs the device-free half of compilation: validation, lifetime
/// analysis, ordering, synchronization and aliasing. Resource
/// allocation and pipeline creation stay with the facade, which owns
/// the device.
pub struct RenderGraphCompiler;

impl RenderGraphCompiler {
    pub fn plan(passes: &[RenderPass], resources: &mut [VirtualResource]) -> CompilationResult {
        let mut result = CompilationResult::default();

        for pass in passes {
            for usage in &pass.usages {
                let known = usage.resource.is_valid() && usage.resource.index() < resources.len();
                if !known {
                    log::error!(
                        "pass '{}' declares a usage of unknown resource {:?}",
                        pass.name,
                        usage.resource,
                    );
                    return result.fail(
                        CompileStage::Validated,
                        format!("pass '{}' references an invalid resource handle", pass.name),
                    );
                }
            }
        }
        result.stage = CompileStage::Validated;

        GraphAnalyzer::compute_resource_lifetimes(passes, resources);
        result.stage = CompileStage::LifetimesComputed;

        let analysis = GraphAnalyzer::analyze_graph(passes, resources);
        if analysis.has_cycles {
            return result.fail(CompileStage::Sorted, "render graph contains cycles");
        }
        result.stage = CompileStage::Sorted;

        result.barrier_batches =
            SynchronizationGenerator::generate_synchronization(&analysis, passes, resources);
        let AnalysisResult {
            execution_order,
            dependencies,
            unused_resources,
            ..
        } = analysis;
        result.execution_order = execution_order;
        result.dependencies = dependencies;
        result.unused_resources = unused_resources;
        result.stage = CompileStage::SynchronizationGenerated;

        result.alias_groups = GraphAnalyzer::analyze_resource_aliasing(resources);

        log::debug!(
            "planned {} passes, {} dependencies, {} barrier batches, {} alias groups",
            result.execution_order.len(),
            result.dependencies.len(),
            result.barrier_batches.len(),
            result.alias_groups.len(),
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pass::{PassKind, ResourceUsage};
    use crate::resource::{ImageDescription, ResourceDescription};
    use crate::state::ResourceState;
    use ash::vk;

    fn image_resource(name: &str, index: u32) -> VirtualResource {
        VirtualResource::new(
            name,
            ResourceHandle::new(index),
            ResourceDescription::Image(ImageDescription::color_target(
                vk::Format::R8G8B8A8_UNORM,
                64,
                64,
            )),
        )
    }

    fn pass(name: &str, index: u32) -> RenderPass {
        RenderPass::new(name, RenderPassHandle::new(index), PassKind::Graphics)
    }

    fn usage(resource: ResourceHandle, state: ResourceState, write: bool) -> ResourceUsage {
        ResourceUsage {
            resource,
            stage: state.stage,
            access: state.access,
            layout: state.layout,
            write,
            binding: None,
        }
    }

    #[test]
    fn plan_reaches_synchronization_stage() {
        let target = image_resource("target", 0);
        let mut writer = pass("writer", 0);
        writer.push_usage(usage(target.handle, ResourceState::COLOR_ATTACHMENT, true));
        let mut reader = pass("reader", 1);
        reader.push_usage(usage(target.handle, ResourceState::SHADER_READ, false));

        let passes = vec![writer, reader];
        let mut resources = vec![target];
        let result = RenderGraphCompiler::plan(&passes, &mut resources);

        assert_eq!(result.stage, CompileStage::SynchronizationGenerated);
        assert_eq!(
            result.execution_order,
            vec![RenderPassHandle::new(0), RenderPassHandle::new(1)]
        );
        assert_eq!(result.dependencies.len(), 1);
        assert!(result.error_message.is_none());
        assert!(!result.succeeded());
    }

    #[test]
    fn invalid_handle_fails_validation() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut broken = pass("broken", 0);
        broken.push_usage(usage(
            ResourceHandle::INVALID,
            ResourceState::SHADER_READ,
            false,
        ));

        let passes = vec![broken];
        let mut resources: Vec<VirtualResource> = Vec::new();
        let result = RenderGraphCompiler::plan(&passes, &mut resources);

        assert!(result.failed());
        assert!(result.execution_order.is_empty());
        assert!(result.error_message.as_deref().unwrap().contains("broken"));
    }

    #[test]
    fn out_of_range_handle_fails_validation() {
        let target = image_resource("target", 0);
        let mut dangling = pass("dangling", 0);
        dangling.push_usage(usage(
            ResourceHandle::new(7),
            ResourceState::SHADER_READ,
            false,
        ));

        let passes = vec![dangling];
        let mut resources = vec![target];
        let result = RenderGraphCompiler::plan(&passes, &mut resources);

        assert!(result.failed());
    }

    #[test]
    fn cycles_fail_after_validation() {
        let a = image_resource("a", 0);
        let b = image_resource("b", 1);
        let mut first = pass("first", 0);
        first.push_usage(usage(a.handle, ResourceState::SHADER_READ, false));
        first.push_usage(usage(b.handle, ResourceState::COLOR_ATTACHMENT, true));
        let mut second = pass("second", 1);
        second.push_usage(usage(b.handle, ResourceState::SHADER_READ, false));
        second.push_usage(usage(a.handle, ResourceState::COLOR_ATTACHMENT, true));

        let passes = vec![first, second];
        let mut resources = vec![a, b];
        let result = RenderGraphCompiler::plan(&passes, &mut resources);

        assert!(result.failed());
        assert!(result.error_message.as_deref().unwrap().contains("cycles"));
        assert!(result.execution_order.is_empty());
    }

    #[test]
    fn planning_twice_is_stable() {
        let target = image_resource("target", 0);
        let depth = image_resource("depth", 1);
        let mut geometry = pass("geometry", 0);
        geometry.push_usage(usage(target.handle, ResourceState::COLOR_ATTACHMENT, true));
        geometry.push_usage(usage(depth.handle, ResourceState::DEPTH_ATTACHMENT, true));
        let mut post = pass("post", 1);
        post.push_usage(usage(target.handle, ResourceState::SHADER_READ, false));

        let passes = vec![geometry, post];
        let mut resources = vec![target, depth];

        let first = RenderGraphCompiler::plan(&passes, &mut resources);
        let second = RenderGraphCompiler::plan(&passes, &mut resources);

        assert_eq!(first.execution_order, second.execution_order);
        assert_eq!(first.barrier_batches, second.barrier_batches);
        assert_eq!(first.alias_groups.len(), second.alias_groups.len());
    }
}
