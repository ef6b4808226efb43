use std::fmt::Write as _;
use std::sync::{Arc, Mutex};

use ash::vk;
use gpu_allocator::vulkan::Allocator;
use petgraph::graph::DiGraph;

use crate::analyzer::Dependency;
use crate::compiler::{CompilationResult, CompileStage, RenderGraphCompiler};
use crate::executor::RenderGraphExecutor;
use crate::handle::{RenderPassHandle, ResourceHandle};
use crate::pass::{PassBuilder, PassKind, RenderPass};
use crate::registry::ResourceRegistry;
use crate::resource::{ImageDescription, ResourceDescription};
use crate::state::ResourceState;
use crate::{RenderGraphError, Result};

/// The embedder-facing facade. Owns the registry, the declared passes and
/// the current compilation; re-plans lazily whenever the declarations
/// change between frames.
pub struct RenderGraph {
    device: Arc<ash::Device>,
    registry: ResourceRegistry,
    passes: Vec<RenderPass>,
    frames_in_flight: usize,
    compiled: Option<CompilationResult>,
    executor: RenderGraphExecutor,
    frame_number: u64,
    frame_open: bool,
    dirty: bool,
}

impl RenderGraph {
    pub fn new(
        device: Arc<ash::Device>,
        allocator: Arc<Mutex<Allocator>>,
        frames_in_flight: usize,
    ) -> Self {
        assert!(frames_in_flight >= 1, "need at least one frame in flight");
        Self {
            registry: ResourceRegistry::new(device.clone(), allocator),
            executor: RenderGraphExecutor::new(device.clone()),
            device,
            passes: Vec::new(),
            frames_in_flight,
            compiled: None,
            frame_number: 0,
            frame_open: false,
            dirty: true,
        }
    }

    /// Declares a transient resource. Backing memory appears at compile
    /// time and may be shared with other transients whose lifetimes never
    /// overlap.
    pub fn create_resource(
        &mut self,
        name: impl Into<String>,
        description: ResourceDescription,
    ) -> ResourceHandle {
        self.dirty = true;
        self.registry.create_virtual_resource(name, description)
    }

    /// Wraps an externally owned image (typically a swapchain image) as a
    /// graph resource. The graph transitions its layout but never
    /// allocates or frees it.
    pub fn import_resource(
        &mut self,
        name: impl Into<String>,
        description: ImageDescription,
        image: vk::Image,
        view: vk::ImageView,
        initial_state: ResourceState,
    ) -> Result<ResourceHandle> {
        self.dirty = true;
        let handle = self
            .registry
            .create_virtual_resource(name, ResourceDescription::Image(description));
        self.registry
            .import_resource(handle, image, view, initial_state)?;
        Ok(handle)
    }

    /// Adds a pass. The setup closure declares resource usages and attaches
    /// the pipeline and execution callbacks; after it returns the pass is
    /// immutable.
    pub fn add_pass(
        &mut self,
        name: impl Into<String>,
        kind: PassKind,
        setup: impl FnOnce(&mut PassBuilder<'_>),
    ) -> RenderPassHandle {
        let handle = RenderPassHandle::new(self.passes.len() as u32);
        let mut pass = RenderPass::new(name, handle, kind);
        {
            let mut builder = PassBuilder {
                pass: &mut pass,
                registry: &self.registry,
            };
            setup(&mut builder);
        }
        log::debug!("added pass '{}' ({:?})", pass.name, kind);
        self.passes.push(pass);
        self.dirty = true;
        handle
    }

    /// Runs the full pipeline: planning, resource allocation, pipeline
    /// creation. On failure the previous successful compilation (if any)
    /// stays in effect.
    pub fn compile(&mut self) -> Result<()> {
        let mut result = RenderGraphCompiler::plan(&self.passes, self.registry.virtuals_mut());
        if result.failed() {
            let message = result
                .error_message
                .take()
                .unwrap_or_else(|| "unknown planning failure".into());
            log::error!("render graph compilation failed: {message}");
            return Err(RenderGraphError::CompilationFailed {
                stage: result.failed_during,
                message,
            });
        }

        self.registry.allocate_actual_resources(
            self.frames_in_flight,
            &result.alias_groups,
            self.frame_number,
        )?;
        result.stage = CompileStage::ResourcesAllocated;

        for pass in &mut self.passes {
            if let Err(err) = pass.compile(&self.device) {
                log::error!("pipeline creation failed for pass '{}': {err}", pass.name);
                return Err(RenderGraphError::PipelineCreation {
                    pass: pass.name.clone(),
                });
            }
        }
        result.stage = CompileStage::NativeObjectsCreated;

        result.stage = CompileStage::Compiled;
        log::info!(
            "compiled render graph: {} passes, {} barrier batches",
            result.execution_order.len(),
            result.barrier_batches.len(),
        );
        self.compiled = Some(result);
        self.dirty = false;
        Ok(())
    }

    pub fn begin_frame(&mut self) {
        assert!(
            !self.frame_open,
            "begin_frame called twice without end_frame"
        );
        self.frame_open = true;
    }

    /// Records the compiled graph into `cmd` for one frame in flight.
    /// Compiles implicitly when declarations changed since the last
    /// successful compile.
    pub fn execute(&mut self, cmd: vk::CommandBuffer, frame_index: usize) -> Result<()> {
        if frame_index >= self.frames_in_flight {
            return Err(RenderGraphError::FrameIndexOutOfRange {
                frame_index,
                frames_in_flight: self.frames_in_flight,
            });
        }
        if self.dirty || self.compiled.is_none() {
            self.compile()?;
        }
        match &self.compiled {
            Some(compiled) => self.executor.execute(
                compiled,
                &mut self.passes,
                &self.registry,
                cmd,
                frame_index,
            ),
            None => Err(RenderGraphError::CompilationFailed {
                stage: CompileStage::Uninitialized,
                message: "graph has never compiled successfully".into(),
            }),
        }
    }

    /// Advances the frame counter and frees retired backings whose
    /// retention window has elapsed.
    pub fn end_frame(&mut self) {
        assert!(self.frame_open, "end_frame without begin_frame");
        self.frame_open = false;
        self.frame_number += 1;
        self.registry.flush_retired(self.frame_number);
    }

    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    pub fn frames_in_flight(&self) -> usize {
        self.frames_in_flight
    }

    pub fn registry(&self) -> &ResourceRegistry {
        &self.registry
    }

    pub fn pass_count(&self) -> usize {
        self.passes.len()
    }

    /// Graphviz rendering of the dependency graph: passes are nodes, each
    /// edge is labeled with the resource carrying the dependency.
    pub fn export_to_dot(&mut self) -> String {
        let dependencies: Vec<Dependency> = match &self.compiled {
            Some(compiled) if !self.dirty => compiled.dependencies.clone(),
            _ => RenderGraphCompiler::plan(&self.passes, self.registry.virtuals_mut()).dependencies,
        };

        let mut graph: DiGraph<String, String> = DiGraph::new();
        let nodes: Vec<_> = self
            .passes
            .iter()
            .map(|pass| graph.add_node(pass.name.clone()))
            .collect();
        for dep in &dependencies {
            graph.add_edge(
                nodes[dep.producer.index()],
                nodes[dep.consumer.index()],
                self.registry.get_virtual_resource(dep.resource).name.clone(),
            );
        }
        format!("{}", petgraph::dot::Dot::new(&graph))
    }

    /// Human-readable summary of the last compilation, for logging and
    /// debug overlays.
    pub fn dump_compilation_info(&self) -> String {
        let Some(compiled) = &self.compiled else {
            return "render graph: not compiled".into();
        };

        let mut out = String::new();
        let _ = writeln!(out, "render graph ({:?})", compiled.stage);
        let _ = writeln!(out, "execution order:");
        for (position, &handle) in compiled.execution_order.iter().enumerate() {
            let pass = &self.passes[handle.index()];
            let barriers = compiled
                .barrier_batches
                .get(&handle)
                .map(|batch| batch.len())
                .unwrap_or(0);
            let _ = writeln!(
                out,
                "  {position}: {} ({:?}, {barriers} barriers)",
                pass.name, pass.kind
            );
        }
        if !compiled.alias_groups.is_empty() {
            let _ = writeln!(out, "alias groups:");
            for group in &compiled.alias_groups {
                let members: Vec<&str> = group
                    .members
                    .iter()
                    .map(|&member| self.registry.get_virtual_resource(member).name.as_str())
                    .collect();
                let _ = writeln!(
                    out,
                    "  [{}] ({} bytes)",
                    members.join(", "),
                    group.byte_size
                );
            }
        }
        if !compiled.unused_resources.is_empty() {
            let names: Vec<&str> = compiled
                .unused_resources
                .iter()
                .map(|&handle| self.registry.get_virtual_resource(handle).name.as_str())
                .collect();
            let _ = writeln!(out, "unused resources: {}", names.join(", "));
        }
        out
    }
}

impl Drop for RenderGraph {
    fn drop(&mut self) {
        // Pipelines are created through embedder callbacks but owned here.
        for pass in &self.passes {
            if let Some(pipeline) = pass.pipeline() {
                unsafe { self.device.destroy_pipeline(pipeline, None) };
            }
        }
    }
}
