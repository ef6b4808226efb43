use std::sync::Arc;

use ash::vk;

use crate::compiler::CompilationResult;
use crate::handle::ResourceHandle;
use crate::pass::RenderPass;
use crate::registry::ResourceRegistry;
use crate::{RenderGraphError, Result};

/// Read-only view handed to pass execution callbacks. Resolves virtual
/// handles to the physical objects backing them for the current frame.
pub struct RenderContext<'a> {
    pub frame_index: usize,
    registry: &'a ResourceRegistry,
}

impl<'a> RenderContext<'a> {
    pub(crate) fn new(registry: &'a ResourceRegistry, frame_index: usize) -> Self {
        Self {
            frame_index,
            registry,
        }
    }

    pub fn image(&self, handle: ResourceHandle) -> Result<vk::Image> {
        let actual = self.registry.resolve(handle, self.frame_index)?;
        actual
            .native
            .image()
            .ok_or_else(|| self.kind_mismatch("image", handle))
    }

    pub fn image_view(&self, handle: ResourceHandle) -> Result<vk::ImageView> {
        let actual = self.registry.resolve(handle, self.frame_index)?;
        actual
            .native
            .image_view()
            .ok_or_else(|| self.kind_mismatch("image_view", handle))
    }

    pub fn buffer(&self, handle: ResourceHandle) -> Result<vk::Buffer> {
        let actual = self.registry.resolve(handle, self.frame_index)?;
        actual
            .native
            .buffer()
            .ok_or_else(|| self.kind_mismatch("buffer", handle))
    }

    fn kind_mismatch(&self, operation: &'static str, handle: ResourceHandle) -> RenderGraphError {
        let resource = self.registry.get_virtual_resource(handle);
        RenderGraphError::ResourceKindMismatch {
            operation,
            actual_kind: if resource.description.is_buffer() {
                "buffer"
            } else {
                "image"
            },
            resource: resource.name.clone(),
        }
    }
}

/// Replays a compiled graph into a command buffer: for each pass in
/// execution order, record its barrier batch as one `vkCmdPipelineBarrier2`
/// call, then invoke the pass callback. Recording is strictly serial.
pub struct RenderGraphExecutor {
    device: Arc<ash::Device>,
}

impl RenderGraphExecutor {
    pub fn new(device: Arc<ash::Device>) -> Self {
        Self { device }
    }

    pub fn execute(
        &self,
        compiled: &CompilationResult,
        passes: &mut [RenderPass],
        registry: &ResourceRegistry,
        cmd: vk::CommandBuffer,
        frame_index: usize,
    ) -> Result<()> {
        for &pass_handle in &compiled.execution_order {
            if let Some(batch) = compiled.barrier_batches.get(&pass_handle) {
                let memory: Vec<vk::MemoryBarrier2<'_>> =
                    batch.memory.iter().map(|barrier| barrier.to_vk()).collect();

                let mut buffers = Vec::with_capacity(batch.buffers.len());
                for barrier in &batch.buffers {
                    let actual = registry.resolve(barrier.resource, frame_index)?;
                    let buffer = actual.native.buffer().ok_or_else(|| {
                        RenderGraphError::ResourceKindMismatch {
                            operation: "buffer barrier",
                            actual_kind: "image",
                            resource: registry.get_virtual_resource(barrier.resource).name.clone(),
                        }
                    })?;
                    buffers.push(barrier.to_vk(buffer));
                }

                let mut images = Vec::with_capacity(batch.images.len());
                for barrier in &batch.images {
                    let actual = registry.resolve(barrier.resource, frame_index)?;
                    let image = actual.native.image().ok_or_else(|| {
                        RenderGraphError::ResourceKindMismatch {
                            operation: "image barrier",
                            actual_kind: "buffer",
                            resource: registry.get_virtual_resource(barrier.resource).name.clone(),
                        }
                    })?;
                    images.push(barrier.to_vk(image));
                }

                let dependency_info = vk::DependencyInfo::default()
                    .memory_barriers(&memory)
                    .buffer_memory_barriers(&buffers)
                    .image_memory_barriers(&images);
                unsafe {
                    self.device.cmd_pipeline_barrier2(cmd, &dependency_info);
                }
            }

            let pass = &mut passes[pass_handle.index()];
            log::trace!("executing pass '{}'", pass.name);
            let context = RenderContext::new(registry, frame_index);
            pass.execute(cmd, &context);
        }
        Ok(())
    }
}
