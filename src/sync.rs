use std::collections::HashMap;

use ash::vk;

use crate::analyzer::AnalysisResult;
use crate::handle::{RenderPassHandle, ResourceHandle};
use crate::pass::RenderPass;
use crate::resource::{VirtualResource, infer_image_aspect};
use crate::state::{ResourceState, is_valid_layout_transition};

/// Barrier descriptors carry handles, not native objects; the executor
/// resolves them against the registry when recording.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImageBarrier {
    pub resource: ResourceHandle,
    pub src: ResourceState,
    pub dst: ResourceState,
    pub aspect: vk::ImageAspectFlags,
}

impl ImageBarrier {
    pub fn is_noop(&self) -> bool {
        self.src.layout == self.dst.layout && self.src.access == self.dst.access
    }

    pub fn to_vk(&self, image: vk::Image) -> vk::ImageMemoryBarrier2<'static> {
        vk::ImageMemoryBarrier2::default()
            .src_stage_mask(self.src.stage)
            .src_access_mask(self.src.access)
            .dst_stage_mask(self.dst.stage)
            .dst_access_mask(self.dst.access)
            .old_layout(self.src.layout)
            .new_layout(self.dst.layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: self.aspect,
                base_mip_level: 0,
                level_count: vk::REMAINING_MIP_LEVELS,
                base_array_layer: 0,
                layer_count: vk::REMAINING_ARRAY_LAYERS,
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BufferBarrier {
    pub resource: ResourceHandle,
    pub src: ResourceState,
    pub dst: ResourceState,
}

impl BufferBarrier {
    pub fn is_noop(&self) -> bool {
        self.src.buffer_equivalent(&self.dst)
    }

    pub fn to_vk(&self, buffer: vk::Buffer) -> vk::BufferMemoryBarrier2<'static> {
        vk::BufferMemoryBarrier2::default()
            .src_stage_mask(self.src.stage)
            .src_access_mask(self.src.access)
            .dst_stage_mask(self.dst.stage)
            .dst_access_mask(self.dst.access)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .buffer(buffer)
            .offset(0)
            .size(vk::WHOLE_SIZE)
    }
}

/// Coarse execution dependency for access classes the image/buffer
/// barriers do not fully express.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemoryBarrier {
    pub src_stage: vk::PipelineStageFlags2,
    pub src_access: vk::AccessFlags2,
    pub dst_stage: vk::PipelineStageFlags2,
    pub dst_access: vk::AccessFlags2,
}

impl MemoryBarrier {
    pub fn is_noop(&self) -> bool {
        self.src_stage == self.dst_stage && self.src_access == self.dst_access
    }

    pub fn to_vk(&self) -> vk::MemoryBarrier2<'static> {
        vk::MemoryBarrier2::default()
            .src_stage_mask(self.src_stage)
            .src_access_mask(self.src_access)
            .dst_stage_mask(self.dst_stage)
            .dst_access_mask(self.dst_access)
    }
}

/// Everything to insert immediately before one pass. Ordering within a
/// batch is unspecified; it is submitted as a single pipeline-barrier
/// call, never split.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BarrierBatch {
    pub memory: Vec<MemoryBarrier>,
    pub buffers: Vec<BufferBarrier>,
    pub images: Vec<ImageBarrier>,
}

impl BarrierBatch {
    pub fn is_empty(&self) -> bool {
        self.memory.is_empty() && self.buffers.is_empty() && self.images.is_empty()
    }

    pub fn len(&self) -> usize {
        self.memory.len() + self.buffers.len() + self.images.len()
    }
}

/// Per-resource state as of the pass currently being walked. Writer
/// bookkeeping lives on `VirtualResource` (filled in by the analyzer);
/// the tracker only carries the state diff.
struct ResourceStateTracker {
    states: HashMap<ResourceHandle, ResourceState>,
}

impl ResourceStateTracker {
    fn new(resources: &[VirtualResource]) -> Self {
        let states = resources
            .iter()
            .map(|resource| (resource.handle, resource.initial_state))
            .collect();
        Self { states }
    }

    fn current(&self, handle: ResourceHandle) -> ResourceState {
        self.states.get(&handle).copied().unwrap_or_default()
    }

    fn transition(&mut self, handle: ResourceHandle, state: ResourceState) {
        self.states.insert(handle, state);
    }
}

pub struct SynchronizationGenerator;

impl SynchronizationGenerator {
    /// Walks the execution order diffing each usage's required state
    /// against the tracked state and emits the minimal barrier set.
    /// Resources' `final_state` is left at whatever state the last pass
    /// put them in.
    pub fn generate_synchronization(
        analysis: &AnalysisResult,
        passes: &[RenderPass],
        resources: &mut [VirtualResource],
    ) -> HashMap<RenderPassHandle, BarrierBatch> {
        let mut tracker = ResourceStateTracker::new(resources);
        let mut batches: HashMap<RenderPassHandle, BarrierBatch> = HashMap::new();

        for &pass_handle in &analysis.execution_order {
            let pass = &passes[pass_handle.index()];
            let mut batch = BarrierBatch::default();

            for usage in &pass.usages {
                let Some(resource) = resources.get(usage.resource.index()) else {
                    continue;
                };
                let required = usage.required_state();
                let current = tracker.current(usage.resource);

                if resource.description.is_image() {
                    if !current.needs_transition(&required) {
                        continue;
                    }
                    if !is_valid_layout_transition(current.layout, required.layout) {
                        log::warn!(
                            "pass '{}': invalid layout transition {:?} -> {:?} for '{}', skipping",
                            pass.name,
                            current.layout,
                            required.layout,
                            resource.name,
                        );
                        continue;
                    }
                    let aspect = resource
                        .description
                        .as_image()
                        .map(|desc| infer_image_aspect(desc.format))
                        .unwrap_or(vk::ImageAspectFlags::COLOR);
                    log::trace!(
                        "pass '{}': image barrier for '{}' {:?} -> {:?}",
                        pass.name,
                        resource.name,
                        current.layout,
                        required.layout,
                    );
                    batch.images.push(ImageBarrier {
                        resource: usage.resource,
                        src: current,
                        dst: required,
                        aspect,
                    });
                } else {
                    if current.buffer_equivalent(&required) {
                        continue;
                    }
                    batch.buffers.push(BufferBarrier {
                        resource: usage.resource,
                        src: current,
                        dst: required,
                    });
                }

                if current.stage != required.stage
                    && (current.access != vk::AccessFlags2::NONE
                        || required.access != vk::AccessFlags2::NONE)
                {
                    batch.memory.push(MemoryBarrier {
                        src_stage: current.stage,
                        src_access: current.access,
                        dst_stage: required.stage,
                        dst_access: required.access,
                    });
                }

                tracker.transition(usage.resource, required);
            }

            Self::optimize_barriers(&mut batch);
            if !batch.is_empty() {
                batches.insert(pass_handle, batch);
            }
        }

        for resource in resources.iter_mut() {
            resource.final_state = tracker.current(resource.handle);
        }

        batches
    }

    /// Drops structural no-ops and trims the hand-off transitions:
    /// `UNDEFINED -> X` has no prior contents to make visible, and
    /// `X -> PRESENT` has no device-side consumer to make them visible to.
    pub fn optimize_barriers(batch: &mut BarrierBatch) {
        batch.images.retain(|barrier| !barrier.is_noop());
        batch.buffers.retain(|barrier| !barrier.is_noop());
        batch.memory.retain(|barrier| !barrier.is_noop());

        for barrier in &mut batch.images {
            if barrier.src.layout == vk::ImageLayout::UNDEFINED {
                barrier.src.access = vk::AccessFlags2::NONE;
            }
            if barrier.dst.layout == vk::ImageLayout::PRESENT_SRC_KHR {
                barrier.dst.access = vk::AccessFlags2::NONE;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::GraphAnalyzer;
    use crate::pass::{PassKind, ResourceUsage};
    use crate::resource::{BufferDescription, ImageDescription, ResourceDescription};

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

    fn buffer_resource(name: &str, index: u32) -> VirtualResource {
        VirtualResource::new(
            name,
            ResourceHandle::new(index),
            ResourceDescription::Buffer(BufferDescription::storage(1024)),
        )
    }

    fn pass(name: &str, index: u32) -> RenderPass {
        RenderPass::new(name, RenderPassHandle::new(index), PassKind::Graphics)
    }

    fn usage(resource: &VirtualResource, state: ResourceState, write: bool) -> ResourceUsage {
        ResourceUsage {
            resource: resource.handle,
            stage: state.stage,
            access: state.access,
            layout: state.layout,
            write,
            binding: None,
        }
    }

    fn analyze(
        passes: &[RenderPass],
        resources: &mut [VirtualResource],
    ) -> crate::analyzer::AnalysisResult {
        GraphAnalyzer::compute_resource_lifetimes(passes, resources);
        GraphAnalyzer::analyze_graph(passes, resources)
    }

    #[test]
    fn write_read_write_emits_both_transitions() {
        let target = image_resource("target", 0);
        let mut a = pass("a", 0);
        a.push_usage(usage(&target, ResourceState::COLOR_ATTACHMENT, true));
        let mut b = pass("b", 1);
        b.push_usage(usage(&target, ResourceState::SHADER_READ, false));
        let mut c = pass("c", 2);
        c.push_usage(usage(&target, ResourceState::COLOR_ATTACHMENT, true));

        let passes = vec![a, b, c];
        let mut resources = vec![target];
        let analysis = analyze(&passes, &mut resources);
        assert_eq!(
            analysis.execution_order,
            vec![
                RenderPassHandle::new(0),
                RenderPassHandle::new(1),
                RenderPassHandle::new(2)
            ]
        );

        let batches =
            SynchronizationGenerator::generate_synchronization(&analysis, &passes, &mut resources);

        let before_b = &batches[&RenderPassHandle::new(1)];
        assert_eq!(before_b.images.len(), 1);
        assert_eq!(
            before_b.images[0].src.layout,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
        );
        assert_eq!(
            before_b.images[0].dst.layout,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        );

        let before_c = &batches[&RenderPassHandle::new(2)];
        assert_eq!(before_c.images.len(), 1);
        assert_eq!(
            before_c.images[0].src.layout,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        );
        assert_eq!(
            before_c.images[0].dst.layout,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
        );
    }

    #[test]
    fn identical_consecutive_usages_emit_nothing() {
        let target = image_resource("target", 0);
        let mut writer = pass("writer", 0);
        writer.push_usage(usage(&target, ResourceState::COLOR_ATTACHMENT, true));
        let mut reader_a = pass("reader_a", 1);
        reader_a.push_usage(usage(&target, ResourceState::SHADER_READ, false));
        let mut reader_b = pass("reader_b", 2);
        reader_b.push_usage(usage(&target, ResourceState::SHADER_READ, false));

        let passes = vec![writer, reader_a, reader_b];
        let mut resources = vec![target];
        let analysis = analyze(&passes, &mut resources);
        let batches =
            SynchronizationGenerator::generate_synchronization(&analysis, &passes, &mut resources);

        assert!(batches.contains_key(&RenderPassHandle::new(1)));
        assert!(!batches.contains_key(&RenderPassHandle::new(2)));
    }

    #[test]
    fn generation_is_deterministic() {
        let target = image_resource("target", 0);
        let mut writer = pass("writer", 0);
        writer.push_usage(usage(&target, ResourceState::COLOR_ATTACHMENT, true));
        let mut reader = pass("reader", 1);
        reader.push_usage(usage(&target, ResourceState::SHADER_READ, false));

        let passes = vec![writer, reader];
        let mut resources = vec![target];
        let analysis = analyze(&passes, &mut resources);

        let first =
            SynchronizationGenerator::generate_synchronization(&analysis, &passes, &mut resources);
        let second =
            SynchronizationGenerator::generate_synchronization(&analysis, &passes, &mut resources);
        assert_eq!(first, second);
    }

    #[test]
    fn invalid_transitions_are_skipped() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut staging = image_resource("staging", 0);
        staging.initial_state = ResourceState::PREINITIALIZED;
        let mut writer = pass("writer", 0);
        // COLOR_ATTACHMENT_OPTIMAL is not reachable from PREINITIALIZED.
        writer.push_usage(usage(&staging, ResourceState::COLOR_ATTACHMENT, true));

        let passes = vec![writer];
        let mut resources = vec![staging];
        let analysis = analyze(&passes, &mut resources);
        let batches =
            SynchronizationGenerator::generate_synchronization(&analysis, &passes, &mut resources);

        assert!(batches.is_empty());
        // The tracked state must not advance past a skipped transition.
        assert_eq!(
            resources[0].final_state.layout,
            vk::ImageLayout::PREINITIALIZED
        );
    }

    #[test]
    fn buffer_usage_emits_buffer_and_memory_barriers() {
        let data = buffer_resource("data", 0);
        let mut producer = pass("producer", 0);
        producer.push_usage(ResourceUsage {
            resource: data.handle,
            stage: vk::PipelineStageFlags2::COMPUTE_SHADER,
            access: vk::AccessFlags2::SHADER_STORAGE_WRITE,
            layout: vk::ImageLayout::UNDEFINED,
            write: true,
            binding: None,
        });
        let mut consumer = pass("consumer", 1);
        consumer.push_usage(ResourceUsage {
            resource: data.handle,
            stage: vk::PipelineStageFlags2::VERTEX_SHADER,
            access: vk::AccessFlags2::SHADER_STORAGE_READ,
            layout: vk::ImageLayout::UNDEFINED,
            write: false,
            binding: None,
        });

        let passes = vec![producer, consumer];
        let mut resources = vec![data];
        let analysis = analyze(&passes, &mut resources);
        let batches =
            SynchronizationGenerator::generate_synchronization(&analysis, &passes, &mut resources);

        let before_consumer = &batches[&RenderPassHandle::new(1)];
        assert_eq!(before_consumer.buffers.len(), 1);
        assert!(before_consumer.images.is_empty());
        // Stages differ and both sides have access bits, so the coarse
        // memory barrier rides along.
        assert_eq!(before_consumer.memory.len(), 1);
        assert_eq!(
            before_consumer.memory[0].src_stage,
            vk::PipelineStageFlags2::COMPUTE_SHADER
        );
    }

    #[test]
    fn optimize_clears_handoff_access_masks() {
        let mut batch = BarrierBatch::default();
        batch.images.push(ImageBarrier {
            resource: ResourceHandle::new(0),
            src: ResourceState::new(
                vk::PipelineStageFlags2::TOP_OF_PIPE,
                vk::AccessFlags2::MEMORY_READ,
                vk::ImageLayout::UNDEFINED,
            ),
            dst: ResourceState::COLOR_ATTACHMENT,
            aspect: vk::ImageAspectFlags::COLOR,
        });
        batch.images.push(ImageBarrier {
            resource: ResourceHandle::new(1),
            src: ResourceState::COLOR_ATTACHMENT,
            dst: ResourceState::new(
                vk::PipelineStageFlags2::BOTTOM_OF_PIPE,
                vk::AccessFlags2::MEMORY_READ,
                vk::ImageLayout::PRESENT_SRC_KHR,
            ),
            aspect: vk::ImageAspectFlags::COLOR,
        });

        SynchronizationGenerator::optimize_barriers(&mut batch);

        assert_eq!(batch.images[0].src.access, vk::AccessFlags2::NONE);
        assert_eq!(batch.images[1].dst.access, vk::AccessFlags2::NONE);
    }

    #[test]
    fn optimize_drops_structural_noops() {
        let mut batch = BarrierBatch::default();
        batch.images.push(ImageBarrier {
            resource: ResourceHandle::new(0),
            src: ResourceState::SHADER_READ,
            dst: ResourceState::new(
                vk::PipelineStageFlags2::COMPUTE_SHADER,
                vk::AccessFlags2::SHADER_SAMPLED_READ,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            ),
            aspect: vk::ImageAspectFlags::COLOR,
        });
        batch.memory.push(MemoryBarrier {
            src_stage: vk::PipelineStageFlags2::TRANSFER,
            src_access: vk::AccessFlags2::TRANSFER_WRITE,
            dst_stage: vk::PipelineStageFlags2::TRANSFER,
            dst_access: vk::AccessFlags2::TRANSFER_WRITE,
        });

        SynchronizationGenerator::optimize_barriers(&mut batch);
        assert!(batch.is_empty());
    }
}
