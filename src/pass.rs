use ash::vk;

use crate::Result;
use crate::executor::RenderContext;
use crate::handle::{RenderPassHandle, ResourceHandle};
use crate::registry::ResourceRegistry;
use crate::state::ResourceState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassKind {
    Graphics,
    Compute,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorBinding {
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
}

/// One declared (pass, resource) edge: the state the pass needs the
/// resource in, plus an optional descriptor binding for the embedder's
/// descriptor layer.
#[derive(Debug, Clone, Copy)]
pub struct ResourceUsage {
    pub resource: ResourceHandle,
    pub stage: vk::PipelineStageFlags2,
    pub access: vk::AccessFlags2,
    pub layout: vk::ImageLayout,
    pub write: bool,
    pub binding: Option<DescriptorBinding>,
}

impl ResourceUsage {
    pub fn required_state(&self) -> ResourceState {
        ResourceState::new(self.stage, self.access, self.layout)
    }
}

/// Handed to a pass's pipeline-creation callback. The frame graph never
/// inspects what the callback builds; it only stores the resulting handle.
pub struct PipelineBuilder<'a> {
    pub device: &'a ash::Device,
    pub kind: PassKind,
}

pub type ExecuteFn = Box<dyn FnMut(vk::CommandBuffer, &RenderContext<'_>)>;
pub type PipelineFn = Box<dyn FnMut(&mut PipelineBuilder<'_>) -> Result<vk::Pipeline>>;

/// One unit of declared GPU work. Configured once through the setup
/// closure passed to `RenderGraph::add_pass`, then immutable.
pub struct RenderPass {
    pub name: String,
    pub handle: RenderPassHandle,
    pub kind: PassKind,
    pub usages: Vec<ResourceUsage>,
    pipeline_fn: Option<PipelineFn>,
    execute_fn: Option<ExecuteFn>,
    pipeline: Option<vk::Pipeline>,
}

impl RenderPass {
    pub(crate) fn new(name: impl Into<String>, handle: RenderPassHandle, kind: PassKind) -> Self {
        Self {
            name: name.into(),
            handle,
            kind,
            usages: Vec::new(),
            pipeline_fn: None,
            execute_fn: None,
            pipeline: None,
        }
    }

    /// Realizes the pass's native pipeline if a creation callback was set.
    /// Idempotent: a pipeline is built at most once.
    pub fn compile(&mut self, device: &ash::Device) -> Result<()> {
        if self.pipeline.is_some() {
            return Ok(());
        }
        if let Some(pipeline_fn) = self.pipeline_fn.as_mut() {
            let mut builder = PipelineBuilder {
                device,
                kind: self.kind,
            };
            self.pipeline = Some(pipeline_fn(&mut builder)?);
        }
        Ok(())
    }

    /// A pass with no execution callback is a legal barrier boundary;
    /// invoking it does nothing.
    pub fn execute(&mut self, cmd: vk::CommandBuffer, context: &RenderContext<'_>) {
        if let Some(execute_fn) = self.execute_fn.as_mut() {
            execute_fn(cmd, context);
        }
    }

    pub fn pipeline(&self) -> Option<vk::Pipeline> {
        self.pipeline
    }

    pub fn reads(&self) -> impl Iterator<Item = &ResourceUsage> {
        self.usages.iter().filter(|usage| !usage.write)
    }

    pub fn writes(&self) -> impl Iterator<Item = &ResourceUsage> {
        self.usages.iter().filter(|usage| usage.write)
    }

    pub(crate) fn push_usage(&mut self, usage: ResourceUsage) {
        self.usages.push(usage);
    }

    pub(crate) fn set_pipeline_fn(&mut self, pipeline_fn: PipelineFn) {
        self.pipeline_fn = Some(pipeline_fn);
    }

    pub(crate) fn set_execute_fn(&mut self, execute_fn: ExecuteFn) {
        self.execute_fn = Some(execute_fn);
    }
}

impl std::fmt::Debug for RenderPass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderPass")
            .field("name", &self.name)
            .field("handle", &self.handle)
            .field("kind", &self.kind)
            .field("usages", &self.usages.len())
            .field("has_pipeline", &self.pipeline.is_some())
            .finish()
    }
}

/// Declaration surface available inside the `add_pass` setup closure.
pub struct PassBuilder<'a> {
    pub(crate) pass: &'a mut RenderPass,
    pub(crate) registry: &'a ResourceRegistry,
}

impl PassBuilder<'_> {
    /// Plain read: `SHADER_READ_ONLY_OPTIMAL` layout with read access for
    /// images, stage/access only for buffers.
    pub fn declare_read(&mut self, resource: ResourceHandle, stage: vk::PipelineStageFlags2) {
        let layout = if self.is_buffer(resource) {
            vk::ImageLayout::UNDEFINED
        } else {
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        };
        self.pass.push_usage(ResourceUsage {
            resource,
            stage,
            access: vk::AccessFlags2::SHADER_READ,
            layout,
            write: false,
            binding: None,
        });
    }

    /// Write: `GENERAL` layout with write access.
    pub fn declare_write(&mut self, resource: ResourceHandle, stage: vk::PipelineStageFlags2) {
        let layout = if self.is_buffer(resource) {
            vk::ImageLayout::UNDEFINED
        } else {
            vk::ImageLayout::GENERAL
        };
        self.pass.push_usage(ResourceUsage {
            resource,
            stage,
            access: vk::AccessFlags2::SHADER_WRITE,
            layout,
            write: true,
            binding: None,
        });
    }

    /// Read-write: `GENERAL` layout with combined access.
    pub fn declare_read_write(&mut self, resource: ResourceHandle, stage: vk::PipelineStageFlags2) {
        let layout = if self.is_buffer(resource) {
            vk::ImageLayout::UNDEFINED
        } else {
            vk::ImageLayout::GENERAL
        };
        self.pass.push_usage(ResourceUsage {
            resource,
            stage,
            access: vk::AccessFlags2::SHADER_READ | vk::AccessFlags2::SHADER_WRITE,
            layout,
            write: true,
            binding: None,
        });
    }

    pub fn declare_read_binding(
        &mut self,
        resource: ResourceHandle,
        stage: vk::PipelineStageFlags2,
        binding: u32,
        descriptor_type: vk::DescriptorType,
    ) {
        self.declare_read(resource, stage);
        self.attach_binding(binding, descriptor_type);
    }

    pub fn declare_write_binding(
        &mut self,
        resource: ResourceHandle,
        stage: vk::PipelineStageFlags2,
        binding: u32,
        descriptor_type: vk::DescriptorType,
    ) {
        self.declare_write(resource, stage);
        self.attach_binding(binding, descriptor_type);
    }

    /// Overrides the declaration defaults for the most recent usage. Lets
    /// attachment-style passes ask for `COLOR_ATTACHMENT_OPTIMAL` instead
    /// of the generic write state.
    pub fn with_state(&mut self, state: ResourceState) {
        let is_buffer = match self.pass.usages.last() {
            Some(usage) => self.registry_is_buffer(usage.resource),
            None => return,
        };
        if let Some(usage) = self.pass.usages.last_mut() {
            usage.stage = state.stage;
            usage.access = state.access;
            if !is_buffer {
                usage.layout = state.layout;
            }
            usage.write = state.is_write();
        }
    }

    pub fn set_pipeline(
        &mut self,
        pipeline_fn: impl FnMut(&mut PipelineBuilder<'_>) -> Result<vk::Pipeline> + 'static,
    ) {
        self.pass.set_pipeline_fn(Box::new(pipeline_fn));
    }

    pub fn set_execute(
        &mut self,
        execute_fn: impl FnMut(vk::CommandBuffer, &RenderContext<'_>) + 'static,
    ) {
        self.pass.set_execute_fn(Box::new(execute_fn));
    }

    fn attach_binding(&mut self, binding: u32, descriptor_type: vk::DescriptorType) {
        if let Some(usage) = self.pass.usages.last_mut() {
            usage.binding = Some(DescriptorBinding {
                binding,
                descriptor_type,
            });
        }
    }

    fn is_buffer(&self, resource: ResourceHandle) -> bool {
        self.registry_is_buffer(resource)
    }

    fn registry_is_buffer(&self, resource: ResourceHandle) -> bool {
        self.registry
            .try_virtual_resource(resource)
            .is_some_and(|res| res.description.is_buffer())
    }
}
