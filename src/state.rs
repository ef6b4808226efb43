use ash::vk;

/// How a resource is accessed at one point in the frame: pipeline stage,
/// access mask and, for images, the layout the access requires.
///
/// Barrier generation works purely on diffs between two of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceState {
    pub stage: vk::PipelineStageFlags2,
    pub access: vk::AccessFlags2,
    pub layout: vk::ImageLayout,
}

impl Default for ResourceState {
    fn default() -> Self {
        Self::UNDEFINED
    }
}

impl ResourceState {
    pub const fn new(
        stage: vk::PipelineStageFlags2,
        access: vk::AccessFlags2,
        layout: vk::ImageLayout,
    ) -> Self {
        Self {
            stage,
            access,
            layout,
        }
    }

    pub const UNDEFINED: Self = Self::new(
        vk::PipelineStageFlags2::TOP_OF_PIPE,
        vk::AccessFlags2::NONE,
        vk::ImageLayout::UNDEFINED,
    );

    pub const PREINITIALIZED: Self = Self::new(
        vk::PipelineStageFlags2::HOST,
        vk::AccessFlags2::HOST_WRITE,
        vk::ImageLayout::PREINITIALIZED,
    );

    pub const GENERAL: Self = Self::new(
        vk::PipelineStageFlags2::ALL_COMMANDS,
        vk::AccessFlags2::from_raw(
            vk::AccessFlags2::MEMORY_READ.as_raw() | vk::AccessFlags2::MEMORY_WRITE.as_raw(),
        ),
        vk::ImageLayout::GENERAL,
    );

    pub const COLOR_ATTACHMENT: Self = Self::new(
        vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
        vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    );

    pub const DEPTH_ATTACHMENT: Self = Self::new(
        vk::PipelineStageFlags2::from_raw(
            vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS.as_raw()
                | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS.as_raw(),
        ),
        vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE,
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
    );

    pub const SHADER_READ: Self = Self::new(
        vk::PipelineStageFlags2::FRAGMENT_SHADER,
        vk::AccessFlags2::SHADER_SAMPLED_READ,
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
    );

    pub const STORAGE_READ_WRITE: Self = Self::new(
        vk::PipelineStageFlags2::COMPUTE_SHADER,
        vk::AccessFlags2::from_raw(
            vk::AccessFlags2::SHADER_STORAGE_READ.as_raw()
                | vk::AccessFlags2::SHADER_STORAGE_WRITE.as_raw(),
        ),
        vk::ImageLayout::GENERAL,
    );

    pub const TRANSFER_SRC: Self = Self::new(
        vk::PipelineStageFlags2::TRANSFER,
        vk::AccessFlags2::TRANSFER_READ,
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
    );

    pub const TRANSFER_DST: Self = Self::new(
        vk::PipelineStageFlags2::TRANSFER,
        vk::AccessFlags2::TRANSFER_WRITE,
        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
    );

    pub const PRESENT: Self = Self::new(
        vk::PipelineStageFlags2::BOTTOM_OF_PIPE,
        vk::AccessFlags2::NONE,
        vk::ImageLayout::PRESENT_SRC_KHR,
    );

    pub const VERTEX_BUFFER: Self = Self::new(
        vk::PipelineStageFlags2::VERTEX_INPUT,
        vk::AccessFlags2::VERTEX_ATTRIBUTE_READ,
        vk::ImageLayout::UNDEFINED,
    );

    pub const INDEX_BUFFER: Self = Self::new(
        vk::PipelineStageFlags2::INDEX_INPUT,
        vk::AccessFlags2::INDEX_READ,
        vk::ImageLayout::UNDEFINED,
    );

    pub const UNIFORM_READ: Self = Self::new(
        vk::PipelineStageFlags2::ALL_GRAPHICS,
        vk::AccessFlags2::UNIFORM_READ,
        vk::ImageLayout::UNDEFINED,
    );

    const WRITE_ACCESS: vk::AccessFlags2 = vk::AccessFlags2::from_raw(
        vk::AccessFlags2::SHADER_WRITE.as_raw()
            | vk::AccessFlags2::SHADER_STORAGE_WRITE.as_raw()
            | vk::AccessFlags2::COLOR_ATTACHMENT_WRITE.as_raw()
            | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE.as_raw()
            | vk::AccessFlags2::TRANSFER_WRITE.as_raw()
            | vk::AccessFlags2::HOST_WRITE.as_raw()
            | vk::AccessFlags2::MEMORY_WRITE.as_raw(),
    );

    pub fn is_write(&self) -> bool {
        self.access.intersects(Self::WRITE_ACCESS)
    }

    /// True when reaching `required` from `self` needs a barrier at all.
    pub fn needs_transition(&self, required: &Self) -> bool {
        self != required
    }

    /// Buffers carry no layout; two buffer states are equivalent when stage
    /// and access agree.
    pub fn buffer_equivalent(&self, other: &Self) -> bool {
        self.stage == other.stage && self.access == other.access
    }
}

/// Layout transitions the generator refuses to emit. A rejected transition
/// is a declaration bug in the calling code, logged and skipped.
pub fn is_valid_layout_transition(old: vk::ImageLayout, new: vk::ImageLayout) -> bool {
    if new == vk::ImageLayout::UNDEFINED || new == vk::ImageLayout::PREINITIALIZED {
        return false;
    }
    if old == vk::ImageLayout::PREINITIALIZED {
        // PREINITIALIZED data is only host-visible; it must first move into
        // a layout the device can consume.
        return matches!(
            new,
            vk::ImageLayout::GENERAL
                | vk::ImageLayout::TRANSFER_DST_OPTIMAL
                | vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        );
    }
    true
}
