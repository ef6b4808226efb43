use ash::vk;
use gpu_allocator::MemoryLocation;
use gpu_allocator::vulkan::Allocation;

use crate::handle::{RenderPassHandle, ResourceHandle};
use crate::state::ResourceState;

#[derive(Debug, Clone, PartialEq)]
pub struct ImageDescription {
    pub format: vk::Format,
    pub extent: vk::Extent3D,
    pub usage: vk::ImageUsageFlags,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub samples: vk::SampleCountFlags,
}

impl ImageDescription {
    pub fn color_target(format: vk::Format, width: u32, height: u32) -> Self {
        Self {
            format,
            extent: vk::Extent3D {
                width,
                height,
                depth: 1,
            },
            usage: vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::SAMPLED,
            mip_levels: 1,
            array_layers: 1,
            samples: vk::SampleCountFlags::TYPE_1,
        }
    }

    pub fn depth_target(format: vk::Format, width: u32, height: u32) -> Self {
        Self {
            format,
            extent: vk::Extent3D {
                width,
                height,
                depth: 1,
            },
            usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT | vk::ImageUsageFlags::SAMPLED,
            mip_levels: 1,
            array_layers: 1,
            samples: vk::SampleCountFlags::TYPE_1,
        }
    }

    pub fn aspect(&self) -> vk::ImageAspectFlags {
        infer_image_aspect(self.format)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BufferDescription {
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
    pub location: MemoryLocation,
}

impl BufferDescription {
    pub fn storage(size: vk::DeviceSize) -> Self {
        Self {
            size,
            usage: vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
            location: MemoryLocation::GpuOnly,
        }
    }
}

/// A resource is image-shaped or buffer-shaped, never both.
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceDescription {
    Image(ImageDescription),
    Buffer(BufferDescription),
}

impl ResourceDescription {
    pub fn is_image(&self) -> bool {
        matches!(self, Self::Image(_))
    }

    pub fn is_buffer(&self) -> bool {
        matches!(self, Self::Buffer(_))
    }

    pub fn as_image(&self) -> Option<&ImageDescription> {
        match self {
            Self::Image(desc) => Some(desc),
            Self::Buffer(_) => None,
        }
    }

    pub fn as_buffer(&self) -> Option<&BufferDescription> {
        match self {
            Self::Buffer(desc) => Some(desc),
            Self::Image(_) => None,
        }
    }

    pub fn byte_size(&self) -> u64 {
        match self {
            Self::Buffer(desc) => desc.size,
            Self::Image(desc) => {
                let texels = desc.extent.width as u64
                    * desc.extent.height as u64
                    * desc.extent.depth as u64
                    * desc.array_layers as u64;
                texels * format_texel_size(desc.format)
            }
        }
    }
}

/// Pass indices bounding the live range of a resource, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLifetime {
    pub first_use: usize,
    pub last_use: usize,
}

impl ResourceLifetime {
    pub fn disjoint(&self, other: &Self) -> bool {
        self.first_use > other.last_use || other.first_use > self.last_use
    }

    pub fn contains(&self, pass_index: usize) -> bool {
        self.first_use <= pass_index && pass_index <= self.last_use
    }
}

/// Logical resource, independent of any backing memory.
#[derive(Debug)]
pub struct VirtualResource {
    pub name: String,
    pub handle: ResourceHandle,
    pub description: ResourceDescription,
    pub lifetime: Option<ResourceLifetime>,
    pub readers: Vec<RenderPassHandle>,
    pub writers: Vec<RenderPassHandle>,
    pub imported: bool,
    pub transient: bool,
    pub initial_state: ResourceState,
    pub final_state: ResourceState,
}

impl VirtualResource {
    pub fn new(name: impl Into<String>, handle: ResourceHandle, desc: ResourceDescription) -> Self {
        Self {
            name: name.into(),
            handle,
            description: desc,
            lifetime: None,
            readers: Vec::new(),
            writers: Vec::new(),
            imported: false,
            transient: true,
            initial_state: ResourceState::UNDEFINED,
            final_state: ResourceState::UNDEFINED,
        }
    }

    /// Dropped and recomputed on every compile.
    pub(crate) fn reset_analysis(&mut self) {
        self.lifetime = None;
        self.readers.clear();
        self.writers.clear();
        self.final_state = self.initial_state;
    }
}

/// The native handle half of a physical resource. Tagged so the inactive
/// member can never be read; access goes through the checked getters.
#[derive(Debug, Clone, Copy)]
pub enum NativeResource {
    Image {
        image: vk::Image,
        view: vk::ImageView,
    },
    Buffer {
        buffer: vk::Buffer,
    },
}

impl NativeResource {
    pub fn image(&self) -> Option<vk::Image> {
        match self {
            Self::Image { image, .. } => Some(*image),
            Self::Buffer { .. } => None,
        }
    }

    pub fn image_view(&self) -> Option<vk::ImageView> {
        match self {
            Self::Image { view, .. } => Some(*view),
            Self::Buffer { .. } => None,
        }
    }

    pub fn buffer(&self) -> Option<vk::Buffer> {
        match self {
            Self::Buffer { buffer } => Some(*buffer),
            Self::Image { .. } => None,
        }
    }
}

/// One physical backing instance of a virtual resource for one frame in
/// flight. Imported resources have no allocation; the registry never owns
/// their memory.
#[derive(Debug)]
pub struct ActualResource {
    pub virtual_handle: ResourceHandle,
    pub frame_index: usize,
    pub native: NativeResource,
    pub allocation: Option<Allocation>,
}

pub fn infer_image_aspect(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D16_UNORM | vk::Format::D32_SFLOAT | vk::Format::X8_D24_UNORM_PACK32 => {
            vk::ImageAspectFlags::DEPTH
        }
        vk::Format::S8_UINT => vk::ImageAspectFlags::STENCIL,
        vk::Format::D16_UNORM_S8_UINT
        | vk::Format::D24_UNORM_S8_UINT
        | vk::Format::D32_SFLOAT_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        _ => vk::ImageAspectFlags::COLOR,
    }
}

fn format_texel_size(format: vk::Format) -> u64 {
    match format {
        vk::Format::R8_UNORM | vk::Format::R8_UINT | vk::Format::S8_UINT => 1,
        vk::Format::R8G8_UNORM | vk::Format::R16_SFLOAT | vk::Format::D16_UNORM => 2,
        vk::Format::R16G16B16A16_SFLOAT | vk::Format::R32G32_SFLOAT => 8,
        vk::Format::R32G32B32A32_SFLOAT => 16,
        vk::Format::D32_SFLOAT_S8_UINT => 5,
        // Covers the common 32-bit color and depth formats.
        _ => 4,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn description_is_image_xor_buffer() {
        let image = ResourceDescription::Image(ImageDescription::color_target(
            vk::Format::R8G8B8A8_UNORM,
            64,
            64,
        ));
        let buffer = ResourceDescription::Buffer(BufferDescription::storage(1024));
        assert!(image.is_image() && !image.is_buffer());
        assert!(buffer.is_buffer() && !buffer.is_image());
    }

    #[test]
    fn lifetime_disjointness() {
        let a = ResourceLifetime {
            first_use: 0,
            last_use: 2,
        };
        let b = ResourceLifetime {
            first_use: 3,
            last_use: 5,
        };
        let c = ResourceLifetime {
            first_use: 2,
            last_use: 4,
        };
        assert!(a.disjoint(&b));
        assert!(b.disjoint(&a));
        assert!(!a.disjoint(&c));
    }

    #[test]
    fn byte_size_accounts_for_extent_and_format() {
        let desc = ResourceDescription::Image(ImageDescription::color_target(
            vk::Format::R8G8B8A8_UNORM,
            16,
            16,
        ));
        assert_eq!(desc.byte_size(), 16 * 16 * 4);
        let buf = ResourceDescription::Buffer(BufferDescription::storage(4096));
        assert_eq!(buf.byte_size(), 4096);
    }

    #[test]
    fn depth_formats_get_depth_aspect() {
        assert_eq!(
            infer_image_aspect(vk::Format::D32_SFLOAT),
            vk::ImageAspectFlags::DEPTH
        );
        assert_eq!(
            infer_image_aspect(vk::Format::D24_UNORM_S8_UINT),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
        assert_eq!(
            infer_image_aspect(vk::Format::R8G8B8A8_UNORM),
            vk::ImageAspectFlags::COLOR
        );
    }
}
