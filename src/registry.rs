use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator};

use crate::analyzer::ResourceAliasGroup;
use crate::handle::ResourceHandle;
use crate::resource::{
    ActualResource, BufferDescription, ImageDescription, NativeResource, ResourceDescription,
    VirtualResource,
};
use crate::state::ResourceState;
use crate::{RenderGraphError, Result};

/// Frames a retired physical resource is kept alive after replacement, so
/// command buffers still in flight never see freed memory.
const RETIRE_FRAMES: u64 = 3;

/// Owns the mapping from virtual resources to their per-frame physical
/// backings. The registry is the sole mutator of physical resource
/// lifetime; everything else sees read-only views.
pub struct ResourceRegistry {
    device: Arc<ash::Device>,
    allocator: Arc<Mutex<Allocator>>,
    virtuals: Vec<VirtualResource>,
    actuals: HashMap<(ResourceHandle, usize), ActualResource>,
    group_backings: HashMap<(usize, usize), ActualResource>,
    alias_of: HashMap<ResourceHandle, usize>,
    retired: Vec<(u64, ActualResource)>,
}

impl ResourceRegistry {
    pub fn new(device: Arc<ash::Device>, allocator: Arc<Mutex<Allocator>>) -> Self {
        Self {
            device,
            allocator,
            virtuals: Vec::new(),
            actuals: HashMap::new(),
            group_backings: HashMap::new(),
            alias_of: HashMap::new(),
            retired: Vec::new(),
        }
    }

    /// Registers a new virtual resource and returns its stable handle.
    /// Never fails; physical realization happens at compile time.
    pub fn create_virtual_resource(
        &mut self,
        name: impl Into<String>,
        description: ResourceDescription,
    ) -> ResourceHandle {
        let handle = ResourceHandle::new(self.virtuals.len() as u32);
        self.virtuals
            .push(VirtualResource::new(name, handle, description));
        handle
    }

    /// Marks a resource as externally owned (e.g. a swapchain image) and
    /// attaches its native handles. The registry never creates or destroys
    /// memory for imported resources; the single attached backing is
    /// shared across all frame indices.
    pub fn import_resource(
        &mut self,
        handle: ResourceHandle,
        image: vk::Image,
        view: vk::ImageView,
        initial_state: ResourceState,
    ) -> Result<()> {
        let resource = self
            .virtuals
            .get_mut(handle.index())
            .ok_or(RenderGraphError::UnknownResource { handle })?;
        if resource.description.is_buffer() {
            return Err(RenderGraphError::ImportRejected {
                resource: resource.name.clone(),
                reason: "buffer-shaped resources cannot be imported as images".into(),
            });
        }
        resource.imported = true;
        resource.transient = false;
        resource.initial_state = initial_state;
        resource.final_state = initial_state;
        self.actuals.insert(
            (handle, 0),
            ActualResource {
                virtual_handle: handle,
                frame_index: 0,
                native: NativeResource::Image { image, view },
                allocation: None,
            },
        );
        Ok(())
    }

    /// Realizes physical backings: one per frame for every non-transient,
    /// non-imported resource, and one shared backing per alias group per
    /// frame for transients. Any creation failure rolls the registry back
    /// to the pre-call (empty) state.
    pub fn allocate_actual_resources(
        &mut self,
        frames_in_flight: usize,
        alias_groups: &[ResourceAliasGroup],
        frame_number: u64,
    ) -> Result<()> {
        self.destroy_actual_resources(frame_number);

        let mut created: Vec<ActualResource> = Vec::new();
        let mut failure: Option<RenderGraphError> = None;

        'outer: for resource in &self.virtuals {
            if resource.transient || resource.imported {
                continue;
            }
            for frame_index in 0..frames_in_flight {
                match self.create_backing(&resource.description, &resource.name, frame_index) {
                    Ok((native, allocation)) => created.push(ActualResource {
                        virtual_handle: resource.handle,
                        frame_index,
                        native,
                        allocation: Some(allocation),
                    }),
                    Err(err) => {
                        failure = Some(err);
                        break 'outer;
                    }
                }
            }
        }

        let mut group_created: Vec<(usize, ActualResource)> = Vec::new();
        if failure.is_none() {
            'groups: for (group_index, group) in alias_groups.iter().enumerate() {
                let representative = group
                    .members
                    .first()
                    .and_then(|&member| self.virtuals.get(member.index()));
                let Some(representative) = representative else {
                    continue;
                };
                for frame_index in 0..frames_in_flight {
                    match self.create_backing(
                        &representative.description,
                        &format!("alias_group_{group_index}"),
                        frame_index,
                    ) {
                        Ok((native, allocation)) => group_created.push((
                            group_index,
                            ActualResource {
                                virtual_handle: representative.handle,
                                frame_index,
                                native,
                                allocation: Some(allocation),
                            },
                        )),
                        Err(err) => {
                            failure = Some(err);
                            break 'groups;
                        }
                    }
                }
            }
        }

        if let Some(err) = failure {
            // Retries must start clean: everything created in this call is
            // freed immediately (never visible to the GPU).
            for actual in created {
                self.destroy_backing(actual);
            }
            for (_, actual) in group_created {
                self.destroy_backing(actual);
            }
            return Err(err);
        }

        for actual in created {
            self.actuals
                .insert((actual.virtual_handle, actual.frame_index), actual);
        }
        for (group_index, actual) in group_created {
            self.group_backings
                .insert((group_index, actual.frame_index), actual);
        }
        for (group_index, group) in alias_groups.iter().enumerate() {
            for &member in &group.members {
                self.alias_of.insert(member, group_index);
            }
        }
        Ok(())
    }

    /// Idempotent teardown of every registry-owned physical resource.
    /// Owned backings are retired rather than freed on the spot; imported
    /// backings carry no allocation, are not ours to destroy, and stay
    /// attached so they survive recompilation.
    pub fn destroy_actual_resources(&mut self, frame_number: u64) {
        Self::retire_owned(&mut self.actuals, &mut self.retired, frame_number);
        let backings = std::mem::take(&mut self.group_backings);
        for (_, actual) in backings {
            self.retired.push((frame_number, actual));
        }
        self.alias_of.clear();
    }

    /// Moves allocation-owning entries into the retire queue and keeps
    /// everything else (imported backings) in place.
    fn retire_owned(
        actuals: &mut HashMap<(ResourceHandle, usize), ActualResource>,
        retired: &mut Vec<(u64, ActualResource)>,
        frame_number: u64,
    ) {
        let taken = std::mem::take(actuals);
        for (key, actual) in taken {
            if actual.allocation.is_some() {
                retired.push((frame_number, actual));
            } else {
                actuals.insert(key, actual);
            }
        }
    }

    /// Frees retired backings whose retention window has elapsed. Called
    /// once per frame from `end_frame`.
    pub fn flush_retired(&mut self, frame_number: u64) {
        let mut keep = Vec::new();
        for (retired_at, actual) in self.retired.drain(..) {
            if frame_number >= retired_at + RETIRE_FRAMES {
                Self::destroy_backing_with(&self.device, &self.allocator, actual);
            } else {
                keep.push((retired_at, actual));
            }
        }
        self.retired = keep;
    }

    /// Frees everything immediately. Only safe once the device is idle.
    pub fn flush_all(&mut self) {
        for (_, actual) in std::mem::take(&mut self.retired) {
            Self::destroy_backing_with(&self.device, &self.allocator, actual);
        }
    }

    /// Fail-fast accessor; handles are only ever obtained from this
    /// registry, so an invalid one is a caller bug, not a runtime error.
    pub fn get_virtual_resource(&self, handle: ResourceHandle) -> &VirtualResource {
        assert!(handle.is_valid(), "invalid resource handle");
        &self.virtuals[handle.index()]
    }

    pub fn try_virtual_resource(&self, handle: ResourceHandle) -> Option<&VirtualResource> {
        self.virtuals.get(handle.index())
    }

    /// Fail-fast accessor, see `get_virtual_resource`.
    pub fn get_actual_resource(
        &self,
        handle: ResourceHandle,
        frame_index: usize,
    ) -> &ActualResource {
        let actual = self
            .resolve(handle, frame_index)
            .expect("no physical backing; was the graph compiled?");
        assert_eq!(
            actual.frame_index,
            if self.get_virtual_resource(handle).imported {
                0
            } else {
                frame_index
            },
            "frame index mismatch"
        );
        actual
    }

    /// Resolves a handle to this frame's physical backing: imported
    /// resources share one backing, non-transients are frame-indexed,
    /// transients go through their alias group.
    pub fn resolve(&self, handle: ResourceHandle, frame_index: usize) -> Result<&ActualResource> {
        let resource = self
            .try_virtual_resource(handle)
            .ok_or(RenderGraphError::UnknownResource { handle })?;
        Self::lookup_backing(
            &self.actuals,
            &self.group_backings,
            &self.alias_of,
            resource,
            frame_index,
        )
        .ok_or_else(|| RenderGraphError::ResourceNotRealized {
            resource: resource.name.clone(),
            frame_index,
        })
    }

    fn lookup_backing<'a>(
        actuals: &'a HashMap<(ResourceHandle, usize), ActualResource>,
        group_backings: &'a HashMap<(usize, usize), ActualResource>,
        alias_of: &HashMap<ResourceHandle, usize>,
        resource: &VirtualResource,
        frame_index: usize,
    ) -> Option<&'a ActualResource> {
        if resource.imported {
            actuals.get(&(resource.handle, 0))
        } else if !resource.transient {
            actuals.get(&(resource.handle, frame_index))
        } else {
            alias_of
                .get(&resource.handle)
                .and_then(|&group| group_backings.get(&(group, frame_index)))
        }
    }

    pub fn virtuals(&self) -> &[VirtualResource] {
        &self.virtuals
    }

    pub fn virtuals_mut(&mut self) -> &mut [VirtualResource] {
        &mut self.virtuals
    }

    pub fn resource_count(&self) -> usize {
        self.virtuals.len()
    }

    fn create_backing(
        &self,
        description: &ResourceDescription,
        name: &str,
        frame_index: usize,
    ) -> Result<(NativeResource, Allocation)> {
        match description {
            ResourceDescription::Image(desc) => self.create_image(desc, name, frame_index),
            ResourceDescription::Buffer(desc) => self.create_buffer(desc, name, frame_index),
        }
    }

    fn create_image(
        &self,
        desc: &ImageDescription,
        name: &str,
        frame_index: usize,
    ) -> Result<(NativeResource, Allocation)> {
        let image = {
            let info = vk::ImageCreateInfo::default()
                .image_type(vk::ImageType::TYPE_2D)
                .format(desc.format)
                .extent(desc.extent)
                .mip_levels(desc.mip_levels)
                .array_layers(desc.array_layers)
                .samples(desc.samples)
                .tiling(vk::ImageTiling::OPTIMAL)
                .usage(desc.usage)
                .sharing_mode(vk::SharingMode::EXCLUSIVE)
                .initial_layout(vk::ImageLayout::UNDEFINED);
            unsafe { self.device.create_image(&info, None)? }
        };

        let requirements = unsafe { self.device.get_image_memory_requirements(image) };
        let allocation = self.lock_allocator().allocate(&AllocationCreateDesc {
            name: &format!("{name}[{frame_index}]"),
            requirements,
            location: gpu_allocator::MemoryLocation::GpuOnly,
            linear: false,
            allocation_scheme: AllocationScheme::DedicatedImage(image),
        });
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(err) => {
                unsafe { self.device.destroy_image(image, None) };
                return Err(err.into());
            }
        };
        if let Err(err) = unsafe {
            self.device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
        } {
            let _ = self.lock_allocator().free(allocation);
            unsafe { self.device.destroy_image(image, None) };
            return Err(err.into());
        }

        let view = {
            let info = vk::ImageViewCreateInfo::default()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(desc.format)
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: desc.aspect(),
                    base_mip_level: 0,
                    level_count: desc.mip_levels,
                    base_array_layer: 0,
                    layer_count: desc.array_layers,
                });
            match unsafe { self.device.create_image_view(&info, None) } {
                Ok(view) => view,
                Err(err) => {
                    let _ = self.lock_allocator().free(allocation);
                    unsafe { self.device.destroy_image(image, None) };
                    return Err(err.into());
                }
            }
        };

        Ok((NativeResource::Image { image, view }, allocation))
    }

    fn create_buffer(
        &self,
        desc: &BufferDescription,
        name: &str,
        frame_index: usize,
    ) -> Result<(NativeResource, Allocation)> {
        let buffer = {
            let info = vk::BufferCreateInfo {
                size: desc.size,
                usage: desc.usage,
                sharing_mode: vk::SharingMode::EXCLUSIVE,
                ..Default::default()
            };
            unsafe { self.device.create_buffer(&info, None)? }
        };

        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };
        let allocation = self.lock_allocator().allocate(&AllocationCreateDesc {
            name: &format!("{name}[{frame_index}]"),
            requirements,
            location: desc.location,
            linear: true,
            allocation_scheme: AllocationScheme::DedicatedBuffer(buffer),
        });
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(err) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(err.into());
            }
        };
        if let Err(err) = unsafe {
            self.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        } {
            let _ = self.lock_allocator().free(allocation);
            unsafe { self.device.destroy_buffer(buffer, None) };
            return Err(err.into());
        }

        Ok((NativeResource::Buffer { buffer }, allocation))
    }

    fn destroy_backing(&self, actual: ActualResource) {
        Self::destroy_backing_with(&self.device, &self.allocator, actual);
    }

    fn destroy_backing_with(
        device: &ash::Device,
        allocator: &Mutex<Allocator>,
        actual: ActualResource,
    ) {
        // Imported backings carry no allocation and are not ours to free.
        let Some(allocation) = actual.allocation else {
            return;
        };
        unsafe {
            match actual.native {
                NativeResource::Image { image, view } => {
                    device.destroy_image_view(view, None);
                    device.destroy_image(image, None);
                }
                NativeResource::Buffer { buffer } => {
                    device.destroy_buffer(buffer, None);
                }
            }
        }
        if let Err(err) = allocator
            .lock()
            .expect("allocator mutex poisoned")
            .free(allocation)
        {
            log::warn!("failed to free retired allocation: {err}");
        }
    }

    fn lock_allocator(&self) -> MutexGuard<'_, Allocator> {
        self.allocator.lock().expect("allocator mutex poisoned")
    }
}

impl Drop for ResourceRegistry {
    fn drop(&mut self) {
        self.destroy_actual_resources(0);
        self.flush_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::ImageDescription;

    fn swapchain_resource(index: u32) -> VirtualResource {
        let mut resource = VirtualResource::new(
            "swapchain",
            ResourceHandle::new(index),
            ResourceDescription::Image(ImageDescription::color_target(
                vk::Format::B8G8R8A8_UNORM,
                64,
                64,
            )),
        );
        resource.imported = true;
        resource.transient = false;
        resource
    }

    fn imported_backing(handle: ResourceHandle) -> ActualResource {
        ActualResource {
            virtual_handle: handle,
            frame_index: 0,
            native: NativeResource::Image {
                image: vk::Image::null(),
                view: vk::ImageView::null(),
            },
            allocation: None,
        }
    }

    fn owned_backing(handle: ResourceHandle, frame_index: usize) -> ActualResource {
        ActualResource {
            virtual_handle: handle,
            frame_index,
            native: NativeResource::Buffer {
                buffer: vk::Buffer::null(),
            },
            allocation: Some(Allocation::default()),
        }
    }

    #[test]
    fn teardown_keeps_imported_backings_attached() {
        let imported = ResourceHandle::new(0);
        let owned = ResourceHandle::new(1);
        let mut actuals = HashMap::new();
        actuals.insert((imported, 0), imported_backing(imported));
        for frame_index in 0..2 {
            actuals.insert((owned, frame_index), owned_backing(owned, frame_index));
        }
        let mut retired = Vec::new();

        ResourceRegistry::retire_owned(&mut actuals, &mut retired, 7);

        assert_eq!(actuals.len(), 1);
        assert!(actuals.contains_key(&(imported, 0)));
        assert_eq!(retired.len(), 2);
        assert!(retired.iter().all(|(frame, _)| *frame == 7));
    }

    #[test]
    fn teardown_is_idempotent_for_imported_backings() {
        let imported = ResourceHandle::new(0);
        let mut actuals = HashMap::new();
        actuals.insert((imported, 0), imported_backing(imported));
        let mut retired = Vec::new();

        ResourceRegistry::retire_owned(&mut actuals, &mut retired, 1);
        ResourceRegistry::retire_owned(&mut actuals, &mut retired, 2);

        assert!(actuals.contains_key(&(imported, 0)));
        assert!(retired.is_empty());
    }

    #[test]
    fn imported_backings_resolve_for_every_frame_index() {
        let resource = swapchain_resource(0);
        let mut actuals = HashMap::new();
        actuals.insert((resource.handle, 0), imported_backing(resource.handle));
        let mut retired = Vec::new();
        // Recompiling tears everything down first; the imported entry has
        // to survive that for later frames to resolve.
        ResourceRegistry::retire_owned(&mut actuals, &mut retired, 1);

        let group_backings = HashMap::new();
        let alias_of = HashMap::new();
        for frame_index in 0..3 {
            let actual = ResourceRegistry::lookup_backing(
                &actuals,
                &group_backings,
                &alias_of,
                &resource,
                frame_index,
            )
            .expect("imported backing must resolve for every frame");
            assert_eq!(actual.frame_index, 0);
            assert!(actual.allocation.is_none());
        }
    }

    #[test]
    fn non_transient_backings_resolve_per_frame() {
        let mut resource = swapchain_resource(0);
        resource.imported = false;
        let mut actuals = HashMap::new();
        for frame_index in 0..2 {
            actuals.insert(
                (resource.handle, frame_index),
                owned_backing(resource.handle, frame_index),
            );
        }

        let group_backings = HashMap::new();
        let alias_of = HashMap::new();
        for frame_index in 0..2 {
            let actual = ResourceRegistry::lookup_backing(
                &actuals,
                &group_backings,
                &alias_of,
                &resource,
                frame_index,
            )
            .expect("per-frame backing must resolve");
            assert_eq!(actual.frame_index, frame_index);
        }
        assert!(
            ResourceRegistry::lookup_backing(&actuals, &group_backings, &alias_of, &resource, 2)
                .is_none()
        );
    }
}
