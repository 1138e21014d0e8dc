use std::sync::{Arc, Mutex, PoisonError};

use ash::vk;

use crate::error::{RenderError, RenderResult};
use crate::frame::FrameIndex;
use crate::update_queue::{FrameWrite, ResourceId};
use crate::vulkan::buffer::Buffer;
use crate::vulkan::context::Context;
use crate::vulkan::uniform_buffer::UniformBuffer;

pub struct DescriptorSetLayout {
    pub inner: vk::DescriptorSetLayout,
    context: Arc<Context>,
}

impl DescriptorSetLayout {
    pub fn new(
        context: Arc<Context>,
        bindings: &[vk::DescriptorSetLayoutBinding],
    ) -> RenderResult<Self> {
        let create_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(bindings);
        let inner = unsafe {
            context
                .device
                .create_descriptor_set_layout(&create_info, None)
        }
        .map_err(RenderError::creating("descriptor set layout"))?;
        Ok(Self { inner, context })
    }
}

impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        unsafe {
            self.context
                .device
                .destroy_descriptor_set_layout(self.inner, None)
        };
    }
}

pub struct DescriptorPool {
    pub inner: vk::DescriptorPool,
    context: Arc<Context>,
}

impl DescriptorPool {
    pub fn new(
        context: Arc<Context>,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
    ) -> RenderResult<Arc<Self>> {
        let create_info = vk::DescriptorPoolCreateInfo::builder()
            .max_sets(max_sets)
            .pool_sizes(pool_sizes);
        let inner = unsafe { context.device.create_descriptor_pool(&create_info, None) }
            .map_err(RenderError::creating("descriptor pool"))?;
        Ok(Arc::new(Self { inner, context }))
    }

    pub fn allocate(
        &self,
        layout: &DescriptorSetLayout,
        count: usize,
    ) -> RenderResult<Vec<vk::DescriptorSet>> {
        let set_layouts = vec![layout.inner; count];
        let allocate_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(self.inner)
            .set_layouts(&set_layouts);
        unsafe { self.context.device.allocate_descriptor_sets(&allocate_info) }
            .map_err(RenderError::creating("descriptor set"))
    }
}

impl Drop for DescriptorPool {
    fn drop(&mut self) {
        // Frees every set allocated from it.
        unsafe { self.context.device.destroy_descriptor_pool(self.inner, None) };
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WriteDescriptorSet {
    binding: u32,
    info: DescriptorInfo,
}

#[derive(Debug, Clone, Copy)]
pub enum DescriptorInfo {
    UniformBuffer(vk::DescriptorBufferInfo),
    StorageBuffer(vk::DescriptorBufferInfo),
    AccelerationStructure(vk::AccelerationStructureKHR),
}

impl DescriptorInfo {
    pub fn descriptor_type(&self) -> vk::DescriptorType {
        match self {
            DescriptorInfo::UniformBuffer(_) => vk::DescriptorType::UNIFORM_BUFFER,
            DescriptorInfo::StorageBuffer(_) => vk::DescriptorType::STORAGE_BUFFER,
            DescriptorInfo::AccelerationStructure(_) => {
                vk::DescriptorType::ACCELERATION_STRUCTURE_KHR
            }
        }
    }
}

impl WriteDescriptorSet {
    pub fn uniform_buffer<T>(binding: u32, buffer: &Buffer<T>) -> WriteDescriptorSet {
        WriteDescriptorSet {
            binding,
            info: DescriptorInfo::UniformBuffer(whole_buffer(buffer)),
        }
    }

    pub fn storage_buffer<T>(binding: u32, buffer: &Buffer<T>) -> WriteDescriptorSet {
        WriteDescriptorSet {
            binding,
            info: DescriptorInfo::StorageBuffer(whole_buffer(buffer)),
        }
    }

    /// The structure has to outlive every frame that uses the set.
    pub fn acceleration_structure(
        binding: u32,
        acceleration_structure: vk::AccelerationStructureKHR,
    ) -> WriteDescriptorSet {
        WriteDescriptorSet {
            binding,
            info: DescriptorInfo::AccelerationStructure(acceleration_structure),
        }
    }

    pub fn binding(&self) -> u32 {
        self.binding
    }

    pub fn info(&self) -> &DescriptorInfo {
        &self.info
    }
}

fn whole_buffer<T>(buffer: &Buffer<T>) -> vk::DescriptorBufferInfo {
    vk::DescriptorBufferInfo::builder()
        .buffer(buffer.get_vk_buffer())
        .offset(0)
        .range(vk::WHOLE_SIZE)
        .build()
}

/// Writes `writes` into `descriptor_set` right away. The set must not be in use
/// by the GPU.
pub fn update_descriptor_set(
    context: &Context,
    descriptor_set: vk::DescriptorSet,
    writes: &[WriteDescriptorSet],
) {
    let mut acceleration_structure_infos: Vec<_> = writes
        .iter()
        .map(|write| match &write.info {
            DescriptorInfo::AccelerationStructure(handle) => {
                vk::WriteDescriptorSetAccelerationStructureKHR::builder()
                    .acceleration_structures(std::slice::from_ref(handle))
                    .build()
            }
            _ => vk::WriteDescriptorSetAccelerationStructureKHR::default(),
        })
        .collect();

    let vk_writes: Vec<vk::WriteDescriptorSet> = writes
        .iter()
        .zip(acceleration_structure_infos.iter_mut())
        .map(|(write, acceleration_structure_info)| {
            let vk_write = vk::WriteDescriptorSet::builder()
                .dst_set(descriptor_set)
                .dst_binding(write.binding)
                .descriptor_type(write.info.descriptor_type());

            match &write.info {
                DescriptorInfo::UniformBuffer(info) | DescriptorInfo::StorageBuffer(info) => {
                    vk_write.buffer_info(std::slice::from_ref(info)).build()
                }
                DescriptorInfo::AccelerationStructure(_) => {
                    let mut vk_write = vk_write.push_next(acceleration_structure_info).build();
                    vk_write.descriptor_count = 1;
                    vk_write
                }
            }
        })
        .collect();

    unsafe { context.device.update_descriptor_sets(&vk_writes, &[]) };
}

#[derive(Clone)]
enum Binding {
    Shared(WriteDescriptorSet),
    /// Bound to the copy that belongs to the frame the set is written for.
    Uniform {
        binding: u32,
        buffer: Arc<UniformBuffer>,
    },
}

impl Binding {
    fn binding(&self) -> u32 {
        match self {
            Binding::Shared(write) => write.binding,
            Binding::Uniform { binding, .. } => *binding,
        }
    }

    fn for_frame(&self, frame: FrameIndex) -> WriteDescriptorSet {
        match self {
            Binding::Shared(write) => *write,
            Binding::Uniform { binding, buffer } => {
                WriteDescriptorSet::uniform_buffer(*binding, buffer.buffer(frame))
            }
        }
    }
}

/// One descriptor set per frame in flight, all describing the same bindings.
///
/// Changing a binding only changes the description. The sets themselves are
/// rewritten by a [`DescriptorSetRefresh`] going through the deferred update
/// queue, one set per frame, each once its frame has retired.
pub struct FrameDescriptorSets {
    id: ResourceId,
    sets: Vec<vk::DescriptorSet>,
    bindings: Mutex<Vec<Binding>>,
    _pool: Arc<DescriptorPool>,
    context: Arc<Context>,
}

impl FrameDescriptorSets {
    /// Allocates one set per frame. Nothing is written until [`write_all`](Self::write_all)
    /// or a [`DescriptorSetRefresh`] runs.
    pub fn new(
        context: Arc<Context>,
        pool: Arc<DescriptorPool>,
        layout: &DescriptorSetLayout,
        frame_count: usize,
    ) -> RenderResult<Arc<Self>> {
        let sets = pool.allocate(layout, frame_count)?;
        Ok(Arc::new(Self {
            id: ResourceId::next(),
            sets,
            bindings: Mutex::new(Vec::new()),
            _pool: pool,
            context,
        }))
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn set(&self, frame: FrameIndex) -> vk::DescriptorSet {
        self.sets[frame.index()]
    }

    pub fn set_binding(&self, write: WriteDescriptorSet) {
        self.replace(Binding::Shared(write));
    }

    pub fn set_uniform_binding(&self, binding: u32, buffer: Arc<UniformBuffer>) {
        self.replace(Binding::Uniform { binding, buffer });
    }

    /// Writes the current bindings into every set immediately. Only valid while
    /// no frame uses the sets, typically during setup.
    pub fn write_all(&self) {
        for frame in 0..self.sets.len() {
            self.write_frame(FrameIndex::new(frame));
        }
    }

    pub fn write_frame(&self, frame: FrameIndex) {
        let writes: Vec<_> = self
            .bindings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|binding| binding.for_frame(frame))
            .collect();
        update_descriptor_set(&self.context, self.set(frame), &writes);
    }

    fn replace(&self, binding: Binding) {
        let mut bindings = self
            .bindings
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match bindings.iter_mut().find(|b| b.binding() == binding.binding()) {
            Some(existing) => *existing = binding,
            None => bindings.push(binding),
        }
    }
}

/// Rewrites one frame's descriptor set from the bindings of a [`FrameDescriptorSets`].
pub struct DescriptorSetRefresh {
    sets: Arc<FrameDescriptorSets>,
}

impl DescriptorSetRefresh {
    pub fn new(sets: Arc<FrameDescriptorSets>) -> Self {
        Self { sets }
    }
}

impl FrameWrite for DescriptorSetRefresh {
    fn target(&self) -> ResourceId {
        self.sets.id
    }

    fn apply(&self, frame: FrameIndex) -> RenderResult<()> {
        if frame.index() >= self.sets.sets.len() {
            return Err(RenderError::InvalidAccess(format!(
                "descriptor sets have no copy for frame {}",
                frame.index()
            )));
        }
        self.sets.write_frame(frame);
        Ok(())
    }

    fn copy_count(&self) -> Option<usize> {
        Some(self.sets.sets.len())
    }
}
