use std::ops::Range;
use std::sync::Arc;
use std::{marker::PhantomData, ops::Deref};

use ash::{self, vk};
use gpu_allocator::{
    vulkan::{Allocation, AllocationCreateDesc, AllocationScheme},
    MemoryLocation,
};

use crate::error::{RenderError, RenderResult};
use crate::vulkan::command_pool::CommandPool;
use crate::vulkan::context::Context;

pub trait IntoSlice<T> {
    fn as_sliced(&self) -> &[T];
}

impl<T> IntoSlice<T> for T {
    fn as_sliced(&self) -> &[T] {
        std::slice::from_ref(self)
    }
}

impl<T> IntoSlice<T> for [T] {
    fn as_sliced(&self) -> &[T] {
        self
    }
}

impl<T> IntoSlice<T> for Vec<T> {
    fn as_sliced(&self) -> &[T] {
        self
    }
}

pub struct UntypedBuffer {
    pub inner: vk::Buffer,
    pub usage: vk::BufferUsageFlags,
    pub size: vk::DeviceSize,
    pub location: MemoryLocation,
    allocation: Option<Allocation>,
    context: Arc<Context>,
}

impl UntypedBuffer {
    pub fn get_device_address(&self) -> vk::DeviceAddress {
        let info = vk::BufferDeviceAddressInfo::builder().buffer(self.inner);
        unsafe {
            self.context
                .buffer_device_address
                .get_buffer_device_address(&info)
        }
    }

    /// Copies `data` into the persistently mapped memory at `offset`.
    pub fn write_bytes(&self, offset: vk::DeviceSize, data: &[u8]) -> RenderResult<()> {
        let end = offset.checked_add(data.len() as vk::DeviceSize);
        if end.map_or(true, |end| end > self.size) {
            return Err(RenderError::InvalidAccess(format!(
                "write of {} bytes at offset {} exceeds buffer of {} bytes",
                data.len(),
                offset,
                self.size
            )));
        }
        let mapped = self
            .allocation
            .as_ref()
            .and_then(|allocation| allocation.mapped_ptr())
            .ok_or_else(|| {
                RenderError::InvalidAccess("buffer is not host visible".to_string())
            })?;

        unsafe {
            let dst = (mapped.as_ptr() as *mut u8).add(offset as usize);
            dst.copy_from_nonoverlapping(data.as_ptr(), data.len());
        }
        Ok(())
    }
}

impl Drop for UntypedBuffer {
    fn drop(&mut self) {
        unsafe { self.context.device.destroy_buffer(self.inner, None) };
        if let Some(allocation) = self.allocation.take() {
            if let Err(err) = self.context.allocator().free(allocation) {
                log::error!("Could not free buffer memory: {}", err);
            }
        }
    }
}

/// Byte range of `count` elements starting at element `first`, or `None` when it
/// does not fit into `len` elements.
pub fn element_range(stride: u64, len: u64, first: u64, count: u64) -> Option<Range<u64>> {
    let end = first.checked_add(count)?;
    if end > len {
        return None;
    }
    Some(first * stride..end * stride)
}

/// A view of some elements of a buffer, as consumed by shaders and
/// acceleration structure builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferRegion {
    pub buffer: vk::Buffer,
    pub device_address: vk::DeviceAddress,
    pub offset: vk::DeviceSize,
    pub size: vk::DeviceSize,
    pub stride: vk::DeviceSize,
}

/// A typed GPU buffer. Cloning is cheap and shares the allocation.
pub struct Buffer<T: ?Sized> {
    inner: Arc<UntypedBuffer>,
    _marker: PhantomData<T>,
}

impl<T> Clone for Buffer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> Buffer<T> {
    pub fn new(
        context: Arc<Context>,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        name: &str,
    ) -> RenderResult<Buffer<T>> {
        Self::new_aligned(context, size, usage, location, 1, name)
    }

    /// Like [`Buffer::new`], with the memory placed at a multiple of `min_alignment`.
    pub fn new_aligned(
        context: Arc<Context>,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        min_alignment: vk::DeviceSize,
        name: &str,
    ) -> RenderResult<Buffer<T>> {
        let device = &context.device;

        let create_info = vk::BufferCreateInfo::builder()
            .size(size.max(1))
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { device.create_buffer(&create_info, None) }
            .map_err(RenderError::creating("buffer"))?;

        let mut requirements = unsafe { device.get_buffer_memory_requirements(buffer) };
        requirements.alignment = requirements.alignment.max(min_alignment);

        let allocation = context.allocator().allocate(&AllocationCreateDesc {
            name,
            requirements,
            location,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        });
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(err) => {
                unsafe { device.destroy_buffer(buffer, None) };
                return Err(err.into());
            }
        };

        if let Err(result) =
            unsafe { device.bind_buffer_memory(buffer, allocation.memory(), allocation.offset()) }
        {
            unsafe { device.destroy_buffer(buffer, None) };
            if let Err(err) = context.allocator().free(allocation) {
                log::error!("Could not free buffer memory: {}", err);
            }
            return Err(RenderError::creating("buffer memory binding")(result));
        }

        log::debug!("Created buffer {:?} ({} bytes, {:?})", name, size, location);

        Ok(Buffer {
            inner: Arc::new(UntypedBuffer {
                inner: buffer,
                usage,
                size,
                location,
                allocation: Some(allocation),
                context,
            }),
            _marker: PhantomData,
        })
    }

    /// Creates a device-local buffer and fills it through a staging buffer.
    /// Blocks until the copy has finished on the GPU.
    pub fn new_device_local_with_data<U: IntoSlice<T> + ?Sized>(
        command_pool: &CommandPool,
        usage: vk::BufferUsageFlags,
        data: &U,
        name: &str,
    ) -> RenderResult<Buffer<T>> {
        let context = command_pool.context().clone();
        let data_size = std::mem::size_of_val(data.as_sliced()) as vk::DeviceSize;

        let buffer = Buffer::new(
            context.clone(),
            data_size,
            usage | vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::GpuOnly,
            name,
        )?;

        let staging_buffer: Buffer<T> = Buffer::new(
            context,
            data_size,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::CpuToGpu,
            "staging",
        )?;
        staging_buffer.copy_data(data)?;

        command_pool.one_time_submit(|command_buffer| {
            buffer.copy_from(command_buffer, &staging_buffer, 0, 0..data_size)
        })??;

        Ok(buffer)
    }

    pub fn get_vk_buffer(&self) -> vk::Buffer {
        self.inner.inner
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.inner.size
    }

    /// Number of whole `T`s that fit into the buffer.
    pub fn len(&self) -> u64 {
        match std::mem::size_of::<T>() as u64 {
            0 => 0,
            stride => self.inner.size / stride,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get_device_address(&self) -> vk::DeviceAddress {
        self.inner.get_device_address()
    }

    pub fn region(&self, first: u64, count: u64) -> RenderResult<BufferRegion> {
        if !self
            .inner
            .usage
            .contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS)
        {
            return Err(RenderError::InvalidAccess(
                "buffer was not created with SHADER_DEVICE_ADDRESS".to_string(),
            ));
        }
        let stride = std::mem::size_of::<T>() as u64;
        let range = element_range(stride, self.len(), first, count).ok_or_else(|| {
            RenderError::InvalidAccess(format!(
                "elements {}..{} are outside of a buffer with {} elements",
                first,
                first.saturating_add(count),
                self.len()
            ))
        })?;
        Ok(BufferRegion {
            buffer: self.inner.inner,
            device_address: self.get_device_address() + range.start,
            offset: range.start,
            size: range.end - range.start,
            stride,
        })
    }

    pub fn copy_data<U: IntoSlice<T> + ?Sized>(&self, data: &U) -> RenderResult<()> {
        let data = data.as_sliced();
        let bytes = unsafe {
            std::slice::from_raw_parts(data.as_ptr() as *const u8, std::mem::size_of_val(data))
        };
        self.inner.write_bytes(0, bytes)
    }

    /// Records a copy of `src_range` (bytes) of `other` to `dst_offset` of this buffer.
    pub fn copy_from(
        &self,
        command_buffer: vk::CommandBuffer,
        other: &Buffer<T>,
        dst_offset: vk::DeviceSize,
        src_range: Range<vk::DeviceSize>,
    ) -> RenderResult<()> {
        if !other
            .inner
            .usage
            .contains(vk::BufferUsageFlags::TRANSFER_SRC)
            || !self.inner.usage.contains(vk::BufferUsageFlags::TRANSFER_DST)
        {
            return Err(RenderError::InvalidAccess(
                "buffer copy needs TRANSFER_SRC and TRANSFER_DST usage".to_string(),
            ));
        }

        let region = vk::BufferCopy {
            dst_offset,
            src_offset: src_range.start,
            size: src_range.end - src_range.start,
        };
        unsafe {
            self.inner.context.device.cmd_copy_buffer(
                command_buffer,
                other.inner.inner,
                self.inner.inner,
                std::slice::from_ref(&region),
            )
        };
        Ok(())
    }

    pub fn get_untyped(&self) -> &Arc<UntypedBuffer> {
        &self.inner
    }
}

impl<T> Deref for Buffer<T> {
    type Target = vk::Buffer;

    fn deref(&self) -> &Self::Target {
        &self.inner.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn element_ranges_are_bounds_checked() {
        assert_eq!(element_range(12, 10, 0, 10), Some(0..120));
        assert_eq!(element_range(12, 10, 4, 2), Some(48..72));
        assert_eq!(element_range(12, 10, 9, 2), None);
        assert_eq!(element_range(12, 10, u64::MAX, 2), None);
        assert_eq!(element_range(4, 0, 0, 0), Some(0..0));
    }
}
