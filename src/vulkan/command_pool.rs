use std::{ops::Deref, sync::Arc};

use ash::vk::{self};

use crate::error::{RenderError, RenderResult};

use super::context::Context;

#[derive(Clone)]
pub struct CommandPool {
    inner: Arc<CommandPoolImpl>,
}

impl CommandPool {
    pub fn new(context: Arc<Context>) -> RenderResult<Self> {
        let create_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(context.queue_family_index)
            .flags(
                vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER
                    | vk::CommandPoolCreateFlags::TRANSIENT,
            );

        let command_pool = unsafe { context.device.create_command_pool(&create_info, None) }
            .map_err(RenderError::creating("command pool"))?;

        Ok(Self {
            inner: Arc::new(CommandPoolImpl {
                inner: command_pool,
                context,
            }),
        })
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.inner.context
    }

    pub fn allocate_primary(&self, count: u32) -> RenderResult<Vec<vk::CommandBuffer>> {
        let allocate_info = vk::CommandBufferAllocateInfo::builder()
            .command_buffer_count(count)
            .command_pool(self.inner.inner)
            .level(vk::CommandBufferLevel::PRIMARY);

        unsafe { self.context().device.allocate_command_buffers(&allocate_info) }
            .map_err(RenderError::creating("command buffers"))
    }

    pub fn free(&self, command_buffers: &[vk::CommandBuffer]) {
        unsafe {
            self.context()
                .device
                .free_command_buffers(self.inner.inner, command_buffers)
        };
    }

    /// Records `record` into a fresh command buffer, submits it and blocks until
    /// the GPU has executed it.
    pub fn one_time_submit<R>(
        &self,
        record: impl FnOnce(vk::CommandBuffer) -> R,
    ) -> RenderResult<R> {
        let context = self.context();
        let device = &context.device;
        let command_buffer = self.allocate_primary(1)?[0];
        let command_buffer = OneTimeCommandBuffer {
            command_buffer,
            command_pool: self,
        };

        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { device.begin_command_buffer(*command_buffer, &begin_info) }
            .map_err(RenderError::creating("command buffer recording"))?;

        let result = record(*command_buffer);

        unsafe { device.end_command_buffer(*command_buffer) }
            .map_err(RenderError::creating("command buffer recording"))?;

        let fence = unsafe { device.create_fence(&vk::FenceCreateInfo::default(), None) }
            .map_err(RenderError::creating("fence"))?;

        let submit_info = vk::SubmitInfo::builder()
            .command_buffers(std::slice::from_ref(&*command_buffer))
            .build();
        let submitted = unsafe {
            device.queue_submit(
                context.queue,
                std::slice::from_ref(&submit_info),
                fence,
            )
        }
        .and_then(|_| unsafe {
            device.wait_for_fences(std::slice::from_ref(&fence), true, u64::MAX)
        });
        unsafe { device.destroy_fence(fence, None) };
        submitted.map_err(RenderError::creating("one time submission"))?;

        Ok(result)
    }
}

/// Frees its command buffer when dropped.
struct OneTimeCommandBuffer<'a> {
    command_buffer: vk::CommandBuffer,
    command_pool: &'a CommandPool,
}

impl Deref for OneTimeCommandBuffer<'_> {
    type Target = vk::CommandBuffer;

    fn deref(&self) -> &Self::Target {
        &self.command_buffer
    }
}

impl Drop for OneTimeCommandBuffer<'_> {
    fn drop(&mut self) {
        self.command_pool
            .free(std::slice::from_ref(&self.command_buffer));
    }
}

struct CommandPoolImpl {
    pub inner: vk::CommandPool,
    pub context: Arc<Context>,
}

impl Drop for CommandPoolImpl {
    fn drop(&mut self) {
        unsafe { self.context.device.destroy_command_pool(self.inner, None) };
    }
}

impl Deref for CommandPool {
    type Target = vk::CommandPool;

    fn deref(&self) -> &Self::Target {
        &self.inner.inner
    }
}
