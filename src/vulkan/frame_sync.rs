use std::sync::Arc;

use ash::vk;
use winit::dpi::PhysicalSize;

use crate::error::{RenderError, RenderResult};
use crate::frame::{AcquiredImage, FrameIndex, FrameSynchronizer, SlotState};
use crate::vulkan::command_pool::CommandPool;
use crate::vulkan::context::Context;
use crate::vulkan::image::Image;
use crate::vulkan::swapchain::{color_subresource_range, SwapchainContainer};
use crate::vulkan::window_settings::PresentMode;

/// Synchronization objects and the command buffer of one frame in flight.
struct SwapImage {
    index: usize,
    image_available: vk::Semaphore,
    in_flight: vk::Fence,
    command_buffer: vk::CommandBuffer,
    state: SlotState,
}

/// Drives the swapchain with one fence, one image-available semaphore and one
/// command buffer per frame in flight.
///
/// Render-finished semaphores belong to the swapchain images instead: a slot's
/// fence says nothing about when the presentation engine is done waiting.
pub struct VulkanFrameSynchronizer {
    slots: Vec<SwapImage>,
    /// Indexed by swapchain image.
    render_finished: Vec<vk::Semaphore>,
    swapchain: SwapchainContainer,
    depth: Image,
    clear_color: [f32; 4],
    command_pool: CommandPool,
    context: Arc<Context>,
}

impl VulkanFrameSynchronizer {
    pub fn new(
        command_pool: CommandPool,
        window_size: PhysicalSize<u32>,
        present_mode: PresentMode,
        frames_in_flight: usize,
        clear_color: [f32; 4],
    ) -> RenderResult<Self> {
        let context = command_pool.context().clone();
        let swapchain = SwapchainContainer::new(
            context.clone(),
            window_size,
            present_mode,
            frames_in_flight as u32,
        )?;
        let depth = Image::new_depth_attachment(context.clone(), swapchain.extent)?;

        let command_buffers = command_pool.allocate_primary(frames_in_flight as u32)?;
        let mut synchronizer = Self {
            slots: Vec::with_capacity(frames_in_flight),
            render_finished: Vec::new(),
            swapchain,
            depth,
            clear_color,
            command_pool,
            context,
        };
        for (index, command_buffer) in command_buffers.into_iter().enumerate() {
            let slot = synchronizer.create_slot(index, command_buffer)?;
            synchronizer.slots.push(slot);
        }
        synchronizer.create_render_finished_semaphores()?;

        log::info!(
            "Created {} frame slots for {} swapchain images",
            synchronizer.slots.len(),
            synchronizer.swapchain.image_count()
        );
        Ok(synchronizer)
    }

    pub fn swapchain(&self) -> &SwapchainContainer {
        &self.swapchain
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.swapchain.extent
    }

    pub fn depth_attachment(&self) -> &Image {
        &self.depth
    }

    pub fn slot_state(&self, frame: FrameIndex) -> SlotState {
        self.slots[frame.index()].state
    }

    /// Rebuilds the swapchain and the depth attachment. Waits for the device
    /// first, so every slot ends up idle.
    pub fn recreate_swapchain(&mut self, window_size: PhysicalSize<u32>) -> RenderResult<()> {
        self.swapchain.recreate(window_size)?;
        self.depth = Image::new_depth_attachment(self.context.clone(), self.swapchain.extent)?;
        self.create_render_finished_semaphores()
    }

    /// Replaces the render-finished semaphores with one per current swapchain
    /// image. The device has to be idle.
    fn create_render_finished_semaphores(&mut self) -> RenderResult<()> {
        self.destroy_render_finished_semaphores();
        let device = &self.context.device;
        for _ in 0..self.swapchain.image_count() {
            let semaphore = unsafe { device.create_semaphore(&Default::default(), None) }
                .map_err(RenderError::creating("semaphore"))?;
            self.render_finished.push(semaphore);
        }
        Ok(())
    }

    fn destroy_render_finished_semaphores(&mut self) {
        for semaphore in self.render_finished.drain(..) {
            unsafe { self.context.device.destroy_semaphore(semaphore, None) };
        }
    }

    fn render_finished(&self, image: AcquiredImage) -> RenderResult<vk::Semaphore> {
        self.render_finished
            .get(image.image_index as usize)
            .copied()
            .ok_or_else(|| {
                RenderError::InvalidAccess(format!(
                    "swapchain image {} has no render-finished semaphore",
                    image.image_index
                ))
            })
    }

    fn create_slot(
        &self,
        index: usize,
        command_buffer: vk::CommandBuffer,
    ) -> RenderResult<SwapImage> {
        let device = &self.context.device;
        let semaphore_info = vk::SemaphoreCreateInfo::default();
        let image_available = unsafe { device.create_semaphore(&semaphore_info, None) }
            .map_err(RenderError::creating("semaphore"))?;
        let in_flight = self.create_signaled_fence()?;

        Ok(SwapImage {
            index,
            image_available,
            in_flight,
            command_buffer,
            state: SlotState::Idle,
        })
    }

    fn create_signaled_fence(&self) -> RenderResult<vk::Fence> {
        let fence_info = vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED);
        unsafe { self.context.device.create_fence(&fence_info, None) }
            .map_err(RenderError::creating("fence"))
    }

    fn slot_mut(&mut self, frame: FrameIndex) -> &mut SwapImage {
        &mut self.slots[frame.index()]
    }

    fn record_clear_pass(&self, command_buffer: vk::CommandBuffer, image_index: u32) {
        let device = &self.context.device;
        let image = self.swapchain.images[image_index as usize];
        let image_view = self.swapchain.imageviews[image_index as usize];

        let barriers = [
            vk::ImageMemoryBarrier2::builder()
                .src_stage_mask(vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT)
                .src_access_mask(vk::AccessFlags2::NONE)
                .dst_stage_mask(vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT)
                .dst_access_mask(vk::AccessFlags2::COLOR_ATTACHMENT_WRITE)
                .old_layout(vk::ImageLayout::UNDEFINED)
                .new_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                .image(image)
                .subresource_range(color_subresource_range())
                .build(),
            vk::ImageMemoryBarrier2::builder()
                .src_stage_mask(
                    vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS
                        | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS,
                )
                .src_access_mask(vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE)
                .dst_stage_mask(
                    vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS
                        | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS,
                )
                .dst_access_mask(
                    vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ
                        | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE,
                )
                .old_layout(vk::ImageLayout::UNDEFINED)
                .new_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
                .image(self.depth.inner)
                .subresource_range(self.depth.full_subresource_range())
                .build(),
        ];
        let dependency_info = vk::DependencyInfo::builder().image_memory_barriers(&barriers);
        unsafe { device.cmd_pipeline_barrier2(command_buffer, &dependency_info) };

        let color_attachment = vk::RenderingAttachmentInfo::builder()
            .image_view(image_view)
            .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .clear_value(vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: self.clear_color,
                },
            })
            .build();
        let depth_attachment = vk::RenderingAttachmentInfo::builder()
            .image_view(self.depth.view)
            .image_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .clear_value(vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 1.0,
                    stencil: 0,
                },
            });
        let rendering_info = vk::RenderingInfo::builder()
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: self.swapchain.extent,
            })
            .layer_count(1)
            .color_attachments(std::slice::from_ref(&color_attachment))
            .depth_attachment(&depth_attachment);

        unsafe {
            device.cmd_begin_rendering(command_buffer, &rendering_info);
            device.cmd_end_rendering(command_buffer);
        }
    }

    fn record_present_transition(&self, command_buffer: vk::CommandBuffer, image_index: u32) {
        let barrier = vk::ImageMemoryBarrier2::builder()
            .src_stage_mask(vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT)
            .src_access_mask(vk::AccessFlags2::COLOR_ATTACHMENT_WRITE)
            .dst_stage_mask(vk::PipelineStageFlags2::BOTTOM_OF_PIPE)
            .dst_access_mask(vk::AccessFlags2::NONE)
            .old_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .new_layout(vk::ImageLayout::PRESENT_SRC_KHR)
            .image(self.swapchain.images[image_index as usize])
            .subresource_range(color_subresource_range())
            .build();
        let dependency_info =
            vk::DependencyInfo::builder().image_memory_barriers(std::slice::from_ref(&barrier));
        unsafe {
            self.context
                .device
                .cmd_pipeline_barrier2(command_buffer, &dependency_info)
        };
    }
}

impl FrameSynchronizer for VulkanFrameSynchronizer {
    type CommandBuffer = vk::CommandBuffer;

    fn frame_count(&self) -> usize {
        self.slots.len()
    }

    fn wait_for_frame_fence(&mut self, frame: FrameIndex) -> RenderResult<()> {
        let fence = self.slots[frame.index()].in_flight;
        unsafe {
            self.context
                .device
                .wait_for_fences(std::slice::from_ref(&fence), true, u64::MAX)
        }
        .map_err(RenderError::creating("frame fence wait"))?;
        self.slot_mut(frame).state.transition_to(SlotState::Idle);
        Ok(())
    }

    fn acquire_next_image(&mut self, frame: FrameIndex) -> RenderResult<AcquiredImage> {
        let semaphore = self.slots[frame.index()].image_available;
        let (image_index, suboptimal) = unsafe {
            self.swapchain.loader.acquire_next_image(
                self.swapchain.inner,
                u64::MAX,
                semaphore,
                vk::Fence::null(),
            )
        }
        .map_err(RenderError::creating("swapchain image"))?;
        self.slot_mut(frame).state.transition_to(SlotState::Acquired);
        Ok(AcquiredImage {
            image_index,
            suboptimal,
        })
    }

    fn reset_frame_fence(&mut self, frame: FrameIndex) -> RenderResult<()> {
        let fence = self.slots[frame.index()].in_flight;
        unsafe { self.context.device.reset_fences(std::slice::from_ref(&fence)) }
            .map_err(RenderError::creating("frame fence reset"))
    }

    fn begin_recording(
        &mut self,
        frame: FrameIndex,
        image: AcquiredImage,
    ) -> RenderResult<vk::CommandBuffer> {
        let command_buffer = self.slots[frame.index()].command_buffer;
        let device = &self.context.device;
        unsafe {
            device.reset_command_buffer(command_buffer, vk::CommandBufferResetFlags::empty())
        }
        .map_err(RenderError::creating("command buffer reset"))?;

        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { device.begin_command_buffer(command_buffer, &begin_info) }
            .map_err(RenderError::creating("command buffer recording"))?;

        self.record_clear_pass(command_buffer, image.image_index);
        self.slot_mut(frame).state.transition_to(SlotState::Recording);
        Ok(command_buffer)
    }

    fn end_recording(&mut self, frame: FrameIndex, image: AcquiredImage) -> RenderResult<()> {
        let command_buffer = self.slots[frame.index()].command_buffer;
        self.record_present_transition(command_buffer, image.image_index);
        unsafe { self.context.device.end_command_buffer(command_buffer) }
            .map_err(RenderError::creating("command buffer recording"))
    }

    fn submit(&mut self, frame: FrameIndex, image: AcquiredImage) -> RenderResult<()> {
        let render_finished = self.render_finished(image)?;
        let slot = &self.slots[frame.index()];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(std::slice::from_ref(&slot.image_available))
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(std::slice::from_ref(&slot.command_buffer))
            .signal_semaphores(std::slice::from_ref(&render_finished))
            .build();

        unsafe {
            self.context.device.queue_submit(
                self.context.queue,
                std::slice::from_ref(&submit_info),
                slot.in_flight,
            )
        }
        .map_err(RenderError::creating("frame submission"))?;
        self.slot_mut(frame).state.transition_to(SlotState::Submitted);
        Ok(())
    }

    fn present(&mut self, frame: FrameIndex, image: AcquiredImage) -> RenderResult<bool> {
        let result = self
            .render_finished(image)
            .and_then(|semaphore| self.queue_present(semaphore, image.image_index));
        // The fence guards the slot from here on, whether presenting worked or not.
        self.slot_mut(frame).state.transition_to(SlotState::Presented);
        result
    }

    fn abandon(&mut self, frame: FrameIndex) -> RenderResult<()> {
        let slot = &self.slots[frame.index()];
        let (image_available, in_flight) = (slot.image_available, slot.in_flight);

        // An empty submission consumes the pending acquire signal and signals the fence.
        let wait_stages = [vk::PipelineStageFlags::ALL_COMMANDS];
        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(std::slice::from_ref(&image_available))
            .wait_dst_stage_mask(&wait_stages)
            .build();
        let device = &self.context.device;
        let consumed = unsafe { device.reset_fences(std::slice::from_ref(&in_flight)) }
            .and_then(|_| unsafe {
                device.queue_submit(
                    self.context.queue,
                    std::slice::from_ref(&submit_info),
                    in_flight,
                )
            });

        if let Err(result) = consumed {
            // Usually means the device is gone, nothing is pending on it anymore.
            log::error!("Could not release frame slot {}: {:?}", frame.index(), result);
            self.replace_sync_objects(frame)?;
        }

        let slot = self.slot_mut(frame);
        slot.state.abandon();
        log::warn!("Abandoned frame slot {}", slot.index);
        Ok(())
    }
}

impl VulkanFrameSynchronizer {
    fn queue_present(
        &self,
        render_finished: vk::Semaphore,
        image_index: u32,
    ) -> RenderResult<bool> {
        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(std::slice::from_ref(&render_finished))
            .swapchains(std::slice::from_ref(&self.swapchain.inner))
            .image_indices(std::slice::from_ref(&image_index));

        unsafe {
            self.swapchain
                .loader
                .queue_present(self.context.queue, &present_info)
        }
        .map_err(RenderError::creating("presentation"))
    }

    fn replace_sync_objects(&mut self, frame: FrameIndex) -> RenderResult<()> {
        self.context.wait_idle()?;

        let in_flight = self.create_signaled_fence()?;
        let image_available =
            unsafe { self.context.device.create_semaphore(&Default::default(), None) }
                .map_err(RenderError::creating("semaphore"))?;

        let device = self.context.device.clone();
        let slot = self.slot_mut(frame);
        unsafe {
            device.destroy_fence(slot.in_flight, None);
            device.destroy_semaphore(slot.image_available, None);
        }
        slot.in_flight = in_flight;
        slot.image_available = image_available;
        Ok(())
    }
}

impl Drop for VulkanFrameSynchronizer {
    fn drop(&mut self) {
        if let Err(err) = self.context.wait_idle() {
            log::error!("Could not wait for the device before teardown: {}", err);
        }
        let device = &self.context.device;
        let command_buffers: Vec<_> = self.slots.iter().map(|slot| slot.command_buffer).collect();
        for slot in self.slots.drain(..) {
            unsafe {
                device.destroy_semaphore(slot.image_available, None);
                device.destroy_fence(slot.in_flight, None);
            }
        }
        self.destroy_render_finished_semaphores();
        self.command_pool.free(&command_buffers);
    }
}
