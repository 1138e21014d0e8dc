use std::sync::Arc;

use winit::{event_loop::EventLoop, window::Window};

use crate::config::EngineConfig;
use crate::error::RenderResult;
use crate::frame::FrameCycle;
use crate::vulkan::command_pool::CommandPool;
use crate::vulkan::context::Context;
use crate::vulkan::frame_sync::VulkanFrameSynchronizer;
use crate::vulkan::raytracing_scene::AccelSettings;

// Fields are dropped in declaration order, the context has to go last.
pub struct RenderContext {
    pub frames: FrameCycle<VulkanFrameSynchronizer>,
    pub command_pool: CommandPool,
    pub config: EngineConfig,
    pub context: Arc<Context>,
}

impl RenderContext {
    pub fn new(
        event_loop: &EventLoop<()>,
        window: &Window,
        config: EngineConfig,
    ) -> RenderResult<Self> {
        let context = Arc::new(Context::new(event_loop, window)?);
        let command_pool = CommandPool::new(context.clone())?;

        let synchronizer = VulkanFrameSynchronizer::new(
            command_pool.clone(),
            window.inner_size(),
            config.present_mode,
            config.frames_in_flight,
            config.clear_color,
        )?;

        Ok(Self {
            frames: FrameCycle::new(synchronizer),
            command_pool,
            config,
            context,
        })
    }

    pub fn accel_settings(&self) -> AccelSettings {
        AccelSettings::from_config(&self.config)
    }

    pub fn recreate_swapchain(&mut self, window: &Window) -> RenderResult<()> {
        self.frames
            .synchronizer_mut()
            .recreate_swapchain(window.inner_size())
    }
}

impl Drop for RenderContext {
    fn drop(&mut self) {
        if let Err(err) = self.context.wait_idle() {
            log::error!("Could not wait for the device on shutdown: {}", err);
        }
    }
}
