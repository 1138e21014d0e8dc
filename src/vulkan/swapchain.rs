use std::sync::Arc;

use ash::vk::{self, SwapchainCreateInfoKHR};
use winit::dpi::PhysicalSize;

use crate::error::{RenderError, RenderResult};
use crate::vulkan::context::Context;
use crate::vulkan::window_settings::PresentMode;

pub struct SwapchainContainer {
    pub loader: ash::extensions::khr::Swapchain,
    pub inner: vk::SwapchainKHR,

    pub images: Vec<vk::Image>,
    pub imageviews: Vec<vk::ImageView>,

    pub surface_format: vk::SurfaceFormatKHR,
    pub extent: vk::Extent2D,

    present_mode: vk::PresentModeKHR,
    min_image_count: u32,

    context: Arc<Context>,
}

impl SwapchainContainer {
    /// `min_image_count` is the number of frames in flight; the surface may hand
    /// out more images than that.
    pub fn new(
        context: Arc<Context>,
        window_size: PhysicalSize<u32>,
        present_mode: PresentMode,
        min_image_count: u32,
    ) -> RenderResult<Self> {
        let formats = unsafe {
            context
                .surface_loader
                .get_physical_device_surface_formats(context.physical_device, context.surface)
        }
        .map_err(RenderError::creating("surface formats"))?;

        let present_modes = unsafe {
            context
                .surface_loader
                .get_physical_device_surface_present_modes(context.physical_device, context.surface)
        }
        .map_err(RenderError::creating("surface present modes"))?;

        let surface_format = formats
            .into_iter()
            .min_by_key(|fmt| match (fmt.format, fmt.color_space) {
                (vk::Format::B8G8R8A8_SRGB, _) => 1,
                (vk::Format::R8G8B8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR) => 2,
                (_, _) => 3,
            })
            .ok_or_else(|| RenderError::UnsupportedFeature("surface has no formats".to_string()))?;

        let swapchain_loader =
            ash::extensions::khr::Swapchain::new(&context.instance, &context.device);

        let mut swapchain = Self {
            loader: swapchain_loader,
            inner: vk::SwapchainKHR::null(),
            images: vec![],
            imageviews: vec![],
            surface_format,
            extent: vk::Extent2D::default(),
            present_mode: present_mode.select(&present_modes),
            min_image_count,
            context,
        };
        swapchain.create(window_size)?;
        log::info!(
            "Created swapchain with {} images ({:?}, {:?})",
            swapchain.images.len(),
            swapchain.surface_format.format,
            swapchain.present_mode
        );
        Ok(swapchain)
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Replaces the swapchain, e.g. after a resize. The caller has to make sure
    /// no frame is still using the old one.
    pub fn recreate(&mut self, window_size: PhysicalSize<u32>) -> RenderResult<()> {
        self.context.wait_idle()?;
        self.create(window_size)?;
        log::info!(
            "Recreated swapchain at {}x{}",
            self.extent.width,
            self.extent.height
        );
        Ok(())
    }

    fn create(&mut self, window_size: PhysicalSize<u32>) -> RenderResult<()> {
        let device = &self.context.device;

        let capabilities = unsafe {
            self.context
                .surface_loader
                .get_physical_device_surface_capabilities(
                    self.context.physical_device,
                    self.context.surface,
                )
        }
        .map_err(RenderError::creating("surface capabilities"))?;

        let mut num_images = capabilities.min_image_count.max(self.min_image_count);
        if capabilities.max_image_count != 0 {
            num_images = num_images.min(capabilities.max_image_count);
        }

        let swapchain_extent = {
            if capabilities.current_extent.width != u32::MAX {
                capabilities.current_extent
            } else {
                vk::Extent2D {
                    width: window_size.width.clamp(
                        capabilities.min_image_extent.width,
                        capabilities.max_image_extent.width,
                    ),
                    height: window_size.height.clamp(
                        capabilities.min_image_extent.height,
                        capabilities.max_image_extent.height,
                    ),
                }
            }
        };

        let create_info = SwapchainCreateInfoKHR::builder()
            .surface(self.context.surface)
            .min_image_count(num_images)
            .image_format(self.surface_format.format)
            .image_color_space(self.surface_format.color_space)
            .image_extent(swapchain_extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(self.present_mode)
            .clipped(true)
            .old_swapchain(self.inner);

        let swapchain = unsafe { self.loader.create_swapchain(&create_info, None) }
            .map_err(RenderError::creating("swapchain"))?;

        let images = unsafe { self.loader.get_swapchain_images(swapchain) }
            .map_err(RenderError::creating("swapchain images"))?;

        let imageviews = images
            .iter()
            .map(|&image| {
                let create_info = vk::ImageViewCreateInfo::builder()
                    .view_type(vk::ImageViewType::TYPE_2D)
                    .format(self.surface_format.format)
                    .components(vk::ComponentMapping {
                        r: vk::ComponentSwizzle::IDENTITY,
                        g: vk::ComponentSwizzle::IDENTITY,
                        b: vk::ComponentSwizzle::IDENTITY,
                        a: vk::ComponentSwizzle::IDENTITY,
                    })
                    .subresource_range(color_subresource_range())
                    .image(image);

                unsafe { device.create_image_view(&create_info, None) }
                    .map_err(RenderError::creating("swapchain image view"))
            })
            .collect::<RenderResult<Vec<_>>>()?;

        self.destroy_views_and_swapchain();

        self.inner = swapchain;
        self.extent = swapchain_extent;
        self.images = images;
        self.imageviews = imageviews;
        Ok(())
    }

    fn destroy_views_and_swapchain(&mut self) {
        for &imageview in self.imageviews.iter() {
            unsafe { self.context.device.destroy_image_view(imageview, None) };
        }
        // Destroying a null swapchain is a no-op
        unsafe { self.loader.destroy_swapchain(self.inner, None) };
    }
}

pub fn color_subresource_range() -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}

impl Drop for SwapchainContainer {
    fn drop(&mut self) {
        self.destroy_views_and_swapchain();
    }
}
