use std::sync::Arc;

use ash::vk;
use gpu_allocator::{
    vulkan::{Allocation, AllocationCreateDesc, AllocationScheme},
    MemoryLocation,
};

use crate::error::{RenderError, RenderResult};
use crate::vulkan::context::Context;

const DEPTH_FORMATS: [vk::Format; 3] = [
    vk::Format::D32_SFLOAT,
    vk::Format::D32_SFLOAT_S8_UINT,
    vk::Format::D24_UNORM_S8_UINT,
];

/// A device-local 2D image together with a view of all of it.
pub struct Image {
    pub inner: vk::Image,
    pub view: vk::ImageView,

    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub aspect_mask: vk::ImageAspectFlags,

    allocation: Option<Allocation>,
    context: Arc<Context>,
}

impl Image {
    /// The depth attachment cleared by the default pass of every frame.
    pub fn new_depth_attachment(context: Arc<Context>, extent: vk::Extent2D) -> RenderResult<Self> {
        let format = find_depth_format(&context)?;
        let create_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let aspect_mask = if format == vk::Format::D32_SFLOAT {
            vk::ImageAspectFlags::DEPTH
        } else {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        };

        Self::new(context, &create_info, aspect_mask, "depth attachment")
    }

    pub fn new(
        context: Arc<Context>,
        create_info: &vk::ImageCreateInfo,
        aspect_mask: vk::ImageAspectFlags,
        name: &str,
    ) -> RenderResult<Self> {
        let device = &context.device;

        let image = unsafe { device.create_image(create_info, None) }
            .map_err(RenderError::creating("image"))?;

        let requirements = unsafe { device.get_image_memory_requirements(image) };

        let allocation = context.allocator().allocate(&AllocationCreateDesc {
            name,
            requirements,
            location: MemoryLocation::GpuOnly,
            linear: false,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        });
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(err) => {
                unsafe { device.destroy_image(image, None) };
                return Err(err.into());
            }
        };

        let mut result = Self {
            inner: image,
            view: vk::ImageView::null(),
            format: create_info.format,
            extent: vk::Extent2D {
                width: create_info.extent.width,
                height: create_info.extent.height,
            },
            aspect_mask,
            allocation: Some(allocation),
            context: context.clone(),
        };

        if let Some(allocation) = &result.allocation {
            unsafe { device.bind_image_memory(image, allocation.memory(), allocation.offset()) }
                .map_err(RenderError::creating("image memory binding"))?;
        }

        let view_info = vk::ImageViewCreateInfo::builder()
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(result.format)
            .components(vk::ComponentMapping {
                r: vk::ComponentSwizzle::IDENTITY,
                g: vk::ComponentSwizzle::IDENTITY,
                b: vk::ComponentSwizzle::IDENTITY,
                a: vk::ComponentSwizzle::IDENTITY,
            })
            .subresource_range(result.full_subresource_range())
            .image(image);

        result.view = unsafe { device.create_image_view(&view_info, None) }
            .map_err(RenderError::creating("image view"))?;

        Ok(result)
    }

    pub fn full_subresource_range(&self) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask: self.aspect_mask,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        }
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        let device = &self.context.device;
        unsafe { device.destroy_image_view(self.view, None) };
        unsafe { device.destroy_image(self.inner, None) };
        if let Some(allocation) = self.allocation.take() {
            if let Err(err) = self.context.allocator().free(allocation) {
                log::error!("Could not free image memory: {}", err);
            }
        }
    }
}

fn find_depth_format(context: &Context) -> RenderResult<vk::Format> {
    DEPTH_FORMATS
        .into_iter()
        .find(|&format| {
            let properties = unsafe {
                context
                    .instance
                    .get_physical_device_format_properties(context.physical_device, format)
            };
            properties
                .optimal_tiling_features
                .contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
        })
        .ok_or_else(|| RenderError::UnsupportedFeature("no depth attachment format".to_string()))
}
