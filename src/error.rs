use ash::vk;
use thiserror::Error;

/// Everything that can go wrong while creating or driving GPU objects.
#[derive(Error, Debug)]
pub enum RenderError {
    #[error("the device was lost")]
    DeviceLost,
    #[error("out of memory ({0:?})")]
    OutOfMemory(vk::Result),
    #[error("unsupported feature: {0}")]
    UnsupportedFeature(String),
    #[error("could not create {resource}: {result:?}")]
    ResourceCreationFailed {
        resource: &'static str,
        result: vk::Result,
    },
    #[error("the surface is out of date")]
    SurfaceOutOfDate,
    #[error("memory allocation failed: {0}")]
    Allocation(#[from] gpu_allocator::AllocationError),
    #[error("{0}")]
    InvalidAccess(String),
}

impl RenderError {
    /// Classifies a failed Vulkan call that was meant to produce `resource`.
    pub fn creating(resource: &'static str) -> impl FnOnce(vk::Result) -> RenderError {
        move |result| match result {
            vk::Result::ERROR_DEVICE_LOST => RenderError::DeviceLost,
            vk::Result::ERROR_OUT_OF_HOST_MEMORY | vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => {
                RenderError::OutOfMemory(result)
            }
            vk::Result::ERROR_OUT_OF_DATE_KHR => RenderError::SurfaceOutOfDate,
            vk::Result::ERROR_FEATURE_NOT_PRESENT | vk::Result::ERROR_EXTENSION_NOT_PRESENT => {
                RenderError::UnsupportedFeature(format!("{resource} ({result:?})"))
            }
            result => RenderError::ResourceCreationFailed { resource, result },
        }
    }

    /// Whether recreating the swapchain is the way out of this error.
    pub fn wants_new_swapchain(&self) -> bool {
        matches!(self, RenderError::SurfaceOutOfDate)
    }
}

pub type RenderResult<T> = Result<T, RenderError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_vulkan_results() {
        assert!(matches!(
            RenderError::creating("fence")(vk::Result::ERROR_DEVICE_LOST),
            RenderError::DeviceLost
        ));
        assert!(matches!(
            RenderError::creating("buffer")(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY),
            RenderError::OutOfMemory(_)
        ));
        assert!(matches!(
            RenderError::creating("swapchain")(vk::Result::ERROR_OUT_OF_DATE_KHR),
            RenderError::SurfaceOutOfDate
        ));
        match RenderError::creating("query pool")(vk::Result::ERROR_INITIALIZATION_FAILED) {
            RenderError::ResourceCreationFailed { resource, result } => {
                assert_eq!(resource, "query pool");
                assert_eq!(result, vk::Result::ERROR_INITIALIZATION_FAILED);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn only_out_of_date_surfaces_want_a_new_swapchain() {
        assert!(RenderError::creating("swapchain image")(vk::Result::ERROR_OUT_OF_DATE_KHR)
            .wants_new_swapchain());
        assert!(!RenderError::DeviceLost.wants_new_swapchain());
        assert!(!RenderError::InvalidAccess("oops".to_string()).wants_new_swapchain());
    }
}
