pub mod acceleration_structure;
pub mod buffer;
pub mod command_pool;
pub mod context;
pub mod descriptor_set;
pub mod frame_sync;
pub mod image;
pub mod model_data;
pub mod raytracing_scene;
pub mod swapchain;
pub mod uniform_buffer;
pub mod window_settings;
