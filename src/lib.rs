pub mod accel;
pub mod config;
pub mod error;
pub mod frame;
pub mod render_context;
pub mod shader_types;
pub mod update_queue;
pub mod vulkan;

pub use error::{RenderError, RenderResult};
