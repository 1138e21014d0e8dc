use std::sync::Arc;

use anyhow::Result;
use ash::vk;
use crevice::std140::{AsStd140, Std140};
use env_logger::Env;
use ultraviolet::{Mat4, Vec3};
use winit::dpi;
use winit::event::{ElementState, Event, KeyboardInput, VirtualKeyCode, WindowEvent};
use winit::event_loop::EventLoop;
use winit::window::{Window, WindowBuilder};

use unnamed_engine::config::{ConfigFileLoader, EngineConfig};
use unnamed_engine::error::RenderResult;
use unnamed_engine::render_context::RenderContext;
use unnamed_engine::shader_types::Camera;
use unnamed_engine::vulkan::acceleration_structure::BlasInput;
use unnamed_engine::vulkan::buffer::Buffer;
use unnamed_engine::vulkan::command_pool::CommandPool;
use unnamed_engine::vulkan::descriptor_set::{
    DescriptorPool, DescriptorSetLayout, DescriptorSetRefresh, FrameDescriptorSets,
    WriteDescriptorSet,
};
use unnamed_engine::vulkan::model_data::GpuModelData;
use unnamed_engine::vulkan::raytracing_scene::{RaytracingScene, SceneMesh};
use unnamed_engine::vulkan::uniform_buffer::UniformBuffer;

const CONFIG_PATH: &str = "config.json";

const CAMERA_BINDING: u32 = 0;
const TLAS_BINDING: u32 = 1;
const MODEL_DATA_BINDING: u32 = 2;

/// A single triangle with everything the closest-hit shader looks up.
struct TriangleMesh {
    vertices: Buffer<[f32; 3]>,
    indices: Buffer<u32>,
    material_indices: Buffer<u32>,
    materials: Buffer<[f32; 4]>,
    offset_indices: Buffer<u32>,
}

impl TriangleMesh {
    fn new(command_pool: &CommandPool) -> RenderResult<Self> {
        let usage = vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
            | vk::BufferUsageFlags::STORAGE_BUFFER
            | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR;
        let vertices: [[f32; 3]; 3] = [[-0.5, -0.5, 0.0], [0.5, -0.5, 0.0], [0.0, 0.5, 0.0]];

        Ok(Self {
            vertices: Buffer::new_device_local_with_data(
                command_pool,
                usage,
                &vertices[..],
                "vertices",
            )?,
            indices: Buffer::new_device_local_with_data(
                command_pool,
                usage,
                &[0u32, 1, 2][..],
                "indices",
            )?,
            material_indices: Buffer::new_device_local_with_data(
                command_pool,
                usage,
                &0u32,
                "material indices",
            )?,
            materials: Buffer::new_device_local_with_data(
                command_pool,
                usage,
                &[1.0f32, 0.6, 0.2, 1.0],
                "materials",
            )?,
            offset_indices: Buffer::new_device_local_with_data(
                command_pool,
                usage,
                &0u32,
                "offset indices",
            )?,
        })
    }

    fn scene_mesh(&self, transform: Mat4) -> RenderResult<SceneMesh> {
        let vertices = self.vertices.region(0, self.vertices.len())?;
        let indices = self.indices.region(0, self.indices.len())?;
        Ok(SceneMesh {
            blas_input: BlasInput::new(vertices, vk::Format::R32G32B32_SFLOAT, indices)?,
            model_data: GpuModelData::new(
                &vertices,
                &indices,
                &self.material_indices.region(0, 1)?,
                &self.materials.region(0, 1)?,
                &self.offset_indices.region(0, 1)?,
            ),
            transform,
        })
    }
}

// Rust will drop these fields in the order they are declared
struct Demo {
    camera_angle: f32,
    use_fixed_camera: bool,
    should_recreate_swapchain: bool,

    descriptor_sets: Arc<FrameDescriptorSets>,
    pipeline_layout: vk::PipelineLayout,
    _descriptor_set_layout: DescriptorSetLayout,
    orbit_camera: Arc<UniformBuffer>,
    fixed_camera: Arc<UniformBuffer>,

    scene: RaytracingScene,
    _triangle: TriangleMesh,

    render: RenderContext,
    window: Window,
}

impl Demo {
    fn new(event_loop: &EventLoop<()>, config: EngineConfig) -> Result<Self> {
        let window = WindowBuilder::new()
            .with_title(config.window.title.clone())
            .with_inner_size(dpi::LogicalSize {
                width: config.window.width,
                height: config.window.height,
            })
            .build(event_loop)?;

        let render = RenderContext::new(event_loop, &window, config)?;
        let frame_count = render.frames.frame_count();
        let context = render.context.clone();

        let triangle = TriangleMesh::new(&render.command_pool)?;
        let meshes = [
            triangle.scene_mesh(Mat4::from_translation(Vec3::new(-0.6, 0.0, 0.0)))?,
            triangle.scene_mesh(Mat4::from_translation(Vec3::new(0.6, 0.0, 0.0)))?,
        ];
        let scene =
            RaytracingScene::setup(&render.command_pool, &meshes, render.accel_settings())?;

        let window_size = window.inner_size();
        let aspect_ratio = window_size.width as f32 / window_size.height.max(1) as f32;
        let orbit_camera = UniformBuffer::new(
            context.clone(),
            Camera::orbit(0.0, aspect_ratio).as_std140().as_bytes(),
            frame_count,
            "orbit camera",
        )?;
        let fixed_camera = UniformBuffer::new(
            context.clone(),
            Camera::orbit(std::f32::consts::FRAC_PI_4, aspect_ratio)
                .as_std140()
                .as_bytes(),
            frame_count,
            "fixed camera",
        )?;

        let layout_bindings = [
            vk::DescriptorSetLayoutBinding::builder()
                .binding(CAMERA_BINDING)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                .descriptor_count(1)
                .stage_flags(vk::ShaderStageFlags::ALL)
                .build(),
            vk::DescriptorSetLayoutBinding::builder()
                .binding(TLAS_BINDING)
                .descriptor_type(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR)
                .descriptor_count(1)
                .stage_flags(vk::ShaderStageFlags::ALL)
                .build(),
            vk::DescriptorSetLayoutBinding::builder()
                .binding(MODEL_DATA_BINDING)
                .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                .descriptor_count(1)
                .stage_flags(vk::ShaderStageFlags::ALL)
                .build(),
        ];
        let descriptor_set_layout = DescriptorSetLayout::new(context.clone(), &layout_bindings)?;
        let pool_sizes = layout_bindings.map(|binding| vk::DescriptorPoolSize {
            ty: binding.descriptor_type,
            descriptor_count: frame_count as u32,
        });
        let descriptor_pool =
            DescriptorPool::new(context.clone(), frame_count as u32, &pool_sizes)?;

        let descriptor_sets = FrameDescriptorSets::new(
            context.clone(),
            descriptor_pool,
            &descriptor_set_layout,
            frame_count,
        )?;
        descriptor_sets.set_uniform_binding(CAMERA_BINDING, orbit_camera.clone());
        descriptor_sets.set_binding(WriteDescriptorSet::acceleration_structure(
            TLAS_BINDING,
            scene.tlas_handle(),
        ));
        descriptor_sets.set_binding(WriteDescriptorSet::storage_buffer(
            MODEL_DATA_BINDING,
            scene.model_data_buffer(),
        ));
        descriptor_sets.write_all();

        let pipeline_layout = {
            let create_info = vk::PipelineLayoutCreateInfo::builder()
                .set_layouts(std::slice::from_ref(&descriptor_set_layout.inner));
            unsafe { context.device.create_pipeline_layout(&create_info, None) }?
        };

        Ok(Self {
            camera_angle: 0.0,
            use_fixed_camera: false,
            should_recreate_swapchain: false,

            descriptor_sets,
            pipeline_layout,
            _descriptor_set_layout: descriptor_set_layout,
            orbit_camera,
            fixed_camera,

            scene,
            _triangle: triangle,

            render,
            window,
        })
    }

    fn main_loop(mut self, event_loop: EventLoop<()>) -> ! {
        event_loop.run(move |event, _, control_flow| {
            control_flow.set_poll();

            match event {
                Event::WindowEvent { event, .. } => match event {
                    WindowEvent::CloseRequested => control_flow.set_exit(),
                    WindowEvent::Resized(_) => self.should_recreate_swapchain = true,
                    WindowEvent::KeyboardInput {
                        input:
                            KeyboardInput {
                                virtual_keycode: Some(keycode),
                                state: ElementState::Pressed,
                                ..
                            },
                        ..
                    } => match keycode {
                        VirtualKeyCode::Escape => control_flow.set_exit(),
                        VirtualKeyCode::Space => self.switch_camera(),
                        _ => (),
                    },
                    _ => (),
                },
                Event::MainEventsCleared => self.window.request_redraw(),
                Event::RedrawRequested(_window_id) => {
                    if let Err(err) = self.draw_frame() {
                        log::error!("Stopping after a failed frame: {}", err);
                        control_flow.set_exit();
                    }
                }
                _ => (),
            }
        });
    }

    /// Rebinds the camera uniform. Every frame's set picks up the change once
    /// that frame is free again.
    fn switch_camera(&mut self) {
        self.use_fixed_camera = !self.use_fixed_camera;
        let camera = if self.use_fixed_camera {
            &self.fixed_camera
        } else {
            &self.orbit_camera
        };
        self.descriptor_sets
            .set_uniform_binding(CAMERA_BINDING, camera.clone());
        let refresh = DescriptorSetRefresh::new(self.descriptor_sets.clone());
        if let Err(err) = self.render.frames.request_descriptor_set_update(refresh) {
            log::error!("Could not rebind the camera: {}", err);
            return;
        }
        log::info!(
            "Switched to the {} camera",
            if self.use_fixed_camera { "fixed" } else { "orbit" }
        );
    }

    fn draw_frame(&mut self) -> Result<()> {
        let window_size = self.window.inner_size();
        if window_size.width == 0 || window_size.height == 0 {
            return Ok(());
        }

        if self.should_recreate_swapchain {
            self.render.recreate_swapchain(&self.window)?;
            self.should_recreate_swapchain = false;
        }

        let extent = self.render.frames.synchronizer().extent();
        let aspect_ratio = extent.width as f32 / extent.height.max(1) as f32;
        self.camera_angle += 0.01;
        let camera = Camera::orbit(self.camera_angle, aspect_ratio);
        self.render.frames.request_uniform_update(
            &self.orbit_camera,
            0,
            camera.as_std140().as_bytes(),
        )?;

        let device = &self.render.context.device;
        let descriptor_sets = &self.descriptor_sets;
        let pipeline_layout = self.pipeline_layout;
        let report = match self.render.frames.draw_frame(|_frames, frame| unsafe {
            device.cmd_bind_descriptor_sets(
                frame.command_buffer,
                vk::PipelineBindPoint::GRAPHICS,
                pipeline_layout,
                0,
                &[descriptor_sets.set(frame.frame)],
                &[],
            );
        }) {
            Ok(report) => report,
            Err(err) if err.wants_new_swapchain() => {
                log::warn!("Skipping a frame: {}", err);
                self.should_recreate_swapchain = true;
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        log::trace!(
            "Frame {} on image {}: {} writes, {:?}",
            report.frame.index(),
            report.image_index,
            report.updates_applied,
            report.outcome
        );
        if report.outcome.wants_new_swapchain() {
            self.should_recreate_swapchain = true;
        }
        Ok(())
    }
}

impl Drop for Demo {
    fn drop(&mut self) {
        if let Err(err) = self.render.context.wait_idle() {
            log::error!("Could not wait for the device: {}", err);
        }
        log::info!(
            "Shutting down with {} BLAS and {} pending writes",
            self.scene.blas().len(),
            self.render.frames.pending_descriptor_updates()
                + self.render.frames.pending_uniform_updates()
        );
        unsafe {
            self.render
                .context
                .device
                .destroy_pipeline_layout(self.pipeline_layout, None)
        };
    }
}

fn main() -> Result<()> {
    let config = ConfigFileLoader::new(CONFIG_PATH).get_or_load_config()?.clone();
    env_logger::Builder::from_env(Env::default().default_filter_or(config.log_filter.clone()))
        .init();

    let event_loop = EventLoop::new();
    let demo = Demo::new(&event_loop, config)?;
    demo.main_loop(event_loop)
}
