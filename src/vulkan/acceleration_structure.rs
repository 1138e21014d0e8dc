use std::sync::Arc;

use ash::vk;
use gpu_allocator::MemoryLocation;
use ultraviolet::Mat4;

use crate::accel::{BlasBuildPlan, BlasSizes, BlasState};
use crate::error::{RenderError, RenderResult};
use crate::vulkan::buffer::{Buffer, BufferRegion};
use crate::vulkan::command_pool::CommandPool;
use crate::vulkan::context::Context;

/// Largest value that fits into the 24 bit custom index of a TLAS instance.
pub const MAX_INSTANCE_CUSTOM_INDEX: u32 = (1 << 24) - 1;

/// An acceleration structure handle and the buffer backing it.
pub struct AccelKHR {
    pub inner: vk::AccelerationStructureKHR,
    pub buffer: Buffer<u8>,
    pub device_address: vk::DeviceAddress,
    context: Arc<Context>,
}

impl AccelKHR {
    // See https://github.com/SaschaWillems/Vulkan/blob/a467d941599a2cef5bd0eff696999bca8d75ee23/base/VulkanRaytracingSample.cpp#L149
    pub fn new(
        context: Arc<Context>,
        structure_type: vk::AccelerationStructureTypeKHR,
        size: vk::DeviceSize,
    ) -> RenderResult<Self> {
        let buffer: Buffer<u8> = Buffer::new(
            context.clone(),
            size,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryLocation::GpuOnly,
            "acceleration structure",
        )?;

        let create_info = vk::AccelerationStructureCreateInfoKHR::builder()
            .buffer(buffer.get_vk_buffer())
            .size(size)
            .ty(structure_type);

        let inner = unsafe {
            context
                .context_raytracing
                .acceleration_structure
                .create_acceleration_structure(&create_info, None)
        }
        .map_err(RenderError::creating("acceleration structure"))?;

        let device_address = {
            let address_info =
                vk::AccelerationStructureDeviceAddressInfoKHR::builder().acceleration_structure(inner);
            unsafe {
                context
                    .context_raytracing
                    .acceleration_structure
                    .get_acceleration_structure_device_address(&address_info)
            }
        };

        Ok(Self {
            inner,
            buffer,
            device_address,
            context,
        })
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.buffer.size()
    }
}

impl Drop for AccelKHR {
    fn drop(&mut self) {
        unsafe {
            self.context
                .context_raytracing
                .acceleration_structure
                .destroy_acceleration_structure(self.inner, None);
        }
    }
}

/// Indexed triangles of one mesh sub-range, as consumed by a BLAS build.
#[derive(Debug, Clone, Copy)]
pub struct BlasInput {
    pub vertices: BufferRegion,
    pub vertex_format: vk::Format,
    /// Highest index used by the sub-range.
    pub max_vertex: u32,
    /// `u32` indices, three per triangle.
    pub indices: BufferRegion,
}

impl BlasInput {
    pub fn new(
        vertices: BufferRegion,
        vertex_format: vk::Format,
        indices: BufferRegion,
    ) -> RenderResult<Self> {
        if indices.stride != std::mem::size_of::<u32>() as u64 {
            return Err(RenderError::InvalidAccess(format!(
                "BLAS indices must be u32, got a stride of {}",
                indices.stride
            )));
        }
        let input = Self {
            vertices,
            vertex_format,
            max_vertex: (vertices.size / vertices.stride.max(1)).saturating_sub(1) as u32,
            indices,
        };
        if input.triangle_count() == 0 {
            return Err(RenderError::InvalidAccess(
                "a BLAS needs at least one triangle".to_string(),
            ));
        }
        Ok(input)
    }

    pub fn triangle_count(&self) -> u32 {
        (self.indices.size / (3 * self.indices.stride.max(1))) as u32
    }

    fn geometry(&self) -> vk::AccelerationStructureGeometryKHR {
        let triangles = vk::AccelerationStructureGeometryTrianglesDataKHR::builder()
            .vertex_format(self.vertex_format)
            .vertex_data(vk::DeviceOrHostAddressConstKHR {
                device_address: self.vertices.device_address,
            })
            .vertex_stride(self.vertices.stride)
            .max_vertex(self.max_vertex)
            .index_type(vk::IndexType::UINT32)
            .index_data(vk::DeviceOrHostAddressConstKHR {
                device_address: self.indices.device_address,
            })
            .build();

        vk::AccelerationStructureGeometryKHR::builder()
            .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
            .geometry(vk::AccelerationStructureGeometryDataKHR { triangles })
            .flags(vk::GeometryFlagsKHR::OPAQUE)
            .build()
    }

    fn build_range(&self) -> vk::AccelerationStructureBuildRangeInfoKHR {
        vk::AccelerationStructureBuildRangeInfoKHR::builder()
            .primitive_count(self.triangle_count())
            .primitive_offset(0)
            .first_vertex(0)
            .transform_offset(0)
            .build()
    }
}

/// Builds one BLAS per input, in input order.
///
/// Inputs are built in batches whose structure memory stays around
/// `batch_budget`. With `ALLOW_COMPACTION` in `flags`, every structure is copied
/// into an exactly sized one after its batch finished and the original is freed.
/// Blocks until everything is built.
pub fn build_blas(
    command_pool: &CommandPool,
    inputs: &[BlasInput],
    flags: vk::BuildAccelerationStructureFlagsKHR,
    batch_budget: u64,
) -> RenderResult<Vec<AccelKHR>> {
    let context = command_pool.context();
    let acceleration_structure = &context.context_raytracing.acceleration_structure;
    let compact = flags.contains(vk::BuildAccelerationStructureFlagsKHR::ALLOW_COMPACTION);

    let geometries: Vec<_> = inputs.iter().map(BlasInput::geometry).collect();
    let sizes: Vec<BlasSizes> = inputs
        .iter()
        .zip(&geometries)
        .map(|(input, geometry)| {
            let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::builder()
                .ty(vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL)
                .flags(flags)
                .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
                .geometries(std::slice::from_ref(geometry));
            let size_info = unsafe {
                acceleration_structure.get_acceleration_structure_build_sizes(
                    vk::AccelerationStructureBuildTypeKHR::DEVICE,
                    &build_info,
                    &[input.triangle_count()],
                )
            };
            BlasSizes {
                structure_size: size_info.acceleration_structure_size,
                scratch_size: size_info.build_scratch_size,
                allow_compaction: compact,
            }
        })
        .collect();

    let mut plan = BlasBuildPlan::new(&sizes, batch_budget);
    let batches = plan.batches().to_vec();
    let mut results = Vec::with_capacity(inputs.len());

    for (batch_index, batch) in batches.iter().enumerate() {
        log::debug!(
            "Building BLAS batch {} ({} structures, {} bytes, {} bytes scratch)",
            batch_index,
            batch.range.len(),
            batch.structure_size,
            batch.scratch_size
        );

        let scratch = scratch_buffer(context, batch.scratch_size)?;
        let structures = batch
            .range
            .clone()
            .map(|index| {
                AccelKHR::new(
                    context.clone(),
                    vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
                    sizes[index].structure_size,
                )
            })
            .collect::<RenderResult<Vec<_>>>()?;
        let query_pool = if compact {
            Some(CompactedSizeQueries::new(
                context.clone(),
                batch.range.len() as u32,
            )?)
        } else {
            None
        };

        command_pool.one_time_submit(|command_buffer| {
            if let Some(queries) = &query_pool {
                queries.reset(command_buffer);
            }
            for (query, (index, structure)) in batch.range.clone().zip(&structures).enumerate() {
                let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::builder()
                    .ty(vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL)
                    .flags(flags)
                    .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
                    .dst_acceleration_structure(structure.inner)
                    .geometries(std::slice::from_ref(&geometries[index]))
                    .scratch_data(vk::DeviceOrHostAddressKHR {
                        device_address: scratch.get_device_address(),
                    })
                    .build();
                let build_range = inputs[index].build_range();

                unsafe {
                    acceleration_structure.cmd_build_acceleration_structures(
                        command_buffer,
                        std::slice::from_ref(&build_info),
                        &[std::slice::from_ref(&build_range)],
                    )
                };
                // The next build reuses the scratch buffer.
                acceleration_structure_barrier(context, command_buffer);

                if let Some(queries) = &query_pool {
                    queries.write(command_buffer, structure.inner, query as u32);
                }
            }
        })?;

        for index in batch.range.clone() {
            plan.finish_build(index);
        }

        if let Some(queries) = query_pool {
            let compacted_sizes = queries.results()?;
            for index in batch.range.clone() {
                plan.advance(index, BlasState::Compacting);
            }

            let compacted = compacted_sizes
                .iter()
                .map(|&size| {
                    AccelKHR::new(
                        context.clone(),
                        vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
                        size,
                    )
                })
                .collect::<RenderResult<Vec<_>>>()?;

            command_pool.one_time_submit(|command_buffer| {
                for (original, target) in structures.iter().zip(&compacted) {
                    let copy_info = vk::CopyAccelerationStructureInfoKHR::builder()
                        .src(original.inner)
                        .dst(target.inner)
                        .mode(vk::CopyAccelerationStructureModeKHR::COMPACT);
                    unsafe {
                        acceleration_structure
                            .cmd_copy_acceleration_structure(command_buffer, &copy_info)
                    };
                }
            })?;

            let before: u64 = structures.iter().map(AccelKHR::size).sum();
            let after: u64 = compacted.iter().map(AccelKHR::size).sum();
            log::info!(
                "Compacted BLAS batch {} from {} to {} bytes",
                batch_index,
                before,
                after
            );

            for index in batch.range.clone() {
                plan.advance(index, BlasState::Compacted);
                plan.advance(index, BlasState::Ready);
            }
            // The oversized originals are dropped here.
            drop(structures);
            results.extend(compacted);
        } else {
            results.extend(structures);
        }
    }

    debug_assert!(plan.is_ready());
    log::info!(
        "Built {} BLAS in {} batches",
        results.len(),
        plan.batches().len()
    );
    Ok(results)
}

fn scratch_buffer(context: &Arc<Context>, size: vk::DeviceSize) -> RenderResult<Buffer<u8>> {
    let alignment = context
        .context_raytracing
        .physical_device_acceleration_structure_properties_khr
        .min_acceleration_structure_scratch_offset_alignment as vk::DeviceSize;
    Buffer::new_aligned(
        context.clone(),
        size,
        vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
        MemoryLocation::GpuOnly,
        alignment,
        "acceleration structure scratch",
    )
}

fn acceleration_structure_barrier(context: &Context, command_buffer: vk::CommandBuffer) {
    let barrier = vk::MemoryBarrier2::builder()
        .src_stage_mask(vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR)
        .src_access_mask(vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR)
        .dst_stage_mask(vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR)
        .dst_access_mask(
            vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR
                | vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR,
        )
        .build();
    let dependency_info =
        vk::DependencyInfo::builder().memory_barriers(std::slice::from_ref(&barrier));
    unsafe {
        context
            .device
            .cmd_pipeline_barrier2(command_buffer, &dependency_info)
    };
}

/// A query pool collecting the compacted size of each BLAS in a batch.
struct CompactedSizeQueries {
    pool: vk::QueryPool,
    count: u32,
    context: Arc<Context>,
}

impl CompactedSizeQueries {
    fn new(context: Arc<Context>, count: u32) -> RenderResult<Self> {
        let create_info = vk::QueryPoolCreateInfo::builder()
            .query_type(vk::QueryType::ACCELERATION_STRUCTURE_COMPACTED_SIZE_KHR)
            .query_count(count);
        let pool = unsafe { context.device.create_query_pool(&create_info, None) }
            .map_err(RenderError::creating("query pool"))?;
        Ok(Self {
            pool,
            count,
            context,
        })
    }

    fn reset(&self, command_buffer: vk::CommandBuffer) {
        unsafe {
            self.context
                .device
                .cmd_reset_query_pool(command_buffer, self.pool, 0, self.count)
        };
    }

    fn write(
        &self,
        command_buffer: vk::CommandBuffer,
        structure: vk::AccelerationStructureKHR,
        query: u32,
    ) {
        unsafe {
            self.context
                .context_raytracing
                .acceleration_structure
                .cmd_write_acceleration_structures_properties(
                    command_buffer,
                    std::slice::from_ref(&structure),
                    vk::QueryType::ACCELERATION_STRUCTURE_COMPACTED_SIZE_KHR,
                    self.pool,
                    query,
                )
        };
    }

    fn results(&self) -> RenderResult<Vec<vk::DeviceSize>> {
        let mut sizes = vec![0u64; self.count as usize];
        unsafe {
            self.context.device.get_query_pool_results(
                self.pool,
                0,
                self.count,
                &mut sizes,
                vk::QueryResultFlags::WAIT | vk::QueryResultFlags::TYPE_64,
            )
        }
        .map_err(RenderError::creating("compacted size query"))?;
        Ok(sizes)
    }
}

impl Drop for CompactedSizeQueries {
    fn drop(&mut self) {
        unsafe { self.context.device.destroy_query_pool(self.pool, None) };
    }
}

/// One BLAS placed into the scene.
#[derive(Debug, Clone, Copy)]
pub struct TlasInstance {
    pub transform: Mat4,
    /// Shows up as `gl_InstanceCustomIndexEXT`, usually an index into the model data table.
    pub custom_index: u32,
    pub mask: u8,
    pub hit_group_offset: u32,
    pub flags: vk::GeometryInstanceFlagsKHR,
    pub blas_address: vk::DeviceAddress,
}

impl TlasInstance {
    pub fn new(blas: &AccelKHR, custom_index: u32) -> Self {
        Self {
            transform: Mat4::identity(),
            custom_index,
            mask: 0xFF,
            hit_group_offset: 0,
            flags: vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE,
            blas_address: blas.device_address,
        }
    }

    pub fn with_transform(mut self, transform: Mat4) -> Self {
        self.transform = transform;
        self
    }

    fn to_vk(self) -> RenderResult<vk::AccelerationStructureInstanceKHR> {
        if self.custom_index > MAX_INSTANCE_CUSTOM_INDEX
            || self.hit_group_offset > MAX_INSTANCE_CUSTOM_INDEX
        {
            return Err(RenderError::InvalidAccess(format!(
                "instance index {} or hit group offset {} does not fit into 24 bits",
                self.custom_index, self.hit_group_offset
            )));
        }
        Ok(vk::AccelerationStructureInstanceKHR {
            transform: vk::TransformMatrixKHR {
                matrix: transform_rows(&self.transform),
            },
            instance_custom_index_and_mask: vk::Packed24_8::new(self.custom_index, self.mask),
            instance_shader_binding_table_record_offset_and_flags: vk::Packed24_8::new(
                self.hit_group_offset,
                self.flags.as_raw() as u8,
            ),
            acceleration_structure_reference: vk::AccelerationStructureReferenceKHR {
                device_handle: self.blas_address,
            },
        })
    }
}

/// The top three rows of a column major matrix, row by row.
pub fn transform_rows(transform: &Mat4) -> [f32; 12] {
    let [c0, c1, c2, c3] = transform.cols;
    [
        c0.x, c1.x, c2.x, c3.x, //
        c0.y, c1.y, c2.y, c3.y, //
        c0.z, c1.z, c2.z, c3.z,
    ]
}

/// The scene's top-level acceleration structure.
pub struct Tlas {
    accel: AccelKHR,
    instance_buffer: Buffer<vk::AccelerationStructureInstanceKHR>,
    instance_count: u32,
    flags: vk::BuildAccelerationStructureFlagsKHR,
    command_pool: CommandPool,
}

impl Tlas {
    /// Uploads `instances` and builds the TLAS over them. Blocks until done.
    pub fn build(
        command_pool: &CommandPool,
        instances: &[TlasInstance],
        flags: vk::BuildAccelerationStructureFlagsKHR,
    ) -> RenderResult<Self> {
        if instances.is_empty() {
            return Err(RenderError::InvalidAccess(
                "a TLAS needs at least one instance".to_string(),
            ));
        }
        let context = command_pool.context();
        let instance_count = instances.len() as u32;

        let instance_buffer = Buffer::new_aligned(
            context.clone(),
            std::mem::size_of_val(instances) as vk::DeviceSize,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryLocation::CpuToGpu,
            16,
            "TLAS instances",
        )?;
        write_instances(&instance_buffer, instances)?;

        let geometry = instance_geometry(&instance_buffer);
        let size_info = build_sizes(context, &geometry, flags, instance_count);
        let accel = AccelKHR::new(
            context.clone(),
            vk::AccelerationStructureTypeKHR::TOP_LEVEL,
            size_info.acceleration_structure_size,
        )?;

        let tlas = Self {
            accel,
            instance_buffer,
            instance_count,
            flags,
            command_pool: command_pool.clone(),
        };
        tlas.record_build(
            &geometry,
            vk::BuildAccelerationStructureModeKHR::BUILD,
            size_info.build_scratch_size,
        )?;
        log::info!("Built TLAS over {} instances", instance_count);
        Ok(tlas)
    }

    /// Refits the TLAS to new transforms of the same instances.
    ///
    /// Panics unless the TLAS was built with `ALLOW_UPDATE`. Waits for the device
    /// first, since in-flight frames may still trace against it.
    pub fn update(&mut self, instances: &[TlasInstance]) -> RenderResult<()> {
        assert!(
            self.flags
                .contains(vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE),
            "TLAS was not built with ALLOW_UPDATE"
        );
        if instances.len() as u32 != self.instance_count {
            return Err(RenderError::InvalidAccess(format!(
                "TLAS update with {} instances, built with {}",
                instances.len(),
                self.instance_count
            )));
        }

        let context = self.command_pool.context().clone();
        context.wait_idle()?;
        write_instances(&self.instance_buffer, instances)?;

        let geometry = instance_geometry(&self.instance_buffer);
        let size_info = build_sizes(&context, &geometry, self.flags, self.instance_count);
        self.record_build(
            &geometry,
            vk::BuildAccelerationStructureModeKHR::UPDATE,
            size_info.update_scratch_size,
        )
    }

    pub fn handle(&self) -> vk::AccelerationStructureKHR {
        self.accel.inner
    }

    pub fn instance_count(&self) -> u32 {
        self.instance_count
    }

    fn record_build(
        &self,
        geometry: &vk::AccelerationStructureGeometryKHR,
        mode: vk::BuildAccelerationStructureModeKHR,
        scratch_size: vk::DeviceSize,
    ) -> RenderResult<()> {
        let context = self.command_pool.context();
        let scratch = scratch_buffer(context, scratch_size)?;

        let mut build_info = vk::AccelerationStructureBuildGeometryInfoKHR::builder()
            .ty(vk::AccelerationStructureTypeKHR::TOP_LEVEL)
            .flags(self.flags)
            .mode(mode)
            .dst_acceleration_structure(self.accel.inner)
            .geometries(std::slice::from_ref(geometry))
            .scratch_data(vk::DeviceOrHostAddressKHR {
                device_address: scratch.get_device_address(),
            });
        if mode == vk::BuildAccelerationStructureModeKHR::UPDATE {
            build_info = build_info.src_acceleration_structure(self.accel.inner);
        }
        let build_info = build_info.build();
        let build_range = vk::AccelerationStructureBuildRangeInfoKHR::builder()
            .primitive_count(self.instance_count)
            .build();

        self.command_pool.one_time_submit(|command_buffer| unsafe {
            context
                .context_raytracing
                .acceleration_structure
                .cmd_build_acceleration_structures(
                    command_buffer,
                    std::slice::from_ref(&build_info),
                    &[std::slice::from_ref(&build_range)],
                )
        })
    }
}

/// Builds `tlas` if there is none yet, or refits it when `update` is set.
///
/// Panics when asked to build over an existing TLAS without `update`.
pub fn build_tlas(
    command_pool: &CommandPool,
    tlas: &mut Option<Tlas>,
    instances: &[TlasInstance],
    flags: vk::BuildAccelerationStructureFlagsKHR,
    update: bool,
) -> RenderResult<()> {
    match tlas {
        Some(existing) => {
            assert!(update, "TLAS was already built, pass update to refit it");
            existing.update(instances)
        }
        None => {
            *tlas = Some(Tlas::build(command_pool, instances, flags)?);
            Ok(())
        }
    }
}

fn write_instances(
    buffer: &Buffer<vk::AccelerationStructureInstanceKHR>,
    instances: &[TlasInstance],
) -> RenderResult<()> {
    let instances = instances
        .iter()
        .map(|instance| instance.to_vk())
        .collect::<RenderResult<Vec<_>>>()?;
    buffer.copy_data(&instances)
}

fn instance_geometry(
    instance_buffer: &Buffer<vk::AccelerationStructureInstanceKHR>,
) -> vk::AccelerationStructureGeometryKHR {
    let instances = vk::AccelerationStructureGeometryInstancesDataKHR::builder()
        .array_of_pointers(false)
        .data(vk::DeviceOrHostAddressConstKHR {
            device_address: instance_buffer.get_device_address(),
        })
        .build();
    vk::AccelerationStructureGeometryKHR::builder()
        .geometry_type(vk::GeometryTypeKHR::INSTANCES)
        .geometry(vk::AccelerationStructureGeometryDataKHR { instances })
        .build()
}

fn build_sizes(
    context: &Context,
    geometry: &vk::AccelerationStructureGeometryKHR,
    flags: vk::BuildAccelerationStructureFlagsKHR,
    instance_count: u32,
) -> vk::AccelerationStructureBuildSizesInfoKHR {
    let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::builder()
        .ty(vk::AccelerationStructureTypeKHR::TOP_LEVEL)
        .flags(flags)
        .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
        .geometries(std::slice::from_ref(geometry));
    unsafe {
        context
            .context_raytracing
            .acceleration_structure
            .get_acceleration_structure_build_sizes(
                vk::AccelerationStructureBuildTypeKHR::DEVICE,
                &build_info,
                &[instance_count],
            )
    }
}

#[cfg(test)]
mod tests {
    use ultraviolet::Vec3;

    use super::*;

    fn region(size: u64, stride: u64) -> BufferRegion {
        BufferRegion {
            buffer: vk::Buffer::null(),
            device_address: 0x1000,
            offset: 0,
            size,
            stride,
        }
    }

    fn vertices(count: u64) -> BufferRegion {
        region(count * 12, 12)
    }

    #[test]
    fn max_vertex_is_the_last_vertex() {
        let input =
            BlasInput::new(vertices(3), vk::Format::R32G32B32_SFLOAT, region(12, 4)).unwrap();
        assert_eq!(input.max_vertex, 2);
        assert_eq!(input.triangle_count(), 1);
    }

    #[test]
    fn trailing_indices_are_not_a_triangle() {
        let input =
            BlasInput::new(vertices(4), vk::Format::R32G32B32_SFLOAT, region(16, 4)).unwrap();
        assert_eq!(input.triangle_count(), 1);
    }

    #[test]
    fn fewer_than_three_indices_are_rejected() {
        assert!(matches!(
            BlasInput::new(vertices(3), vk::Format::R32G32B32_SFLOAT, region(8, 4)),
            Err(RenderError::InvalidAccess(_))
        ));
        assert!(matches!(
            BlasInput::new(vertices(3), vk::Format::R32G32B32_SFLOAT, region(0, 4)),
            Err(RenderError::InvalidAccess(_))
        ));
    }

    #[test]
    fn only_u32_indices_are_accepted() {
        assert!(matches!(
            BlasInput::new(vertices(3), vk::Format::R32G32B32_SFLOAT, region(6, 2)),
            Err(RenderError::InvalidAccess(_))
        ));
    }

    #[test]
    fn transform_is_packed_row_major() {
        let transform = Mat4::from_translation(Vec3::new(1.0, 2.0, 3.0));
        assert_eq!(
            transform_rows(&transform),
            [1.0, 0.0, 0.0, 1.0, 0.0, 1.0, 0.0, 2.0, 0.0, 0.0, 1.0, 3.0]
        );
    }

    #[test]
    fn instance_fields_are_packed() {
        let instance = TlasInstance {
            transform: Mat4::identity(),
            custom_index: 42,
            mask: 0x0F,
            hit_group_offset: 3,
            flags: vk::GeometryInstanceFlagsKHR::FORCE_OPAQUE,
            blas_address: 0xABCD,
        };
        let packed = instance.to_vk().unwrap();
        assert_eq!(packed.instance_custom_index_and_mask.low_24(), 42);
        assert_eq!(packed.instance_custom_index_and_mask.high_8(), 0x0F);
        assert_eq!(
            packed
                .instance_shader_binding_table_record_offset_and_flags
                .low_24(),
            3
        );
        assert_eq!(
            packed
                .instance_shader_binding_table_record_offset_and_flags
                .high_8(),
            vk::GeometryInstanceFlagsKHR::FORCE_OPAQUE.as_raw() as u8
        );
        assert_eq!(unsafe { packed.acceleration_structure_reference.device_handle }, 0xABCD);
    }

    #[test]
    fn oversized_custom_index_is_rejected() {
        let instance = TlasInstance {
            transform: Mat4::identity(),
            custom_index: MAX_INSTANCE_CUSTOM_INDEX + 1,
            mask: 0xFF,
            hit_group_offset: 0,
            flags: vk::GeometryInstanceFlagsKHR::empty(),
            blas_address: 0,
        };
        assert!(matches!(
            instance.to_vk(),
            Err(RenderError::InvalidAccess(_))
        ));
    }
}
