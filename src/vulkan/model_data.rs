use ash::vk;

use crate::error::{RenderError, RenderResult};
use crate::vulkan::acceleration_structure::MAX_INSTANCE_CUSTOM_INDEX;
use crate::vulkan::buffer::{Buffer, BufferRegion};
use crate::vulkan::command_pool::CommandPool;

/// Where the closest-hit shader finds the data of one mesh sub-range.
///
/// Must match the `ModelData` block in the shaders.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GpuModelData {
    pub vertex_buffer: vk::DeviceAddress,
    pub index_buffer: vk::DeviceAddress,
    pub material_index_buffer: vk::DeviceAddress,
    pub material_data_buffer: vk::DeviceAddress,
    pub offset_indices_buffer: vk::DeviceAddress,
}

impl GpuModelData {
    pub fn new(
        vertices: &BufferRegion,
        indices: &BufferRegion,
        material_indices: &BufferRegion,
        material_data: &BufferRegion,
        offset_indices: &BufferRegion,
    ) -> Self {
        Self {
            vertex_buffer: vertices.device_address,
            index_buffer: indices.device_address,
            material_index_buffer: material_indices.device_address,
            material_data_buffer: material_data.device_address,
            offset_indices_buffer: offset_indices.device_address,
        }
    }
}

/// Model data entries in TLAS instance order.
#[derive(Debug, Default)]
pub struct ModelDataTable {
    entries: Vec<GpuModelData>,
}

impl ModelDataTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an entry and returns the custom index its TLAS instance has to carry.
    pub fn push(&mut self, entry: GpuModelData) -> RenderResult<u32> {
        let index = self.entries.len() as u32;
        if index > MAX_INSTANCE_CUSTOM_INDEX {
            return Err(RenderError::InvalidAccess(format!(
                "model data table is full at {} entries",
                self.entries.len()
            )));
        }
        self.entries.push(entry);
        Ok(index)
    }

    pub fn get(&self, custom_index: u32) -> Option<&GpuModelData> {
        self.entries.get(custom_index as usize)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Uploads the table into a device-local storage buffer. Blocks until done.
    pub fn upload(&self, command_pool: &CommandPool) -> RenderResult<Buffer<GpuModelData>> {
        if self.entries.is_empty() {
            return Err(RenderError::InvalidAccess(
                "model data table is empty".to_string(),
            ));
        }
        Buffer::new_device_local_with_data(
            command_pool,
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            &self.entries,
            "model data",
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(base: u64) -> GpuModelData {
        GpuModelData {
            vertex_buffer: base,
            index_buffer: base + 1,
            material_index_buffer: base + 2,
            material_data_buffer: base + 3,
            offset_indices_buffer: base + 4,
        }
    }

    #[test]
    fn layout_is_five_addresses() {
        assert_eq!(std::mem::size_of::<GpuModelData>(), 40);
        assert_eq!(std::mem::align_of::<GpuModelData>(), 8);
    }

    #[test]
    fn custom_indices_follow_insertion_order() {
        let mut table = ModelDataTable::new();
        assert_eq!(table.push(entry(100)).unwrap(), 0);
        assert_eq!(table.push(entry(200)).unwrap(), 1);
        assert_eq!(table.push(entry(300)).unwrap(), 2);
        assert_eq!(table.len(), 3);
        assert_eq!(table.get(1), Some(&entry(200)));
        assert_eq!(table.get(3), None);
    }
}
