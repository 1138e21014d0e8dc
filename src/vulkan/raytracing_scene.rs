use ash::vk;
use ultraviolet::Mat4;

use crate::config::EngineConfig;
use crate::error::{RenderError, RenderResult};
use crate::vulkan::acceleration_structure::{
    build_blas, build_tlas, AccelKHR, BlasInput, Tlas, TlasInstance,
};
use crate::vulkan::buffer::Buffer;
use crate::vulkan::command_pool::CommandPool;
use crate::vulkan::model_data::{GpuModelData, ModelDataTable};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccelSettings {
    pub batch_budget: u64,
    pub compact: bool,
    /// Allows refitting the TLAS with new transforms.
    pub allow_update: bool,
}

impl AccelSettings {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            batch_budget: config.blas_batch_budget,
            compact: config.compact_blas,
            allow_update: false,
        }
    }

    pub fn blas_flags(&self) -> vk::BuildAccelerationStructureFlagsKHR {
        let mut flags = vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE;
        if self.compact {
            flags |= vk::BuildAccelerationStructureFlagsKHR::ALLOW_COMPACTION;
        }
        flags
    }

    pub fn tlas_flags(&self) -> vk::BuildAccelerationStructureFlagsKHR {
        let mut flags = vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE;
        if self.allow_update {
            flags |= vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE;
        }
        flags
    }
}

/// One drawable sub-range of a mesh.
#[derive(Debug, Clone, Copy)]
pub struct SceneMesh {
    pub blas_input: BlasInput,
    pub model_data: GpuModelData,
    pub transform: Mat4,
}

/// BLAS, TLAS and model data of a scene, all in the same order: mesh `i` owns
/// BLAS `i`, TLAS instance `i` and model data entry `i`.
pub struct RaytracingScene {
    blas: Vec<AccelKHR>,
    instances: Vec<TlasInstance>,
    tlas: Tlas,
    model_data: ModelDataTable,
    model_data_buffer: Buffer<GpuModelData>,
    settings: AccelSettings,
}

impl RaytracingScene {
    pub fn setup(
        command_pool: &CommandPool,
        meshes: &[SceneMesh],
        settings: AccelSettings,
    ) -> RenderResult<Self> {
        if meshes.is_empty() {
            return Err(RenderError::InvalidAccess(
                "a raytracing scene needs at least one mesh".to_string(),
            ));
        }

        let inputs: Vec<_> = meshes.iter().map(|mesh| mesh.blas_input).collect();
        let blas = build_blas(
            command_pool,
            &inputs,
            settings.blas_flags(),
            settings.batch_budget,
        )?;

        let mut model_data = ModelDataTable::new();
        let instances = meshes
            .iter()
            .zip(&blas)
            .map(|(mesh, blas)| {
                let custom_index = model_data.push(mesh.model_data)?;
                Ok(TlasInstance::new(blas, custom_index).with_transform(mesh.transform))
            })
            .collect::<RenderResult<Vec<_>>>()?;

        let mut tlas = None;
        build_tlas(
            command_pool,
            &mut tlas,
            &instances,
            settings.tlas_flags(),
            false,
        )?;
        let tlas = tlas.ok_or_else(|| {
            RenderError::InvalidAccess("TLAS build produced no structure".to_string())
        })?;

        let model_data_buffer = model_data.upload(command_pool)?;
        log::info!("Raytracing scene ready with {} meshes", meshes.len());

        Ok(Self {
            blas,
            instances,
            tlas,
            model_data,
            model_data_buffer,
            settings,
        })
    }

    /// The handle bound by the raytracing dispatch every frame.
    pub fn tlas_handle(&self) -> vk::AccelerationStructureKHR {
        self.tlas.handle()
    }

    pub fn tlas(&self) -> &Tlas {
        &self.tlas
    }

    pub fn blas(&self) -> &[AccelKHR] {
        &self.blas
    }

    pub fn model_data(&self) -> &ModelDataTable {
        &self.model_data
    }

    pub fn model_data_buffer(&self) -> &Buffer<GpuModelData> {
        &self.model_data_buffer
    }

    /// Moves the meshes and refits the TLAS. Needs `allow_update`.
    pub fn set_transforms(&mut self, transforms: &[Mat4]) -> RenderResult<()> {
        if !self.settings.allow_update {
            return Err(RenderError::UnsupportedFeature(
                "TLAS was built without allow_update".to_string(),
            ));
        }
        if transforms.len() != self.instances.len() {
            return Err(RenderError::InvalidAccess(format!(
                "got {} transforms for {} instances",
                transforms.len(),
                self.instances.len()
            )));
        }
        for (instance, transform) in self.instances.iter_mut().zip(transforms) {
            instance.transform = *transform;
        }

        self.tlas.update(&self.instances)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_follow_config() {
        let config = EngineConfig {
            compact_blas: false,
            blas_batch_budget: 1024,
            ..EngineConfig::default()
        };
        let settings = AccelSettings::from_config(&config);
        assert_eq!(settings.batch_budget, 1024);
        assert!(!settings
            .blas_flags()
            .contains(vk::BuildAccelerationStructureFlagsKHR::ALLOW_COMPACTION));
        assert!(!settings
            .tlas_flags()
            .contains(vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE));
    }

    #[test]
    fn compaction_and_update_set_their_flags() {
        let settings = AccelSettings {
            batch_budget: 1,
            compact: true,
            allow_update: true,
        };
        assert!(settings
            .blas_flags()
            .contains(vk::BuildAccelerationStructureFlagsKHR::ALLOW_COMPACTION));
        assert!(settings
            .tlas_flags()
            .contains(vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE));
    }
}
