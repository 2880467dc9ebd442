//! Backends the scenarios run on.
//!
//! Each backend supplies its own headless device and the compute kernels the
//! scenarios dispatch: registered host closures on the software backend,
//! SPIR-V compiled from `shaders/` on Vulkan.

use crate::scenarios::{ProbeHit, ProbeRay, COPY_GROUP_BYTES};
use crate::{HarnessConfig, Result, TestError};
use glam::Vec3;
use std::path::{Path, PathBuf};
use tessera_hal::Api;
use tessera_soft::{Dispatch, Ray, RayFlags, SoftApi, SoftConfig, SoftDevice};
use tessera_vk::{DeviceBuilder, VkApi, VkDevice};
use tracing::debug;

/// Directory holding `copy.spv`, `probe_ray.spv` and `read_target.spv` for
/// the Vulkan backend.
pub const SPIRV_DIR_ENV: &str = "TESSERA_SPIRV_DIR";

/// Compute kernels used by the scenarios, in the backend's native bytecode.
#[derive(Debug, Clone)]
pub struct ShaderSet {
    /// Copies set 0 binding 0 into binding 1, [`COPY_GROUP_BYTES`] per workgroup.
    pub copy: Vec<u8>,
    /// Traces the [`ProbeRay`] at binding 0 through the TLAS at binding 1 and
    /// writes a [`ProbeHit`] to binding 2.
    pub probe_ray: Vec<u8>,
    /// Packs the RGBA8 image sampled through bindings 0 and 1 into one word
    /// per texel at binding 2.
    pub read_target: Vec<u8>,
}

/// A backend that can host the end-to-end scenarios.
pub trait ScenarioBackend: Api {
    /// Create a headless device.
    fn create_device(config: HarnessConfig) -> Result<Self::Device>;

    /// Load the scenario kernels for `device`.
    fn load_shaders(device: &Self::Device) -> Result<ShaderSet>;
}

const COPY_KERNEL: &str = "copy";
const PROBE_RAY_KERNEL: &str = "probe_ray";
const READ_TARGET_KERNEL: &str = "read_target";

impl ScenarioBackend for SoftApi {
    fn create_device(config: HarnessConfig) -> Result<SoftDevice> {
        Ok(SoftDevice::new(
            SoftConfig::default()
                .device_name("tessera-test")
                .ray_tracing(config.ray_tracing)
                .dedicated_upload_queue(config.dedicated_upload_queue),
        ))
    }

    fn load_shaders(device: &SoftDevice) -> Result<ShaderSet> {
        device.register_kernel(COPY_KERNEL, copy_kernel);
        device.register_kernel(PROBE_RAY_KERNEL, probe_ray_kernel);
        device.register_kernel(READ_TARGET_KERNEL, read_target_kernel);
        Ok(ShaderSet {
            copy: COPY_KERNEL.as_bytes().to_vec(),
            probe_ray: PROBE_RAY_KERNEL.as_bytes().to_vec(),
            read_target: READ_TARGET_KERNEL.as_bytes().to_vec(),
        })
    }
}

fn copy_kernel(dispatch: &Dispatch<'_>) -> tessera_core::Result<()> {
    let [groups, _, _] = dispatch.group_count();
    let len = dispatch
        .storage_size(0, 0)?
        .min(dispatch.storage_size(0, 1)?)
        .min(u64::from(groups) * COPY_GROUP_BYTES);
    let mut bytes = vec![0; len as usize];
    dispatch.read_storage(0, 0, 0, &mut bytes)?;
    dispatch.write_storage(0, 1, 0, &bytes)
}

fn probe_ray_kernel(dispatch: &Dispatch<'_>) -> tessera_core::Result<()> {
    let probe: ProbeRay = dispatch.read_uniform(0, 0)?;
    let ray = Ray::new(Vec3::from(probe.origin), Vec3::from(probe.direction))
        .with_interval(probe.t_min, probe.t_max)
        .with_flags(RayFlags::OPAQUE);
    let result = match dispatch.trace_ray(0, 1, &ray)? {
        Some(hit) => ProbeHit {
            hit: 1,
            instance_id: hit.instance_id,
            primitive_index: hit.primitive_index,
            t: hit.t,
        },
        None => ProbeHit::MISS,
    };
    dispatch.write_storage(0, 2, 0, bytemuck::bytes_of(&result))
}

/// RGBA8 texels are already one little-endian word each.
fn read_target_kernel(dispatch: &Dispatch<'_>) -> tessera_core::Result<()> {
    dispatch.sampler(0, 1, 0)?;
    let texels = dispatch.sampled_target_texels(0, 0, 0)?;
    dispatch.write_storage(0, 2, 0, &texels)
}

impl ScenarioBackend for VkApi {
    fn create_device(config: HarnessConfig) -> Result<VkDevice> {
        DeviceBuilder::new()
            .app_name("tessera-test")
            .validation(true)
            .ray_tracing(config.ray_tracing)
            .dedicated_upload_queue(config.dedicated_upload_queue)
            .build()
            .map_err(|e| TestError::Backend(e.into()))
    }

    fn load_shaders(_device: &VkDevice) -> Result<ShaderSet> {
        let dir = std::env::var_os(SPIRV_DIR_ENV)
            .map(PathBuf::from)
            .ok_or_else(|| TestError::MissingShader(format!("{SPIRV_DIR_ENV} is not set")))?;
        Ok(ShaderSet {
            copy: load_spirv(&dir, COPY_KERNEL)?,
            probe_ray: load_spirv(&dir, PROBE_RAY_KERNEL)?,
            read_target: load_spirv(&dir, READ_TARGET_KERNEL)?,
        })
    }
}

fn load_spirv(dir: &Path, name: &str) -> Result<Vec<u8>> {
    let path = dir.join(format!("{name}.spv"));
    if !path.is_file() {
        return Err(TestError::MissingShader(path.display().to_string()));
    }
    debug!(path = %path.display(), "loading SPIR-V");
    Ok(std::fs::read(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn software_kernels_are_named_by_their_bytecode() {
        let device = SoftApi::create_device(HarnessConfig::default()).unwrap();
        let shaders = SoftApi::load_shaders(&device).unwrap();
        assert_eq!(shaders.copy, b"copy");
        assert_eq!(shaders.probe_ray, b"probe_ray");
        assert_eq!(shaders.read_target, b"read_target");
        SoftApi::destroy_device(device);
    }

    #[test]
    fn missing_spirv_file_is_reported() {
        let dir = std::env::temp_dir().join("tessera-test-no-such-dir");
        let err = load_spirv(&dir, "copy").unwrap_err();
        assert!(matches!(err, TestError::MissingShader(path) if path.ends_with("copy.spv")));
    }
}
