// Shader module loading
//
// Shaders are SPIR-V compiled ahead of time by build.rs and read at runtime,
// so a recompiled shader can be picked up without rebuilding the binary.

use std::io::Cursor;
use std::path::Path;

use anyhow::{Context, Result};
use ash::vk;

use super::VulkanDevice;
use crate::error::{GpuResult, VkResultExt};

/// Read a SPIR-V file into properly aligned words
pub fn read_spirv(path: impl AsRef<Path>) -> Result<Vec<u32>> {
    let path = path.as_ref();
    let bytes = std::fs::read(path).with_context(|| format!("Failed to read shader {:?}", path))?;
    ash::util::read_spv(&mut Cursor::new(bytes)).with_context(|| format!("Invalid SPIR-V in {:?}", path))
}

/// Create a shader module from SPIR-V words
pub fn create_shader_module(device: &VulkanDevice, code: &[u32]) -> GpuResult<vk::ShaderModule> {
    let create_info = vk::ShaderModuleCreateInfo::builder().code(code);
    unsafe { device.device.create_shader_module(&create_info, None) }.creating("shader module")
}
