use crate::config::DevicePreference;
use candle_core::{Device, utils};

use super::PipelineError;

/// Pick the compute device models are placed on.
///
/// CUDA wins when the crate is built with the `cuda` feature and a GPU is present, then Metal
/// under the `metal` feature; everything else runs on the CPU.
pub fn select_device(preference: DevicePreference) -> Result<Device, PipelineError> {
    let device = match preference {
        DevicePreference::Cpu => Device::Cpu,
        DevicePreference::Auto if utils::cuda_is_available() => {
            Device::new_cuda(0).map_err(PipelineError::Device)?
        }
        DevicePreference::Auto if utils::metal_is_available() => {
            Device::new_metal(0).map_err(PipelineError::Device)?
        }
        DevicePreference::Auto => Device::Cpu,
    };
    tracing::info!(
        device = device_label(&device),
        preference = ?preference,
        "Selected compute device"
    );
    Ok(device)
}

/// Short human-readable name of a device for logs.
pub fn device_label(device: &Device) -> &'static str {
    if device.is_cuda() {
        "cuda"
    } else if device.is_metal() {
        "metal"
    } else {
        "cpu"
    }
}
