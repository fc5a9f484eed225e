use anyhow::{Result, bail};
use candle_core::{Device, utils::metal_is_available};

/// Name of the compute device a model is placed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum DeviceName {
    #[strum(to_string = "CPU")]
    Cpu,
    #[strum(to_string = "CUDA")]
    Cuda,
    #[strum(to_string = "Metal")]
    Metal,
}

impl DeviceName {
    pub fn of(device: &Device) -> Self {
        match device {
            Device::Cpu => DeviceName::Cpu,
            Device::Cuda(_) => DeviceName::Cuda,
            Device::Metal(_) => DeviceName::Metal,
        }
    }
}

/// First usable GPU, CUDA before Metal. Unlike CPU selection there is no silent fallback.
pub fn gpu_device() -> Result<Device> {
    if cuda_is_available() {
        Ok(Device::new_cuda(0)?)
    } else if metal_is_available() {
        Ok(Device::new_metal(0)?)
    } else {
        bail!("neither CUDA nor Metal is available")
    }
}

pub fn cuda_is_available() -> bool {
    cfg!(feature = "cuda")
        && unsafe {
            libloading::Library::new(if cfg!(target_os = "windows") {
                "nvcuda.dll"
            } else {
                "libcuda.so"
            })
            .is_ok()
        }
}
