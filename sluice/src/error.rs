use crate::vk;

/// Errors returned by hardware backends.
#[derive(Debug, thiserror::Error)]
pub enum HalError {
    #[error("the device was removed")]
    DeviceLost,
    #[error("out of memory")]
    OutOfMemory,
    #[error("Vulkan error: {0}")]
    Vulkan(vk::Result),
    #[error("allocation error")]
    Allocation(#[from] gpu_allocator::AllocationError),
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),
}

impl From<vk::Result> for HalError {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_DEVICE_LOST => HalError::DeviceLost,
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => HalError::OutOfMemory,
            other => HalError::Vulkan(other),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("hardware error")]
    Hal(#[from] HalError),
    #[error("I/O error")]
    Io(#[from] std::io::Error),
    #[error("invalid configuration")]
    Config(#[from] toml::de::Error),
    #[error("device `{0}` exposes no queues")]
    NoQueues(String),
}

/// Returned by blocking waits once the device has been lost.
#[derive(Copy, Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[error("the GPU device was lost")]
pub struct DeviceLost;
