//! Vulkan backend.
//!
//! Wraps a device created by the application. The device must have been created with the
//! `timelineSemaphore` and `hostQueryReset` features (Vulkan 1.2), and with `sparseBinding` if
//! reserved resources are committed.
//!
//! Fences are timeline semaphores. Waits and signals are empty `vkQueueSubmit`s carrying a
//! `VkTimelineSemaphoreSubmitInfo`. Query heaps are query pools paired with a host-visible
//! readback buffer that resolve command lists copy results into.
use super::{
    downcast, CommandList, HardwareCommandAllocator, HardwareDevice, HardwareFence, HardwareQueryHeap,
    HardwareQueue, PipelineStatisticsFlags, QueryType, QueueKind, ReservedResourceCommit, DEVICE_REMOVED_FENCE_VALUE,
};
use crate::error::HalError;
use ash::vk::{self, Handle};
use gpu_allocator::{
    vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc},
    MemoryLocation,
};
use parking_lot::Mutex;
use std::{
    any::Any,
    ffi::{c_void, CStr},
    ops::Range,
    sync::Arc,
    time::Duration,
};
use tracing::{debug, error};

/// A queue created along with the device.
#[derive(Copy, Clone, Debug)]
pub struct VulkanQueueDesc {
    pub kind: QueueKind,
    pub family_index: u32,
    pub queue: vk::Queue,
}

struct DeviceInner {
    device: ash::Device,
    allocator: Mutex<Allocator>,
}

pub struct VulkanDevice {
    name: String,
    inner: Arc<DeviceInner>,
    queues: Vec<Arc<VulkanQueue>>,
}

impl VulkanDevice {
    /// Wraps an existing device.
    ///
    /// # Safety
    ///
    /// `device` must have been created from `physical_device` with the features listed in the
    /// module documentation, and each queue in `queues` must belong to it. The device must
    /// outlive every object created from the returned `VulkanDevice`.
    pub unsafe fn new(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: ash::Device,
        queues: &[VulkanQueueDesc],
    ) -> Result<VulkanDevice, HalError> {
        let properties = instance.get_physical_device_properties(physical_device);
        let name = CStr::from_ptr(properties.device_name.as_ptr())
            .to_string_lossy()
            .into_owned();
        let timestamp_period = properties.limits.timestamp_period;

        let allocator = Allocator::new(&AllocatorCreateDesc {
            physical_device,
            debug_settings: Default::default(),
            device: device.clone(),
            instance: instance.clone(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })?;

        let inner = Arc::new(DeviceInner {
            device,
            allocator: Mutex::new(allocator),
        });
        let queues = queues
            .iter()
            .map(|desc| {
                Arc::new(VulkanQueue {
                    inner: inner.clone(),
                    kind: desc.kind,
                    family_index: desc.family_index,
                    queue: Mutex::new(desc.queue),
                    timestamp_period,
                })
            })
            .collect();

        debug!(device = %name, timestamp_period, "wrapped Vulkan device");
        Ok(VulkanDevice { name, inner, queues })
    }

    pub fn raw(&self) -> &ash::Device {
        &self.inner.device
    }
}

impl HardwareDevice for VulkanDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn queue(&self, kind: QueueKind) -> Option<Arc<dyn HardwareQueue>> {
        self.queues
            .iter()
            .find(|queue| queue.kind == kind)
            .map(|queue| queue.clone() as Arc<dyn HardwareQueue>)
    }

    fn create_fence(&self, initial_value: u64) -> Result<Arc<dyn HardwareFence>, HalError> {
        let mut timeline_create_info = vk::SemaphoreTypeCreateInfo {
            semaphore_type: vk::SemaphoreType::TIMELINE,
            initial_value,
            ..Default::default()
        };
        let semaphore_create_info = vk::SemaphoreCreateInfo::builder().push_next(&mut timeline_create_info);
        let semaphore = unsafe { self.inner.device.create_semaphore(&semaphore_create_info, None)? };
        Ok(Arc::new(VulkanFence {
            inner: self.inner.clone(),
            semaphore,
        }))
    }

    fn create_query_heap(&self, ty: QueryType, capacity: u32) -> Result<Box<dyn HardwareQueryHeap>, HalError> {
        Ok(Box::new(unsafe { VulkanQueryHeap::new(&self.inner, ty, capacity)? }))
    }

    fn create_command_allocator(&self, kind: QueueKind) -> Result<Box<dyn HardwareCommandAllocator>, HalError> {
        let family_index = self
            .queues
            .iter()
            .find(|queue| queue.kind == kind)
            .map(|queue| queue.family_index)
            .ok_or(HalError::Unsupported("no queue of this kind"))?;
        Ok(Box::new(unsafe { VulkanCommandAllocator::new(&self.inner, family_index)? }))
    }
}

pub struct VulkanQueue {
    inner: Arc<DeviceInner>,
    kind: QueueKind,
    family_index: u32,
    /// Access to a `VkQueue` must be externally synchronized.
    queue: Mutex<vk::Queue>,
    timestamp_period: f32,
}

impl VulkanQueue {
    fn submit(
        &self,
        command_buffers: &[vk::CommandBuffer],
        waits: &[(vk::Semaphore, u64)],
        signals: &[(vk::Semaphore, u64)],
    ) -> Result<(), HalError> {
        let wait_semaphores: Vec<_> = waits.iter().map(|(semaphore, _)| *semaphore).collect();
        let wait_semaphore_values: Vec<_> = waits.iter().map(|(_, value)| *value).collect();
        let wait_semaphore_dst_stages = vec![vk::PipelineStageFlags::ALL_COMMANDS; waits.len()];
        let signal_semaphores: Vec<_> = signals.iter().map(|(semaphore, _)| *semaphore).collect();
        let signal_semaphore_values: Vec<_> = signals.iter().map(|(_, value)| *value).collect();

        let timeline_submit_info = vk::TimelineSemaphoreSubmitInfo {
            wait_semaphore_value_count: wait_semaphore_values.len() as u32,
            p_wait_semaphore_values: wait_semaphore_values.as_ptr(),
            signal_semaphore_value_count: signal_semaphore_values.len() as u32,
            p_signal_semaphore_values: signal_semaphore_values.as_ptr(),
            ..Default::default()
        };

        let submit_info = vk::SubmitInfo {
            p_next: &timeline_submit_info as *const _ as *const c_void,
            wait_semaphore_count: wait_semaphores.len() as u32,
            p_wait_semaphores: wait_semaphores.as_ptr(),
            p_wait_dst_stage_mask: wait_semaphore_dst_stages.as_ptr(),
            command_buffer_count: command_buffers.len() as u32,
            p_command_buffers: command_buffers.as_ptr(),
            signal_semaphore_count: signal_semaphores.len() as u32,
            p_signal_semaphores: signal_semaphores.as_ptr(),
            ..Default::default()
        };

        let queue = self.queue.lock();
        unsafe { self.inner.device.queue_submit(*queue, &[submit_info], vk::Fence::null())? };
        Ok(())
    }
}

fn semaphore(fence: &dyn HardwareFence) -> Result<vk::Semaphore, HalError> {
    Ok(downcast::<VulkanFence>(fence.as_any(), "fence from another backend")?.semaphore)
}

impl HardwareQueue for VulkanQueue {
    fn kind(&self) -> QueueKind {
        self.kind
    }

    fn execute(&self, command_lists: &[CommandList]) -> Result<(), HalError> {
        let command_buffers: Vec<_> = command_lists
            .iter()
            .map(|list| vk::CommandBuffer::from_raw(list.0))
            .collect();
        self.submit(&command_buffers, &[], &[])
    }

    fn wait(&self, fence: &dyn HardwareFence, value: u64) -> Result<(), HalError> {
        self.submit(&[], &[(semaphore(fence)?, value)], &[])
    }

    fn signal(&self, fence: &dyn HardwareFence, value: u64) -> Result<(), HalError> {
        self.submit(&[], &[], &[(semaphore(fence)?, value)])
    }

    fn update_reserved_resources(&self, commits: &[ReservedResourceCommit]) -> Result<(), HalError> {
        let binds: Vec<Vec<vk::SparseMemoryBind>> = commits
            .iter()
            .map(|commit| {
                commit
                    .bindings
                    .iter()
                    .map(|binding| vk::SparseMemoryBind {
                        resource_offset: binding.resource_offset,
                        size: binding.size,
                        memory: binding.memory.map_or(vk::DeviceMemory::null(), vk::DeviceMemory::from_raw),
                        memory_offset: binding.memory_offset,
                        flags: vk::SparseMemoryBindFlags::empty(),
                    })
                    .collect()
            })
            .collect();
        let buffer_binds: Vec<_> = commits
            .iter()
            .zip(binds.iter())
            .map(|(commit, binds)| vk::SparseBufferMemoryBindInfo {
                buffer: vk::Buffer::from_raw(commit.resource.0),
                bind_count: binds.len() as u32,
                p_binds: binds.as_ptr(),
            })
            .collect();
        let bind_info = vk::BindSparseInfo {
            buffer_bind_count: buffer_binds.len() as u32,
            p_buffer_binds: buffer_binds.as_ptr(),
            ..Default::default()
        };

        let queue = self.queue.lock();
        unsafe {
            self.inner
                .device
                .queue_bind_sparse(*queue, &[bind_info], vk::Fence::null())?
        };
        Ok(())
    }

    fn timestamp_frequency(&self) -> u64 {
        if self.timestamp_period <= 0.0 {
            return 0;
        }
        (1_000_000_000.0 / self.timestamp_period as f64) as u64
    }
}

pub struct VulkanFence {
    inner: Arc<DeviceInner>,
    semaphore: vk::Semaphore,
}

impl VulkanFence {
    pub fn raw(&self) -> vk::Semaphore {
        self.semaphore
    }
}

impl HardwareFence for VulkanFence {
    fn completed_value(&self) -> u64 {
        match unsafe { self.inner.device.get_semaphore_counter_value(self.semaphore) } {
            Ok(value) => value,
            Err(vk::Result::ERROR_DEVICE_LOST) => DEVICE_REMOVED_FENCE_VALUE,
            Err(err) => {
                error!("vkGetSemaphoreCounterValue failed: {err}");
                DEVICE_REMOVED_FENCE_VALUE
            }
        }
    }

    fn wait(&self, value: u64, timeout: Duration) -> bool {
        let semaphores = [self.semaphore];
        let values = [value];
        let wait_info = vk::SemaphoreWaitInfo {
            semaphore_count: 1,
            p_semaphores: semaphores.as_ptr(),
            p_values: values.as_ptr(),
            ..Default::default()
        };
        let timeout_ns = timeout.as_nanos().min(u64::MAX as u128) as u64;
        match unsafe { self.inner.device.wait_semaphores(&wait_info, timeout_ns) } {
            Ok(()) => true,
            Err(vk::Result::TIMEOUT) | Err(vk::Result::ERROR_DEVICE_LOST) => false,
            Err(err) => {
                error!("vkWaitSemaphores failed: {err}");
                false
            }
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for VulkanFence {
    fn drop(&mut self) {
        unsafe {
            self.inner.device.destroy_semaphore(self.semaphore, None);
        }
    }
}

const PIPELINE_STATISTICS: [(PipelineStatisticsFlags, vk::QueryPipelineStatisticFlags); 7] = [
    (
        PipelineStatisticsFlags::INPUT_ASSEMBLY_VERTICES,
        vk::QueryPipelineStatisticFlags::INPUT_ASSEMBLY_VERTICES,
    ),
    (
        PipelineStatisticsFlags::INPUT_ASSEMBLY_PRIMITIVES,
        vk::QueryPipelineStatisticFlags::INPUT_ASSEMBLY_PRIMITIVES,
    ),
    (
        PipelineStatisticsFlags::VERTEX_SHADER_INVOCATIONS,
        vk::QueryPipelineStatisticFlags::VERTEX_SHADER_INVOCATIONS,
    ),
    (
        PipelineStatisticsFlags::CLIPPING_INVOCATIONS,
        vk::QueryPipelineStatisticFlags::CLIPPING_INVOCATIONS,
    ),
    (
        PipelineStatisticsFlags::CLIPPING_PRIMITIVES,
        vk::QueryPipelineStatisticFlags::CLIPPING_PRIMITIVES,
    ),
    (
        PipelineStatisticsFlags::FRAGMENT_SHADER_INVOCATIONS,
        vk::QueryPipelineStatisticFlags::FRAGMENT_SHADER_INVOCATIONS,
    ),
    (
        PipelineStatisticsFlags::COMPUTE_SHADER_INVOCATIONS,
        vk::QueryPipelineStatisticFlags::COMPUTE_SHADER_INVOCATIONS,
    ),
];

/// Vulkan writes the enabled counters in bit order, which matches `PipelineStatisticsFlags`.
fn pipeline_statistics_flags(counters: PipelineStatisticsFlags) -> vk::QueryPipelineStatisticFlags {
    PIPELINE_STATISTICS
        .iter()
        .filter(|(flag, _)| counters.contains(*flag))
        .fold(vk::QueryPipelineStatisticFlags::empty(), |acc, (_, vk_flag)| acc | *vk_flag)
}

pub struct VulkanQueryHeap {
    inner: Arc<DeviceInner>,
    ty: QueryType,
    capacity: u32,
    pool: vk::QueryPool,
    buffer: vk::Buffer,
    allocation: Option<Allocation>,
}

impl VulkanQueryHeap {
    unsafe fn new(inner: &Arc<DeviceInner>, ty: QueryType, capacity: u32) -> Result<VulkanQueryHeap, HalError> {
        let device = &inner.device;
        let (query_type, pipeline_statistics) = match ty {
            QueryType::Occlusion => (vk::QueryType::OCCLUSION, vk::QueryPipelineStatisticFlags::empty()),
            QueryType::Timestamp => (vk::QueryType::TIMESTAMP, vk::QueryPipelineStatisticFlags::empty()),
            QueryType::PipelineStatistics => (
                vk::QueryType::PIPELINE_STATISTICS,
                pipeline_statistics_flags(PipelineStatisticsFlags::all()),
            ),
        };
        let pool = device.create_query_pool(
            &vk::QueryPoolCreateInfo {
                query_type,
                query_count: capacity,
                pipeline_statistics,
                ..Default::default()
            },
            None,
        )?;
        device.reset_query_pool(pool, 0, capacity);

        let size = capacity as u64 * ty.words_per_query() as u64 * 8;
        let buffer = match device.create_buffer(
            &vk::BufferCreateInfo {
                size,
                usage: vk::BufferUsageFlags::TRANSFER_DST,
                sharing_mode: vk::SharingMode::EXCLUSIVE,
                ..Default::default()
            },
            None,
        ) {
            Ok(buffer) => buffer,
            Err(err) => {
                device.destroy_query_pool(pool, None);
                return Err(err.into());
            }
        };

        let requirements = device.get_buffer_memory_requirements(buffer);
        let allocation = inner.allocator.lock().allocate(&AllocationCreateDesc {
            name: "query readback",
            requirements,
            location: MemoryLocation::GpuToCpu,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        });
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(err) => {
                device.destroy_buffer(buffer, None);
                device.destroy_query_pool(pool, None);
                return Err(err.into());
            }
        };

        let heap = VulkanQueryHeap {
            inner: inner.clone(),
            ty,
            capacity,
            pool,
            buffer,
            allocation: Some(allocation),
        };
        if let Some(allocation) = &heap.allocation {
            // on failure, `heap` releases everything when dropped
            device.bind_buffer_memory(buffer, allocation.memory(), allocation.offset())?;
        }
        Ok(heap)
    }

    fn stride(&self) -> u64 {
        self.ty.words_per_query() as u64 * 8
    }
}

impl HardwareQueryHeap for VulkanQueryHeap {
    fn query_type(&self) -> QueryType {
        self.ty
    }

    fn capacity(&self) -> u32 {
        self.capacity
    }

    fn read_results(&self, range: Range<u32>, out: &mut [u64]) -> Result<(), HalError> {
        let mapped = self
            .allocation
            .as_ref()
            .and_then(|allocation| allocation.mapped_slice())
            .ok_or(HalError::Unsupported("query readback buffer is not host-visible"))?;
        let start = range.start as usize * self.stride() as usize;
        let bytes = &mapped[start..start + out.len() * 8];
        for (word, chunk) in out.iter_mut().zip(bytes.chunks_exact(8)) {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(chunk);
            *word = u64::from_ne_bytes(raw);
        }
        Ok(())
    }

    fn reset(&self) -> Result<(), HalError> {
        unsafe {
            self.inner.device.reset_query_pool(self.pool, 0, self.capacity);
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for VulkanQueryHeap {
    fn drop(&mut self) {
        if let Some(allocation) = self.allocation.take() {
            if let Err(err) = self.inner.allocator.lock().free(allocation) {
                error!("failed to free query readback memory: {err}");
            }
        }
        unsafe {
            self.inner.device.destroy_buffer(self.buffer, None);
            self.inner.device.destroy_query_pool(self.pool, None);
        }
    }
}

pub struct VulkanCommandAllocator {
    inner: Arc<DeviceInner>,
    command_pool: vk::CommandPool,
    free: Vec<vk::CommandBuffer>,
    used: Vec<vk::CommandBuffer>,
}

impl VulkanCommandAllocator {
    unsafe fn new(inner: &Arc<DeviceInner>, queue_family_index: u32) -> Result<VulkanCommandAllocator, HalError> {
        let create_info = vk::CommandPoolCreateInfo {
            flags: vk::CommandPoolCreateFlags::TRANSIENT,
            queue_family_index,
            ..Default::default()
        };
        let command_pool = inner.device.create_command_pool(&create_info, None)?;
        Ok(VulkanCommandAllocator {
            inner: inner.clone(),
            command_pool,
            free: vec![],
            used: vec![],
        })
    }

    fn alloc(&mut self) -> Result<vk::CommandBuffer, HalError> {
        let cb = match self.free.pop() {
            Some(cb) => cb,
            None => unsafe {
                let allocate_info = vk::CommandBufferAllocateInfo {
                    command_pool: self.command_pool,
                    level: vk::CommandBufferLevel::PRIMARY,
                    command_buffer_count: 1,
                    ..Default::default()
                };
                let buffers = self.inner.device.allocate_command_buffers(&allocate_info)?;
                buffers[0]
            },
        };
        self.used.push(cb);
        Ok(cb)
    }

    /// Allocates a command buffer and records it with `record`.
    fn record(&mut self, record: impl FnOnce(&ash::Device, vk::CommandBuffer)) -> Result<CommandList, HalError> {
        let cb = self.alloc()?;
        let device = &self.inner.device;
        unsafe {
            device.begin_command_buffer(
                cb,
                &vk::CommandBufferBeginInfo {
                    flags: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
                    ..Default::default()
                },
            )?;
            record(device, cb);
            device.end_command_buffer(cb)?;
        }
        Ok(CommandList(cb.as_raw()))
    }
}

impl HardwareCommandAllocator for VulkanCommandAllocator {
    fn allocate(&mut self) -> Result<CommandList, HalError> {
        Ok(CommandList(self.alloc()?.as_raw()))
    }

    fn record_query_resolve(&mut self, runs: &[(&dyn HardwareQueryHeap, Range<u32>)]) -> Result<CommandList, HalError> {
        let mut copies = Vec::with_capacity(runs.len());
        for (heap, range) in runs {
            let heap = downcast::<VulkanQueryHeap>(heap.as_any(), "query heap from another backend")?;
            copies.push((heap.pool, heap.buffer, heap.stride(), range.clone()));
        }
        self.record(|device, cb| unsafe {
            for (pool, buffer, stride, range) in copies {
                device.cmd_copy_query_pool_results(
                    cb,
                    pool,
                    range.start,
                    range.end - range.start,
                    buffer,
                    range.start as u64 * stride,
                    stride,
                    vk::QueryResultFlags::TYPE_64 | vk::QueryResultFlags::WAIT,
                );
            }
            device.cmd_pipeline_barrier(
                cb,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::HOST,
                vk::DependencyFlags::empty(),
                &[vk::MemoryBarrier {
                    src_access_mask: vk::AccessFlags::TRANSFER_WRITE,
                    dst_access_mask: vk::AccessFlags::HOST_READ,
                    ..Default::default()
                }],
                &[],
                &[],
            );
        })
    }

    fn record_timestamp(&mut self, heap: &dyn HardwareQueryHeap, index: u32) -> Result<CommandList, HalError> {
        let pool = downcast::<VulkanQueryHeap>(heap.as_any(), "query heap from another backend")?.pool;
        self.record(|device, cb| unsafe {
            device.cmd_write_timestamp(cb, vk::PipelineStageFlags::BOTTOM_OF_PIPE, pool, index);
        })
    }

    fn reset(&mut self) -> Result<(), HalError> {
        unsafe {
            self.inner
                .device
                .reset_command_pool(self.command_pool, vk::CommandPoolResetFlags::empty())?;
        }
        self.free.append(&mut self.used);
        Ok(())
    }
}

impl Drop for VulkanCommandAllocator {
    fn drop(&mut self) {
        unsafe {
            self.inner.device.destroy_command_pool(self.command_pool, None);
        }
    }
}
