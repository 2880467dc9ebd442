//! GPU memory management.

use crate::error::{Result, VkError};
use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::MemoryLocation;
use std::sync::Arc;

/// A buffer handle with its bound allocation.
#[derive(Debug)]
pub struct BufferAllocation {
    pub buffer: vk::Buffer,
    pub allocation: Option<Allocation>,
    pub size: u64,
}

impl BufferAllocation {
    /// Host pointer of the mapped allocation, if host-visible.
    pub fn mapped_ptr(&self) -> Option<*mut u8> {
        self.allocation
            .as_ref()
            .and_then(Allocation::mapped_ptr)
            .map(|p| p.as_ptr().cast::<u8>())
    }

    fn checked_range(&self, offset: u64, len: usize) -> Result<*mut u8> {
        let ptr = self
            .mapped_ptr()
            .ok_or_else(|| VkError::InvalidState("Buffer not mapped".to_string()))?;
        let end = offset
            .checked_add(len as u64)
            .ok_or_else(|| VkError::InvalidState("Offset overflow".to_string()))?;
        if end > self.size {
            return Err(VkError::InvalidState(format!(
                "Range {offset}..{end} out of buffer of {} bytes",
                self.size
            )));
        }
        Ok(ptr)
    }

    /// Write raw bytes at `offset` (must be host-visible).
    pub fn write_bytes(&self, offset: u64, data: &[u8]) -> Result<()> {
        let ptr = self.checked_range(offset, data.len())?;
        // SAFETY: the range was checked against the mapped allocation.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.add(offset as usize), data.len());
        }
        Ok(())
    }

    /// Read raw bytes at `offset` (must be host-visible).
    pub fn read_bytes(&self, offset: u64, out: &mut [u8]) -> Result<()> {
        let ptr = self.checked_range(offset, out.len())?;
        // SAFETY: the range was checked against the mapped allocation.
        unsafe {
            std::ptr::copy_nonoverlapping(ptr.add(offset as usize), out.as_mut_ptr(), out.len());
        }
        Ok(())
    }
}

/// An image handle with its bound allocation.
#[derive(Debug)]
pub struct ImageAllocation {
    pub image: vk::Image,
    pub allocation: Option<Allocation>,
}

/// GPU memory allocator wrapper.
pub struct GpuAllocator {
    allocator: Option<Allocator>,
    device: Arc<ash::Device>,
    live: usize,
}

impl GpuAllocator {
    /// Create a new allocator.
    ///
    /// # Safety
    /// The instance, device, and physical device must be valid.
    pub unsafe fn new(
        instance: &ash::Instance,
        device: Arc<ash::Device>,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Self> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: (*device).clone(),
            physical_device,
            debug_settings: gpu_allocator::AllocatorDebugSettings {
                log_memory_information: cfg!(debug_assertions),
                log_leaks_on_shutdown: true,
                store_stack_traces: false,
                log_allocations: false,
                log_frees: false,
                log_stack_traces: false,
            },
            buffer_device_address: true,
            allocation_sizes: Default::default(),
        })?;

        Ok(Self {
            allocator: Some(allocator),
            device,
            live: 0,
        })
    }

    fn allocator(&mut self) -> Result<&mut Allocator> {
        self.allocator
            .as_mut()
            .ok_or_else(|| VkError::InvalidState("Allocator not initialized".to_string()))
    }

    /// Number of allocations not yet freed.
    pub fn live_allocations(&self) -> usize {
        self.live
    }

    /// Create a buffer and bind fresh memory to it.
    ///
    /// `min_alignment` raises the memory alignment above what the driver
    /// reports, for buffers whose device address must be aligned.
    pub fn create_buffer(
        &mut self,
        size: u64,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        name: &str,
        min_alignment: u64,
    ) -> Result<BufferAllocation> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { self.device.create_buffer(&buffer_info, None)? };

        let mut requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };
        requirements.alignment = requirements.alignment.max(min_alignment);

        let allocation = self.allocator().and_then(|allocator| {
            Ok(allocator.allocate(&AllocationCreateDesc {
                name,
                requirements,
                location,
                linear: true,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })?)
        });
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(error) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(error);
            }
        };

        // SAFETY: the memory handle stays owned by the allocation, which outlives the binding.
        let memory = unsafe { allocation.memory() };
        let offset = allocation.offset();
        let mut bound = BufferAllocation {
            buffer,
            allocation: Some(allocation),
            size,
        };
        self.live += 1;
        if let Err(error) = unsafe { self.device.bind_buffer_memory(buffer, memory, offset) } {
            self.free_buffer(&mut bound)?;
            return Err(error.into());
        }
        Ok(bound)
    }

    /// Destroy a buffer and free its allocation.
    pub fn free_buffer(&mut self, buffer: &mut BufferAllocation) -> Result<()> {
        if let Some(allocation) = buffer.allocation.take() {
            self.allocator()?.free(allocation)?;
            self.live -= 1;
        }

        unsafe {
            self.device.destroy_buffer(buffer.buffer, None);
        }
        buffer.buffer = vk::Buffer::null();

        Ok(())
    }

    /// Create an image and bind fresh memory to it.
    pub fn create_image(
        &mut self,
        create_info: &vk::ImageCreateInfo,
        location: MemoryLocation,
        name: &str,
    ) -> Result<ImageAllocation> {
        let image = unsafe { self.device.create_image(create_info, None)? };

        let requirements = unsafe { self.device.get_image_memory_requirements(image) };

        let allocation = self.allocator().and_then(|allocator| {
            Ok(allocator.allocate(&AllocationCreateDesc {
                name,
                requirements,
                location,
                linear: false,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })?)
        });
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(error) => {
                unsafe { self.device.destroy_image(image, None) };
                return Err(error);
            }
        };

        // SAFETY: the memory handle stays owned by the allocation, which outlives the binding.
        let memory = unsafe { allocation.memory() };
        let offset = allocation.offset();
        let mut bound = ImageAllocation {
            image,
            allocation: Some(allocation),
        };
        self.live += 1;
        if let Err(error) = unsafe { self.device.bind_image_memory(image, memory, offset) } {
            self.free_image(&mut bound)?;
            return Err(error.into());
        }
        Ok(bound)
    }

    /// Destroy an image and free its allocation.
    pub fn free_image(&mut self, image: &mut ImageAllocation) -> Result<()> {
        if let Some(allocation) = image.allocation.take() {
            self.allocator()?.free(allocation)?;
            self.live -= 1;
        }

        unsafe {
            self.device.destroy_image(image.image, None);
        }
        image.image = vk::Image::null();

        Ok(())
    }

    /// Shutdown the allocator, freeing all GPU memory.
    ///
    /// Must be called before the Vulkan device is destroyed. Remaining
    /// allocations are freed and logged as leaks.
    pub fn shutdown(&mut self) {
        if let Some(allocator) = self.allocator.take() {
            drop(allocator);
        }
    }
}

impl Drop for GpuAllocator {
    fn drop(&mut self) {
        self.shutdown();
    }
}
