//! Physical buffer storage and the submission queue.
//!
//! A [`Device`] owns the raw buffers the [`BufferManager`](crate::buffer::BufferManager)
//! hands out and executes copies, uploads and readbacks. All offsets and
//! lengths are in bytes.

pub(crate) mod host;
#[cfg(feature = "wgpu")]
pub(crate) mod gpu;

use crate::backend::Backend;
use crate::error::Result;
use crate::tensor::{BufferId, BufferUsage};

pub(crate) use host::HostDevice;

#[cfg(feature = "wgpu")]
pub(crate) use gpu::GpuDevice;

pub(crate) enum Device {
    Host(HostDevice),
    #[cfg(feature = "wgpu")]
    Gpu(GpuDevice),
}

impl Device {
    pub(crate) fn backend(&self) -> Backend {
        match self {
            Self::Host(_) => Backend::Cpu,
            #[cfg(feature = "wgpu")]
            Self::Gpu(_) => Backend::Wgpu,
        }
    }

    pub(crate) fn create_buffer(
        &mut self,
        id: BufferId,
        capacity: u64,
        usage: BufferUsage,
        label: &str,
    ) -> Result<()> {
        match self {
            Self::Host(host) => host.create_buffer(id, capacity),
            #[cfg(feature = "wgpu")]
            Self::Gpu(gpu) => gpu.create_buffer(id, capacity, usage, label),
        }
        .inspect(|_| log::trace!("created {id} `{label}` ({capacity} bytes, usage {:#x})", usage.bits()))
    }

    pub(crate) fn write(&mut self, id: BufferId, offset: u64, data: &[f32]) -> Result<()> {
        match self {
            Self::Host(host) => host.write(id, offset, data),
            #[cfg(feature = "wgpu")]
            Self::Gpu(gpu) => gpu.write(id, offset, data),
        }
    }

    pub(crate) fn copy(
        &mut self,
        src: BufferId,
        src_offset: u64,
        dst: BufferId,
        dst_offset: u64,
        len: u64,
    ) -> Result<()> {
        match self {
            Self::Host(host) => host.copy(src, src_offset, dst, dst_offset, len),
            #[cfg(feature = "wgpu")]
            Self::Gpu(gpu) => gpu.copy(src, src_offset, dst, dst_offset, len),
        }
    }

    /// Blocks until `len` bytes from the start of a mappable buffer are on the host.
    pub(crate) fn map_read(&mut self, id: BufferId, len: u64) -> Result<Vec<f32>> {
        match self {
            Self::Host(host) => host.map_read(id, len),
            #[cfg(feature = "wgpu")]
            Self::Gpu(gpu) => gpu.map_read(id, len),
        }
    }

    pub(crate) fn destroy(&mut self, id: BufferId) -> Result<()> {
        match self {
            Self::Host(host) => host.destroy(id),
            #[cfg(feature = "wgpu")]
            Self::Gpu(gpu) => gpu.destroy(id),
        }
    }

    /// Blocks until every submitted command has finished executing.
    pub(crate) fn wait_idle(&mut self) -> Result<()> {
        match self {
            Self::Host(_) => Ok(()),
            #[cfg(feature = "wgpu")]
            Self::Gpu(gpu) => gpu.wait_idle(),
        }
    }
}
