//! `wgpu` device: adapter and queue acquisition, raw buffers and readback.

use crate::error::{Error, Result};
use crate::tensor::{BufferId, BufferUsage};
use std::collections::HashMap;
use thiserror::Error;

/// Failures reported by `wgpu` itself.
#[derive(Debug, Error)]
pub enum GpuError {
    /// No adapter matched the request.
    #[error("adapter request failed: {0}")]
    Adapter(#[from] wgpu::RequestAdapterError),
    /// The adapter refused to create a device.
    #[error("device request failed: {0}")]
    Device(#[from] wgpu::RequestDeviceError),
    /// Waiting on the queue failed.
    #[error("device poll failed: {0}")]
    Poll(#[from] wgpu::PollError),
    /// A readback buffer could not be mapped.
    #[error("buffer mapping failed: {0}")]
    Map(#[from] wgpu::BufferAsyncError),
    /// The map callback was dropped without reporting a result.
    #[error("buffer mapping was abandoned")]
    MapAbandoned,
}

/// Device, queue and every buffer allocated on them.
pub(crate) struct GpuDevice {
    pub(crate) device: wgpu::Device,
    pub(crate) queue: wgpu::Queue,
    buffers: HashMap<BufferId, wgpu::Buffer>,
}

impl GpuDevice {
    /// Selects the default adapter and creates a device and queue on it.
    ///
    /// The async `wgpu` requests are driven to completion with `pollster`.
    pub(crate) fn new() -> Result<Self, GpuError> {
        let instance = wgpu::Instance::default();
        let adapter =
            pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions::default()))?;
        let info = adapter.get_info();
        log::info!("using adapter `{}` ({:?})", info.name, info.backend);

        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("gpugrad"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::default(),
            memory_hints: wgpu::MemoryHints::Performance,
            ..Default::default()
        }))?;

        Ok(Self {
            device,
            queue,
            buffers: HashMap::new(),
        })
    }

    pub(crate) fn buffer(&self, id: BufferId) -> Result<&wgpu::Buffer> {
        self.buffers.get(&id).ok_or(Error::BufferReleased(id))
    }

    pub(crate) fn create_buffer(
        &mut self,
        id: BufferId,
        capacity: u64,
        usage: BufferUsage,
        label: &str,
    ) -> Result<()> {
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: capacity,
            usage: buffer_usages(usage),
            mapped_at_creation: false,
        });
        self.buffers.insert(id, buffer);
        Ok(())
    }

    pub(crate) fn write(&mut self, id: BufferId, offset: u64, data: &[f32]) -> Result<()> {
        let buffer = self.buffer(id)?;
        self.queue
            .write_buffer(buffer, offset, bytemuck::cast_slice(data));
        Ok(())
    }

    pub(crate) fn copy(
        &mut self,
        src: BufferId,
        src_offset: u64,
        dst: BufferId,
        dst_offset: u64,
        len: u64,
    ) -> Result<()> {
        let (source, destination) = (self.buffer(src)?, self.buffer(dst)?);
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("gpugrad copy"),
            });
        encoder.copy_buffer_to_buffer(source, src_offset, destination, dst_offset, len);
        self.queue.submit(std::iter::once(encoder.finish()));
        Ok(())
    }

    pub(crate) fn map_read(&mut self, id: BufferId, len: u64) -> Result<Vec<f32>> {
        let buffer = self.buffer(id)?;
        let slice = buffer.slice(..len);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            tx.send(result).ok();
        });
        self.device
            .poll(wgpu::PollType::Wait)
            .map_err(GpuError::from)?;
        rx.recv()
            .map_err(|_| GpuError::MapAbandoned)?
            .map_err(GpuError::from)?;

        let mut data = vec![0.0f32; (len as usize) / size_of::<f32>()];
        {
            let view = slice.get_mapped_range();
            bytemuck::cast_slice_mut::<f32, u8>(&mut data).copy_from_slice(&view);
        }
        buffer.unmap();
        Ok(data)
    }

    pub(crate) fn destroy(&mut self, id: BufferId) -> Result<()> {
        let buffer = self.buffers.remove(&id).ok_or(Error::BufferReleased(id))?;
        buffer.destroy();
        Ok(())
    }

    pub(crate) fn wait_idle(&mut self) -> Result<()> {
        self.device
            .poll(wgpu::PollType::Wait)
            .map_err(GpuError::from)?;
        Ok(())
    }
}

fn buffer_usages(usage: BufferUsage) -> wgpu::BufferUsages {
    [
        (BufferUsage::STORAGE, wgpu::BufferUsages::STORAGE),
        (BufferUsage::COPY_SRC, wgpu::BufferUsages::COPY_SRC),
        (BufferUsage::COPY_DST, wgpu::BufferUsages::COPY_DST),
        (BufferUsage::MAP_READ, wgpu::BufferUsages::MAP_READ),
        (BufferUsage::UNIFORM, wgpu::BufferUsages::UNIFORM),
    ]
    .into_iter()
    .filter(|(flag, _)| usage.contains(*flag))
    .fold(wgpu::BufferUsages::empty(), |acc, (_, bits)| acc | bits)
}
