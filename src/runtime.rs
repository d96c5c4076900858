//! The explicit runtime context.
//!
//! A [`Runtime`] bundles the device, the [`BufferManager`] and the compiled
//! kernels. It is created once and passed by `&mut` to every layer, optimizer
//! and driver; nothing in the crate reaches for global state.

use crate::autograd;
use crate::backend::Backend;
use crate::buffer::{BufferManager, DEFAULT_ALIGNMENT};
use crate::config::RuntimeConfig;
use crate::device::{Device, HostDevice};
use crate::error::{Error, Result};
use crate::kernels::KernelRegistry;
use crate::tensor::{BufferUsage, Shape, TensorId, TensorRecord};

/// Device, buffer pool, kernels and autograd state.
pub struct Runtime {
    pub(crate) buffers: BufferManager,
    pub(crate) kernels: KernelRegistry,
    grad_enabled: bool,
}

impl Runtime {
    /// Creates a runtime on the configured backend.
    ///
    /// # Errors
    /// - [`Error::BackendUnavailable`] if the backend was not compiled in
    /// - [`Error::Alignment`] for an unusable alignment
    /// - GPU adapter, device or shader failures on the `Wgpu` backend
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        config.validate()?;
        let device = match config.backend {
            Backend::Cpu => Device::Host(HostDevice::default()),
            #[cfg(feature = "wgpu")]
            Backend::Wgpu => Device::Gpu(crate::device::GpuDevice::new()?),
            #[cfg(not(feature = "wgpu"))]
            Backend::Wgpu => return Err(Error::BackendUnavailable(Backend::Wgpu)),
        };
        let kernels = KernelRegistry::new(&device)?;
        log::info!("runtime ready on the {} backend", config.backend);
        Ok(Self {
            buffers: BufferManager::new(device, config.alignment),
            kernels,
            grad_enabled: true,
        })
    }

    /// A host runtime with default settings.
    pub fn cpu() -> Self {
        let device = Device::Host(HostDevice::default());
        Self {
            kernels: KernelRegistry::host(),
            buffers: BufferManager::new(device, DEFAULT_ALIGNMENT),
            grad_enabled: true,
        }
    }

    pub fn backend(&self) -> Backend {
        self.buffers.backend()
    }

    pub fn buffers(&self) -> &BufferManager {
        &self.buffers
    }

    pub fn buffers_mut(&mut self) -> &mut BufferManager {
        &mut self.buffers
    }

    /// See [`BufferManager::begin_scope`].
    pub fn begin_scope(&mut self, label: &str) {
        self.buffers.begin_scope(label);
    }

    /// Uploads `data` into the tensor named `name`, reusing its buffer when possible.
    pub fn tensor(&mut self, name: &str, shape: Shape, data: &[f32]) -> Result<TensorId> {
        check_len(shape, data)?;
        self.buffers
            .get_or_create(name, BufferUsage::TENSOR, shape, Some(data))
    }

    /// Like [`tensor`](Self::tensor), marked as requiring gradients.
    pub fn parameter(&mut self, name: &str, shape: Shape, data: &[f32]) -> Result<TensorId> {
        let id = self.tensor(name, shape, data)?;
        self.set_requires_grad(id, true)?;
        Ok(id)
    }

    /// A tensor in the active scope, optionally initialized.
    pub fn scoped(&mut self, shape: Shape, data: Option<&[f32]>) -> Result<TensorId> {
        if let Some(data) = data {
            check_len(shape, data)?;
        }
        self.buffers.get_scoped(BufferUsage::TENSOR, shape, data)
    }

    /// A scoped tensor with every element set to `value`.
    pub fn filled(&mut self, shape: Shape, value: f32) -> Result<TensorId> {
        let data = vec![value; shape.len()];
        self.scoped(shape, Some(&data))
    }

    pub fn zeros(&mut self, shape: Shape) -> Result<TensorId> {
        self.filled(shape, 0.0)
    }

    pub fn ones(&mut self, shape: Shape) -> Result<TensorId> {
        self.filled(shape, 1.0)
    }

    pub fn record(&self, id: TensorId) -> Result<&TensorRecord> {
        self.buffers.tensor(id)
    }

    pub fn shape(&self, id: TensorId) -> Result<Shape> {
        Ok(self.buffers.tensor(id)?.shape)
    }

    pub fn name(&self, id: TensorId) -> Result<&str> {
        Ok(&self.buffers.tensor(id)?.name)
    }

    /// Reads the logical contents of a tensor back to the host. Blocks.
    pub fn read_tensor(&mut self, id: TensorId) -> Result<Vec<f32>> {
        let record = self.buffers.tensor(id)?;
        let (buffer, len) = (record.buffer, record.shape.byte_len());
        self.buffers.read(buffer, len, 0)
    }

    /// Overwrites the contents of a tensor.
    pub fn write_tensor(&mut self, id: TensorId, data: &[f32]) -> Result<()> {
        let record = self.buffers.tensor(id)?;
        check_len(record.shape, data)?;
        let buffer = record.buffer;
        self.buffers.write(buffer, data, 0)
    }

    /// Sets every element of an existing tensor to `value`.
    pub fn fill(&mut self, id: TensorId, value: f32) -> Result<()> {
        let data = vec![value; self.shape(id)?.len()];
        self.write_tensor(id, &data)
    }

    pub fn requires_grad(&self, id: TensorId) -> Result<bool> {
        Ok(self.buffers.tensor(id)?.requires_grad)
    }

    pub fn set_requires_grad(&mut self, id: TensorId, requires_grad: bool) -> Result<()> {
        self.buffers.tensor_mut(id)?.requires_grad = requires_grad;
        Ok(())
    }

    /// The gradient accumulated for `id` by the last backward pass.
    ///
    /// # Errors
    /// [`Error::MissingGradient`] if no gradient was ever allocated.
    pub fn gradient(&self, id: TensorId) -> Result<TensorId> {
        let record = self.buffers.tensor(id)?;
        record
            .grad
            .ok_or_else(|| Error::MissingGradient(record.name.clone()))
    }

    /// Like [`gradient`](Self::gradient), returning `None` instead of an error.
    pub fn try_gradient(&self, id: TensorId) -> Result<Option<TensorId>> {
        Ok(self.buffers.tensor(id)?.grad)
    }

    pub fn is_grad_enabled(&self) -> bool {
        self.grad_enabled
    }

    /// Turns graph recording on or off, returning the previous setting.
    pub fn set_grad_enabled(&mut self, enabled: bool) -> bool {
        std::mem::replace(&mut self.grad_enabled, enabled)
    }

    /// Runs `f` without recording any graph edges.
    pub fn no_grad<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let previous = self.set_grad_enabled(false);
        let result = f(self);
        self.set_grad_enabled(previous);
        result
    }

    /// Back-propagates from `loss` into every reachable tensor that requires gradients.
    pub fn backward(&mut self, loss: TensorId) -> Result<()> {
        autograd::backward(self, loss)
    }

    /// Blocks until all submitted work has completed.
    pub fn synchronize(&mut self) -> Result<()> {
        self.buffers.device_mut().wait_idle()
    }

    /// See [`BufferManager::flush_destroy_queue`].
    pub fn flush_destroy_queue(&mut self) -> Result<()> {
        self.buffers.flush_destroy_queue()
    }

    /// See [`BufferManager::destroy_all`].
    pub fn destroy_all(&mut self) -> Result<()> {
        self.buffers.destroy_all()
    }
}

fn check_len(shape: Shape, data: &[f32]) -> Result<()> {
    if data.len() != shape.len() {
        return Err(Error::DataLength {
            expected: shape.len(),
            found: data.len(),
        });
    }
    Ok(())
}
