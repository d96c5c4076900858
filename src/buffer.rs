//! Named and scoped buffer pooling.
//!
//! The [`BufferManager`] owns every device buffer and the tensor arena that
//! describes them. Buffers are requested by name; a later request under the
//! same name reuses the buffer whenever it is large enough and has the same
//! usage class, so a training loop that asks for the same tensors in the same
//! order every iteration settles into a fixed working set.
//!
//! # Scopes
//!
//! [`BufferManager::get_scoped`] generates the name `_<scope>_<n>` from the
//! active scope label and a counter that [`BufferManager::begin_scope`] resets.
//! Entering a scope and replaying the same allocation sequence therefore
//! returns the same buffers as the previous pass. Scopes do not nest.
//!
//! # Deferred destruction
//!
//! Replaced buffers may still be referenced by submitted work, so they are
//! queued and only destroyed by [`BufferManager::flush_destroy_queue`] or
//! [`BufferManager::destroy_all`], both of which wait for the device to go
//! idle first.

use crate::backend::Backend;
use crate::device::Device;
use crate::error::{Error, Result};
use crate::tensor::{BufferId, BufferUsage, Shape, TensorId, TensorRecord};
use log::{debug, error, trace};
use std::collections::{BTreeSet, HashMap};

/// Byte boundary allocations are rounded up to unless configured otherwise.
pub const DEFAULT_ALIGNMENT: u64 = 256;

/// Rounds `size` up to the next multiple of `alignment`.
pub const fn align_to(size: u64, alignment: u64) -> u64 {
    size.div_ceil(alignment) * alignment
}

#[derive(Debug, Clone, Copy)]
struct Allocation {
    usage: BufferUsage,
    capacity: u64,
}

#[derive(Debug, Clone, Copy)]
struct Readback {
    buffer: BufferId,
    capacity: u64,
}

/// Owner of all device buffers and of the tensor arena.
pub struct BufferManager {
    device: Device,
    alignment: u64,
    tensors: Vec<TensorRecord>,
    names: HashMap<String, TensorId>,
    allocations: HashMap<BufferId, Allocation>,
    next_buffer: u64,
    scope: String,
    counter: usize,
    readback: Option<Readback>,
    pending_destroy: Vec<BufferId>,
}

impl BufferManager {
    pub(crate) fn new(device: Device, alignment: u64) -> Self {
        Self {
            device,
            alignment,
            tensors: Vec::new(),
            names: HashMap::new(),
            allocations: HashMap::new(),
            next_buffer: 0,
            scope: String::from("default"),
            counter: 0,
            readback: None,
            pending_destroy: Vec::new(),
        }
    }

    pub fn backend(&self) -> Backend {
        self.device.backend()
    }

    pub fn alignment(&self) -> u64 {
        self.alignment
    }

    pub(crate) fn device_mut(&mut self) -> &mut Device {
        &mut self.device
    }

    /// Returns the tensor registered under `name`, creating or replacing its
    /// buffer as needed.
    ///
    /// An existing buffer is reused when its capacity covers `shape` and its
    /// usage equals `usage`. Otherwise a buffer of `shape.byte_len()` rounded up
    /// to the alignment is allocated and the old one is queued for destruction.
    /// Either way the name keeps its [`TensorId`]: the record takes the new
    /// shape and is reset to a fresh, graph-free state.
    pub fn get_or_create(
        &mut self,
        name: &str,
        usage: BufferUsage,
        shape: Shape,
        data: Option<&[f32]>,
    ) -> Result<TensorId> {
        let shape = shape.ensure_non_empty()?;
        if let Some(data) = data
            && data.len() > shape.len()
        {
            return Err(Error::DataLength {
                expected: shape.len(),
                found: data.len(),
            });
        }
        let required = shape.byte_len();

        if let Some(&id) = self.names.get(name) {
            let buffer = self.tensors[id.index()].buffer;
            let fits = self
                .allocations
                .get(&buffer)
                .is_some_and(|allocation| allocation.capacity >= required && allocation.usage == usage);
            let buffer = if fits {
                trace!("reusing `{name}` ({buffer}) as {shape}");
                buffer
            } else {
                if self.allocations.contains_key(&buffer) {
                    debug!("replacing `{name}` ({buffer}): needs {required} bytes as {usage:?}");
                    self.pending_destroy.push(buffer);
                }
                self.allocate(name, usage, required)?
            };
            let record = &mut self.tensors[id.index()];
            record.reset_graph();
            record.buffer = buffer;
            record.usage = usage;
            record.shape = shape;
            if let Some(data) = data {
                self.write(buffer, data, 0)?;
            }
            return Ok(id);
        }

        let buffer = self.allocate(name, usage, required)?;
        let id = self.push(TensorRecord::new(name.to_owned(), buffer, usage, shape));
        self.names.insert(name.to_owned(), id);
        if let Some(data) = data {
            self.write(buffer, data, 0)?;
        }
        Ok(id)
    }

    /// [`get_or_create`](Self::get_or_create) under the next name of the active scope.
    pub fn get_scoped(
        &mut self,
        usage: BufferUsage,
        shape: Shape,
        data: Option<&[f32]>,
    ) -> Result<TensorId> {
        let name = format!("_{}_{}", self.scope, self.counter);
        self.counter += 1;
        self.get_or_create(&name, usage, shape, data)
    }

    /// Makes `label` the active scope and restarts its counter at zero.
    pub fn begin_scope(&mut self, label: &str) {
        trace!("entering scope `{label}`");
        label.clone_into(&mut self.scope);
        self.counter = 0;
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Uploads `data` into `buffer` starting `offset` bytes in.
    pub fn write(&mut self, buffer: BufferId, data: &[f32], offset: u64) -> Result<()> {
        let allocation = self.allocation(buffer)?;
        let len = (data.len() * size_of::<f32>()) as u64;
        check_range(buffer, offset, len, allocation.capacity)?;
        self.device.write(buffer, offset, data)
    }

    /// Copies `byte_len` bytes at `offset` into the readback buffer and maps
    /// them to the host. Blocks until the data is available.
    pub fn read(&mut self, buffer: BufferId, byte_len: u64, offset: u64) -> Result<Vec<f32>> {
        let allocation = self.allocation(buffer)?;
        check_range(buffer, offset, byte_len, allocation.capacity)?;
        let staging = self.ensure_readback(byte_len)?;
        self.device.copy(buffer, offset, staging, 0, byte_len)?;
        self.device.map_read(staging, byte_len)
    }

    fn ensure_readback(&mut self, size: u64) -> Result<BufferId> {
        if let Some(readback) = self.readback
            && readback.capacity >= size
        {
            return Ok(readback.buffer);
        }
        let capacity = align_to(size.max(1), self.alignment);
        let buffer = self.next_id();
        self.device
            .create_buffer(buffer, capacity, BufferUsage::READBACK, "readback")?;
        if let Some(old) = self.readback.replace(Readback { buffer, capacity }) {
            debug!("growing readback buffer to {capacity} bytes");
            self.pending_destroy.push(old.buffer);
        }
        Ok(buffer)
    }

    /// Destroys every queued buffer once the device has finished all submitted work.
    pub fn flush_destroy_queue(&mut self) -> Result<()> {
        if self.pending_destroy.is_empty() {
            return Ok(());
        }
        self.device.wait_idle()?;
        let pending = std::mem::take(&mut self.pending_destroy);
        debug!("destroying {} deferred buffers", pending.len());
        for buffer in pending {
            self.allocations.remove(&buffer);
            if let Err(err) = self.device.destroy(buffer) {
                error!("failed to destroy {buffer}: {err}");
            }
        }
        Ok(())
    }

    /// Waits for the device, then destroys every buffer and clears the registry.
    ///
    /// All previously issued [`TensorId`]s become invalid.
    pub fn destroy_all(&mut self) -> Result<()> {
        self.device.wait_idle()?;
        let mut doomed: BTreeSet<BufferId> = self.allocations.keys().copied().collect();
        doomed.extend(self.pending_destroy.drain(..));
        doomed.extend(self.readback.take().map(|readback| readback.buffer));
        debug!("tearing down {} buffers", doomed.len());
        for buffer in doomed {
            if let Err(err) = self.device.destroy(buffer) {
                error!("failed to destroy {buffer}: {err}");
            }
        }
        self.allocations.clear();
        self.names.clear();
        self.tensors.clear();
        self.counter = 0;
        Ok(())
    }

    pub fn tensor(&self, id: TensorId) -> Result<&TensorRecord> {
        self.tensors.get(id.index()).ok_or(Error::UnknownTensor(id))
    }

    pub(crate) fn tensor_mut(&mut self, id: TensorId) -> Result<&mut TensorRecord> {
        self.tensors
            .get_mut(id.index())
            .ok_or(Error::UnknownTensor(id))
    }

    /// Number of records in the tensor arena.
    pub fn tensor_count(&self) -> usize {
        self.tensors.len()
    }

    pub(crate) fn records(&self) -> &[TensorRecord] {
        &self.tensors
    }

    /// The tensor currently registered under `name`.
    pub fn lookup(&self, name: &str) -> Option<TensorId> {
        self.names.get(name).copied()
    }

    /// Capacity in bytes of a live buffer.
    pub fn capacity(&self, buffer: BufferId) -> Option<u64> {
        self.allocations.get(&buffer).map(|allocation| allocation.capacity)
    }

    /// Number of live tensor buffers, queued ones included.
    pub fn live_buffers(&self) -> usize {
        self.allocations.len()
    }

    pub fn pending_destroy(&self) -> usize {
        self.pending_destroy.len()
    }

    pub fn readback_capacity(&self) -> Option<u64> {
        self.readback.map(|readback| readback.capacity)
    }

    fn allocation(&self, buffer: BufferId) -> Result<Allocation> {
        self.allocations
            .get(&buffer)
            .copied()
            .ok_or(Error::BufferReleased(buffer))
    }

    fn allocate(&mut self, label: &str, usage: BufferUsage, size: u64) -> Result<BufferId> {
        let capacity = align_to(size, self.alignment);
        let buffer = self.next_id();
        self.device.create_buffer(buffer, capacity, usage, label)?;
        self.allocations.insert(buffer, Allocation { usage, capacity });
        debug!("allocated {buffer} for `{label}` ({capacity} bytes)");
        Ok(buffer)
    }

    fn next_id(&mut self) -> BufferId {
        let id = BufferId(self.next_buffer);
        self.next_buffer += 1;
        id
    }

    fn push(&mut self, record: TensorRecord) -> TensorId {
        let id = TensorId(self.tensors.len() as u32);
        self.tensors.push(record);
        id
    }
}

fn check_range(buffer: BufferId, offset: u64, len: u64, capacity: u64) -> Result<()> {
    if offset % 4 != 0 {
        return Err(Error::Misaligned(offset));
    }
    if len == 0 || len % 4 != 0 {
        return Err(Error::TransferSize(len));
    }
    if offset + len > capacity {
        return Err(Error::Capacity {
            buffer,
            offset,
            len,
            capacity,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::HostDevice;

    fn manager() -> BufferManager {
        BufferManager::new(Device::Host(HostDevice::default()), DEFAULT_ALIGNMENT)
    }

    #[test]
    fn aligns_allocations() {
        assert_eq!(align_to(4, 256), 256);
        assert_eq!(align_to(256, 256), 256);
        assert_eq!(align_to(257, 256), 512);

        let mut buffers = manager();
        let id = buffers
            .get_or_create("w", BufferUsage::TENSOR, Shape::new(10, 10), None)
            .unwrap();
        let buffer = buffers.tensor(id).unwrap().buffer();
        assert_eq!(buffers.capacity(buffer), Some(512));
    }

    #[test]
    fn reuses_when_capacity_and_usage_match() {
        let mut buffers = manager();
        let first = buffers
            .get_or_create("x", BufferUsage::TENSOR, Shape::new(4, 4), Some(&[1.0; 16]))
            .unwrap();
        let buffer = buffers.tensor(first).unwrap().buffer();

        let same = buffers
            .get_or_create("x", BufferUsage::TENSOR, Shape::new(4, 4), None)
            .unwrap();
        assert_eq!(same, first);

        // smaller request reinterprets the same storage in place
        let smaller = buffers
            .get_or_create("x", BufferUsage::TENSOR, Shape::new(2, 3), Some(&[2.0; 6]))
            .unwrap();
        assert_eq!(smaller, first);
        assert_eq!(buffers.tensor(smaller).unwrap().buffer(), buffer);
        assert_eq!(buffers.tensor(smaller).unwrap().shape(), Shape::new(2, 3));
        assert_eq!(buffers.pending_destroy(), 0);
    }

    #[test]
    fn alternating_shapes_keep_one_record() {
        let mut buffers = manager();
        let full = buffers
            .get_or_create("input", BufferUsage::TENSOR, Shape::new(4, 2), None)
            .unwrap();
        let count = buffers.tensor_count();
        for _ in 0..3 {
            let partial = buffers
                .get_or_create("input", BufferUsage::TENSOR, Shape::new(1, 2), None)
                .unwrap();
            let again = buffers
                .get_or_create("input", BufferUsage::TENSOR, Shape::new(4, 2), None)
                .unwrap();
            assert_eq!((partial, again), (full, full));
        }
        assert_eq!(buffers.tensor_count(), count);
        assert_eq!(buffers.live_buffers(), 1);
    }

    #[test]
    fn rejects_partial_word_transfers() {
        let mut buffers = manager();
        let id = buffers
            .get_or_create("x", BufferUsage::TENSOR, Shape::new(1, 4), Some(&[1.5; 4]))
            .unwrap();
        let buffer = buffers.tensor(id).unwrap().buffer();
        assert!(matches!(buffers.read(buffer, 6, 0), Err(Error::TransferSize(6))));
        assert!(matches!(buffers.read(buffer, 0, 0), Err(Error::TransferSize(0))));
        assert!(matches!(buffers.write(buffer, &[], 0), Err(Error::TransferSize(0))));
        assert_eq!(buffers.read(buffer, 8, 4).unwrap(), vec![1.5, 1.5]);
    }

    #[test]
    fn replaces_and_defers_destruction() {
        let mut buffers = manager();
        let small = buffers
            .get_or_create("x", BufferUsage::TENSOR, Shape::new(1, 4), None)
            .unwrap();
        let old = buffers.tensor(small).unwrap().buffer();

        let large = buffers
            .get_or_create("x", BufferUsage::TENSOR, Shape::new(100, 4), None)
            .unwrap();
        assert_ne!(buffers.tensor(large).unwrap().buffer(), old);
        assert_eq!(buffers.pending_destroy(), 1);
        assert_eq!(buffers.live_buffers(), 2);

        let usage_change = buffers
            .get_or_create("x", BufferUsage::STORAGE, Shape::new(1, 4), None)
            .unwrap();
        assert_ne!(buffers.tensor(usage_change).unwrap().buffer(), old);
        assert_eq!(buffers.pending_destroy(), 2);

        buffers.flush_destroy_queue().unwrap();
        assert_eq!(buffers.pending_destroy(), 0);
        assert_eq!(buffers.live_buffers(), 1);
        assert!(matches!(
            buffers.read(old, 16, 0),
            Err(Error::BufferReleased(_))
        ));
    }

    #[test]
    fn scoped_names_restart_per_scope() {
        let mut buffers = manager();
        buffers.begin_scope("fwd");
        let a = buffers.get_scoped(BufferUsage::TENSOR, Shape::new(2, 2), None).unwrap();
        let b = buffers.get_scoped(BufferUsage::TENSOR, Shape::new(2, 2), None).unwrap();
        assert_eq!(buffers.tensor(a).unwrap().name(), "_fwd_0");
        assert_eq!(buffers.tensor(b).unwrap().name(), "_fwd_1");

        buffers.begin_scope("fwd");
        let again = buffers.get_scoped(BufferUsage::TENSOR, Shape::new(2, 2), None).unwrap();
        assert_eq!(again, a);

        buffers.begin_scope("test");
        let other = buffers.get_scoped(BufferUsage::TENSOR, Shape::new(2, 2), None).unwrap();
        assert_ne!(buffers.tensor(other).unwrap().buffer(), buffers.tensor(a).unwrap().buffer());
    }

    #[test]
    fn writes_are_bounded_by_capacity() {
        let mut buffers = manager();
        let id = buffers
            .get_or_create("x", BufferUsage::TENSOR, Shape::new(1, 4), None)
            .unwrap();
        let buffer = buffers.tensor(id).unwrap().buffer();

        // capacity is 256 bytes: 64 floats fit, 65 do not
        buffers.write(buffer, &[1.0; 64], 0).unwrap();
        assert!(matches!(
            buffers.write(buffer, &[1.0; 65], 0),
            Err(Error::Capacity { capacity: 256, .. })
        ));
        assert!(matches!(
            buffers.write(buffer, &[1.0], 2),
            Err(Error::Misaligned(2))
        ));
    }

    #[test]
    fn readback_grows_on_demand() {
        let mut buffers = manager();
        let data: Vec<f32> = (0..100).map(|i| i as f32).collect();
        let id = buffers
            .get_or_create("x", BufferUsage::TENSOR, Shape::new(10, 10), Some(&data))
            .unwrap();
        let buffer = buffers.tensor(id).unwrap().buffer();

        assert_eq!(buffers.read(buffer, 8, 4).unwrap(), vec![1.0, 2.0]);
        assert_eq!(buffers.readback_capacity(), Some(256));

        assert_eq!(buffers.read(buffer, 400, 0).unwrap(), data);
        assert_eq!(buffers.readback_capacity(), Some(512));
        assert_eq!(buffers.pending_destroy(), 1);
    }

    #[test]
    fn destroy_all_clears_registry() {
        let mut buffers = manager();
        let id = buffers
            .get_or_create("x", BufferUsage::TENSOR, Shape::new(2, 2), Some(&[1.0; 4]))
            .unwrap();
        let buffer = buffers.tensor(id).unwrap().buffer();
        buffers.read(buffer, 16, 0).unwrap();

        buffers.destroy_all().unwrap();
        assert_eq!(buffers.live_buffers(), 0);
        assert_eq!(buffers.readback_capacity(), None);
        assert_eq!(buffers.lookup("x"), None);
        assert!(matches!(buffers.tensor(id), Err(Error::UnknownTensor(_))));
    }
}
