//! Host-memory device. Buffers are plain `Vec<f32>` and every submission
//! completes before it returns.

use crate::error::{Error, Result};
use crate::tensor::BufferId;
use std::collections::HashMap;

const FLOAT: u64 = size_of::<f32>() as u64;

#[derive(Debug, Default)]
pub(crate) struct HostDevice {
    buffers: HashMap<BufferId, Vec<f32>>,
}

impl HostDevice {
    pub(crate) fn create_buffer(&mut self, id: BufferId, capacity: u64) -> Result<()> {
        self.buffers.insert(id, vec![0.0; (capacity / FLOAT) as usize]);
        Ok(())
    }

    pub(crate) fn buffer(&self, id: BufferId) -> Result<&[f32]> {
        self.buffers
            .get(&id)
            .map(Vec::as_slice)
            .ok_or(Error::BufferReleased(id))
    }

    /// Removes a buffer for exclusive mutation; pair with [`Self::put`].
    pub(crate) fn take(&mut self, id: BufferId) -> Result<Vec<f32>> {
        self.buffers.remove(&id).ok_or(Error::BufferReleased(id))
    }

    pub(crate) fn put(&mut self, id: BufferId, data: Vec<f32>) {
        self.buffers.insert(id, data);
    }

    pub(crate) fn write(&mut self, id: BufferId, offset: u64, data: &[f32]) -> Result<()> {
        let buffer = self.buffers.get_mut(&id).ok_or(Error::BufferReleased(id))?;
        let capacity = buffer_len(buffer);
        let start = (offset / FLOAT) as usize;
        let dst = buffer
            .get_mut(start..start + data.len())
            .ok_or(Error::Capacity {
                buffer: id,
                offset,
                len: data.len() as u64 * FLOAT,
                capacity,
            })?;
        dst.copy_from_slice(data);
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
        let source = self.buffer(src)?;
        let start = (src_offset / FLOAT) as usize;
        let count = (len / FLOAT) as usize;
        let chunk = source
            .get(start..start + count)
            .ok_or(Error::Capacity {
                buffer: src,
                offset: src_offset,
                len,
                capacity: buffer_len(source),
            })?
            .to_vec();
        self.write(dst, dst_offset, &chunk)
    }

    pub(crate) fn map_read(&mut self, id: BufferId, len: u64) -> Result<Vec<f32>> {
        let buffer = self.buffer(id)?;
        let count = (len / FLOAT) as usize;
        buffer
            .get(..count)
            .map(<[f32]>::to_vec)
            .ok_or(Error::Capacity {
                buffer: id,
                offset: 0,
                len,
                capacity: buffer_len(buffer),
            })
    }

    pub(crate) fn destroy(&mut self, id: BufferId) -> Result<()> {
        self.buffers
            .remove(&id)
            .map(drop)
            .ok_or(Error::BufferReleased(id))
    }
}

fn buffer_len(buffer: &[f32]) -> u64 {
    buffer.len() as u64 * FLOAT
}
