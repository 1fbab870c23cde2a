//! Typed device buffers over the reference counted pool.

use frost_pool::{Handle, Pool, Storage, Usage};

use crate::error::*;
use crate::pre::*;

/// Shape and element type a buffer was allocated with.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Layout {
    pub shape: Vec<usize>,
    pub dtype: DType,
}

impl Layout {
    pub fn len(&self) -> usize { self.shape.iter().product() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }
}

/// Opaque handle to a device buffer. Copying the handle does not add a reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Memory {
    handle: Handle,
}

/// Flat element data of a host array.
#[derive(Debug, Clone, PartialEq)]
pub enum HostData {
    F32(Vec<f32>),
    I32(Vec<i32>),
    U32(Vec<u32>),
    Bool(Vec<bool>),
}

impl HostData {
    pub fn dtype(&self) -> DType {
        match self { HostData::F32(_) => DType::F32, HostData::I32(_) => DType::I32, HostData::U32(_) => DType::U32, HostData::Bool(_) => DType::Bool }
    }
    pub fn len(&self) -> usize {
        match self { HostData::F32(v) => v.len(), HostData::I32(v) => v.len(), HostData::U32(v) => v.len(), HostData::Bool(v) => v.len() }
    }
    pub fn is_empty(&self) -> bool { self.len() == 0 }

    fn words(&self) -> Vec<u32> {
        match self {
            HostData::F32(v) => v.iter().map(|x| x.to_bits()).collect(),
            HostData::I32(v) => v.iter().map(|&x| x as u32).collect(),
            HostData::U32(v) => v.clone(),
            HostData::Bool(v) => v.iter().map(|&x| x as u32).collect(),
        }
    }

    fn from_words(dtype: DType, words: &[u32]) -> Self {
        match dtype {
            DType::F32 => HostData::F32(words.iter().map(|&w| f32::from_bits(w)).collect()),
            DType::I32 => HostData::I32(words.iter().map(|&w| w as i32).collect()),
            DType::U32 => HostData::U32(words.to_vec()),
            DType::Bool => HostData::Bool(words.iter().map(|&w| w != 0).collect()),
        }
    }
}

/// A shaped host array, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct HostArray {
    pub shape: Vec<usize>,
    pub data: HostData,
}

impl HostArray {
    pub fn new(shape: &[usize], data: HostData) -> Result<Self> {
        let len = shape.iter().product::<usize>();
        if len != data.len() {
            return mismatch(format!("{} elements for shape {shape:?}", data.len()));
        }
        Ok(HostArray { shape: shape.to_vec(), data })
    }
    pub fn f32(shape: &[usize], data: Vec<f32>) -> Result<Self> { Self::new(shape, HostData::F32(data)) }
    pub fn i32(shape: &[usize], data: Vec<i32>) -> Result<Self> { Self::new(shape, HostData::I32(data)) }
    pub fn u32(shape: &[usize], data: Vec<u32>) -> Result<Self> { Self::new(shape, HostData::U32(data)) }
    pub fn bool(shape: &[usize], data: Vec<bool>) -> Result<Self> { Self::new(shape, HostData::Bool(data)) }

    /// Every element equal to `value`.
    pub fn full(shape: &[usize], value: impl Into<Scalar>) -> Self {
        let value = value.into();
        let len = shape.iter().product::<usize>();
        let data = HostData::from_words(value.dtype(), &vec![value.to_bits(); len]);
        HostArray { shape: shape.to_vec(), data }
    }

    pub fn dtype(&self) -> DType { self.data.dtype() }

    pub fn as_f32(&self) -> Option<&[f32]> {
        match &self.data { HostData::F32(v) => Some(v), _ => None }
    }
    pub fn as_i32(&self) -> Option<&[i32]> {
        match &self.data { HostData::I32(v) => Some(v), _ => None }
    }
}

/// Allocation, reference counting and host transfer of device buffers.
///
/// Buffers hold one 32-bit word per element. Released storage is kept for reuse by
/// the next allocation of the same size.
#[derive(Default)]
pub struct MemoryManager {
    pool: Pool<Layout>,
}

impl MemoryManager {
    pub fn new() -> Self { Self::default() }

    /// A zero filled buffer holding one reference.
    pub fn allocate(&self, shape: &[usize], dtype: DType) -> Memory {
        let layout = Layout { shape: shape.to_vec(), dtype };
        Memory { handle: self.pool.allocate(layout.len(), layout) }
    }

    pub fn from_host(&self, array: &HostArray) -> Result<Memory> {
        let memory = self.allocate(&array.shape, array.dtype());
        let storage = self.storage(memory)?;
        let mut words = storage.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        words.copy_from_slice(&array.data.words());
        Ok(memory)
    }

    pub fn to_host(&self, memory: Memory) -> Result<HostArray> {
        let layout = self.layout(memory)?;
        let storage = self.storage(memory)?;
        let words = storage.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        Ok(HostArray { data: HostData::from_words(layout.dtype, &words), shape: layout.shape })
    }

    pub fn layout(&self, memory: Memory) -> Result<Layout> { Ok(self.pool.meta(memory.handle)?) }

    pub(crate) fn storage(&self, memory: Memory) -> Result<Storage> { Ok(self.pool.storage(memory.handle)?) }

    pub fn retain(&self, memory: Memory) -> Result<()> { Ok(self.pool.retain(memory.handle)?) }

    /// Drop one reference; the storage goes back to the pool with the last one.
    pub fn release(&self, memory: Memory) -> Result<()> {
        if self.pool.release(memory.handle)? {
            log::trace!("buffer {} returned to the pool", memory.handle.index());
        }
        Ok(())
    }

    pub fn refs(&self, memory: Memory) -> Result<usize> { Ok(self.pool.refs(memory.handle)?) }

    /// Bytes held by live buffers.
    pub fn used_memory(&self) -> usize { self.pool.usage().live }

    pub fn usage(&self) -> Usage { self.pool.usage() }

    /// Give pooled storage back to the system allocator.
    pub fn trim(&self) { self.pool.trim() }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn host_round_trip_keeps_layout() {
        let m = MemoryManager::new();
        let a = HostArray::i32(&[2, 3], vec![1, -2, 3, -4, 5, i32::MIN]).unwrap();
        let mem = m.from_host(&a).unwrap();
        assert_eq!(m.to_host(mem).unwrap(), a);
        assert_eq!(m.layout(mem).unwrap(), Layout { shape: vec![2, 3], dtype: DType::I32 });
        assert_eq!(m.used_memory(), 24);
    }

    #[test]
    fn release_to_zero_recycles() {
        let m = MemoryManager::new();
        let a = m.allocate(&[4], DType::F32);
        m.retain(a).unwrap();
        m.release(a).unwrap();
        assert_eq!(m.used_memory(), 16);
        m.release(a).unwrap();
        assert_eq!(m.used_memory(), 0);
        assert_eq!(m.usage().pooled, 16);
        assert!(matches!(m.release(a), Err(Error::DoubleFree(_))));
        assert!(matches!(m.to_host(a), Err(Error::UseAfterRelease(_))));
        let b = m.allocate(&[2, 2], DType::U32);
        assert_eq!(m.to_host(b).unwrap(), HostArray::full(&[2, 2], 0u32));
    }

    #[test]
    fn mismatched_host_data_is_rejected() {
        assert!(matches!(HostArray::f32(&[3], vec![1.0]), Err(Error::ShapeMismatch(_))));
        assert!(HostArray::bool(&[0, 5], vec![]).is_ok());
    }
}
