//! Tensor capability interface.
//!
//! The engine never depends on a concrete ML framework. A tensor leaf in
//! the state value tree only needs to answer five questions and hand back
//! its bytes; [`HostTensor`] implements that directly for host-resident
//! data, and [`DeviceTensorHandle`] forwards to a caller-supplied
//! [`DeviceOps`] implementation for device-resident data (the real
//! backend, e.g. `burn` or `tch`, plugs in there).

use std::borrow::Cow;

/// Canonical, lowercase, framework-agnostic dtype name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    Float32,
    Float64,
    Float16,
    BFloat16,
    Int64,
    Int32,
    Int16,
    Int8,
    Uint8,
    Bool,
}

impl DType {
    /// Canonical lowercase name written into the header JSON.
    pub fn as_str(&self) -> &'static str {
        match self {
            DType::Float32 => "float32",
            DType::Float64 => "float64",
            DType::Float16 => "float16",
            DType::BFloat16 => "bfloat16",
            DType::Int64 => "int64",
            DType::Int32 => "int32",
            DType::Int16 => "int16",
            DType::Int8 => "int8",
            DType::Uint8 => "uint8",
            DType::Bool => "bool",
        }
    }

    pub fn element_size(&self) -> usize {
        match self {
            DType::Float32 | DType::Int32 => 4,
            DType::Float64 | DType::Int64 => 8,
            DType::Float16 | DType::BFloat16 | DType::Int16 => 2,
            DType::Int8 | DType::Uint8 | DType::Bool => 1,
        }
    }

    /// Normalizes a framework-qualified name (e.g. `torch.float32`,
    /// `DType::F32`) into the canonical lowercase name. Implementations
    /// must call this before writing a header.
    pub fn parse_normalized(raw: &str) -> Option<DType> {
        let lowered = raw.to_ascii_lowercase();
        let stripped = lowered
            .rsplit(['.', ':'])
            .next()
            .unwrap_or(lowered.as_str());
        Some(match stripped {
            "float32" | "f32" => DType::Float32,
            "float64" | "f64" | "double" => DType::Float64,
            "float16" | "f16" | "half" => DType::Float16,
            "bfloat16" | "bf16" => DType::BFloat16,
            "int64" | "i64" | "long" => DType::Int64,
            "int32" | "i32" | "int" => DType::Int32,
            "int16" | "i16" | "short" => DType::Int16,
            "int8" | "i8" => DType::Int8,
            "uint8" | "u8" | "byte" => DType::Uint8,
            "bool" | "boolean" => DType::Bool,
            _ => return None,
        })
    }
}

impl std::fmt::Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capability interface implemented by any tensor-bearing structure the
/// engine needs to stage and serialize.
pub trait TensorLike {
    fn dtype(&self) -> DType;
    fn shape(&self) -> &[usize];

    fn element_count(&self) -> usize {
        self.shape().iter().product()
    }

    fn byte_size(&self) -> usize {
        self.element_count() * self.dtype().element_size()
    }

    fn is_contiguous(&self) -> bool;

    /// Borrowed contiguous bytes when `is_contiguous()`; an owned,
    /// rematerialized buffer otherwise.
    fn contiguous_bytes(&self) -> Cow<'_, [u8]>;

    /// Copies this tensor's contiguous bytes into `dst`. `dst.len()` must
    /// equal `byte_size()`.
    fn to_host(&self, dst: &mut [u8]) {
        dst.copy_from_slice(&self.contiguous_bytes());
    }
}

/// An owned, host-resident, always-contiguous tensor. Used directly by
/// callers without a GPU backend, and as the restored type on `load`.
#[derive(Debug, Clone, PartialEq)]
pub struct HostTensor {
    dtype: DType,
    shape: Vec<usize>,
    bytes: Vec<u8>,
}

impl HostTensor {
    pub fn new(dtype: DType, shape: Vec<usize>, bytes: Vec<u8>) -> Self {
        let expected: usize = shape.iter().product::<usize>() * dtype.element_size();
        assert_eq!(
            bytes.len(),
            expected,
            "byte buffer length does not match dtype/shape"
        );
        Self {
            dtype,
            shape,
            bytes,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

impl TensorLike for HostTensor {
    fn dtype(&self) -> DType {
        self.dtype
    }

    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn is_contiguous(&self) -> bool {
        true
    }

    fn contiguous_bytes(&self) -> Cow<'_, [u8]> {
        Cow::Borrowed(&self.bytes)
    }
}

/// Narrow seam through which a real compute backend supplies
/// device-resident tensor data without this crate depending on it.
pub trait DeviceOps: Send + Sync {
    fn dtype(&self) -> DType;
    fn shape(&self) -> &[usize];
    fn is_contiguous(&self) -> bool;
    /// Copies this tensor's contiguous bytes to the host into `dst`.
    fn copy_to_host(&self, dst: &mut [u8]);
    /// Total free bytes of device memory, for the profiler.
    fn free_device_memory(&self) -> usize;
}

/// A tensor leaf backed by a device-resident handle.
pub struct DeviceTensorHandle {
    inner: Box<dyn DeviceOps>,
}

impl DeviceTensorHandle {
    pub fn new(inner: Box<dyn DeviceOps>) -> Self {
        Self { inner }
    }

    pub fn free_device_memory(&self) -> usize {
        self.inner.free_device_memory()
    }
}

impl std::fmt::Debug for DeviceTensorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceTensorHandle")
            .field("dtype", &self.inner.dtype())
            .field("shape", &self.inner.shape())
            .finish()
    }
}

impl TensorLike for DeviceTensorHandle {
    fn dtype(&self) -> DType {
        self.inner.dtype()
    }

    fn shape(&self) -> &[usize] {
        self.inner.shape()
    }

    fn is_contiguous(&self) -> bool {
        self.inner.is_contiguous()
    }

    fn contiguous_bytes(&self) -> Cow<'_, [u8]> {
        let mut buf = vec![0u8; self.byte_size()];
        self.inner.copy_to_host(&mut buf);
        Cow::Owned(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dtype_normalizes_framework_prefixes() {
        assert_eq!(DType::parse_normalized("torch.float32"), Some(DType::Float32));
        assert_eq!(DType::parse_normalized("Float32"), Some(DType::Float32));
        assert_eq!(DType::parse_normalized("f32"), Some(DType::Float32));
        assert_eq!(DType::parse_normalized("torch.bfloat16"), Some(DType::BFloat16));
        assert_eq!(DType::parse_normalized("nonsense"), None);
    }

    #[test]
    fn host_tensor_byte_size_matches_dtype_and_shape() {
        let t = HostTensor::new(DType::Float32, vec![2, 3], vec![0u8; 24]);
        assert_eq!(t.byte_size(), 24);
        assert_eq!(t.element_count(), 6);
    }
}
