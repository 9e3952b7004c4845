//! ## Endianness Module
//! Wrappers for big-endian cells as they are stored in device-tree blobs.
//!
//! All the types declared here implement [EndianData<T>],
//! which defines [EndianData<T>::value] to convert the stored cell into a native integer.
//! Cells are read out of byte slices by copy, so unaligned property data is fine.

/// [u32] stored in big endianness
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct BigEndian32(u32);

/// [u64] stored in big endianness
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct BigEndian64(u64);

/// This trait defines a packed cell in memory with some specific endianness.
pub trait EndianData<T>: Copy + Clone {
    /// Size of one cell in bytes.
    const SIZE: usize;
    /// Parse the value into the endianness of the current architecture.
    fn value(&self) -> T;
    /// Build a cell holding `value`.
    fn from_value(value: T) -> Self;
    /// Copy a cell out of the first [Self::SIZE] bytes of `bytes`.
    ///
    /// Returns [None] if the slice is too short.
    fn read(bytes: &[u8]) -> Option<Self>;
    /// Raw bytes of the cell, in storage order.
    fn to_bytes(self) -> [u8; 8];
}

macro_rules! impl_converter_big {
    ($type: tt, $tval: tt) => {
        impl EndianData<$tval> for $type {
            const SIZE: usize = size_of::<$tval>();

            #[inline(always)]
            fn value(&self) -> $tval {
                $tval::from_be(self.0)
            }

            #[inline(always)]
            fn from_value(value: $tval) -> Self {
                $type(value.to_be())
            }

            #[inline(always)]
            fn read(bytes: &[u8]) -> Option<Self> {
                let raw: [u8; size_of::<$tval>()] = bytes.get(..Self::SIZE)?.try_into().ok()?;
                Some($type($tval::from_ne_bytes(raw)))
            }

            fn to_bytes(self) -> [u8; 8] {
                let mut out = [0u8; 8];
                out[..Self::SIZE].copy_from_slice(&self.0.to_ne_bytes());
                out
            }
        }
    };
}

impl_converter_big!(BigEndian32, u32);
impl_converter_big!(BigEndian64, u64);

/// Read a big-endian `u32` at `offset` in `bytes`.
#[inline(always)]
pub fn be32_at(bytes: &[u8], offset: usize) -> Option<u32> {
    Some(BigEndian32::read(bytes.get(offset..)?)?.value())
}

/// Read a big-endian `u64` at `offset` in `bytes`.
#[inline(always)]
pub fn be64_at(bytes: &[u8], offset: usize) -> Option<u64> {
    Some(BigEndian64::read(bytes.get(offset..)?)?.value())
}
