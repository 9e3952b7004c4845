use alloc::{boxed::Box, vec::Vec};
use core::{fmt, str};
use utils::endian::{BigEndian32, BigEndian64, EndianData};

/// A property of a node in the linked tree. Name and payload are owned copies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Property {
    pub name: Box<str>,
    pub data: Box<[u8]>,
}

impl Property {
    pub fn new(name: &str, data: &[u8]) -> Property {
        Property {
            name: Box::from(name),
            data: Box::from(data),
        }
    }
    pub fn value_as_u32(&self) -> Result<u32, PropertyError> {
        decode_u32(&self.data)
    }
    pub fn value_as_u64(&self) -> Result<u64, PropertyError> {
        decode_u64(&self.data)
    }
    pub fn value_as_str(&self) -> Result<&str, PropertyError> {
        decode_str(&self.data)
    }
    pub fn value_as_strlist(&self) -> Result<Vec<&str>, PropertyError> {
        decode_strlist(&self.data)
    }
    pub fn value_as_u32_array(&self) -> Result<Vec<u32>, PropertyError> {
        decode_u32_array(&self.data)
    }
}

/// Decode a single 32-bit cell. The payload must be exactly one cell long.
pub fn decode_u32(data: &[u8]) -> Result<u32, PropertyError> {
    if data.len() != BigEndian32::SIZE {
        return Err(PropertyError::TypeMismatch);
    }
    BigEndian32::read(data)
        .map(|cell| cell.value())
        .ok_or(PropertyError::TypeMismatch)
}

/// Decode a 64-bit value stored as two cells.
pub fn decode_u64(data: &[u8]) -> Result<u64, PropertyError> {
    if data.len() != BigEndian64::SIZE {
        return Err(PropertyError::TypeMismatch);
    }
    BigEndian64::read(data)
        .map(|cell| cell.value())
        .ok_or(PropertyError::TypeMismatch)
}

/// Decode a NUL-terminated string. Only the part before the first NUL is returned.
pub fn decode_str(data: &[u8]) -> Result<&str, PropertyError> {
    let end = data
        .iter()
        .position(|b| *b == 0)
        .ok_or(PropertyError::TypeMismatch)?;
    str::from_utf8(&data[..end]).map_err(|_| PropertyError::TypeMismatch)
}

/// Decode a list of NUL-terminated strings packed back to back.
pub fn decode_strlist(data: &[u8]) -> Result<Vec<&str>, PropertyError> {
    if data.last().is_some_and(|b| *b != 0) {
        return Err(PropertyError::TypeMismatch);
    }
    let mut res = Vec::new();
    let mut st = 0;
    for (i, b) in data.iter().enumerate() {
        if *b == 0 {
            res.push(str::from_utf8(&data[st..i]).map_err(|_| PropertyError::TypeMismatch)?);
            st = i + 1;
        }
    }
    Ok(res)
}

/// Decode an array of 32-bit cells.
pub fn decode_u32_array(data: &[u8]) -> Result<Vec<u32>, PropertyError> {
    if data.len() % BigEndian32::SIZE != 0 {
        return Err(PropertyError::TypeMismatch);
    }
    Ok(data
        .chunks_exact(BigEndian32::SIZE)
        .filter_map(BigEndian32::read)
        .map(|cell| cell.value())
        .collect())
}

/// Decode the `index`-th cell of a cell array.
pub fn decode_u32_index(data: &[u8], index: usize) -> Result<u32, PropertyError> {
    if data.len() % BigEndian32::SIZE != 0 {
        return Err(PropertyError::TypeMismatch);
    }
    let off = index * BigEndian32::SIZE;
    data.get(off..off + BigEndian32::SIZE)
        .and_then(BigEndian32::read)
        .map(|cell| cell.value())
        .ok_or(PropertyError::NotFound)
}

/// Fold `cells` big-endian cells starting at cell `start` into one number.
pub fn decode_cells(data: &[u8], start: usize, cells: usize) -> Result<u64, PropertyError> {
    let mut val: u64 = 0;
    for i in start..start + cells {
        val = (val << 32) | decode_u32_index(data, i)? as u64;
    }
    Ok(val)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyError {
    /// The property (or node) does not exist.
    NotFound,
    /// The stored encoding does not match the requested type.
    TypeMismatch,
    /// A phandle does not point to any node.
    DanglingHandle,
    /// The tree cannot be modified.
    ReadOnly,
}

impl fmt::Display for PropertyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            PropertyError::NotFound => "property not found",
            PropertyError::TypeMismatch => "property has unexpected encoding",
            PropertyError::DanglingHandle => "phandle does not resolve",
            PropertyError::ReadOnly => "tree is read-only",
        };
        f.write_str(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_lengths_are_strict() {
        assert_eq!(decode_u32(&[0, 0, 0, 7]), Ok(7));
        assert_eq!(decode_u32(&[0, 0, 7]), Err(PropertyError::TypeMismatch));
        assert_eq!(decode_u32(&[0, 0, 0, 0, 0, 0, 0, 7]), Err(PropertyError::TypeMismatch));
        assert_eq!(decode_u64(&[0, 0, 0, 1, 0, 0, 0, 2]), Ok(0x1_0000_0002));
    }

    #[test]
    fn strings_need_terminator() {
        assert_eq!(decode_str(b"okay\0"), Ok("okay"));
        assert_eq!(decode_str(b"okay"), Err(PropertyError::TypeMismatch));
        assert_eq!(decode_str(b""), Err(PropertyError::TypeMismatch));
        assert_eq!(
            decode_strlist(b"vendor,uart\0ns16550a\0"),
            Ok(alloc::vec!["vendor,uart", "ns16550a"])
        );
        assert_eq!(decode_strlist(b"a\0b"), Err(PropertyError::TypeMismatch));
        assert_eq!(decode_strlist(b""), Ok(Vec::new()));
    }

    #[test]
    fn cell_arrays() {
        let data = [0, 0, 0, 1, 0, 0, 0, 2, 0, 0, 0, 3];
        assert_eq!(decode_u32_array(&data), Ok(alloc::vec![1, 2, 3]));
        assert_eq!(decode_u32_index(&data, 2), Ok(3));
        assert_eq!(decode_u32_index(&data, 3), Err(PropertyError::NotFound));
        assert_eq!(decode_cells(&data, 1, 2), Ok(0x2_0000_0003));
        assert_eq!(decode_u32_array(&data[..5]), Err(PropertyError::TypeMismatch));
    }
}
