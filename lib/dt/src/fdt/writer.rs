use alloc::{string::String, vec::Vec};
use utils::{
    endian::{BigEndian32, BigEndian64, EndianData},
    num::AlignableTo,
};

use crate::fdt::{Fdt, FdtError, FdtHeader, FdtNodeType};

/// Sequential builder for flattened device tree blobs.
///
/// Nodes are opened with [FdtWriter::begin_node] and closed with [FdtWriter::end_node];
/// properties go to the node opened last. Property names are de-duplicated in the strings block.
#[derive(Debug, Default)]
pub struct FdtWriter {
    structs: Vec<u8>,
    strings: Vec<u8>,
    rsv: Vec<(u64, u64)>,
    depth: usize,
    roots: usize,
    boot_cpuid: u32,
}

impl FdtWriter {
    pub fn new() -> FdtWriter {
        FdtWriter::default()
    }

    pub fn set_boot_cpuid(&mut self, cpuid: u32) {
        self.boot_cpuid = cpuid;
    }

    /// Add an entry to the memory reservation map.
    pub fn add_reserve(&mut self, address: u64, size: u64) {
        self.rsv.push((address, size));
    }

    fn push_u32(&mut self, value: u32) {
        let cell = BigEndian32::from_value(value);
        self.structs
            .extend_from_slice(&cell.to_bytes()[..BigEndian32::SIZE]);
    }

    fn pad(&mut self) {
        let len = self.structs.len().align_up(4);
        self.structs.resize(len, 0);
    }

    fn string_offset(&mut self, name: &str) -> u32 {
        let mut st = 0;
        while st < self.strings.len() {
            let len = self.strings[st..]
                .iter()
                .position(|b| *b == 0)
                .unwrap_or(self.strings.len() - st);
            if &self.strings[st..st + len] == name.as_bytes() {
                return st as u32;
            }
            st += len + 1;
        }
        let off = self.strings.len();
        self.strings.extend_from_slice(name.as_bytes());
        self.strings.push(0);
        off as u32
    }

    /// Open a node. The first node opened is the root and should be named "".
    pub fn begin_node(&mut self, name: &str) {
        if self.depth == 0 {
            self.roots += 1;
        }
        self.push_u32(FdtNodeType::FDT_BEGIN_NODE.bits());
        self.structs.extend_from_slice(name.as_bytes());
        self.structs.push(0);
        self.pad();
        self.depth += 1;
    }

    pub fn end_node(&mut self) {
        self.push_u32(FdtNodeType::FDT_END_NODE.bits());
        self.depth = self.depth.saturating_sub(1);
    }

    /// Append a raw property to the current node.
    pub fn property(&mut self, name: &str, data: &[u8]) {
        let nameoff = self.string_offset(name);
        self.push_u32(FdtNodeType::FDT_PROP.bits());
        self.push_u32(data.len() as u32);
        self.push_u32(nameoff);
        self.structs.extend_from_slice(data);
        self.pad();
    }

    pub fn property_empty(&mut self, name: &str) {
        self.property(name, &[]);
    }

    pub fn property_u32(&mut self, name: &str, value: u32) {
        self.property(name, &BigEndian32::from_value(value).to_bytes()[..4]);
    }

    pub fn property_u64(&mut self, name: &str, value: u64) {
        self.property(name, &BigEndian64::from_value(value).to_bytes());
    }

    pub fn property_u32_array(&mut self, name: &str, values: &[u32]) {
        let data: Vec<u8> = values
            .iter()
            .flat_map(|v| v.to_be_bytes())
            .collect();
        self.property(name, &data);
    }

    pub fn property_string(&mut self, name: &str, value: &str) {
        self.property_strings(name, &[value]);
    }

    pub fn property_strings(&mut self, name: &str, values: &[&str]) {
        let mut data = String::new();
        for value in values {
            data.push_str(value);
            data.push('\0');
        }
        self.property(name, data.as_bytes());
    }

    /// Lay out header, reservation map, structure block and strings block.
    pub fn finish(mut self) -> Result<Vec<u8>, FdtError> {
        if self.depth != 0 || self.roots != 1 {
            return Err(FdtError::Unbalanced);
        }
        self.push_u32(FdtNodeType::FDT_END.bits());

        let off_mem_rsvmap = FdtHeader::SIZE.align_up(8);
        let off_dt_struct = off_mem_rsvmap + (self.rsv.len() + 1) * 16;
        let off_dt_strings = off_dt_struct + self.structs.len();
        let totalsize = off_dt_strings + self.strings.len();

        let header = [
            Fdt::FDT_MAGIC,
            totalsize as u32,
            off_dt_struct as u32,
            off_dt_strings as u32,
            off_mem_rsvmap as u32,
            Fdt::FDT_VERSION,
            Fdt::LAST_COMP_VERSION,
            self.boot_cpuid,
            self.strings.len() as u32,
            self.structs.len() as u32,
        ];
        let mut blob = Vec::with_capacity(totalsize);
        for word in header {
            blob.extend_from_slice(&word.to_be_bytes());
        }
        blob.resize(off_mem_rsvmap, 0);
        for (addr, size) in self.rsv.iter().chain(core::iter::once(&(0, 0))) {
            blob.extend_from_slice(&addr.to_be_bytes());
            blob.extend_from_slice(&size.to_be_bytes());
        }
        blob.extend_from_slice(&self.structs);
        blob.extend_from_slice(&self.strings);
        Ok(blob)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_shared_in_strings_block() {
        let mut w = FdtWriter::new();
        w.begin_node("");
        w.property_string("compatible", "board");
        w.begin_node("a");
        w.property_string("compatible", "x");
        w.end_node();
        w.end_node();
        let blob = w.finish().unwrap();
        let fdt = Fdt::new(&blob).unwrap();
        assert_eq!(fdt.header().size_dt_strings as usize, "compatible\0".len());
        let a = fdt.path_offset("/a").unwrap();
        assert_eq!(fdt.getprop(a, "compatible"), Some(&b"x\0"[..]));
    }

    #[test]
    fn rejects_unbalanced_nodes() {
        let mut w = FdtWriter::new();
        w.begin_node("");
        w.begin_node("a");
        w.end_node();
        assert_eq!(w.finish().unwrap_err(), FdtError::Unbalanced);
        assert_eq!(FdtWriter::new().finish().unwrap_err(), FdtError::Unbalanced);
    }
}
