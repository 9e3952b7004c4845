//! This module provides functionalities to resolve a flattened device tree

use bitflags::bitflags;
use core::fmt;
use utils::endian::be32_at;

pub mod reader;
pub mod writer;

pub use reader::Fdt;
pub use writer::FdtWriter;

/// Flattened Device Tree header, decoded to native integers.
///
/// This mirrors the on-disk header structure; every field is a big-endian 32-bit word in the blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FdtHeader {
    pub magic: u32,
    pub totalsize: u32,
    pub off_dt_struct: u32,
    pub off_dt_strings: u32,
    pub off_mem_rsvmap: u32,
    pub version: u32,
    pub last_comp_version: u32,
    pub boot_cpuid_phys: u32,
    pub size_dt_strings: u32,
    pub size_dt_struct: u32,
}

impl FdtHeader {
    /// Size of the version-17 header in bytes.
    pub const SIZE: usize = 40;

    /// Decode the header words at the start of `blob`.
    pub fn parse(blob: &[u8]) -> Result<FdtHeader, FdtError> {
        let word = |idx: usize| be32_at(blob, idx * 4).ok_or(FdtError::Truncated);
        Ok(FdtHeader {
            magic: word(0)?,
            totalsize: word(1)?,
            off_dt_struct: word(2)?,
            off_dt_strings: word(3)?,
            off_mem_rsvmap: word(4)?,
            version: word(5)?,
            last_comp_version: word(6)?,
            boot_cpuid_phys: word(7)?,
            size_dt_strings: word(8)?,
            size_dt_struct: word(9)?,
        })
    }
}

bitflags! {
    /// Type tags found in the FDT structure block.
    pub struct FdtNodeType : u32{
        /// Begin a node (followed by its name string)
        const FDT_BEGIN_NODE  = 0x01;
        /// End a node
        const FDT_END_NODE    = 0x02;
        /// A property entry (length, nameoff, data)
        const FDT_PROP        = 0x03;
        /// No-op padding word
        const FDT_NOP         = 0x04;
        /// End of the structure block
        const FDT_END         = 0x09;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdtError {
    InvalidNodeType { node_type: usize, cursor: usize },
    InvalidMagic { magic: usize },
    IncompatibleVersion { version: usize },
    /// A block or token runs past the end of the blob.
    Truncated,
    /// BEGIN_NODE/END_NODE tokens do not nest.
    BadStructure { cursor: usize },
    /// A name is not valid UTF-8 or not terminated.
    BadString { cursor: usize },
    /// A memory reservation runs past the end of the address space.
    BadReservation { cursor: usize },
    /// The writer was finished with nodes still open, or without a root.
    Unbalanced,
}

impl fmt::Display for FdtError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FdtError::InvalidNodeType { node_type, cursor } => {
                write!(f, "invalid token {:#x} at {:#x}", node_type, cursor)
            }
            FdtError::InvalidMagic { magic } => write!(f, "bad magic {:#x}", magic),
            FdtError::IncompatibleVersion { version } => {
                write!(f, "incompatible version {}", version)
            }
            FdtError::Truncated => f.write_str("blob truncated"),
            FdtError::BadStructure { cursor } => write!(f, "unbalanced nodes at {:#x}", cursor),
            FdtError::BadString { cursor } => write!(f, "bad string at {:#x}", cursor),
            FdtError::BadReservation { cursor } => write!(f, "bad memory reservation at {:#x}", cursor),
            FdtError::Unbalanced => f.write_str("unbalanced writer state"),
        }
    }
}
