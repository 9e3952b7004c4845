//! Device-tree data structures used by the driver model.
//!
//! Two interchangeable representations are provided:
//! - [fdt::Fdt]: a read-only view over a flattened blob, addressed by structure-block offsets.
//!   Usable before any heap exists because it never copies.
//! - [node::DeviceTree]: a linked in-memory tree, addressed by node index, which may be
//!   modified. Produced from a blob with [fdt::Fdt::unflatten].
//!
//! Both decode property payloads through the same helpers in [prop], so the same
//! property reads back the same value whichever representation it came from.
#![no_std]
extern crate alloc;

pub mod fdt;
pub mod node;
pub mod prop;
