//! Build-time configuration of the driver model.
//! The constants are generated by `build.rs` from the selected profile of `dm_config.json`.

#![no_std]
#![deny(missing_docs)]

/// Constants of the selected configuration profile.
pub mod build_flags {
    #![allow(missing_docs)]
    include!(concat!(env!("OUT_DIR"), "/build_flags.rs"));
}

pub use build_flags::*;
