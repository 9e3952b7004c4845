//! Error types of the driver model.

use core::fmt;
use dt::{fdt::FdtError, prop::PropertyError};

/// Errno-style codes reported by [DmError::errno].
pub mod errno {
    pub const ENOENT: i32 = 2;
    pub const EIO: i32 = 5;
    pub const EAGAIN: i32 = 11;
    pub const ENOMEM: i32 = 12;
    pub const EBUSY: i32 = 16;
    pub const EEXIST: i32 = 17;
    pub const ENODEV: i32 = 19;
    pub const EINVAL: i32 = 22;
    pub const ENOSPC: i32 = 28;
    pub const ENOSYS: i32 = 38;
    pub const ENODATA: i32 = 61;
    pub const EOVERFLOW: i32 = 75;
    pub const EKEYREJECTED: i32 = 129;
}

/// The lifecycle callback that reported a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookStage {
    OfToPlat,
    Bind,
    ChildPostBind,
    PostBind,
    PreProbe,
    ChildPreProbe,
    Probe,
    PostProbe,
    Unbind,
}

impl HookStage {
    pub fn name(self) -> &'static str {
        match self {
            HookStage::OfToPlat => "of_to_plat",
            HookStage::Bind => "bind",
            HookStage::ChildPostBind => "child_post_bind",
            HookStage::PostBind => "post_bind",
            HookStage::PreProbe => "pre_probe",
            HookStage::ChildPreProbe => "child_pre_probe",
            HookStage::Probe => "probe",
            HookStage::PostProbe => "post_probe",
            HookStage::Unbind => "unbind",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmError {
    /// No driver matches the node's compatible strings.
    NoMatchingDriver,
    /// The node is already bound to the matching driver.
    AlreadyBound,
    /// The data pool is exhausted.
    OutOfMemory,
    /// A device was about to be probed while its parent is inactive.
    ParentNotProbed,
    HookFailed(HookStage),
    InvalidNode(PropertyError),
    /// Lookup miss (uclass, device, driver or node).
    NotFound,
    /// The device is still probed.
    Active,
    /// The removal flags do not select this device or one of its children.
    Rejected,
    /// The feature is disabled by configuration or unavailable on this tree.
    NotSupported,
    /// No room for another device tree.
    TooManyTrees,
    /// A status code reported by a driver or an event subscriber.
    Driver(i32),
}

impl DmError {
    /// Negative errno-style code for this error.
    pub fn errno(&self) -> i32 {
        use errno::*;
        match self {
            DmError::NoMatchingDriver => -ENODEV,
            DmError::AlreadyBound => -EEXIST,
            DmError::OutOfMemory => -ENOMEM,
            DmError::ParentNotProbed => -EAGAIN,
            DmError::HookFailed(_) => -EIO,
            DmError::InvalidNode(PropertyError::NotFound) => -EINVAL,
            DmError::InvalidNode(PropertyError::TypeMismatch) => -EOVERFLOW,
            DmError::InvalidNode(PropertyError::DanglingHandle) => -ENOENT,
            DmError::InvalidNode(PropertyError::ReadOnly) => -ENOSYS,
            DmError::NotFound => -ENOENT,
            DmError::Active => -EBUSY,
            DmError::Rejected => -EKEYREJECTED,
            DmError::NotSupported => -ENOSYS,
            DmError::TooManyTrees => -ENOSPC,
            DmError::Driver(code) if *code > 0 => -*code,
            DmError::Driver(code) => *code,
        }
    }
}

impl From<PropertyError> for DmError {
    fn from(value: PropertyError) -> Self {
        DmError::InvalidNode(value)
    }
}

impl From<FdtError> for DmError {
    /// A malformed blob is reported like a node with unexpected contents.
    fn from(value: FdtError) -> Self {
        log::warn!("Malformed device tree: {}", value);
        DmError::InvalidNode(PropertyError::TypeMismatch)
    }
}

impl fmt::Display for DmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DmError::NoMatchingDriver => f.write_str("no matching driver"),
            DmError::AlreadyBound => f.write_str("already bound"),
            DmError::OutOfMemory => f.write_str("out of memory"),
            DmError::ParentNotProbed => f.write_str("parent not probed"),
            DmError::HookFailed(stage) => write!(f, "{} hook failed", stage.name()),
            DmError::InvalidNode(err) => write!(f, "invalid node: {}", err),
            DmError::NotFound => f.write_str("not found"),
            DmError::Active => f.write_str("device is active"),
            DmError::Rejected => f.write_str("removal rejected by flags"),
            DmError::NotSupported => f.write_str("not supported"),
            DmError::TooManyTrees => f.write_str("too many device trees"),
            DmError::Driver(code) => write!(f, "driver error {}", code),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_is_negative() {
        assert_eq!(DmError::OutOfMemory.errno(), -errno::ENOMEM);
        assert_eq!(DmError::Driver(5).errno(), -5);
        assert_eq!(DmError::Driver(-7).errno(), -7);
        assert_eq!(DmError::from(PropertyError::NotFound).errno(), -errno::EINVAL);
    }
}
