//! Optional process-wide handle to the driver-model context.
//!
//! Firmware that cannot pass a [Dm] around installs it once after creating it and takes it back
//! before shutting down:
//!
//! 1. [install] after [Dm::new], before the first [get];
//! 2. [get] from anywhere while installed;
//! 3. [take] once the context was [uninit](Dm::uninit)-ed, which empties the handle.
use alloc::sync::Arc;
use lazy_static::lazy_static;
use spin::RwLock;

use crate::{error::DmError, root::Dm};

lazy_static! {
    static ref DM_ROOT: RwLock<Option<Arc<Dm>>> = RwLock::new(None);
}

/// Make `dm` the process-wide context. Fails with [DmError::Active] if one is installed.
pub fn install(dm: Arc<Dm>) -> Result<(), DmError> {
    let mut slot = DM_ROOT.write();
    if slot.is_some() {
        return Err(DmError::Active);
    }
    *slot = Some(dm);
    Ok(())
}

pub fn get() -> Option<Arc<Dm>> {
    DM_ROOT.read().clone()
}

/// Remove the process-wide context and hand it back.
pub fn take() -> Option<Arc<Dm>> {
    DM_ROOT.write().take()
}
