//! Runtime view of the build-time configuration.

use ::config::build_flags;

/// Container nodes whose children are bound under the root by the extended scan.
pub const DEFAULT_SCAN_PATHS: &[&str] = &["/chosen", "/clocks", "/firmware"];

/// Driver-model settings.
///
/// [Default] takes every value from the selected `dm_config.json` profile; boards and tests
/// override single fields with struct update syntax.
#[derive(Debug, Clone)]
pub struct DmConfig {
    /// Maximum number of device trees addressed at once.
    pub multi_tree_max: usize,
    /// Size of the pool backing device data, in bytes.
    pub pool_size: usize,
    /// Whether event subscribers can be registered at runtime.
    pub event_dynamic: bool,
    /// Whether `/aliases` entries decide sequence numbers.
    pub seq_alias: bool,
    /// Whether the scan also binds the children of [DmConfig::scan_paths].
    pub extended_scan: bool,
    pub scan_paths: &'static [&'static str],
}

impl Default for DmConfig {
    fn default() -> Self {
        DmConfig {
            multi_tree_max: build_flags::OFNODE_MULTI_TREE_MAX,
            pool_size: build_flags::DM_POOL_SIZE,
            event_dynamic: build_flags::DM_EVENT_DYNAMIC,
            seq_alias: build_flags::DM_SEQ_ALIAS,
            extended_scan: build_flags::DM_EXTENDED_SCAN,
            scan_paths: DEFAULT_SCAN_PATHS,
        }
    }
}
