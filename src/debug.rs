//! Debug logging utilities for pmemvm.
//!
//! Set the `PMEMVM_DEBUG` environment variable to enable verbose logging:
//! - `PMEMVM_DEBUG=1` - Enable all debug output
//! - `PMEMVM_DEBUG=region` - Enable only region-table logs
//! - `PMEMVM_DEBUG=carve` - Enable only carving logs
//! - `PMEMVM_DEBUG=assign` - Enable only page assignment logs
//! - `PMEMVM_DEBUG=region,assign` - Enable multiple categories
//!
//! Output goes through the `log` facade at debug level, so a logger must
//! also be installed by the host.

use std::sync::OnceLock;

/// Debug categories that can be enabled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugCategory {
    Region,
    Carve,
    Assign,
    All,
}

/// Cached debug configuration
static DEBUG_CONFIG: OnceLock<DebugConfig> = OnceLock::new();

#[derive(Debug, Default)]
struct DebugConfig {
    enabled: bool,
    region: bool,
    carve: bool,
    assign: bool,
}

impl DebugConfig {
    fn parse(val: &str) -> Self {
        let val_lower = val.to_lowercase();
        if val_lower == "1" || val_lower == "all" {
            return Self {
                enabled: true,
                region: true,
                carve: true,
                assign: true,
            };
        }
        Self {
            enabled: true,
            region: val_lower.contains("region"),
            carve: val_lower.contains("carve"),
            assign: val_lower.contains("assign"),
        }
    }

    fn from_env() -> Self {
        match std::env::var("PMEMVM_DEBUG") {
            Ok(val) => Self::parse(&val),
            Err(_) => Self::default(),
        }
    }

    fn allows(&self, category: DebugCategory) -> bool {
        if !self.enabled {
            return false;
        }
        match category {
            DebugCategory::All => self.region || self.carve || self.assign,
            DebugCategory::Region => self.region,
            DebugCategory::Carve => self.carve,
            DebugCategory::Assign => self.assign,
        }
    }
}

fn get_config() -> &'static DebugConfig {
    DEBUG_CONFIG.get_or_init(DebugConfig::from_env)
}

/// Check if debug logging is enabled for a category
pub fn is_debug_enabled(category: DebugCategory) -> bool {
    get_config().allows(category)
}

/// Debug print macro for region-table logs
#[macro_export]
macro_rules! debug_region {
    ($($arg:tt)*) => {
        if $crate::debug::is_debug_enabled($crate::debug::DebugCategory::Region) {
            log::debug!(target: "pmemvm::region", $($arg)*);
        }
    };
}

/// Debug print macro for carving logs
#[macro_export]
macro_rules! debug_carve {
    ($($arg:tt)*) => {
        if $crate::debug::is_debug_enabled($crate::debug::DebugCategory::Carve) {
            log::debug!(target: "pmemvm::carve", $($arg)*);
        }
    };
}

/// Debug print macro for page assignment logs
#[macro_export]
macro_rules! debug_assign {
    ($($arg:tt)*) => {
        if $crate::debug::is_debug_enabled($crate::debug::DebugCategory::Assign) {
            log::debug!(target: "pmemvm::assign", $($arg)*);
        }
    };
}
