//! Pool naming
//!
//! Each media class maps to exactly one volume group on the node.

use crate::error::{Error, Result};

/// Every pool volume group starts with this
pub const POOL_NAME_PREFIX: &str = "LocalStorage_";

pub const POOL_NAME_HDD: &str = "LocalStorage_PoolHDD";
pub const POOL_NAME_SSD: &str = "LocalStorage_PoolSSD";
pub const POOL_NAME_NVME: &str = "LocalStorage_PoolNVMe";

pub const DISK_CLASS_HDD: &str = "HDD";
pub const DISK_CLASS_SSD: &str = "SSD";
pub const DISK_CLASS_NVME: &str = "NVMe";

pub const POOL_TYPE_REGULAR: &str = "REGULAR";

/// Hard cap on logical volumes per pool
pub const MAX_VOLUME_COUNT: i64 = 1000;

pub const POOL_NAMES: [&str; 3] = [POOL_NAME_HDD, POOL_NAME_SSD, POOL_NAME_NVME];

/// Pool that holds disks of `class`
pub fn pool_name_for_class(class: &str) -> Result<&'static str> {
    match class {
        DISK_CLASS_HDD => Ok(POOL_NAME_HDD),
        DISK_CLASS_SSD => Ok(POOL_NAME_SSD),
        DISK_CLASS_NVME => Ok(POOL_NAME_NVME),
        other => Err(Error::UnsupportedPoolClass(other.to_string())),
    }
}

/// Media class served by pool `name`
pub fn class_for_pool_name(name: &str) -> Option<&'static str> {
    match name.trim() {
        POOL_NAME_HDD => Some(DISK_CLASS_HDD),
        POOL_NAME_SSD => Some(DISK_CLASS_SSD),
        POOL_NAME_NVME => Some(DISK_CLASS_NVME),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_class_pool_mapping() {
        for class in [DISK_CLASS_HDD, DISK_CLASS_SSD, DISK_CLASS_NVME] {
            let pool = pool_name_for_class(class).unwrap();
            assert!(pool.starts_with(POOL_NAME_PREFIX));
            assert_eq!(class_for_pool_name(pool), Some(class));
        }
        assert_matches!(pool_name_for_class("TAPE"), Err(Error::UnsupportedPoolClass(_)));
        assert_eq!(class_for_pool_name("vg0"), None);
    }
}
