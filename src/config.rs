// Runtime sizing of the GigaCage pools.

use crate::bits::is_power_of_two;
use crate::{BRP_POOL_SIZE, CONFIGURABLE_POOL_SIZE, MAX_POOL_SIZE, NON_BRP_POOL_SIZE, SUPER_PAGE_SIZE};

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    PoolSizeNotPowerOfTwo { pool: &'static str, size: usize },
    PoolSizeTooSmall { pool: &'static str, size: usize },
    PoolSizeTooLarge { pool: &'static str, size: usize },
}

impl std::error::Error for ConfigError {}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::PoolSizeNotPowerOfTwo { pool, size } => {
                write!(f, "{pool} pool size {size} is not a power of two")
            }
            ConfigError::PoolSizeTooSmall { pool, size } => {
                write!(f, "{pool} pool size {size} is smaller than a super page ({SUPER_PAGE_SIZE})")
            }
            ConfigError::PoolSizeTooLarge { pool, size } => {
                write!(f, "{pool} pool size {size} is larger than the maximum ({MAX_POOL_SIZE})")
            }
        }
    }
}

/// Sizes of the pools and whether `init` reserves the card table. Every pool is a power of two
/// between one super page and `MAX_POOL_SIZE`, since membership is a mask test and pools are
/// carved in super pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GigaCageConfig {
    pub non_brp_pool_size: usize,
    pub brp_pool_size: usize,
    pub configurable_pool_size: usize,
    pub reserve_card_table: bool,
}

impl GigaCageConfig {
    pub fn new(non_brp_pool_size: usize, brp_pool_size: usize, configurable_pool_size: usize) -> Result<Self, ConfigError> {
        check_pool_size("non-BRP", non_brp_pool_size)?;
        check_pool_size("BRP", brp_pool_size)?;
        check_pool_size("configurable", configurable_pool_size)?;

        Ok(Self {
            non_brp_pool_size,
            brp_pool_size,
            configurable_pool_size,
            reserve_card_table: cfg!(feature = "card-table"),
        })
    }

    pub fn with_card_table(mut self, reserve_card_table: bool) -> Self {
        self.reserve_card_table = reserve_card_table;
        self
    }

    /// The fixed pools, in the order they are laid out.
    pub fn pool_sizes(&self) -> [usize; 2] {
        [self.non_brp_pool_size, self.brp_pool_size]
    }
}

impl Default for GigaCageConfig {
    fn default() -> Self {
        Self {
            non_brp_pool_size: NON_BRP_POOL_SIZE,
            brp_pool_size: BRP_POOL_SIZE,
            configurable_pool_size: CONFIGURABLE_POOL_SIZE,
            reserve_card_table: cfg!(feature = "card-table"),
        }
    }
}

fn check_pool_size(pool: &'static str, size: usize) -> Result<(), ConfigError> {
    if !is_power_of_two(size) {
        return Err(ConfigError::PoolSizeNotPowerOfTwo { pool, size });
    }
    if size < SUPER_PAGE_SIZE {
        return Err(ConfigError::PoolSizeTooSmall { pool, size });
    }
    if size > MAX_POOL_SIZE {
        return Err(ConfigError::PoolSizeTooLarge { pool, size });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        let d = GigaCageConfig::default();
        let c = GigaCageConfig::new(d.non_brp_pool_size, d.brp_pool_size, d.configurable_pool_size).unwrap();
        assert_eq!(c, d);
    }

    #[test]
    fn rejects_bad_sizes() {
        assert_eq!(
            GigaCageConfig::new(3 << 21, 1 << 26, 1 << 26),
            Err(ConfigError::PoolSizeNotPowerOfTwo { pool: "non-BRP", size: 3 << 21 })
        );
        assert_eq!(
            GigaCageConfig::new(1 << 26, 1 << 20, 1 << 26),
            Err(ConfigError::PoolSizeTooSmall { pool: "BRP", size: 1 << 20 })
        );
        assert!(GigaCageConfig::new(1 << 26, 1 << 26, 0).is_err());
        assert_eq!(
            GigaCageConfig::new(1 << 26, 2 * MAX_POOL_SIZE, 1 << 26),
            Err(ConfigError::PoolSizeTooLarge { pool: "BRP", size: 2 * MAX_POOL_SIZE })
        );
        assert!(GigaCageConfig::new(MAX_POOL_SIZE, MAX_POOL_SIZE, MAX_POOL_SIZE).is_ok());

        let e = GigaCageConfig::new(1 << 26, 1 << 26, 0).unwrap_err();
        assert_eq!(e.to_string(), "configurable pool size 0 is not a power of two");
    }

    #[test]
    fn card_table_override() {
        let c = GigaCageConfig::new(1 << 26, 1 << 26, 1 << 25).unwrap().with_card_table(true);
        assert!(c.reserve_card_table);
        assert_eq!(c.pool_sizes(), [1 << 26, 1 << 26]);
    }
}
