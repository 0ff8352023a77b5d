//! Buffer manager configuration.
//!
//! A plain data struct plus a builder. Loading these values from CLI flags
//! or a config file is an external collaborator's job — construct a
//! `BufferManagerConfig` directly, as the tests and benches do.

use crate::buffer::page::PAGE_SIZE;
use crate::error::{BufferError, Result};

/// Recognized configuration options and their effects.
#[derive(Debug, Clone)]
pub struct BufferManagerConfig {
    /// DRAM pool size in GiB; determines `N = dram_gib * 2^30 / sizeof(BufferFrame)`.
    pub dram_gib: f64,

    /// `partitions_count = 1 << partition_bits`; partition selection uses the
    /// low bits of the page id.
    pub partition_bits: u32,

    /// Percent of `N` kept free per partition (lower bound driving phases 2/3).
    pub free_pct: f64,

    /// Percent of `N` kept in the cooling queue per partition (upper bound
    /// driving phase 1).
    pub cool_pct: f64,

    /// Number of page-provider agents; must divide `partitions_count`.
    pub pp_threads: usize,

    /// Capacity of the `AsyncWriteBuffer`.
    pub async_batch_size: usize,

    /// Device location.
    pub device_path: String,

    /// Truncate the device file on open.
    pub truncate: bool,

    /// Preallocate this many GiB on the device at startup.
    pub preallocate_gib: f64,

    /// Request top scheduling priority for page-provider agents.
    pub elevate_priority: bool,

    /// Page size in bytes (must be a power of two, >= 512).
    pub page_size: usize,
}

/// Largest power of two not exceeding the host's visible core count,
/// capped at `max_partitions` — any such value is guaranteed to divide
/// `1 << partition_bits` for the default `partition_bits` below, so the
/// default config is always self-consistent regardless of the machine it
/// runs on.
fn default_pp_threads(max_partitions: usize) -> usize {
    let cores = num_cpus::get().max(1);
    let mut threads = 1usize;
    while threads * 2 <= cores && threads * 2 <= max_partitions {
        threads *= 2;
    }
    threads
}

impl Default for BufferManagerConfig {
    fn default() -> Self {
        let partition_bits = 6;
        Self {
            dram_gib: 1.0,
            partition_bits,
            free_pct: 1.0,
            cool_pct: 10.0,
            pp_threads: default_pp_threads(1usize << partition_bits),
            async_batch_size: 256,
            device_path: "./vmcache.db".to_string(),
            truncate: false,
            preallocate_gib: 0.0,
            elevate_priority: false,
            page_size: PAGE_SIZE,
        }
    }
}

impl BufferManagerConfig {
    pub fn builder() -> BufferManagerConfigBuilder {
        BufferManagerConfigBuilder::default()
    }

    pub fn partitions_count(&self) -> usize {
        1usize << self.partition_bits
    }

    /// Validate cross-field invariants the manager relies on: `pp_threads`
    /// must evenly divide the partition count so each page-provider agent
    /// can own a contiguous, equal-sized partition range.
    pub fn validate(&self) -> Result<()> {
        if !self.page_size.is_power_of_two() || self.page_size < 512 {
            return Err(BufferError::Config(format!(
                "page_size {} must be a power of two >= 512",
                self.page_size
            )));
        }
        let partitions = self.partitions_count();
        if self.pp_threads == 0 || partitions % self.pp_threads != 0 {
            return Err(BufferError::Config(format!(
                "pp_threads ({}) must divide partitions_count ({})",
                self.pp_threads, partitions
            )));
        }
        if !(0.0..=100.0).contains(&self.free_pct) || !(0.0..=100.0).contains(&self.cool_pct) {
            return Err(BufferError::Config(
                "free_pct and cool_pct must be within [0, 100]".to_string(),
            ));
        }
        if self.async_batch_size == 0 {
            return Err(BufferError::Config(
                "async_batch_size must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct BufferManagerConfigBuilder {
    cfg: BufferManagerConfigOverrides,
}

#[derive(Default)]
struct BufferManagerConfigOverrides {
    dram_gib: Option<f64>,
    partition_bits: Option<u32>,
    free_pct: Option<f64>,
    cool_pct: Option<f64>,
    pp_threads: Option<usize>,
    async_batch_size: Option<usize>,
    device_path: Option<String>,
    truncate: Option<bool>,
    preallocate_gib: Option<f64>,
    elevate_priority: Option<bool>,
    page_size: Option<usize>,
}

macro_rules! builder_field {
    ($name:ident, $ty:ty) => {
        pub fn $name(mut self, value: $ty) -> Self {
            self.cfg.$name = Some(value);
            self
        }
    };
}

impl BufferManagerConfigBuilder {
    builder_field!(dram_gib, f64);
    builder_field!(partition_bits, u32);
    builder_field!(free_pct, f64);
    builder_field!(cool_pct, f64);
    builder_field!(pp_threads, usize);
    builder_field!(async_batch_size, usize);
    builder_field!(truncate, bool);
    builder_field!(preallocate_gib, f64);
    builder_field!(elevate_priority, bool);
    builder_field!(page_size, usize);

    pub fn device_path(mut self, value: impl Into<String>) -> Self {
        self.cfg.device_path = Some(value.into());
        self
    }

    pub fn build(self) -> BufferManagerConfig {
        let default = BufferManagerConfig::default();
        let partition_bits = self.cfg.partition_bits.unwrap_or(default.partition_bits);
        BufferManagerConfig {
            dram_gib: self.cfg.dram_gib.unwrap_or(default.dram_gib),
            partition_bits,
            free_pct: self.cfg.free_pct.unwrap_or(default.free_pct),
            cool_pct: self.cfg.cool_pct.unwrap_or(default.cool_pct),
            pp_threads: self
                .cfg
                .pp_threads
                .unwrap_or_else(|| default_pp_threads(1usize << partition_bits)),
            async_batch_size: self
                .cfg
                .async_batch_size
                .unwrap_or(default.async_batch_size),
            device_path: self.cfg.device_path.unwrap_or(default.device_path),
            truncate: self.cfg.truncate.unwrap_or(default.truncate),
            preallocate_gib: self.cfg.preallocate_gib.unwrap_or(default.preallocate_gib),
            elevate_priority: self.cfg.elevate_priority.unwrap_or(default.elevate_priority),
            page_size: self.cfg.page_size.unwrap_or(default.page_size),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        BufferManagerConfig::default().validate().unwrap();
    }

    #[test]
    fn pp_threads_must_divide_partitions() {
        let cfg = BufferManagerConfig::builder()
            .partition_bits(2) // 4 partitions
            .pp_threads(3)
            .build();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn builder_overrides_defaults() {
        let cfg = BufferManagerConfig::builder()
            .dram_gib(2.0)
            .partition_bits(4)
            .build();
        assert_eq!(cfg.dram_gib, 2.0);
        assert_eq!(cfg.partitions_count(), 16);
    }
}
