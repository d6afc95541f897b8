use std::process;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::core::{RegionConfig, RegionService};
use crate::layer::{ChannelLayer, LayerConfig, LayerConfigBuilder};

mod lock_tests;

pub(crate) fn unique_prefix(name: &str) -> String {
    static PREFIX_COUNTER: AtomicUsize = AtomicUsize::new(0);
    format!(
        "shmch-{}-{}-{}",
        name,
        process::id(),
        PREFIX_COUNTER.fetch_add(1, Ordering::SeqCst)
    )
}

/// Small regions so tests stay cheap: 255 message slots of 1 KiB.
pub(crate) fn small_config(name: &str) -> LayerConfigBuilder {
    LayerConfig::builder()
        .prefix(unique_prefix(name))
        .channel_memory(256 * 1024)
        .group_memory(64 * 1024)
        .message_slot_size(1024)
        .group_slot_size(256)
}

/// Removes the regions when a test ends, including by panic.
pub(crate) struct Cleanup(pub LayerConfig);

impl Drop for Cleanup {
    fn drop(&mut self) {
        let _ = ChannelLayer::remove(&self.0);
    }
}

/// A 16 KiB region of 128-byte slots under a unique name.
pub(crate) fn region_config(name: &str, lock_timeout: Duration) -> RegionConfig {
    RegionConfig {
        os_id: format!("/{}", unique_prefix(name)),
        size: 16 * 1024,
        slot_size: 128,
        lock_timeout,
    }
}

pub(crate) struct Unlink(pub String);

impl Drop for Unlink {
    fn drop(&mut self) {
        let _ = RegionService::unlink(&self.0);
    }
}
