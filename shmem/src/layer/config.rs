use std::path::Path;
use std::time::Duration;

use serde_derive::{Deserialize, Serialize};

use crate::capacity::{CapacityRule, CapacityTable};
use crate::core::arena::SLOT_HEADER_SIZE;
use crate::core::{RegionConfig, REGION_OVERHEAD};
use crate::errors::{IpcError, Result};
use crate::names::MAX_NAME_LENGTH;

const MB: usize = 1024 * 1024;

// A group record key is `group NUL channel`.
const MIN_GROUP_SLOT_SIZE: usize = SLOT_HEADER_SIZE + 2 * MAX_NAME_LENGTH + 1;
const MIN_MESSAGE_SLOT_SIZE: usize = SLOT_HEADER_SIZE + MAX_NAME_LENGTH;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayerConfig {
    /// Names both regions: `<prefix>-messages` and `<prefix>-groups`.
    pub prefix: String,
    pub channel_memory: usize,
    pub group_memory: usize,
    pub message_slot_size: usize,
    pub group_slot_size: usize,
    /// Default message time-to-live in seconds.
    pub expiry: u64,
    /// Default membership time-to-live in seconds.
    pub group_expiry: u64,
    /// Default per-channel capacity.
    pub capacity: usize,
    pub channel_capacity: Vec<CapacityRule>,
    pub lock_timeout_ms: u64,
    pub receive_timeout_ms: u64,
}

impl Default for LayerConfig {
    fn default() -> Self {
        LayerConfig {
            prefix: "asgi".to_string(),
            channel_memory: 100 * MB,
            group_memory: 20 * MB,
            message_slot_size: 8192,
            group_slot_size: 256,
            expiry: 60,
            group_expiry: 86400,
            capacity: 10,
            channel_capacity: Vec::new(),
            lock_timeout_ms: 10_000,
            receive_timeout_ms: 5_000,
        }
    }
}

fn region_id(prefix: &str, suffix: &str) -> String {
    if cfg!(unix) {
        format!("/{}-{}", prefix, suffix)
    } else {
        format!("{}-{}", prefix, suffix)
    }
}

impl LayerConfig {
    pub fn builder() -> LayerConfigBuilder {
        LayerConfigBuilder {
            config: LayerConfig::default(),
        }
    }

    /// Loads a TOML config file; a missing file is written out with defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<LayerConfig> {
        let config: LayerConfig = confy::load_path(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.prefix.is_empty() || self.prefix.contains('/') || self.prefix.contains('\0') {
            return Err(IpcError::Config(format!("invalid prefix {:?}", self.prefix)));
        }
        for (what, slot_size, min) in [
            ("message_slot_size", self.message_slot_size, MIN_MESSAGE_SLOT_SIZE),
            ("group_slot_size", self.group_slot_size, MIN_GROUP_SLOT_SIZE),
        ] {
            if slot_size < min || slot_size % 8 != 0 {
                return Err(IpcError::Config(format!(
                    "{} of {} must be a multiple of 8 and at least {}",
                    what, slot_size, min
                )));
            }
        }
        for (what, memory, slot_size) in [
            ("channel_memory", self.channel_memory, self.message_slot_size),
            ("group_memory", self.group_memory, self.group_slot_size),
        ] {
            if memory < REGION_OVERHEAD + slot_size {
                return Err(IpcError::Config(format!(
                    "{} of {} bytes cannot hold a single {} byte slot",
                    what, memory, slot_size
                )));
            }
        }
        self.capacity_table()?;
        Ok(())
    }

    pub fn capacity_table(&self) -> Result<CapacityTable> {
        CapacityTable::new(self.capacity, &self.channel_capacity)
    }

    pub fn messages_region(&self) -> RegionConfig {
        RegionConfig {
            os_id: region_id(&self.prefix, "messages"),
            size: self.channel_memory,
            slot_size: self.message_slot_size,
            lock_timeout: self.lock_timeout(),
        }
    }

    pub fn groups_region(&self) -> RegionConfig {
        RegionConfig {
            os_id: region_id(&self.prefix, "groups"),
            size: self.group_memory,
            slot_size: self.group_slot_size,
            lock_timeout: self.lock_timeout(),
        }
    }

    #[inline]
    pub fn expiry(&self) -> Duration {
        Duration::from_secs(self.expiry)
    }

    #[inline]
    pub fn group_expiry(&self) -> Duration {
        Duration::from_secs(self.group_expiry)
    }

    #[inline]
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    #[inline]
    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }
}

pub struct LayerConfigBuilder {
    config: LayerConfig,
}

impl LayerConfigBuilder {
    pub fn prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.config.prefix = prefix.into();
        self
    }

    pub fn channel_memory(mut self, bytes: usize) -> Self {
        self.config.channel_memory = bytes;
        self
    }

    pub fn group_memory(mut self, bytes: usize) -> Self {
        self.config.group_memory = bytes;
        self
    }

    pub fn message_slot_size(mut self, bytes: usize) -> Self {
        self.config.message_slot_size = bytes;
        self
    }

    pub fn group_slot_size(mut self, bytes: usize) -> Self {
        self.config.group_slot_size = bytes;
        self
    }

    pub fn expiry(mut self, seconds: u64) -> Self {
        self.config.expiry = seconds;
        self
    }

    pub fn group_expiry(mut self, seconds: u64) -> Self {
        self.config.group_expiry = seconds;
        self
    }

    pub fn capacity(mut self, capacity: usize) -> Self {
        self.config.capacity = capacity;
        self
    }

    /// Appends an override; earlier rules take precedence.
    pub fn channel_capacity(mut self, rule: CapacityRule) -> Self {
        self.config.channel_capacity.push(rule);
        self
    }

    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.config.lock_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn receive_timeout(mut self, timeout: Duration) -> Self {
        self.config.receive_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn build(self) -> Result<LayerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;
    use std::fs;

    use crate::capacity::PatternKind;

    #[test]
    fn defaults_are_valid() -> Result<()> {
        let config = LayerConfig::builder().build()?;
        assert_eq!(config, LayerConfig::default());
        assert_eq!(config.expiry(), Duration::from_secs(60));
        assert!(config.messages_region().os_id.ends_with("asgi-messages"));
        assert!(config.groups_region().os_id.ends_with("asgi-groups"));
        Ok(())
    }

    #[test]
    fn rejects_bad_values() {
        assert!(LayerConfig::builder().prefix("").build().is_err());
        assert!(LayerConfig::builder().prefix("a/b").build().is_err());
        assert!(LayerConfig::builder().message_slot_size(100).build().is_err());
        assert!(LayerConfig::builder().message_slot_size(1001).build().is_err());
        assert!(LayerConfig::builder().group_slot_size(128).build().is_err());
        assert!(LayerConfig::builder().channel_memory(1024).build().is_err());
        assert!(LayerConfig::builder()
            .channel_capacity(CapacityRule::regex("(", 1))
            .build()
            .is_err());
    }

    #[test]
    fn load_from_toml() -> std::result::Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("layer.toml");
        fs::write(
            &path,
            r#"
prefix = "web"
capacity = 100
expiry = 30

[[channel_capacity]]
pattern = "http.request"
capacity = 200

[[channel_capacity]]
pattern = "^websocket\\."
kind = "regex"
capacity = 20
"#,
        )?;
        let config = LayerConfig::load(&path)?;
        assert_eq!(config.prefix, "web");
        assert_eq!(config.capacity, 100);
        assert_eq!(config.expiry, 30);
        assert_eq!(config.group_expiry, 86400);
        assert_eq!(config.channel_capacity.len(), 2);
        assert_eq!(config.channel_capacity[0].kind, PatternKind::Glob);
        assert_eq!(config.channel_capacity[1].kind, PatternKind::Regex);

        let table = config.capacity_table()?;
        assert_eq!(table.capacity_for("http.request"), 200);
        assert_eq!(table.capacity_for("websocket.send"), 20);
        assert_eq!(table.capacity_for("other"), 100);
        Ok(())
    }
}
