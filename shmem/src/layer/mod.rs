//! The channel layer: named channels with capacity-bounded queues plus
//! groups of channels, shared by every process using the same prefix.

use std::fmt;
use std::time::Duration;

use tracing::debug;

use crate::channels::{ChannelStore, Message};
use crate::core::RegionService;
use crate::errors::{IpcError, Result};
use crate::groups::GroupStore;
use crate::names;

mod config;

pub use self::config::{LayerConfig, LayerConfigBuilder};

pub struct ChannelLayer {
    prefix: String,
    messages: ChannelStore,
    groups: GroupStore,
    expiry: Duration,
    group_expiry: Duration,
    receive_timeout: Duration,
}

impl ChannelLayer {
    /// Attaches to (or creates) the message and group regions for
    /// `config.prefix`.
    pub fn new(config: &LayerConfig) -> Result<ChannelLayer> {
        config.validate()?;
        let messages = ChannelStore::new(
            RegionService::open(&config.messages_region())?,
            config.capacity_table()?,
        );
        let groups = GroupStore::new(RegionService::open(&config.groups_region())?);
        debug!(
            prefix = %config.prefix,
            messages = %messages.region(),
            groups = %groups.region(),
            "channel layer ready"
        );
        Ok(ChannelLayer {
            prefix: config.prefix.clone(),
            messages,
            groups,
            expiry: config.expiry(),
            group_expiry: config.group_expiry(),
            receive_timeout: config.receive_timeout(),
        })
    }

    #[inline]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn send(&self, channel: &str, message: &[u8]) -> Result<()> {
        self.send_with_expiry(channel, message, self.expiry)
    }

    pub fn send_with_expiry(&self, channel: &str, message: &[u8], expiry: Duration) -> Result<()> {
        names::validate_channel(channel)?;
        self.messages.send(channel, message, expiry).map(|_| ())
    }

    /// Takes the oldest message queued on any of `channels`. With `block`
    /// set, waits up to the configured receive timeout.
    pub fn receive(&self, channels: &[&str], block: bool) -> Result<Option<Message>> {
        for channel in channels {
            names::validate_channel(channel)?;
        }
        self.messages.receive(channels, block, self.receive_timeout)
    }

    /// Blocking receive bounded by `timeout`.
    pub fn receive_timeout(&self, channels: &[&str], timeout: Duration) -> Result<Option<Message>> {
        for channel in channels {
            names::validate_channel(channel)?;
        }
        self.messages.receive(channels, true, timeout)
    }

    /// Makes a channel name from `pattern` that has no queued messages.
    pub fn new_channel(&self, pattern: &str) -> Result<String> {
        loop {
            let name = names::new_channel_name(pattern)?;
            if self.messages.len(&name)? == 0 {
                return Ok(name);
            }
        }
    }

    pub fn channel_len(&self, channel: &str) -> Result<usize> {
        names::validate_channel(channel)?;
        self.messages.len(channel)
    }

    pub fn capacity_for(&self, channel: &str) -> usize {
        self.messages.capacity_for(channel)
    }

    pub fn group_add(&self, group: &str, channel: &str) -> Result<()> {
        self.group_add_with_expiry(group, channel, self.group_expiry)
    }

    pub fn group_add_with_expiry(&self, group: &str, channel: &str, expiry: Duration) -> Result<()> {
        names::validate_group(group)?;
        names::validate_channel(channel)?;
        self.groups.add(group, channel, expiry)
    }

    /// Removes `channel` from `group`; absent memberships are ignored.
    pub fn group_discard(&self, group: &str, channel: &str) -> Result<()> {
        names::validate_group(group)?;
        names::validate_channel(channel)?;
        self.groups.discard(group, channel).map(|_| ())
    }

    pub fn group_channels(&self, group: &str) -> Result<Vec<String>> {
        names::validate_group(group)?;
        self.groups.members(group)
    }

    pub fn send_group(&self, group: &str, message: &[u8]) -> Result<Vec<String>> {
        self.send_group_with_expiry(group, message, self.expiry)
    }

    /// Sends `message` to every current member of `group`.
    ///
    /// A member refusing the message with `ChannelFull` does not stop
    /// delivery to the others; those channels are returned. Any other error
    /// aborts the fan-out.
    pub fn send_group_with_expiry(
        &self,
        group: &str,
        message: &[u8],
        expiry: Duration,
    ) -> Result<Vec<String>> {
        let members = self.group_channels(group)?;
        let mut refused = Vec::new();
        for channel in members {
            match self.messages.send(&channel, message, expiry) {
                Ok(_) => {}
                Err(IpcError::ChannelFull { channel }) => refused.push(channel),
                Err(e) => return Err(e),
            }
        }
        if !refused.is_empty() {
            debug!(group, refused = refused.len(), "group send partially refused");
        }
        Ok(refused)
    }

    /// Deletes all messages and all group memberships.
    pub fn flush(&self) -> Result<()> {
        let messages = self.messages.flush()?;
        let memberships = self.groups.flush()?;
        debug!(prefix = %self.prefix, messages, memberships, "flushed");
        Ok(())
    }

    /// Removes both regions. Processes still attached keep working on the
    /// old regions; new attachers start empty.
    pub fn destroy(self) {
        self.messages.destroy();
        self.groups.destroy();
    }

    /// Removes the regions of `config` without attaching to them.
    pub fn remove(config: &LayerConfig) -> Result<()> {
        RegionService::unlink(&config.messages_region().os_id)?;
        RegionService::unlink(&config.groups_region().os_id)?;
        Ok(())
    }
}

impl fmt::Display for ChannelLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChannelLayer(prefix={})", self.prefix)
    }
}
