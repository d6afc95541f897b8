use std::time::Duration;

use tracing::{debug, trace};

use crate::core::arena::AllocError;
use crate::core::{expires_at, unix_millis, RegionService};
use crate::errors::{IpcError, Result};

// Group names never contain a NUL byte, so it splits the key unambiguously.
const SEPARATOR: u8 = 0;

fn member_key(group: &str, channel: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(group.len() + 1 + channel.len());
    key.extend_from_slice(group.as_bytes());
    key.push(SEPARATOR);
    key.extend_from_slice(channel.as_bytes());
    key
}

fn group_prefix(group: &str) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(group.len() + 1);
    prefix.extend_from_slice(group.as_bytes());
    prefix.push(SEPARATOR);
    prefix
}

/// Group memberships with expiry, one zero-payload record per
/// `(group, channel)` pair.
pub struct GroupStore {
    region: RegionService,
}

impl GroupStore {
    pub fn new(region: RegionService) -> GroupStore {
        GroupStore { region }
    }

    #[inline]
    pub fn region(&self) -> &RegionService {
        &self.region
    }

    /// Adds `channel` to `group`, or pushes back the expiry of an existing
    /// membership.
    pub fn add(&self, group: &str, channel: &str, expiry: Duration) -> Result<()> {
        let key = member_key(group, channel);
        let added = self.region.with_lock(|arena| {
            let now = unix_millis();
            let expires_at = expires_at(now, expiry);
            let existing = arena.records(now).find(|r| r.key == &key[..]).map(|r| r.id);
            match existing {
                Some(id) => {
                    arena.refresh(id, expires_at);
                    Ok(())
                }
                None => arena.allocate(&key, &[], expires_at, now).map(|_| ()),
            }
        })?;
        added.map_err(|e| match e {
            AllocError::Full => {
                debug!(group, channel, region = %self.region.name(), "group region exhausted");
                IpcError::GroupStoreFull {
                    group: group.to_string(),
                }
            }
            AllocError::TooLarge { size, max } => IpcError::MessageTooLarge { size, max },
        })?;
        trace!(group, channel, "membership added");
        Ok(())
    }

    /// Removes the membership if present. Returns whether one was removed.
    pub fn discard(&self, group: &str, channel: &str) -> Result<bool> {
        let key = member_key(group, channel);
        self.region.with_lock(|arena| {
            let now = unix_millis();
            let ids: Vec<_> = arena
                .records(now)
                .filter(|r| r.key == &key[..])
                .map(|r| r.id)
                .collect();
            ids.into_iter().fold(false, |removed, id| arena.free(id) || removed)
        })
    }

    /// Live members of `group` in the order they first joined.
    pub fn members(&self, group: &str) -> Result<Vec<String>> {
        let prefix = group_prefix(group);
        self.region.with_lock(|arena| {
            let now = unix_millis();
            arena
                .records(now)
                .filter(|r| r.key.starts_with(&prefix))
                .map(|r| String::from_utf8_lossy(&r.key[prefix.len()..]).into_owned())
                .collect()
        })
    }

    /// Drops every membership of every group.
    pub fn flush(&self) -> Result<usize> {
        self.region.with_lock(|arena| arena.clear())
    }

    pub fn destroy(self) {
        self.region.destroy()
    }
}
