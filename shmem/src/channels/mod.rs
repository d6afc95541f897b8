use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::capacity::CapacityTable;
use crate::core::arena::AllocError;
use crate::core::{expires_at, unix_millis, RegionService};
use crate::errors::{IpcError, Result};

const POLL_INTERVAL_MIN: Duration = Duration::from_millis(1);
const POLL_INTERVAL_MAX: Duration = Duration::from_millis(50);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub channel: String,
    pub payload: Vec<u8>,
    pub sequence: u64,
}

/// Per-channel FIFO queues of opaque payloads kept in one shared region.
pub struct ChannelStore {
    region: RegionService,
    capacities: CapacityTable,
}

impl ChannelStore {
    pub fn new(region: RegionService, capacities: CapacityTable) -> ChannelStore {
        ChannelStore { region, capacities }
    }

    #[inline]
    pub fn region(&self) -> &RegionService {
        &self.region
    }

    #[inline]
    pub fn capacity_for(&self, channel: &str) -> usize {
        self.capacities.capacity_for(channel)
    }

    /// Queues `payload` on `channel` and returns its sequence number.
    ///
    /// Fails with `ChannelFull` when the channel already holds its admitted
    /// number of live messages or when the region has no slot left.
    pub fn send(&self, channel: &str, payload: &[u8], expiry: Duration) -> Result<u64> {
        let key = channel.as_bytes();
        let max = self.region.config().record_capacity();
        if key.len() + payload.len() > max {
            return Err(IpcError::MessageTooLarge {
                size: key.len() + payload.len(),
                max,
            });
        }
        let capacity = self.capacity_for(channel);

        let sent = self.region.with_lock(|arena| {
            // Read the clock only once the lock is held; waiting for it may
            // take long enough for records to expire.
            let now = unix_millis();
            let expires_at = expires_at(now, expiry);
            let queued = arena.records(now).filter(|r| r.key == key).count();
            if queued >= capacity {
                debug!(channel, queued, capacity, "channel at capacity");
                return Err(IpcError::ChannelFull {
                    channel: channel.to_string(),
                });
            }
            arena.allocate(key, payload, expires_at, now).map_err(|e| match e {
                AllocError::Full => {
                    debug!(channel, region = %self.region.name(), "message region exhausted");
                    IpcError::ChannelFull {
                        channel: channel.to_string(),
                    }
                }
                AllocError::TooLarge { size, max } => IpcError::MessageTooLarge { size, max },
            })
        })?;
        let id = sent?;
        trace!(channel, sequence = id.sequence, "message queued");
        Ok(id.sequence)
    }

    /// Takes the oldest live message queued on any of `channels`.
    ///
    /// With `block` set, polls until a message arrives or `timeout` elapses;
    /// the region lock is never held between polls. Running out of time is
    /// not an error and yields `None`.
    pub fn receive(&self, channels: &[&str], block: bool, timeout: Duration) -> Result<Option<Message>> {
        if channels.is_empty() {
            return Ok(None);
        }
        if let Some(message) = self.try_receive(channels)? {
            return Ok(Some(message));
        }
        if !block {
            return Ok(None);
        }
        let deadline = Instant::now() + timeout;
        let mut interval = POLL_INTERVAL_MIN;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            thread::sleep(interval.min(deadline - now));
            if let Some(message) = self.try_receive(channels)? {
                return Ok(Some(message));
            }
            interval = (interval * 2).min(POLL_INTERVAL_MAX);
        }
    }

    fn try_receive(&self, channels: &[&str]) -> Result<Option<Message>> {
        let message = self.region.with_lock(|arena| {
            let now = unix_millis();
            let found = arena
                .records(now)
                .find(|r| channels.iter().any(|c| c.as_bytes() == r.key))
                .map(|r| {
                    (
                        r.id,
                        Message {
                            channel: String::from_utf8_lossy(r.key).into_owned(),
                            payload: r.payload.to_vec(),
                            sequence: r.id.sequence,
                        },
                    )
                });
            found.map(|(id, message)| {
                arena.free(id);
                message
            })
        })?;
        if let Some(m) = &message {
            trace!(channel = %m.channel, sequence = m.sequence, "message received");
        }
        Ok(message)
    }

    /// Number of live messages queued on `channel`.
    pub fn len(&self, channel: &str) -> Result<usize> {
        let key = channel.as_bytes();
        self.region.with_lock(|arena| {
            let now = unix_millis();
            arena.records(now).filter(|r| r.key == key).count()
        })
    }

    /// Drops every queued message on every channel.
    pub fn flush(&self) -> Result<usize> {
        self.region.with_lock(|arena| arena.clear())
    }

    pub fn destroy(self) {
        self.region.destroy()
    }
}
