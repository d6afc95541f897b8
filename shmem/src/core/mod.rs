use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use shared_memory::{Shmem, ShmemConf, ShmemError};
use tracing::debug;

use crate::errors::{IpcError, Result};

pub mod arena;
pub mod lock;

use self::arena::{SlotArena, ARENA_HEADER_SIZE, SLOT_HEADER_SIZE};
use self::lock::{LockGuard, RegionLock, LOCK_AREA_SIZE};

const REGION_MAGIC: u64 = 0x5348_4d43_484e_4c53; // "SHMCHNLS"
const REGION_VERSION: u32 = 1;
const STATE_READY: u32 = 2;

const HEADER_SIZE: usize = 64;
const LOCK_OFFSET: usize = HEADER_SIZE;
const ARENA_OFFSET: usize = LOCK_OFFSET + LOCK_AREA_SIZE;

/// Bytes of every region spent before the first slot.
pub const REGION_OVERHEAD: usize = ARENA_OFFSET + ARENA_HEADER_SIZE;

#[repr(C)]
struct RegionHeader {
    magic: u64,
    state: AtomicU32,
    version: u32,
}

/// Geometry and naming of one shared region. Every process attaching to
/// `os_id` must use the same `size` and `slot_size`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegionConfig {
    pub os_id: String,
    pub size: usize,
    pub slot_size: usize,
    pub lock_timeout: Duration,
}

impl RegionConfig {
    pub fn slot_count(&self) -> usize {
        SlotArena::slot_count_for(self.size.saturating_sub(ARENA_OFFSET), self.slot_size)
    }

    pub fn record_capacity(&self) -> usize {
        self.slot_size.saturating_sub(SLOT_HEADER_SIZE)
    }

    fn validate(&self) -> Result<()> {
        if self.slot_size <= SLOT_HEADER_SIZE || self.slot_size % 8 != 0 {
            return Err(IpcError::Config(format!(
                "slot size of {} must be a multiple of 8 above {}",
                self.slot_size, SLOT_HEADER_SIZE
            )));
        }
        if self.slot_count() == 0 {
            return Err(IpcError::Config(format!(
                "region {} of {} bytes cannot hold a single {} byte slot",
                self.os_id, self.size, self.slot_size
            )));
        }
        Ok(())
    }
}

/// Milliseconds since the Unix epoch, the clock every attached process
/// shares for expiry.
pub fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

pub fn expires_at(now: i64, expiry: Duration) -> i64 {
    now.saturating_add(expiry.as_millis().min(i64::MAX as u128) as i64)
}

// Mapping an object that exists but has no size yet fails with EINVAL on
// unix; other platforms report it as `MapSizeZero`.
fn not_sized_yet(err: &ShmemError) -> bool {
    match err {
        ShmemError::MapSizeZero => true,
        ShmemError::MapOpenFailed(code) => *code == libc::EINVAL as u32,
        _ => false,
    }
}

/// One attached region: the mapping, the lock living inside it and the
/// arena behind the lock.
pub struct RegionService {
    shmem: Shmem,
    lock: RegionLock,
    config: RegionConfig,
}

impl RegionService {
    /// Attaches to the region named by `config.os_id`, creating and formatting
    /// it when no process has done so yet. Regions outlive the handle.
    pub fn open(config: &RegionConfig) -> Result<RegionService> {
        config.validate()?;
        match ShmemConf::new().os_id(&config.os_id).size(config.size).create() {
            // The fresh mapping stays owned, and is unlinked on drop, until
            // `format` has published it.
            Ok(shmem) => Self::format(shmem, config),
            Err(ShmemError::MappingIdExists) => Self::attach(Self::open_existing(config)?, config),
            Err(e) => Err(e.into()),
        }
    }

    fn open_existing(config: &RegionConfig) -> Result<Shmem> {
        let started = Instant::now();
        loop {
            let result = ShmemConf::new().os_id(&config.os_id).open();
            let within_timeout = started.elapsed() < config.lock_timeout;
            match result {
                // The creator may not have sized the mapping yet.
                Ok(shmem) if shmem.len() == 0 && within_timeout => {}
                Err(ref e) if not_sized_yet(e) && within_timeout => {}
                Ok(shmem) if shmem.len() == 0 => {
                    return Err(IpcError::LayoutMismatch(format!(
                        "{} was never sized",
                        config.os_id
                    )))
                }
                other => return other.map_err(IpcError::from),
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn format(mut shmem: Shmem, config: &RegionConfig) -> Result<RegionService> {
        if shmem.len() < config.size {
            return Err(IpcError::LayoutMismatch(format!(
                "mapped {} bytes for {}, expected {}",
                shmem.len(),
                config.os_id,
                config.size
            )));
        }
        let base = shmem.as_ptr();
        let lock = unsafe {
            let lock = RegionLock::init(base.add(LOCK_OFFSET), &config.os_id)?;
            SlotArena::format(base.add(ARENA_OFFSET), config.size - ARENA_OFFSET, config.slot_size);
            let header = base as *mut RegionHeader;
            (*header).magic = REGION_MAGIC;
            (*header).version = REGION_VERSION;
            (*header).state.store(STATE_READY, Ordering::Release);
            lock
        };
        shmem.set_owner(false);
        debug!(
            region = %config.os_id,
            size = config.size,
            slots = config.slot_count(),
            "created region"
        );
        Ok(RegionService {
            shmem,
            lock,
            config: config.clone(),
        })
    }

    fn attach(shmem: Shmem, config: &RegionConfig) -> Result<RegionService> {
        if shmem.len() < REGION_OVERHEAD {
            return Err(IpcError::LayoutMismatch(format!(
                "{} is only {} bytes",
                config.os_id,
                shmem.len()
            )));
        }
        let base = shmem.as_ptr();
        let header = unsafe { &*(base as *const RegionHeader) };
        let started = Instant::now();
        while header.state.load(Ordering::Acquire) != STATE_READY {
            if started.elapsed() >= config.lock_timeout {
                // Left behind by a creator that died while formatting.
                return Err(IpcError::LayoutMismatch(format!(
                    "{} was never initialized, remove it once no process uses it",
                    config.os_id
                )));
            }
            thread::sleep(Duration::from_millis(1));
        }
        if header.magic != REGION_MAGIC || header.version != REGION_VERSION {
            return Err(IpcError::LayoutMismatch(format!(
                "{} has an unknown header (magic {:#x}, version {})",
                config.os_id, header.magic, header.version
            )));
        }
        let geometry = unsafe { SlotArena::geometry(base.add(ARENA_OFFSET)) };
        if geometry != (config.slot_size, config.slot_count()) {
            return Err(IpcError::LayoutMismatch(format!(
                "{} holds {} slots of {} bytes, configured for {} slots of {} bytes",
                config.os_id,
                geometry.1,
                geometry.0,
                config.slot_count(),
                config.slot_size
            )));
        }
        let lock = unsafe { RegionLock::attach(base.add(LOCK_OFFSET), &config.os_id)? };
        debug!(region = %config.os_id, "attached region");
        Ok(RegionService {
            shmem,
            lock,
            config: config.clone(),
        })
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.config.os_id
    }

    #[inline]
    pub fn config(&self) -> &RegionConfig {
        &self.config
    }

    pub(crate) fn lock(&self) -> Result<LockGuard<'_>> {
        self.lock.acquire(self.config.lock_timeout)
    }

    /// Runs `f` against the arena while holding the region lock. The lock is
    /// released when `f` returns or unwinds.
    pub fn with_lock<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut SlotArena<'_>) -> R,
    {
        let _guard = self.lock()?;
        let mut arena = unsafe { SlotArena::attach(self.shmem.as_ptr().add(ARENA_OFFSET)) };
        Ok(f(&mut arena))
    }

    /// Removes the region's name. Processes still attached keep their
    /// mapping; later attachers create a fresh region.
    pub fn destroy(mut self) {
        debug!(region = %self.config.os_id, "destroying region");
        self.shmem.set_owner(true);
    }

    /// Removes the region named `os_id` if it exists.
    pub fn unlink(os_id: &str) -> Result<bool> {
        match ShmemConf::new().os_id(os_id).open() {
            Ok(mut shmem) => {
                shmem.set_owner(true);
                debug!(region = %os_id, "unlinked region");
                Ok(true)
            }
            Err(ShmemError::MapOpenFailed(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

impl fmt::Display for RegionService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({} slots of {} bytes)",
            self.config.os_id,
            self.config.slot_count(),
            self.config.slot_size
        )
    }
}
