//! Process-shared mutex stored inside the region it guards.
//!
//! On Linux the mutex is a robust pthread mutex: when a holder dies the next
//! acquirer is told so (`EOWNERDEAD`), marks the mutex consistent and carries
//! on. A record being written by the dead holder is left to expire.
//!
//! Other platforms fall back to `raw_sync`'s process-shared mutex, which has
//! no owner-death detection. There a process killed while holding the lock
//! wedges the region until every attached process is stopped and the region
//! is removed; acquirers then fail with `IpcError::LockTimedOut`.

use std::time::Duration;

use tracing::warn;

use crate::errors::{IpcError, Result};

/// Bytes reserved in the region for the mutex.
pub const LOCK_AREA_SIZE: usize = 128;

enum RawLockError {
    TimedOut,
    Unrecoverable,
    Os(Box<dyn std::error::Error + Send + Sync + 'static>),
}

enum Acquired {
    Clean,
    OwnerDied,
}

pub struct RegionLock {
    raw: imp::RawLock,
    region: String,
}

/// Held lock; released on drop.
pub struct LockGuard<'a> {
    _raw: imp::RawGuard<'a>,
}

impl RegionLock {
    /// Initializes a new mutex in `area`.
    ///
    /// # Safety
    /// `area` must be valid for `LOCK_AREA_SIZE` bytes, suitably aligned, and
    /// not yet in use by any other process.
    pub unsafe fn init(area: *mut u8, region: &str) -> Result<RegionLock> {
        let raw = imp::RawLock::init(area).map_err(|e| Self::map_error(region, e, Duration::ZERO))?;
        Ok(RegionLock {
            raw,
            region: region.to_string(),
        })
    }

    /// Binds to a mutex another process initialized.
    ///
    /// # Safety
    /// `area` must hold a mutex written by `init` and stay mapped for the
    /// lifetime of the returned lock.
    pub unsafe fn attach(area: *mut u8, region: &str) -> Result<RegionLock> {
        let raw = imp::RawLock::attach(area).map_err(|e| Self::map_error(region, e, Duration::ZERO))?;
        Ok(RegionLock {
            raw,
            region: region.to_string(),
        })
    }

    pub fn acquire(&self, timeout: Duration) -> Result<LockGuard<'_>> {
        match self.raw.lock(timeout) {
            Ok((guard, Acquired::Clean)) => Ok(LockGuard { _raw: guard }),
            Ok((guard, Acquired::OwnerDied)) => {
                warn!(region = %self.region, "previous lock holder died, lock recovered");
                Ok(LockGuard { _raw: guard })
            }
            Err(e) => Err(Self::map_error(&self.region, e, timeout)),
        }
    }

    fn map_error(region: &str, err: RawLockError, timeout: Duration) -> IpcError {
        match err {
            RawLockError::TimedOut => IpcError::LockTimedOut {
                region: region.to_string(),
                timeout,
            },
            RawLockError::Unrecoverable => IpcError::LockUnrecoverable {
                region: region.to_string(),
            },
            RawLockError::Os(e) => IpcError::Lock(e),
        }
    }
}

#[cfg(target_os = "linux")]
mod imp {
    use std::io;
    use std::mem::{self, MaybeUninit};
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    use super::{Acquired, RawLockError, LOCK_AREA_SIZE};

    const _: () = assert!(mem::size_of::<libc::pthread_mutex_t>() <= LOCK_AREA_SIZE);

    pub struct RawLock {
        mutex: *mut libc::pthread_mutex_t,
    }

    pub struct RawGuard<'a> {
        lock: &'a RawLock,
    }

    impl Drop for RawGuard<'_> {
        fn drop(&mut self) {
            unsafe {
                libc::pthread_mutex_unlock(self.lock.mutex);
            }
        }
    }

    #[inline]
    fn check(rc: libc::c_int) -> Result<(), RawLockError> {
        if rc == 0 {
            Ok(())
        } else {
            Err(RawLockError::Os(Box::new(io::Error::from_raw_os_error(rc))))
        }
    }

    // pthread_mutex_timedlock measures against CLOCK_REALTIME.
    fn deadline(timeout: Duration) -> libc::timespec {
        let at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            + timeout;
        let mut ts: libc::timespec = unsafe { mem::zeroed() };
        ts.tv_sec = at.as_secs() as libc::time_t;
        ts.tv_nsec = at.subsec_nanos() as _;
        ts
    }

    impl RawLock {
        pub unsafe fn init(area: *mut u8) -> Result<RawLock, RawLockError> {
            let mutex = area as *mut libc::pthread_mutex_t;
            let mut attr = MaybeUninit::<libc::pthread_mutexattr_t>::uninit();
            check(libc::pthread_mutexattr_init(attr.as_mut_ptr()))?;
            let attr = attr.as_mut_ptr();
            let result = check(libc::pthread_mutexattr_setpshared(attr, libc::PTHREAD_PROCESS_SHARED))
                .and_then(|_| check(libc::pthread_mutexattr_setrobust(attr, libc::PTHREAD_MUTEX_ROBUST)))
                .and_then(|_| check(libc::pthread_mutex_init(mutex, attr)));
            libc::pthread_mutexattr_destroy(attr);
            result.map(|_| RawLock { mutex })
        }

        pub unsafe fn attach(area: *mut u8) -> Result<RawLock, RawLockError> {
            Ok(RawLock {
                mutex: area as *mut libc::pthread_mutex_t,
            })
        }

        pub fn lock(&self, timeout: Duration) -> Result<(RawGuard<'_>, Acquired), RawLockError> {
            let at = deadline(timeout);
            let rc = unsafe { libc::pthread_mutex_timedlock(self.mutex, &at) };
            match rc {
                0 => Ok((RawGuard { lock: self }, Acquired::Clean)),
                libc::EOWNERDEAD => {
                    // We own the mutex now; the guard unlocks it on every path.
                    let guard = RawGuard { lock: self };
                    check(unsafe { libc::pthread_mutex_consistent(self.mutex) })?;
                    Ok((guard, Acquired::OwnerDied))
                }
                libc::ETIMEDOUT => Err(RawLockError::TimedOut),
                libc::ENOTRECOVERABLE => Err(RawLockError::Unrecoverable),
                rc => Err(RawLockError::Os(Box::new(io::Error::from_raw_os_error(rc)))),
            }
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod imp {
    use std::time::Duration;

    use raw_sync::locks::{LockGuard, LockImpl, LockInit, Mutex};
    use raw_sync::Timeout;

    use super::{Acquired, RawLockError, LOCK_AREA_SIZE};

    pub struct RawLock {
        mutex: Box<dyn LockImpl>,
    }

    pub struct RawGuard<'a> {
        _guard: LockGuard<'a>,
    }

    fn other(e: Box<dyn std::error::Error>) -> RawLockError {
        RawLockError::Os(e.to_string().into())
    }

    impl RawLock {
        pub unsafe fn init(area: *mut u8) -> Result<RawLock, RawLockError> {
            if Mutex::size_of(Some(area)) > LOCK_AREA_SIZE {
                return Err(RawLockError::Os("mutex does not fit the lock area".into()));
            }
            // The guarded data pointer is unused; region access goes through the arena.
            let (mutex, _) = Mutex::new(area, area.add(LOCK_AREA_SIZE)).map_err(other)?;
            Ok(RawLock { mutex })
        }

        pub unsafe fn attach(area: *mut u8) -> Result<RawLock, RawLockError> {
            let (mutex, _) = Mutex::from_existing(area, area.add(LOCK_AREA_SIZE)).map_err(other)?;
            Ok(RawLock { mutex })
        }

        pub fn lock(&self, timeout: Duration) -> Result<(RawGuard<'_>, Acquired), RawLockError> {
            // raw_sync reports every failure of a timed lock the same way.
            match self.mutex.try_lock(Timeout::Val(timeout)) {
                Ok(guard) => Ok((RawGuard { _guard: guard }, Acquired::Clean)),
                Err(_) => Err(RawLockError::TimedOut),
            }
        }
    }
}
