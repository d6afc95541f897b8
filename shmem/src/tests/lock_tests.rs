use std::error::Error;
use std::panic::{self, AssertUnwindSafe};
use std::thread;
use std::time::Duration;

use super::{region_config, Unlink};
use crate::core::RegionService;
use crate::errors::IpcError;

#[test]
fn lock_times_out_while_held() -> Result<(), Box<dyn Error>> {
    let config = region_config("held", Duration::from_millis(50));
    let _unlink = Unlink(config.os_id.clone());
    let region = RegionService::open(&config)?;

    let guard = region.lock()?;
    let contender = {
        let config = config.clone();
        thread::spawn(move || -> Result<(), IpcError> {
            let region = RegionService::open(&config)?;
            region.with_lock(|arena| arena.slot_count()).map(|_| ())
        })
    };
    let result = contender.join().map_err(|_| "contender panicked")?;
    drop(guard);

    match result {
        Err(IpcError::LockTimedOut { region: name, timeout }) => {
            assert_eq!(name, config.os_id);
            assert_eq!(timeout, Duration::from_millis(50));
        }
        other => panic!("expected LockTimedOut, got {:?}", other),
    }
    // Released again once the guard is gone.
    region.with_lock(|_| ())?;
    Ok(())
}

#[test]
fn lock_is_released_when_the_critical_section_panics() -> Result<(), Box<dyn Error>> {
    let config = region_config("panic", Duration::from_millis(200));
    let _unlink = Unlink(config.os_id.clone());
    let region = RegionService::open(&config)?;

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        let _ = region.with_lock(|_| panic!("boom"));
    }));
    assert!(outcome.is_err());
    assert_eq!(region.with_lock(|arena| arena.slot_count())?, config.slot_count());
    Ok(())
}

#[cfg(target_os = "linux")]
#[test]
fn lock_held_by_a_dead_owner_is_recovered() -> Result<(), Box<dyn Error>> {
    let config = region_config("deadowner", Duration::from_secs(2));
    let _unlink = Unlink(config.os_id.clone());
    let region = RegionService::open(&config)?;
    region.with_lock(|arena| arena.allocate(b"key", b"kept", i64::MAX, 0))?
        .map_err(|e| format!("{:?}", e))?;

    let owner = {
        let config = config.clone();
        thread::spawn(move || -> Result<(), IpcError> {
            let region = RegionService::open(&config)?;
            let guard = region.lock()?;
            // Exit the thread while still owning the lock. The mapping is
            // leaked too so the kernel can still reach the mutex.
            std::mem::forget(guard);
            std::mem::forget(region);
            Ok(())
        })
    };
    owner.join().map_err(|_| "owner panicked")??;

    let kept = region.with_lock(|arena| {
        arena.records(0).map(|r| r.payload.to_vec()).collect::<Vec<_>>()
    })?;
    assert_eq!(kept, vec![b"kept".to_vec()]);
    // And the lock is healthy afterwards.
    region.with_lock(|_| ())?;
    Ok(())
}
