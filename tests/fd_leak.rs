//! Descriptor accounting. Lives in its own test binary so no sibling
//! test's descriptors can skew the before/after counts.

#![cfg(target_os = "linux")]

use anyhow::Result;
use shm_region::SharedRegion;

fn open_fd_count() -> usize {
    std::fs::read_dir("/proc/self/fd")
        .map(|entries| entries.count())
        .unwrap_or(0)
}

#[test]
fn region_lifecycle_leaks_no_descriptors() -> Result<()> {
    // Warm up the process-wide probes so their one-time work is not
    // attributed to the measured iterations.
    {
        let mut warmup = SharedRegion::create_freezeable(4096)?;
        warmup.map(4096)?;
        warmup.unmap();
        warmup.freeze()?;
        let _ = shm_region::have_future_write_seal();
    }

    let before = open_fd_count();

    // Full lifecycle, dropped with live mappings still in place.
    for _ in 0..32 {
        let mut region = SharedRegion::create_freezeable(4096)?;
        region.map(4096)?;
        region.as_mut_slice().unwrap().fill(0xEE);
        region.unmap();
        region.freeze()?;
        region.map(4096)?;

        let handle = region.export_for_transfer(false)?;
        let mut peer = SharedRegion::from_handle(handle);
        peer.map(4096)?;
    }

    // A freezeable region destroyed without ever being frozen releases
    // both descriptors too (and logs a diagnostic on the way out).
    for _ in 0..32 {
        let mut region = SharedRegion::create_freezeable(4096)?;
        region.map(4096)?;
    }

    assert_eq!(open_fd_count(), before);
    Ok(())
}
