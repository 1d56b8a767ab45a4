use anyhow::Result;
use shm_region::{BackingKind, Error, SharedRegion, find_free_address};

#[test]
fn create_and_map_yields_zeroed_writable_memory() -> Result<()> {
    for size in [1usize, 4096, 65536, 1 << 20] {
        let mut region = SharedRegion::create(size)?;
        region.map(size)?;
        assert_eq!(region.mapped_len(), Some(size));
        let bytes = region.as_mut_slice().expect("fresh regions map writable");
        assert!(bytes.iter().all(|&b| b == 0));
        bytes[0] = 1;
        bytes[size - 1] = 2;
    }
    Ok(())
}

#[test]
fn zero_size_create_fails_before_any_kernel_object() {
    match SharedRegion::create(0) {
        Err(Error::Allocation(_)) => {}
        other => panic!("expected allocation failure, got {other:?}"),
    }
}

#[test]
fn create_reports_a_backing_kind() -> Result<()> {
    let region = SharedRegion::create(4096)?;
    let kind = region.backing().expect("created regions record a backing");
    if shm_region::have_memfd() {
        assert_eq!(kind, BackingKind::AnonymousFile);
    } else {
        assert!(matches!(
            kind,
            BackingKind::NamedUnlinked | BackingKind::PlatformAnon
        ));
    }
    Ok(())
}

#[test]
fn freeze_scenario_pattern_survives_and_write_access_is_gone() -> Result<()> {
    let mut region = SharedRegion::create_freezeable(4096)?;
    region.map(4096)?;
    region
        .as_mut_slice()
        .expect("writable before freeze")
        .fill(0xAA);
    region.unmap();

    region.freeze()?;
    assert!(region.is_read_only());
    assert!(!region.is_freezeable());

    region.map(4096)?;
    assert!(region.as_slice().unwrap().iter().all(|&b| b == 0xAA));
    // A frozen region must never expose a writable view.
    assert!(region.as_mut_slice().is_none());
    Ok(())
}

#[test]
fn freeze_is_not_idempotent() -> Result<()> {
    let mut region = SharedRegion::create_freezeable(4096)?;
    region.freeze()?;
    assert!(matches!(region.freeze(), Err(Error::NotFreezeable)));
    Ok(())
}

#[test]
fn freeze_requires_freeze_intent() -> Result<()> {
    let mut region = SharedRegion::create(4096)?;
    assert!(matches!(region.freeze(), Err(Error::NotFreezeable)));
    Ok(())
}

#[test]
fn export_round_trips_written_bytes() -> Result<()> {
    let mut region = SharedRegion::create(4096)?;
    region.map(4096)?;
    for (i, b) in region.as_mut_slice().unwrap().iter_mut().enumerate() {
        *b = (i % 251) as u8;
    }

    // The transport's job would be carrying `handle` to another process;
    // adopting it here exercises the same kernel object either way.
    let handle = region.export_for_transfer(false)?;
    assert_eq!(handle.size, 4096);
    assert!(!handle.read_only);

    let mut peer = SharedRegion::from_handle(handle);
    peer.map(4096)?;
    assert_eq!(peer.as_slice().unwrap(), region.as_slice().unwrap());
    Ok(())
}

#[test]
fn frozen_export_maps_read_only_on_the_peer() -> Result<()> {
    let mut region = SharedRegion::create_freezeable(4096)?;
    region.map(4096)?;
    region.as_mut_slice().unwrap().fill(0x42);
    region.unmap();
    region.freeze()?;

    let handle = region.export_for_transfer(true)?;
    assert!(handle.read_only);

    let mut peer = SharedRegion::from_handle(handle);
    peer.map(4096)?;
    assert!(peer.is_read_only());
    assert!(peer.as_mut_slice().is_none());
    assert!(peer.as_slice().unwrap().iter().all(|&b| b == 0x42));
    Ok(())
}

#[test]
fn export_marks_region_unfreezeable() -> Result<()> {
    let mut region = SharedRegion::create_freezeable(4096)?;
    let handle = region.export_for_transfer(false)?;
    drop(handle);
    assert!(!region.is_freezeable());
    assert!(matches!(region.freeze(), Err(Error::NotFreezeable)));
    Ok(())
}

#[test]
fn unmap_then_remap_preserves_contents() -> Result<()> {
    let mut region = SharedRegion::create(8192)?;
    region.map(8192)?;
    region.as_mut_slice().unwrap()[..4].copy_from_slice(b"shmr");
    region.unmap();
    assert!(region.as_slice().is_none());

    region.map(8192)?;
    assert_eq!(&region.as_slice().unwrap()[..4], b"shmr");
    Ok(())
}

#[test]
fn close_local_keeps_the_mapping_usable() -> Result<()> {
    let mut region = SharedRegion::create(4096)?;
    region.map(4096)?;
    region.as_mut_slice().unwrap().fill(0x17);

    let handle = region.export_for_transfer(true)?;
    // The descriptors are gone, but a mapping keeps its pages resident.
    assert!(region.as_slice().unwrap().iter().all(|&b| b == 0x17));
    drop(handle);
    Ok(())
}

#[test]
fn map_at_honors_a_free_address_hint() -> Result<()> {
    let len = 4096;
    let mut region = SharedRegion::create(len)?;
    // Nothing holds the probed range, so a parallel test can race us to
    // it; retry with a fresh probe instead of flaking.
    for _ in 0..16 {
        let addr = find_free_address(len).expect("address probe");
        match region.map_at(len, addr) {
            Ok(()) => {
                assert_eq!(region.mapped_ptr(), Some(addr));
                return Ok(());
            }
            Err(Error::AddressUnavailable) => continue,
            Err(err) => return Err(err.into()),
        }
    }
    panic!("no probed address could be mapped in 16 attempts");
}

#[test]
fn map_at_fails_when_the_address_is_taken() -> Result<()> {
    let len = 4096;
    let mut holder = SharedRegion::create(len)?;
    holder.map(len)?;
    let taken = holder.mapped_ptr().unwrap();

    let mut region = SharedRegion::create(len)?;
    match region.map_at(len, taken) {
        Err(Error::AddressUnavailable) => {}
        other => panic!("expected AddressUnavailable, got {other:?}"),
    }
    // No partial mapping may be retained after the failure.
    assert!(region.as_slice().is_none());
    region.map(len)?;
    Ok(())
}
