use kernel_vm::addresses::{PAGE_SIZE, VirtualAddress};
use kernel_vm::sim::SimRam;
use kernel_vm::{AddressSpace, FrameAllocator, RegionKind, VmError};

const CODE: VirtualAddress = VirtualAddress::new(0x0040_0000);
const DATA: VirtualAddress = VirtualAddress::new(0x1000_0000);

fn allocator(total: usize) -> FrameAllocator<SimRam> {
    let ram = SimRam::new(total, 4);
    let (low, high) = ram.probe();
    let frames = unsafe { FrameAllocator::new(ram, low, high) };
    frames.bootstrap().expect("bootstrap");
    frames
}

fn loaded_program(frames: &FrameAllocator<SimRam>) -> AddressSpace<'_, SimRam> {
    let mut space = AddressSpace::create(frames);
    space.define_region(CODE, 0x2000, true, false, true).unwrap();
    space.define_region(DATA, 0x0800, true, true, false).unwrap();
    space.prepare_load().unwrap();
    space.copy_out(CODE, b"\x27\xbd\xff\xe8text").unwrap();
    space.copy_out(DATA, b"data segment").unwrap();
    space.complete_load();
    space
}

#[test]
fn third_region_is_rejected_and_existing_ones_kept() {
    let frames = allocator(64);
    let mut space = AddressSpace::create(&frames);
    space.define_region(CODE, 0x1000, true, false, true).unwrap();
    space.define_region(DATA, 0x3001, true, true, false).unwrap();

    assert_eq!(
        space.define_region(VirtualAddress::new(0x2000_0000), 0x1000, true, true, false),
        Err(VmError::NotImplemented)
    );

    let code = space.region(0).unwrap();
    let data = space.region(1).unwrap();
    assert_eq!((code.kind(), code.base(), code.pages()), (RegionKind::Code, CODE, 1));
    assert_eq!((data.kind(), data.base(), data.pages()), (RegionKind::Data, DATA, 4));
    assert!(space.region(2).is_none());
}

#[test]
fn third_region_after_prepare_is_still_not_implemented() {
    let frames = allocator(64);
    let mut space = AddressSpace::create(&frames);
    space.define_region(CODE, 0x1000, true, false, true).unwrap();
    space.define_region(DATA, 0x1000, true, true, false).unwrap();
    space.prepare_load().unwrap();
    let used = frames.used_frames();

    assert_eq!(
        space.define_region(VirtualAddress::new(0x2000_0000), 0x1000, true, true, false),
        Err(VmError::NotImplemented)
    );
    assert_eq!(space.region(0).map(|r| r.base()), Some(CODE));
    assert_eq!(space.region(1).map(|r| r.base()), Some(DATA));
    assert_eq!(frames.used_frames(), used);
}

#[test]
fn second_region_after_prepare_is_invalid() {
    let frames = allocator(64);
    let mut space = AddressSpace::create(&frames);
    space.define_region(CODE, 0x1000, true, false, true).unwrap();
    space.prepare_load().unwrap();

    assert_eq!(
        space.define_region(DATA, 0x1000, true, true, false),
        Err(VmError::InvalidArgument)
    );
    assert!(space.region(1).is_none());
}

#[test]
fn prepare_then_destroy_returns_every_frame() {
    let frames = allocator(64);
    let free = frames.free_frames();

    let space = loaded_program(&frames);
    assert_eq!(frames.free_frames(), free - (2 + 1 + 12));
    space.destroy();
    assert_eq!(frames.free_frames(), free);

    // the whole pool is still one contiguous run
    let all = frames.alloc_pages(free).unwrap();
    frames.free_pages(all);
}

#[test]
fn destroying_an_unprepared_space_is_harmless() {
    let frames = allocator(32);
    let mut space = AddressSpace::create(&frames);
    space.define_region(CODE, 0x1000, true, false, true).unwrap();
    space.destroy();
    assert_eq!(frames.used_frames(), 0);
}

#[test]
fn failed_prepare_load_rolls_back_completely() {
    // enough for the code region, not for code + data + stack
    let frames = allocator(4 + 1 + 20);
    let free = frames.free_frames();
    assert_eq!(free, 20);

    let mut space = AddressSpace::create(&frames);
    space.define_region(CODE, 6 * PAGE_SIZE as usize, true, false, true).unwrap();
    space.define_region(DATA, 4 * PAGE_SIZE as usize, true, true, false).unwrap();

    assert_eq!(space.prepare_load(), Err(VmError::OutOfMemory));
    assert_eq!(frames.free_frames(), free);
    assert!(!space.is_prepared());
    assert!(!space.region(0).unwrap().is_backed());
    assert_eq!(space.define_stack(), Err(VmError::InvalidArgument));
}

#[test]
fn copy_is_identical_but_independent() {
    let frames = allocator(96);
    let mut old = loaded_program(&frames);
    let sp = old.define_stack().unwrap();
    old.copy_out(VirtualAddress::new(sp.as_u32() - 8), b"stackvar").unwrap();

    let mut new = old.copy().unwrap();
    assert!(new.is_loaded());

    for (va, len) in [(CODE, 8), (DATA, 12), (VirtualAddress::new(sp.as_u32() - 8), 8)] {
        let (mut a, mut b) = (vec![0; len], vec![0; len]);
        old.copy_in(va, &mut a).unwrap();
        new.copy_in(va, &mut b).unwrap();
        assert_eq!(a, b, "contents differ at {va}");

        let (from, to) = (old.translate(va).unwrap(), new.translate(va).unwrap());
        assert_ne!(from.frame, to.frame, "frame shared at {va}");
    }

    new.copy_out(DATA, b"DATA").unwrap();
    let mut check = [0; 4];
    old.copy_in(DATA, &mut check).unwrap();
    assert_eq!(&check, b"data");
}

#[test]
fn copy_that_runs_out_of_memory_leaks_nothing() {
    let frames = allocator(4 + 1 + 25);
    let old = loaded_program(&frames);
    let free = frames.free_frames();
    assert!(free < 15);

    assert!(matches!(old.copy(), Err(VmError::OutOfMemory)));
    assert_eq!(frames.free_frames(), free);
}

#[test]
fn copy_of_unprepared_space_stays_unprepared() {
    let frames = allocator(32);
    let mut old = AddressSpace::create(&frames);
    old.define_region(CODE, 0x1000, true, false, true).unwrap();

    let new = old.copy().unwrap();
    assert!(!new.is_prepared());
    assert_eq!(new.region(0).map(|r| r.base()), Some(CODE));
    assert_eq!(frames.used_frames(), 0);
}

#[test]
fn fresh_pages_read_as_zero() {
    let frames = allocator(64);
    let mut space = AddressSpace::create(&frames);
    space.define_region(DATA, 0x1000, true, true, false).unwrap();
    space.prepare_load().unwrap();

    let mut buf = [0xFF; 64];
    space.copy_in(DATA + 100, &mut buf).unwrap();
    assert!(buf.iter().all(|&b| b == 0));
}
