use kernel_info::machine::NUM_TLB;
use kernel_info::memory::USERSTACK;
use kernel_sync::irq::InterruptControl;
use kernel_vm::addresses::{PAGE_SIZE, VirtualAddress};
use kernel_vm::sim::{SimInterrupts, SimRam, SimTlb};
use kernel_vm::{
    AddressSpace, Curproc, FrameAllocator, Mmu, Tlb, TlbShootdown, VM_FAULT_READ,
    VM_FAULT_READONLY, VM_FAULT_WRITE, VmError,
};

const CODE: VirtualAddress = VirtualAddress::new(0x0040_0000);
const DATA: VirtualAddress = VirtualAddress::new(0x1000_0000);

fn allocator() -> FrameAllocator<SimRam> {
    let ram = SimRam::new(256, 4);
    let (low, high) = ram.probe();
    let frames = unsafe { FrameAllocator::new(ram, low, high) };
    frames.bootstrap().expect("bootstrap");
    frames
}

fn program(frames: &FrameAllocator<SimRam>, data_pages: usize) -> AddressSpace<'_, SimRam> {
    let mut space = AddressSpace::create(frames);
    space.define_region(CODE, 0x1000, true, false, true).unwrap();
    space
        .define_region(DATA, data_pages * PAGE_SIZE as usize, true, true, false)
        .unwrap();
    space.prepare_load().unwrap();
    space
}

fn below_stack(bytes: u32) -> VirtualAddress {
    VirtualAddress::new(USERSTACK.as_u32() - bytes)
}

#[test]
fn stack_window_is_exactly_twelve_pages() {
    let frames = allocator();
    let space = program(&frames, 1);
    let (tlb, cpu) = (SimTlb::new(), SimInterrupts::new());
    let mmu = Mmu::new(&tlb, &cpu);

    assert_eq!(
        mmu.vm_fault(VM_FAULT_READ, below_stack(13 * PAGE_SIZE), Curproc::Running(&space)),
        Err(VmError::HardwareFault)
    );
    assert_eq!(
        mmu.vm_fault(VM_FAULT_WRITE, below_stack(1), Curproc::Running(&space)),
        Ok(())
    );
    assert_eq!(
        mmu.vm_fault(VM_FAULT_WRITE, below_stack(12 * PAGE_SIZE), Curproc::Running(&space)),
        Ok(())
    );

    let top = tlb.lookup(below_stack(1)).expect("stack page installed");
    assert!(top.dirty());
    let expected = space.translate(below_stack(PAGE_SIZE)).unwrap().paddr;
    assert_eq!(top.frame(), expected);
}

#[test]
fn faults_without_a_process_are_rejected() {
    let (tlb, cpu) = (SimTlb::new(), SimInterrupts::new());
    let mmu = Mmu::new(&tlb, &cpu);

    assert_eq!(
        mmu.vm_fault::<SimRam>(VM_FAULT_READ, CODE, Curproc::NoProcess),
        Err(VmError::HardwareFault)
    );
    assert_eq!(
        mmu.vm_fault::<SimRam>(VM_FAULT_READ, CODE, Curproc::NoAddressSpace),
        Err(VmError::HardwareFault)
    );
    assert_eq!(tlb.valid_entries(), 0);
}

#[test]
fn unknown_fault_type_is_invalid_before_anything_else() {
    let (tlb, cpu) = (SimTlb::new(), SimInterrupts::new());
    let mmu = Mmu::new(&tlb, &cpu);
    let err = mmu
        .vm_fault::<SimRam>(7, CODE, Curproc::NoProcess)
        .unwrap_err();
    assert_eq!(err, VmError::InvalidArgument);
    assert_eq!(err.errno(), 8);
}

#[test]
fn address_outside_every_region_is_efault() {
    let frames = allocator();
    let space = program(&frames, 1);
    let (tlb, cpu) = (SimTlb::new(), SimInterrupts::new());
    let mmu = Mmu::new(&tlb, &cpu);

    let err = mmu
        .vm_fault(VM_FAULT_READ, VirtualAddress::new(0x0050_0000), Curproc::Running(&space))
        .unwrap_err();
    assert_eq!(err.errno(), 6);
}

#[test]
fn code_becomes_read_only_after_load() {
    let frames = allocator();
    let mut space = program(&frames, 1);
    let (tlb, cpu) = (SimTlb::new(), SimInterrupts::new());
    let mmu = Mmu::new(&tlb, &cpu);

    mmu.vm_fault(VM_FAULT_WRITE, CODE, Curproc::Running(&space)).unwrap();
    assert!(tlb.lookup(CODE).unwrap().dirty());
    // a stray read-only trap while loading is ignored
    assert_eq!(
        mmu.vm_fault(VM_FAULT_READONLY, CODE, Curproc::Running(&space)),
        Ok(())
    );

    space.complete_load();
    mmu.activate();
    mmu.vm_fault(VM_FAULT_READ, CODE + 0x10, Curproc::Running(&space)).unwrap();
    let entry = tlb.lookup(CODE).unwrap();
    assert!(entry.valid());
    assert!(!entry.dirty());

    mmu.vm_fault(VM_FAULT_READ, DATA, Curproc::Running(&space)).unwrap();
    assert!(tlb.lookup(DATA).unwrap().dirty());

    assert_eq!(
        mmu.vm_fault(VM_FAULT_READONLY, CODE + 4, Curproc::Running(&space)),
        Err(VmError::HardwareFault)
    );
}

#[test]
#[should_panic(expected = "on a writable page")]
fn read_only_fault_on_data_after_load_panics() {
    let frames = allocator();
    let mut space = program(&frames, 1);
    space.complete_load();
    let (tlb, cpu) = (SimTlb::new(), SimInterrupts::new());
    let mmu = Mmu::new(&tlb, &cpu);
    let _ = mmu.vm_fault(VM_FAULT_READONLY, DATA, Curproc::Running(&space));
}

#[test]
#[should_panic(expected = "has no page table")]
fn fault_in_unprepared_region_panics() {
    let frames = allocator();
    let mut space = AddressSpace::create(&frames);
    space.define_region(CODE, 0x1000, true, false, true).unwrap();
    let (tlb, cpu) = (SimTlb::new(), SimInterrupts::new());
    let mmu = Mmu::new(&tlb, &cpu);
    let _ = mmu.vm_fault(VM_FAULT_READ, CODE, Curproc::Running(&space));
}

#[test]
fn full_tlb_falls_back_to_random_replacement() {
    let frames = allocator();
    let pages = NUM_TLB + 8;
    let space = program(&frames, pages);
    let (tlb, cpu) = (SimTlb::with_seed(42), SimInterrupts::new());
    let mmu = Mmu::new(&tlb, &cpu);

    for page in 0..pages {
        let va = DATA + (page as u32) * PAGE_SIZE;
        mmu.vm_fault(VM_FAULT_READ, va, Curproc::Running(&space)).unwrap();
        // the entry just written is always live
        assert!(tlb.lookup(va).is_some());
    }

    assert_eq!(tlb.valid_entries(), NUM_TLB);
    assert_eq!(tlb.random_writes(), 8);
    assert!(cpu.enabled());
    assert_eq!(cpu.mask_count(), pages);
}

#[test]
fn activate_invalidates_every_slot() {
    let frames = allocator();
    let space = program(&frames, 4);
    let (tlb, cpu) = (SimTlb::new(), SimInterrupts::new());
    let mmu = Mmu::new(&tlb, &cpu);

    for page in 0..4 {
        mmu.vm_fault(VM_FAULT_READ, DATA + page * PAGE_SIZE, Curproc::Running(&space))
            .unwrap();
    }
    assert_eq!(tlb.valid_entries(), 4);

    mmu.activate();
    assert_eq!(tlb.valid_entries(), 0);
    for slot in 0..NUM_TLB {
        let (hi, _) = tlb.read(slot);
        assert_eq!(hi.vpn(), 0x8_0000 + slot as u32);
    }
    assert!(cpu.enabled());

    mmu.deactivate();
    assert_eq!(tlb.valid_entries(), 0);
}

#[test]
fn refill_runs_with_interrupts_masked_and_restores_them() {
    let frames = allocator();
    let space = program(&frames, 1);
    let (tlb, cpu) = (SimTlb::new(), SimInterrupts::new());
    let mmu = Mmu::new(&tlb, &cpu);

    // a fault taken with interrupts already off leaves them off
    assert!(cpu.mask());
    mmu.vm_fault(VM_FAULT_READ, DATA, Curproc::Running(&space)).unwrap();
    assert!(!cpu.enabled());

    cpu.unmask();
    mmu.vm_fault(VM_FAULT_READ, CODE, Curproc::Running(&space)).unwrap();
    assert!(cpu.enabled());
    assert_eq!(cpu.mask_count(), 3);
}

#[test]
#[should_panic(expected = "only one core is supported")]
fn shootdown_all_is_fatal() {
    let (tlb, cpu) = (SimTlb::new(), SimInterrupts::new());
    Mmu::new(&tlb, &cpu).tlb_shootdown_all();
}

#[test]
#[should_panic(expected = "only one core is supported")]
fn single_page_shootdown_is_fatal() {
    let (tlb, cpu) = (SimTlb::new(), SimInterrupts::new());
    Mmu::new(&tlb, &cpu).tlb_shootdown(&TlbShootdown { page: CODE });
}
