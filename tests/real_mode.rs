use iem::state::gpr;
use iem::{CpuState, FlatBus, Info, Segment, Vcpu};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

#[test]
fn software_interrupt_round_trip_through_the_ivt() -> anyhow::Result<()> {
    init_tracing();

    let mut bus = FlatBus::new(0x10_0000);
    // IVT[0x21] = 0000:0600
    bus.load(0x21 * 4, &[0x00, 0x06, 0x00, 0x00]);
    // mov ax, 0x1234 ; iret
    bus.load(0x600, &[0xb8, 0x34, 0x12, 0xcf]);
    // int 0x21 ; hlt
    bus.load(0x7c00, &[0xcd, 0x21, 0xf4]);

    let mut state = CpuState::new_real();
    state.segments.cs = Segment::real_mode(0);
    state.set_rip(0x7c00);
    state.set_gpr_u64(gpr::RSP, 0x7000);
    let mut cpu = Vcpu::new(state, bus);

    let (res, n) = cpu.execute_many(16);
    assert_eq!(res?, Info::Halt);
    assert_eq!(n, 4);
    assert_eq!(cpu.state.gpr_u64(gpr::RAX) & 0xffff, 0x1234);
    assert_eq!(cpu.state.gpr_u64(gpr::RSP), 0x7000);
    assert_eq!(cpu.state.rip(), 0x7c03);
    assert_eq!(cpu.mappings().active(), 0);
    Ok(())
}

#[test]
fn far_jump_reloads_cs_from_the_selector() -> anyhow::Result<()> {
    init_tracing();

    let mut bus = FlatBus::new(0x10_0000);
    // jmp 0x2000:0x0010
    bus.load(0x7c00, &[0xea, 0x10, 0x00, 0x00, 0x20]);
    bus.load(0x20010, &[0xf4]);

    let mut state = CpuState::new_real();
    state.segments.cs = Segment::real_mode(0);
    state.set_rip(0x7c00);
    let mut cpu = Vcpu::new(state, bus);

    assert_eq!(cpu.execute_one()?, Info::Done);
    assert_eq!(cpu.state.segments.cs.selector, 0x2000);
    assert_eq!(cpu.state.segments.cs.base, 0x20000);
    assert_eq!(cpu.state.rip(), 0x10);
    assert_eq!(cpu.execute_one()?, Info::Halt);
    Ok(())
}
