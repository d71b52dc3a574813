use std::collections::HashMap;

use iem_mmu::{TlbFlags, TlbSet};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Load { vpn: u64, global: bool, large: bool },
    InvalidateAll { global: bool },
    InvalidatePage { vpn: u64 },
    Lookup { vpn: u64 },
}

// A small page-number space so lookups collide with loads and with each other's
// direct-mapped slots.
fn vpn_strategy() -> impl Strategy<Value = u64> {
    prop_oneof![0u64..64, (0u64..4).prop_map(|n| n * 256 + 7), Just(0x200), Just(0x3ff)]
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (vpn_strategy(), any::<bool>(), prop::bool::weighted(0.2))
            .prop_map(|(vpn, global, large)| Op::Load { vpn, global, large }),
        1 => any::<bool>().prop_map(|global| Op::InvalidateAll { global }),
        2 => vpn_strategy().prop_map(|vpn| Op::InvalidatePage { vpn }),
        4 => vpn_strategy().prop_map(|vpn| Op::Lookup { vpn }),
    ]
}

const LARGE_MASK: u64 = 0x1ff;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn lookup_never_hits_an_invalidated_tag(
        start_rev in prop_oneof![Just(1u32), Just(u32::MAX - 2), any::<u32>()],
        ops in prop::collection::vec(op_strategy(), 1..200),
    ) {
        let mut tlb = TlbSet::new();
        let start_rev = start_rev.max(1);
        tlb.set_revisions_for_test(start_rev, start_rev, 1);

        // (vpn, global) -> large mask of translations loaded and not yet invalidated.
        let mut live: HashMap<(u64, bool), u64> = HashMap::new();

        for op in ops {
            match op {
                Op::Load { vpn, global, large } => {
                    let mask = if large { LARGE_MASK } else { 0 };
                    tlb.insert(vpn << 12, global, TlbFlags::empty(), vpn << 12, mask);
                    live.insert((vpn, global), mask);
                }
                Op::InvalidateAll { global } => {
                    tlb.invalidate_all(global);
                    live.retain(|(_, g), _| *g && !global);
                }
                Op::InvalidatePage { vpn } => {
                    tlb.invalidate_page(vpn << 12);
                    live.retain(|(tag, _), mask| {
                        *tag != vpn && (*mask == 0 || (*tag & !*mask) != (vpn & !*mask))
                    });
                }
                Op::Lookup { vpn } => {
                    if let Some(e) = tlb.lookup(vpn << 12) {
                        prop_assert_eq!(e.tag, vpn);
                        prop_assert!(
                            live.contains_key(&(vpn, false)) || live.contains_key(&(vpn, true)),
                            "stale hit for vpn {:#x}",
                            vpn
                        );
                    }
                }
            }
        }
    }
}
