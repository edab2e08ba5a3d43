//! Property-style checks: after any interleaving of SH_REQ/EX_REQ traffic
//! from a handful of tiles against a single line, the directory's own
//! bookkeeping must never let two tiles simultaneously believe they hold an
//! exclusive/modified copy.

use std::collections::HashSet;
use std::sync::Arc;

use proptest::prelude::*;

use tilesim::prelude::*;

#[derive(Debug, Clone, Copy)]
enum Op {
    Read(TileId),
    Write(TileId),
}

fn op_strategy(tile_count: u32) -> impl Strategy<Value = Op> {
    (0..tile_count).prop_flat_map(|t| prop_oneof![Just(Op::Read(t)), Just(Op::Write(t))])
}

proptest! {
    #[test]
    fn directory_never_grants_two_writers(ops in prop::collection::vec(op_strategy(3), 1..40)) {
        let mut config = SimConfig::default_two_tile();
        config.total_cores = 3;
        config.boundaries = vec![
            Boundary { base: 0, limit: 0x40000 },
            Boundary { base: 0x40000, limit: 0x80000 },
            Boundary { base: 0x80000, limit: 0xC0000 },
        ];
        let chip = Arc::new(Chip::new(config).unwrap());
        let address = 0u64;

        for op in ops {
            match op {
                Op::Read(t) => {
                    let _ = chip.tile(t).load(address, 8);
                }
                Op::Write(t) => {
                    chip.tile(t).store(address, &[1u8; 8]);
                }
            }
            // Give service threads a moment to finish any forwarded
            // invalidations before checking the invariant.
            std::thread::sleep(std::time::Duration::from_millis(5));
            prop_assert!(chip.check_single_writer_invariant(address).is_ok());

            let home = chip.home_of(address).unwrap();
            let dstate = chip.tile(home).directory.peek_state(address);
            let writers: Vec<_> = chip
                .tiles()
                .iter()
                .filter(|t| matches!(t.cache.peek_state(address), CState::Modified | CState::Exclusive))
                .map(|t| t.id)
                .collect::<HashSet<_>>()
                .into_iter()
                .collect();
            if matches!(dstate, DState::Exclusive | DState::Modified) {
                prop_assert!(writers.len() <= 1);
            }
        }
    }
}
