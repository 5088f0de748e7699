use crate::{is_aligned, IntervalError, IntervalSet};
use proptest::prelude::*;
use proptest::test_runner::TestCaseResult;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

const RANGE_BASE: u64 = 0x1000;
const RANGE_SIZE: u64 = 0x1000;
const MAX_OPS: usize = 64;

#[derive(Debug, Clone)]
enum Op {
    Add { start: u64, size: u64, tag: u8 },
    Remove { start: u64, size: u64 },
    Allocate { size: u64, alignment_bits: u8 },
}

fn region_strategy() -> impl Strategy<Value = (u64, u64)> {
    (0..RANGE_SIZE).prop_flat_map(|offset| {
        let remaining = RANGE_SIZE - offset;
        (Just(RANGE_BASE + offset), 1..=remaining.min(0x400))
    })
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (region_strategy(), 0u8..2).prop_map(|((start, size), tag)| Op::Add { start, size, tag }),
        3 => region_strategy().prop_map(|(start, size)| Op::Remove { start, size }),
        2 => (1u64..0x300, 0u8..8).prop_map(|(size, alignment_bits)| Op::Allocate { size, alignment_bits }),
    ]
}

/// Byte-granular reference model: `Some(tag)` for free bytes.
struct Model {
    bytes: Vec<Option<u8>>,
}

impl Model {
    fn slot(&self, addr: u64) -> usize {
        (addr - RANGE_BASE) as usize
    }

    fn range(&self, start: u64, size: u64) -> std::ops::Range<usize> {
        self.slot(start)..self.slot(start) + size as usize
    }
}

fn check_invariants(set: &IntervalSet<u8>, model: &Model) -> TestCaseResult {
    let ivs = set.intervals();
    for pair in ivs.windows(2) {
        prop_assert!(pair[0].end() <= pair[1].start, "overlap: {pair:?}");
        if pair[0].tag == pair[1].tag {
            prop_assert!(pair[0].end() < pair[1].start, "uncoalesced: {pair:?}");
        }
    }

    let mut expected = vec![None; RANGE_SIZE as usize];
    for iv in ivs {
        prop_assert!(iv.start >= set.base() && iv.end() <= set.end());
        for slot in model.range(iv.start, iv.size) {
            expected[slot] = Some(iv.tag);
        }
    }
    prop_assert_eq!(&expected, &model.bytes);
    Ok(())
}

fn run(ops: Vec<Op>, seed: u64) -> TestCaseResult {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut set = IntervalSet::<u8>::empty("prop", RANGE_BASE, RANGE_SIZE).unwrap();
    let mut model = Model {
        bytes: vec![None; RANGE_SIZE as usize],
    };

    for op in ops {
        let before = set.clone();
        match op {
            Op::Add { start, size, tag } => {
                let conflict = model.bytes[model.range(start, size)]
                    .iter()
                    .any(|b| matches!(b, Some(t) if *t != tag));
                match set.add_region(start, size, tag) {
                    Ok(()) => {
                        prop_assert!(!conflict);
                        let range = model.range(start, size);
                        model.bytes[range].fill(Some(tag));
                    }
                    Err(IntervalError::TagConflict { .. }) => {
                        prop_assert!(conflict);
                        prop_assert_eq!(&set, &before);
                    }
                    Err(err) => return Err(TestCaseError::fail(format!("{err}"))),
                }
            }
            Op::Remove { start, size } => {
                let all_free = model.bytes[model.range(start, size)]
                    .iter()
                    .all(Option::is_some);
                match set.remove_region(start, size) {
                    Ok(removed) => {
                        prop_assert!(all_free);
                        prop_assert_eq!(removed.iter().map(|iv| iv.size).sum::<u64>(), size);
                        let range = model.range(start, size);
                        model.bytes[range].fill(None);
                    }
                    Err(IntervalError::NotFree { .. }) => {
                        prop_assert!(!all_free);
                        prop_assert_eq!(&set, &before);
                    }
                    Err(err) => return Err(TestCaseError::fail(format!("{err}"))),
                }
            }
            Op::Allocate {
                size,
                alignment_bits,
            } => match set.allocate(size, alignment_bits, &mut rng) {
                Ok(region) => {
                    prop_assert!(is_aligned(region.start, alignment_bits));
                    prop_assert_eq!(region.size, size);
                    let range = model.range(region.start, size);
                    prop_assert!(model.bytes[range.clone()]
                        .iter()
                        .all(|b| *b == Some(region.tag)));
                    model.bytes[range].fill(None);
                }
                Err(IntervalError::Exhausted { .. }) => {
                    prop_assert_eq!(&set, &before);
                }
                Err(err) => return Err(TestCaseError::fail(format!("{err}"))),
            },
        }
        check_invariants(&set, &model)?;
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        .. ProptestConfig::default()
    })]

    #[test]
    fn interval_set_matches_byte_model(
        ops in prop::collection::vec(op_strategy(), 1..=MAX_OPS),
        seed in any::<u64>(),
    ) {
        run(ops, seed)?;
    }
}
