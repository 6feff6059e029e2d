// Finality - Windowed distinct-producer rule shared by PoA and DPoS
use crate::types::{Address, Block, Hash};
use std::collections::HashSet;

/// Walks back from the tail toward the current LIB and returns the new LIB
///
/// Blocks are consumed in windows of `window` blocks. Within a window the
/// distinct coinbases are counted; the block at which the count first reaches
/// `threshold` (the oldest one visited so far) becomes the new LIB. `accept`
/// vetoes the whole walk when a block is not comparable with the tail.
pub fn find_new_lib<'a, I, F>(
    ancestors: I,
    lib: &Block,
    window: usize,
    threshold: usize,
    mut accept: F,
) -> Option<Hash>
where
    I: IntoIterator<Item = &'a Block>,
    F: FnMut(&Block) -> bool,
{
    if window == 0 || threshold == 0 {
        return None;
    }

    let mut producers: HashSet<Address> = HashSet::new();
    let mut in_window = 0usize;

    for block in ancestors {
        if block.height() <= lib.height() {
            break;
        }
        if !accept(block) {
            return None;
        }

        producers.insert(block.coinbase());
        in_window += 1;

        if producers.len() >= threshold {
            return Some(block.hash());
        }
        if in_window == window {
            producers.clear();
            in_window = 0;
        }
    }

    None
}

/// `2n/3 + 1`
pub fn two_thirds_quorum(n: usize) -> usize {
    n * 2 / 3 + 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Header, Signature64};

    fn addr(seed: u8) -> Address {
        Address::from_public_key_bytes([seed; 32])
    }

    fn block(height: u64, producer: u8) -> Block {
        let mut header = Header {
            parent_hash: Hash::ZERO,
            height,
            time: height * 10,
            coinbase: addr(producer),
            account_hash: Hash::ZERO,
            transaction_hash: Hash::ZERO,
            consensus_hash: Hash::ZERO,
            difficulty: 0,
            nonce: 0,
            hash: Hash::ZERO,
            signature: Signature64::zero(),
        };
        header.hash = header.calc_hash();
        Block::new(header, vec![])
    }

    // Chain ordered genesis..tail; returns (tail-first walk, genesis)
    fn chain(producers: &[u8]) -> Vec<Block> {
        let mut blocks = vec![block(0, 0)];
        for (i, p) in producers.iter().enumerate() {
            blocks.push(block(i as u64 + 1, *p));
        }
        blocks
    }

    #[test]
    fn test_full_round_finalizes_oldest_block() {
        let blocks = chain(&[1, 2]);
        let walk = || blocks.iter().rev();
        assert_eq!(find_new_lib(walk(), &blocks[0], 3, 3, |_| true), None);

        let blocks = chain(&[1, 2, 3]);
        let lib = find_new_lib(blocks.iter().rev(), &blocks[0], 3, 3, |_| true);
        assert_eq!(lib, Some(blocks[1].hash()));
    }

    #[test]
    fn test_repeated_producer_does_not_count_twice() {
        let blocks = chain(&[1, 1, 2]);
        assert_eq!(find_new_lib(blocks.iter().rev(), &blocks[0], 3, 3, |_| true), None);
    }

    #[test]
    fn test_window_resets_between_rounds() {
        // Walking back: [3,2,2] then [1,...]; neither window holds 3 distinct
        let blocks = chain(&[1, 2, 2, 3]);
        assert_eq!(find_new_lib(blocks.iter().rev(), &blocks[0], 3, 3, |_| true), None);
    }

    #[test]
    fn test_two_thirds_threshold() {
        assert_eq!(two_thirds_quorum(3), 3);
        assert_eq!(two_thirds_quorum(4), 3);
        assert_eq!(two_thirds_quorum(6), 5);

        // 4 signers, threshold 3: the third distinct producer seals it
        let blocks = chain(&[1, 2, 3, 4]);
        let lib = find_new_lib(blocks.iter().rev(), &blocks[0], 4, 3, |_| true);
        assert_eq!(lib, Some(blocks[2].hash()));
    }

    #[test]
    fn test_stops_at_current_lib_and_respects_veto() {
        let blocks = chain(&[1, 2, 3, 1, 2]);
        // LIB already at height 3: only two blocks above it
        assert_eq!(find_new_lib(blocks.iter().rev(), &blocks[3], 3, 3, |_| true), None);

        let vetoed = find_new_lib(blocks.iter().rev(), &blocks[0], 3, 3, |b| b.height() != 4);
        assert_eq!(vetoed, None);
    }
}
