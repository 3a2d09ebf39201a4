//! Deterministic argument guessing for ABI-less probing.
//!
//! Every candidate is addressed by `(arity, index)`, so a search can always be regenerated
//! from scratch without carrying generator state.

use alloy::primitives::{Address, Bytes, Selector, U256};

pub const MAX_ARITY: usize = 5;

/// One 32-byte ABI word.
pub type Word = [u8; 32];

/// Ordered probe words. The last entry is the deployer, padded like an `address` argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeCorpus {
    words: Vec<Word>,
}

impl ProbeCorpus {
    pub fn for_deployer(deployer: Address) -> Self {
        let ten = U256::from(10u64);
        let numbers = [
            U256::ZERO,
            U256::from(1u64),
            U256::from(10_000u64),
            U256::from(1_000_000u64),
            ten.pow(U256::from(22u64)),
            U256::MAX,
        ];
        let mut words: Vec<Word> = numbers.iter().map(|n| n.to_be_bytes::<32>()).collect();
        let mut padded = [0u8; 32];
        padded[12..].copy_from_slice(deployer.as_slice());
        words.push(padded);
        Self { words }
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Number of candidates at `arity`: `len^arity`, saturating.
    pub fn candidate_count(&self, arity: usize) -> u64 {
        (self.words.len() as u64).saturating_pow(arity as u32)
    }

    /// Candidate `index` at `arity`, lexicographic over corpus indices with the first argument
    /// as the most significant digit. `None` past the end.
    pub fn candidate(&self, arity: usize, index: u64) -> Option<Bytes> {
        if index >= self.candidate_count(arity) {
            return None;
        }
        let base = self.words.len() as u64;
        let mut digits = vec![0usize; arity];
        let mut rest = index;
        for slot in digits.iter_mut().rev() {
            *slot = (rest % base) as usize;
            rest /= base;
        }
        let mut out = Vec::with_capacity(arity * 32);
        for digit in digits {
            out.extend_from_slice(&self.words[digit]);
        }
        Some(Bytes::from(out))
    }

    pub fn candidates(&self, arity: usize) -> Candidates<'_> {
        Candidates {
            corpus: self,
            arity,
            next: 0,
            count: self.candidate_count(arity),
        }
    }
}

/// Finite iterator over every candidate at one arity.
pub struct Candidates<'a> {
    corpus: &'a ProbeCorpus,
    arity: usize,
    next: u64,
    count: u64,
}

impl Iterator for Candidates<'_> {
    type Item = Bytes;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.count {
            return None;
        }
        let item = self.corpus.candidate(self.arity, self.next);
        self.next += 1;
        item
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.count.saturating_sub(self.next) as usize;
        (left, Some(left))
    }
}

pub fn encode_call(selector: Selector, args: &[u8]) -> Bytes {
    let mut out = Vec::with_capacity(4 + args.len());
    out.extend_from_slice(selector.as_slice());
    out.extend_from_slice(args);
    Bytes::from(out)
}
