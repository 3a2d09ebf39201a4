use alloy::primitives::{Address, Selector};
use attack_simulation::calldata_search::{encode_call, ProbeCorpus, MAX_ARITY};
use proptest::prelude::*;

fn corpus(seed: [u8; 20]) -> ProbeCorpus {
    ProbeCorpus::for_deployer(Address::from(seed))
}

proptest! {
    #[test]
    fn candidate_layout_matches_index_digits(
        seed in any::<[u8; 20]>(),
        arity in 0usize..=MAX_ARITY,
        raw_index in any::<u64>(),
    ) {
        let corpus = corpus(seed);
        let count = corpus.candidate_count(arity);
        let index = raw_index % count;
        let candidate = corpus.candidate(arity, index).expect("in range");
        prop_assert_eq!(candidate.len(), arity * 32);

        // Each 32-byte word is the corpus entry named by the matching base-C digit of
        // `index`, most significant digit first.
        let base = corpus.len() as u64;
        let mut rest = index;
        for position in (0..arity).rev() {
            let digit = rest % base;
            rest /= base;
            let expected = corpus.candidate(1, digit).expect("word");
            prop_assert_eq!(&candidate[position * 32..(position + 1) * 32], &expected[..]);
        }
        prop_assert!(corpus.candidate(arity, count).is_none());
    }

    #[test]
    fn iterator_agrees_with_indexing(seed in any::<[u8; 20]>(), arity in 0usize..=2) {
        let corpus = corpus(seed);
        let all: Vec<_> = corpus.candidates(arity).collect();
        prop_assert_eq!(all.len() as u64, corpus.candidate_count(arity));
        for (index, candidate) in all.iter().enumerate() {
            prop_assert_eq!(Some(candidate.clone()), corpus.candidate(arity, index as u64));
        }
    }

    #[test]
    fn encoded_call_starts_with_selector(selector in any::<[u8; 4]>(), args in proptest::collection::vec(any::<u8>(), 0..96)) {
        let encoded = encode_call(Selector::from(selector), &args);
        prop_assert_eq!(&encoded[..4], &selector[..]);
        prop_assert_eq!(&encoded[4..], &args[..]);
    }
}
