// ABOUTME: Property tests for the GTID set algebra
// ABOUTME: Union laws, cardinality bounds, subtraction and itemize recollapse over random sets

use mysql_rpl_failover::gtid::{self, GtidSet};
use proptest::prelude::*;

const UUIDS: [&str; 3] = [
    "3E11FA47-71CA-11E1-9E33-C80AA9429562",
    "3e11fa47-71ca-11e1-9e33-c80aa9429562",
    "b7c5b9b2-5c4a-11ee-8c99-0242ac120002",
];

/// GTID set text built from random, unsorted and possibly overlapping intervals
fn gtid_text() -> impl Strategy<Value = String> {
    prop::collection::vec((0..UUIDS.len(), 1u64..60, 0u64..8), 0..8).prop_map(|groups| {
        groups
            .into_iter()
            .map(|(uuid, start, len)| {
                if len == 0 {
                    format!("{}:{}", UUIDS[uuid], start)
                } else {
                    format!("{}:{}-{}", UUIDS[uuid], start, start + len)
                }
            })
            .collect::<Vec<_>>()
            .join(",")
    })
}

fn set(text: &str) -> GtidSet {
    gtid::parse(text).unwrap()
}

proptest! {
    #[test]
    fn union_is_commutative(a in gtid_text(), b in gtid_text()) {
        prop_assert_eq!(gtid::union(&a, &b).unwrap(), gtid::union(&b, &a).unwrap());
    }

    #[test]
    fn union_is_idempotent(a in gtid_text()) {
        let a = set(&a);
        prop_assert_eq!(a.union(&a), a);
    }

    #[test]
    fn union_is_associative(a in gtid_text(), b in gtid_text(), c in gtid_text()) {
        let (a, b, c) = (set(&a), set(&b), set(&c));
        prop_assert_eq!(a.union(&b).union(&c), a.union(&b.union(&c)));
    }

    #[test]
    fn union_cardinality_is_bounded_and_tight_only_when_disjoint(
        a in gtid_text(),
        b in gtid_text(),
    ) {
        let (a, b) = (set(&a), set(&b));
        let merged = a.union(&b).cardinality();
        prop_assert!(merged <= a.cardinality() + b.cardinality());
        prop_assert!(merged >= a.cardinality().max(b.cardinality()));

        let disjoint = a.subtract(&b) == a;
        prop_assert_eq!(merged == a.cardinality() + b.cardinality(), disjoint);
    }

    #[test]
    fn operands_are_subsets_of_their_union(a in gtid_text(), b in gtid_text()) {
        let (a, b) = (set(&a), set(&b));
        let merged = a.union(&b);
        prop_assert!(a.is_subset(&merged));
        prop_assert!(b.is_subset(&merged));
    }

    #[test]
    fn subtraction_removes_exactly_the_overlap(a in gtid_text(), b in gtid_text()) {
        let (a, b) = (set(&a), set(&b));
        let rest = a.subtract(&b);
        prop_assert!(rest.is_subset(&a));
        prop_assert_eq!(rest.subtract(&b).cardinality(), rest.cardinality());
        prop_assert_eq!(rest.union(&b), a.union(&b));
    }

    #[test]
    fn itemized_transactions_recollapse_to_the_same_set(a in gtid_text()) {
        let mut rebuilt = GtidSet::new();
        let mut count = 0u128;
        for (uuid, sequences) in gtid::itemize(&a).unwrap() {
            for sequence in sequences {
                rebuilt.insert(&uuid, gtid::Interval::single(sequence));
                count += 1;
            }
        }
        let original = set(&a);
        prop_assert_eq!(&rebuilt, &original);
        // Itemize does not merge groups, so overlaps are listed more than once
        prop_assert!(count >= original.cardinality());
    }

    #[test]
    fn last_is_the_greatest_member(a in gtid_text()) {
        let parsed = set(&a);
        for uuid in parsed.uuids() {
            let last = parsed.last(uuid).unwrap();
            let max = parsed.intervals(uuid).unwrap().iter().map(|i| i.end).max().unwrap();
            prop_assert_eq!(last.sequence(), max);
            prop_assert_eq!(gtid::last(&a, &uuid.to_uppercase()).unwrap(), Some(last));
        }
    }

    #[test]
    fn normalized_text_parses_back_to_the_same_set(a in gtid_text()) {
        let parsed = set(&a);
        prop_assert_eq!(set(&parsed.to_string()), parsed);
    }
}
