//! Next-move selector.

use std::collections::BTreeSet;

use tracing::warn;

use crate::readiness::ReadyStore;
use crate::types::Opportunity;

/// Pick the opportunity to act on this cycle.
///
/// Requires proof the store is ready. Invalid records and ids in `exclude`
/// are skipped; among the rest the lowest `(rank, created_at, id)` wins, so
/// the result is reproducible for the same feed.
pub fn select_next<'a>(
    store: &ReadyStore,
    opportunities: &'a [Opportunity],
    exclude: &BTreeSet<String>,
) -> Option<&'a Opportunity> {
    opportunities
        .iter()
        .filter(|opp| match opp.validate() {
            Ok(()) => true,
            Err(problem) => {
                warn!(merchant_id = store.merchant_id(), %problem, "skipping invalid opportunity");
                false
            }
        })
        .filter(|opp| !exclude.contains(&opp.id))
        .min_by(|a, b| {
            (a.rank, a.created_at, &a.id).cmp(&(b.rank, b.created_at, &b.id))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::tests::opportunity;
    use time::Duration;

    fn ranked(id: &str, rank: u32) -> Opportunity {
        Opportunity {
            rank,
            ..opportunity(id)
        }
    }

    #[test]
    fn takes_lowest_rank() {
        let store = ReadyStore::assume("m1");
        let feed = vec![ranked("o2", 2), ranked("o1", 1), ranked("o3", 3)];
        let picked = select_next(&store, &feed, &BTreeSet::new()).unwrap();
        assert_eq!(picked.id, "o1");
    }

    #[test]
    fn ties_break_on_created_at_then_id() {
        let store = ReadyStore::assume("m1");
        let older = Opportunity {
            created_at: opportunity("x").created_at - Duration::hours(1),
            ..ranked("o9", 1)
        };
        let feed = vec![ranked("o2", 1), older, ranked("o1", 1)];
        assert_eq!(
            select_next(&store, &feed, &BTreeSet::new()).unwrap().id,
            "o9"
        );

        let feed = vec![ranked("o2", 1), ranked("o1", 1)];
        assert_eq!(
            select_next(&store, &feed, &BTreeSet::new()).unwrap().id,
            "o1"
        );
    }

    #[test]
    fn empty_feed_selects_nothing() {
        let store = ReadyStore::assume("m1");
        assert!(select_next(&store, &[], &BTreeSet::new()).is_none());
    }

    #[test]
    fn excluded_and_invalid_opportunities_are_skipped() {
        let store = ReadyStore::assume("m1");
        let invalid = Opportunity {
            confidence: 150,
            ..ranked("bad", 0)
        };
        let feed = vec![invalid, ranked("done", 1), ranked("o3", 3)];
        let exclude: BTreeSet<String> = ["done".to_string()].into_iter().collect();
        assert_eq!(select_next(&store, &feed, &exclude).unwrap().id, "o3");
    }
}
