//! Combined balance aggregation
//!
//! `balance(account) = discrete(account, default 0) + Σ projected edges`
//!
//! Accounts netting to exactly zero are dropped. Ordering uses exact
//! integer comparison, never floating point.

use crate::types::{AccountId, Amount, DiscreteBalance, ProjectedEdge, ReportedBalance};
use num_traits::Zero;
use std::collections::BTreeMap;

/// Merge discrete balances with projected stream edges
///
/// Sorted ascending by balance, or descending when `reverse` is set. Ties
/// are ordered by account so the output is deterministic.
pub fn combine_balances(
    discrete: &[DiscreteBalance],
    streams: &[ProjectedEdge],
    reverse: bool,
) -> Vec<ReportedBalance> {
    let mut totals: BTreeMap<&AccountId, Amount> = BTreeMap::new();

    for entry in discrete {
        accumulate(&mut totals, &entry.account, &entry.balance);
    }

    for edge in streams {
        if edge.balance.is_zero() {
            continue;
        }
        accumulate(&mut totals, &edge.account, &edge.balance);
    }

    let mut balances: Vec<ReportedBalance> = totals
        .into_iter()
        .filter(|(_, balance)| !balance.is_zero())
        .map(|(account, balance)| ReportedBalance {
            account: account.clone(),
            balance,
        })
        .collect();

    balances.sort_by(|a, b| {
        let by_balance = if reverse {
            b.balance.cmp(&a.balance)
        } else {
            a.balance.cmp(&b.balance)
        };
        by_balance.then_with(|| a.account.cmp(&b.account))
    });

    balances
}

fn accumulate<'a>(
    totals: &mut BTreeMap<&'a AccountId, Amount>,
    account: &'a AccountId,
    amount: &Amount,
) {
    *totals.entry(account).or_insert_with(Amount::zero) += amount;
}
