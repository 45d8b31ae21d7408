//! Real-time projection of settled edge state
//!
//! Projection is read-only: stored state is never mutated. The deposit is
//! reported on the edge, not folded into the projected balance.

use crate::{
    error::{Error, Result},
    types::{AccountId, Amount, EdgeState, ProjectedEdge},
};
use num_traits::Zero;

/// `flow_rate * (at - last_settled_timestamp)`
pub fn unsettled_delta(state: &EdgeState, at: i64) -> Result<Amount> {
    let elapsed = at.checked_sub(state.last_settled_timestamp).ok_or_else(|| {
        Error::Overflow(format!("elapsed time overflowed on edge {}", state.edge_id))
    })?;
    Ok(&state.flow_rate * Amount::from(elapsed))
}

/// Static balance plus accrual up to `at`
pub fn projected_balance(state: &EdgeState, at: i64) -> Result<Amount> {
    Ok(&state.static_balance + unsettled_delta(state, at)?)
}

/// Project a stored edge row to `at`
pub fn project_edge(account: &AccountId, state: &EdgeState, at: i64) -> Result<ProjectedEdge> {
    Ok(ProjectedEdge {
        account: account.clone(),
        state: state.clone(),
        balance: projected_balance(state, at)?,
        projected_at: at,
    })
}

/// Project many rows to `at`
///
/// A row that cannot be projected is logged and skipped so one bad edge
/// never hides the rest of a page.
pub fn project_rows<'a, I>(rows: I, at: i64) -> Vec<ProjectedEdge>
where
    I: IntoIterator<Item = (&'a AccountId, &'a EdgeState)>,
{
    rows.into_iter()
        .filter_map(|(account, state)| match project_edge(account, state, at) {
            Ok(projected) => Some(projected),
            Err(e) => {
                tracing::warn!(
                    account = %account,
                    edge = %state.edge_id,
                    at,
                    error = %e,
                    "Skipping edge that cannot be projected"
                );
                None
            }
        })
        .collect()
}

/// Project many rows, dropping edges whose projected balance is exactly zero
pub fn project_nonzero<'a, I>(rows: I, at: i64) -> Vec<ProjectedEdge>
where
    I: IntoIterator<Item = (&'a AccountId, &'a EdgeState)>,
{
    let mut out = project_rows(rows, at);
    out.retain(|projected| !projected.balance.is_zero());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replay::fold_flow_history;
    use crate::types::{Blockchain, EdgeId, FlowChangeEvent};

    fn flow(from: &str, to: &str, rate: i64, timestamp: i64, height: u64) -> FlowChangeEvent {
        FlowChangeEvent {
            blockchain: Blockchain::new("polygon"),
            from: AccountId::new(from),
            to: AccountId::new(to),
            flow_rate: Amount::from(rate),
            timestamp,
            height,
            log_index: 0,
            transaction: format!("0x{}", height),
        }
    }

    fn open_edge(static_balance: i64, rate: i64, at: i64) -> EdgeState {
        let event = flow("D", "C", rate, at, 1);
        let mut state = EdgeState::empty(event.edge_id(), event);
        state.static_balance = Amount::from(static_balance);
        state.flow_rate = Amount::from(rate);
        state.last_settled_timestamp = at;
        state
    }

    #[test]
    fn test_open_edge_accrues() {
        let t0 = 1_700_000_000;
        let state = open_edge(100, 2, t0);
        assert_eq!(projected_balance(&state, t0 + 50).unwrap(), Amount::from(200));
        assert_eq!(unsettled_delta(&state, t0).unwrap(), Amount::zero());
    }

    #[test]
    fn test_closed_stream_is_frozen() {
        let events = vec![flow("A", "B", 10, 0, 1), flow("A", "B", 0, 100, 2)];
        let edge = EdgeId::new(&AccountId::new("A"), &AccountId::new("B"));

        let a_state = fold_flow_history(&AccountId::new("A"), &events).unwrap()[&edge].clone();
        let b_state = fold_flow_history(&AccountId::new("B"), &events).unwrap()[&edge].clone();

        assert_eq!(projected_balance(&a_state, 100).unwrap(), Amount::from(-1000));
        assert_eq!(projected_balance(&a_state, 500).unwrap(), Amount::from(-1000));
        assert_eq!(projected_balance(&b_state, 500).unwrap(), Amount::from(1000));
        assert_eq!(
            projected_balance(&b_state, 100).unwrap(),
            projected_balance(&b_state, 1_000_000_000).unwrap()
        );
    }

    #[test]
    fn test_projection_does_not_touch_state() {
        let state = open_edge(100, 2, 10);
        let projected = project_edge(&AccountId::new("C"), &state, 60).unwrap();
        assert_eq!(projected.state, state);
        assert_eq!(projected.balance, Amount::from(200));
        assert_eq!(projected.projected_at, 60);
    }

    #[test]
    fn test_zero_projection_filtered() {
        let account = AccountId::new("C");
        let zero = open_edge(0, 0, 10);
        let live = open_edge(5, 1, 10);

        let rows = vec![(&account, &zero), (&account, &live)];
        let projected = project_nonzero(rows, 20);
        assert_eq!(projected.len(), 1);
        assert_eq!(projected[0].balance, Amount::from(15));
    }

    #[test]
    fn test_outflow_can_cancel_to_zero() {
        // Static +100 draining at -2/s hits exactly zero at t=60
        let account = AccountId::new("C");
        let draining = open_edge(100, -2, 10);
        assert!(project_nonzero(vec![(&account, &draining)], 60).is_empty());
    }

    #[test]
    fn test_large_rate_projects_exactly() {
        let mut state = open_edge(0, 0, 0);
        state.flow_rate = "1000000000000000000000".parse().unwrap();
        let expected: Amount = "100000000000000000000000000000".parse().unwrap();
        assert_eq!(projected_balance(&state, 100_000_000).unwrap(), expected);
    }

    #[test]
    fn test_unprojectable_row_skipped() {
        let account = AccountId::new("C");
        let poisoned = open_edge(1, 1, i64::MIN);
        let live = open_edge(5, 1, 10);

        assert!(project_edge(&account, &poisoned, i64::MAX).is_err());

        let rows = vec![(&account, &poisoned), (&account, &live)];
        let projected = project_nonzero(rows, 20);
        assert_eq!(projected.len(), 1);
        assert_eq!(projected[0].balance, Amount::from(15));
    }
}
