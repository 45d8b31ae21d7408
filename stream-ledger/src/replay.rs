//! Flow replay: fold an account's ordered flow history into edge state
//!
//! The fold is a pure function of `(account, ordered events)`. It is not
//! commutative, so input must be sorted by `(height, log_index)`; unsorted
//! input is rejected rather than silently producing a different result.
//!
//! For each event on edge `from:to`:
//!
//! ```text
//! elapsed         = event.timestamp - state.last_settled_timestamp
//! static_balance += state.flow_rate * elapsed        (settle previous rate)
//! flow_rate       = account == from ? -rate : +rate  (perspective)
//! ```

use crate::{
    error::{Error, Result},
    types::{AccountId, Amount, EdgeId, EdgeState, FlowChangeEvent, FlowExtensionEvent},
};
use num_traits::Zero;
use std::collections::BTreeMap;

/// Settled edges of one account, keyed by edge
pub type EdgeMap = BTreeMap<EdgeId, EdgeState>;

/// Fold an account's flow history into per-edge settled state
///
/// Every event must touch `account`, and events must be strictly ascending
/// by position.
pub fn fold_flow_history(account: &AccountId, events: &[FlowChangeEvent]) -> Result<EdgeMap> {
    let mut edges = EdgeMap::new();

    for (i, event) in events.iter().enumerate() {
        if i > 0 && events[i - 1].position() >= event.position() {
            return Err(Error::InvalidEvent(format!(
                "flow history of {} is not ordered: {} follows {}",
                account,
                event.position(),
                events[i - 1].position()
            )));
        }
        if !event.touches(account) {
            return Err(Error::InvariantViolation(format!(
                "event {} on edge {} does not involve {}",
                event.position(),
                event.edge_id(),
                account
            )));
        }

        let edge_id = event.edge_id();
        let state = edges
            .entry(edge_id.clone())
            .or_insert_with(|| EdgeState::empty(edge_id, event.clone()));
        settle(state, account, event)?;
    }

    Ok(edges)
}

/// Fold one event into an edge
fn settle(state: &mut EdgeState, account: &AccountId, event: &FlowChangeEvent) -> Result<()> {
    let elapsed = event
        .timestamp
        .checked_sub(state.last_settled_timestamp)
        .ok_or_else(|| overflow(&state.edge_id, "elapsed time"))?;

    state.static_balance += &state.flow_rate * Amount::from(elapsed);

    state.flow_rate = signed_rate(account, event);
    state.last_settled_timestamp = event.timestamp;
    state.update_count += 1;
    state.last_event = event.clone();

    Ok(())
}

/// Rate as seen by `account`: outflow is negative
pub fn signed_rate(account: &AccountId, event: &FlowChangeEvent) -> Amount {
    if &event.from == account {
        -&event.flow_rate
    } else {
        event.flow_rate.clone()
    }
}

/// Attach deposits to the edges the account pays on
///
/// `find_deposit` locates the extension event for an edge's last event. Only
/// the payer of that last event carries the deposit; the payee's view keeps
/// zero. A missing extension event is treated as a zero deposit.
pub fn attribute_deposits<F>(
    account: &AccountId,
    edges: &mut EdgeMap,
    mut find_deposit: F,
) -> Result<()>
where
    F: FnMut(&FlowChangeEvent) -> Result<Option<FlowExtensionEvent>>,
{
    for state in edges.values_mut() {
        state.deposit = Amount::zero();

        if &state.last_event.from != account {
            continue;
        }

        match find_deposit(&state.last_event)? {
            Some(extension) => state.deposit = extension.deposit,
            None => {
                tracing::debug!(
                    account = %account,
                    edge = %state.edge_id,
                    position = %state.last_event.position(),
                    "No extension event for flow change, deposit is zero"
                );
            }
        }
    }
    Ok(())
}

fn overflow(edge_id: &EdgeId, what: &str) -> Error {
    Error::Overflow(format!("{} overflowed on edge {}", what, edge_id))
}
