//! Core types for the streaming ledger
//!
//! All types are designed for:
//! - Deterministic serialization (bincode)
//! - Exact arbitrary-precision integers for amounts and rates
//! - Total ordering of chain events by `(height, log_index)`

use chrono::{DateTime, Utc};
use num_bigint::{BigInt, Sign};
use num_traits::Zero;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Token amount or per-second rate in base units. Never overflows.
pub type Amount = BigInt;

/// Chain identifier (e.g. "polygon-mainnet")
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Blockchain(String);

impl Blockchain {
    /// Create new chain ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Blockchain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Account address on a chain
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AccountId(String);

impl AccountId {
    /// Create new account ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Position of an event in the chain log
///
/// Ordering is `(height, log_index)` ascending, which is the order the replay
/// fold consumes events in.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct EventPosition {
    /// Block height
    pub height: u64,
    /// Log index within the block
    pub log_index: u32,
}

impl EventPosition {
    /// Create new position
    pub fn new(height: u64, log_index: u32) -> Self {
        Self { height, log_index }
    }

    /// Big-endian key bytes (sort order == logical order)
    pub fn to_key_bytes(self) -> [u8; 12] {
        let mut out = [0u8; 12];
        out[..8].copy_from_slice(&self.height.to_be_bytes());
        out[8..].copy_from_slice(&self.log_index.to_be_bytes());
        out
    }

    /// Parse from big-endian key bytes
    pub fn from_key_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 12 {
            return None;
        }
        let height = u64::from_be_bytes(bytes[..8].try_into().ok()?);
        let log_index = u32::from_be_bytes(bytes[8..].try_into().ok()?);
        Some(Self { height, log_index })
    }
}

impl fmt::Display for EventPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.height, self.log_index)
    }
}

/// Directed edge identifier, `from:to`
///
/// `A:B` and `B:A` are different edges.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EdgeId(String);

impl EdgeId {
    /// Build edge ID from payer and payee
    pub fn new(from: &AccountId, to: &AccountId) -> Self {
        Self(format!("{}:{}", from.as_str(), to.as_str()))
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EdgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Change of the constant payment rate on the edge `from -> to`
///
/// A `flow_rate` of zero terminates the stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowChangeEvent {
    /// Chain the event was emitted on
    pub blockchain: Blockchain,

    /// Payer
    pub from: AccountId,

    /// Payee
    pub to: AccountId,

    /// New rate in units per second
    pub flow_rate: Amount,

    /// Block timestamp (unix seconds)
    pub timestamp: i64,

    /// Block height
    pub height: u64,

    /// Log index within the block
    pub log_index: u32,

    /// Transaction hash
    pub transaction: String,
}

impl FlowChangeEvent {
    /// Ordering key
    pub fn position(&self) -> EventPosition {
        EventPosition::new(self.height, self.log_index)
    }

    /// Directed edge this event changes
    pub fn edge_id(&self) -> EdgeId {
        EdgeId::new(&self.from, &self.to)
    }

    /// Whether `account` is payer or payee
    pub fn touches(&self, account: &AccountId) -> bool {
        &self.from == account || &self.to == account
    }

    /// Check structural validity before storing
    pub fn validate(&self) -> crate::Result<()> {
        if self.from.as_str().is_empty() || self.to.as_str().is_empty() {
            return Err(crate::Error::InvalidEvent(format!(
                "flow change at {} has an empty account",
                self.position()
            )));
        }
        Ok(())
    }
}

/// Collateral deposit emitted alongside a flow change
///
/// Emitted in the same transaction as its [`FlowChangeEvent`], at
/// `log_index + 1` of the parent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowExtensionEvent {
    /// Chain the event was emitted on
    pub blockchain: Blockchain,

    /// Account that posted the deposit
    pub flow_operator: AccountId,

    /// Deposit amount
    pub deposit: Amount,

    /// Block height
    pub height: u64,

    /// Log index within the block
    pub log_index: u32,

    /// Transaction hash
    pub transaction: String,

    /// Explicit link to the parent flow change, when the parser provides one
    #[serde(default)]
    pub parent: Option<EventPosition>,
}

impl FlowExtensionEvent {
    /// Positional composite key `blockchain_height_operator_logIndex`
    pub fn sibling_key(&self) -> String {
        sibling_key(&self.blockchain, self.height, &self.flow_operator, self.log_index)
    }
}

/// Composite key used to locate the extension event of a flow change
pub fn sibling_key(
    blockchain: &Blockchain,
    height: u64,
    account: &AccountId,
    log_index: u32,
) -> String {
    format!("{}_{}_{}_{}", blockchain, height, account, log_index)
}

/// Any event relevant to streaming state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowEvent {
    /// Rate change
    Change(FlowChangeEvent),
    /// Deposit record
    Extension(FlowExtensionEvent),
}

impl FlowEvent {
    /// Chain of the event
    pub fn blockchain(&self) -> &Blockchain {
        match self {
            FlowEvent::Change(e) => &e.blockchain,
            FlowEvent::Extension(e) => &e.blockchain,
        }
    }

    /// Accounts whose streaming state this event may change
    pub fn affected_accounts(&self) -> Vec<&AccountId> {
        match self {
            FlowEvent::Change(e) => vec![&e.from, &e.to],
            FlowEvent::Extension(e) => vec![&e.flow_operator],
        }
    }
}

impl From<FlowChangeEvent> for FlowEvent {
    fn from(event: FlowChangeEvent) -> Self {
        FlowEvent::Change(event)
    }
}

impl From<FlowExtensionEvent> for FlowEvent {
    fn from(event: FlowExtensionEvent) -> Self {
        FlowEvent::Extension(event)
    }
}

/// Settled state of one directed edge, from one account's perspective
///
/// Derived by replay and replaced in full on every recompute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeState {
    /// Directed edge `from:to`
    pub edge_id: EdgeId,

    /// Balance settled up to `last_settled_timestamp`
    pub static_balance: Amount,

    /// Current rate, negative when the owning account pays
    pub flow_rate: Amount,

    /// Timestamp of the last folded event
    pub last_settled_timestamp: i64,

    /// Number of events folded into this edge
    pub update_count: u64,

    /// Last folded event
    pub last_event: FlowChangeEvent,

    /// Deposit posted by the owning account (zero for the payee)
    pub deposit: Amount,
}

impl EdgeState {
    /// Fresh edge with no accrued balance
    pub fn empty(edge_id: EdgeId, first_event: FlowChangeEvent) -> Self {
        Self {
            edge_id,
            static_balance: Amount::zero(),
            flow_rate: Amount::zero(),
            last_settled_timestamp: 0,
            update_count: 0,
            last_event: first_event,
            deposit: Amount::zero(),
        }
    }
}

/// Edge state extrapolated to a point in time (read model)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectedEdge {
    /// Account whose perspective the edge is stored from
    pub account: AccountId,

    /// Stored settled state
    pub state: EdgeState,

    /// `static_balance + flow_rate * (at - last_settled_timestamp)`
    pub balance: Amount,

    /// Projection time (unix seconds)
    pub projected_at: i64,
}

/// Balance on the discrete token ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscreteBalance {
    /// Holder
    pub account: AccountId,
    /// Non-negative balance
    pub balance: Amount,
}

/// Combined discrete + streaming balance (read model, never stored)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportedBalance {
    /// Holder
    pub account: AccountId,
    /// Discrete balance plus projected streaming balance
    pub balance: Amount,
}

/// Discrete transfer: `from == None` mints, `to == None` burns
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferEvent {
    /// Chain the event was emitted on
    pub blockchain: Blockchain,
    /// Debited account
    pub from: Option<AccountId>,
    /// Credited account
    pub to: Option<AccountId>,
    /// Transferred amount
    pub amount: Amount,
    /// Block height
    pub height: u64,
    /// Log index within the block
    pub log_index: u32,
    /// Transaction hash
    pub transaction: String,
}

impl TransferEvent {
    /// Check structural validity before applying
    pub fn validate(&self) -> crate::Result<()> {
        if self.amount.sign() != Sign::Plus {
            return Err(crate::Error::InvalidEvent(format!(
                "transfer amount must be positive, got {}",
                self.amount
            )));
        }
        if self.from.is_none() && self.to.is_none() {
            return Err(crate::Error::InvalidEvent(
                "transfer needs a sender or a receiver".to_string(),
            ));
        }
        Ok(())
    }
}

/// Last event folded by the most recent successful recompute of an account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecomputeWatermark {
    /// Position of the newest folded event
    pub position: EventPosition,
    /// Wall-clock time of the recompute
    pub recomputed_at: DateTime<Utc>,
}

/// Offset/limit page request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Pagination {
    /// Items to skip
    pub offset: usize,
    /// Max items to return (`None` uses the configured default)
    pub limit: Option<usize>,
}

impl Pagination {
    /// Page with explicit offset and limit
    pub fn new(offset: usize, limit: usize) -> Self {
        Self {
            offset,
            limit: Some(limit),
        }
    }

    /// Resolve the effective limit against configured default and cap
    pub fn effective_limit(&self, default_limit: usize, max_limit: usize) -> usize {
        self.limit.unwrap_or(default_limit).min(max_limit)
    }

    /// Slice an already-ordered result set
    pub fn apply<T>(&self, items: Vec<T>, default_limit: usize, max_limit: usize) -> Vec<T> {
        let limit = self.effective_limit(default_limit, max_limit);
        items.into_iter().skip(self.offset).take(limit).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change(from: &str, to: &str, height: u64, log_index: u32) -> FlowChangeEvent {
        FlowChangeEvent {
            blockchain: Blockchain::new("polygon"),
            from: AccountId::new(from),
            to: AccountId::new(to),
            flow_rate: Amount::from(10),
            timestamp: 0,
            height,
            log_index,
            transaction: "0xabc".to_string(),
        }
    }

    #[test]
    fn test_edge_id_is_directed() {
        let a = AccountId::new("0xA");
        let b = AccountId::new("0xB");
        assert_eq!(EdgeId::new(&a, &b).as_str(), "0xA:0xB");
        assert_ne!(EdgeId::new(&a, &b), EdgeId::new(&b, &a));
    }

    #[test]
    fn test_position_ordering() {
        assert!(EventPosition::new(1, 9) < EventPosition::new(2, 0));
        assert!(EventPosition::new(2, 0) < EventPosition::new(2, 1));

        let key_a = EventPosition::new(1, 9).to_key_bytes();
        let key_b = EventPosition::new(2, 0).to_key_bytes();
        assert!(key_a < key_b);
        assert_eq!(
            EventPosition::from_key_bytes(&key_b),
            Some(EventPosition::new(2, 0))
        );
    }

    #[test]
    fn test_sibling_key_format() {
        let ext = FlowExtensionEvent {
            blockchain: Blockchain::new("polygon"),
            flow_operator: AccountId::new("0xA"),
            deposit: Amount::from(42),
            height: 100,
            log_index: 6,
            transaction: "0xabc".to_string(),
            parent: None,
        };
        assert_eq!(ext.sibling_key(), "polygon_100_0xA_6");
    }

    #[test]
    fn test_affected_accounts() {
        let event = FlowEvent::from(change("0xA", "0xB", 1, 0));
        let accounts: Vec<&str> = event.affected_accounts().iter().map(|a| a.as_str()).collect();
        assert_eq!(accounts, vec!["0xA", "0xB"]);
    }

    #[test]
    fn test_empty_account_rejected() {
        let mut event = change("0xA", "0xB", 1, 0);
        assert!(event.validate().is_ok());
        event.to = AccountId::new("");
        assert!(event.validate().is_err());
    }

    #[test]
    fn test_amounts_exceed_machine_words() {
        // 10^40 base units: beyond u128 and any 96-bit decimal
        let big: Amount = "10000000000000000000000000000000000000000".parse().unwrap();
        let event = FlowChangeEvent {
            flow_rate: big.clone(),
            ..change("0xA", "0xB", 1, 0)
        };
        assert!(event.validate().is_ok());

        let bytes = bincode::serialize(&event).unwrap();
        let decoded: FlowChangeEvent = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded.flow_rate, big);
    }

    #[test]
    fn test_transfer_amount_must_be_positive() {
        let transfer = |amount: i64| TransferEvent {
            blockchain: Blockchain::new("polygon"),
            from: None,
            to: Some(AccountId::new("0xA")),
            amount: Amount::from(amount),
            height: 1,
            log_index: 0,
            transaction: "0xabc".to_string(),
        };
        assert!(transfer(1).validate().is_ok());
        assert!(transfer(0).validate().is_err());
        assert!(transfer(-5).validate().is_err());
    }

    #[test]
    fn test_pagination_apply() {
        let page = Pagination::new(1, 2);
        assert_eq!(page.apply(vec![1, 2, 3, 4], 100, 1000), vec![2, 3]);

        let default_page = Pagination::default();
        assert_eq!(default_page.apply(vec![1, 2, 3], 2, 1000), vec![1, 2]);
        assert_eq!(Pagination::new(0, 50).effective_limit(10, 20), 20);
    }
}
