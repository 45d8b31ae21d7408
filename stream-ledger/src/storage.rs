//! Storage layer using RocksDB
//!
//! # Column Families
//!
//! - `flow_events` - Flow change log (key: chain || position)
//! - `flow_index` - Per-account index (key: chain || account || position)
//! - `extensions` - Deposit events (key: positional sibling key)
//! - `extension_links` - Explicit parent links (key: chain || parent position)
//! - `edge_states` - Derived edge rows (key: chain || account || edge_id)
//! - `discrete_balances` - Token balances (key: chain || account)
//! - `watermarks` - Last successful recompute (key: chain || account)
//! - `tasks` - Durable work queue entries (opaque keys)
//! - `meta` - Bootstrap markers and applied-transfer markers
//!
//! Positions are encoded big-endian so a forward scan over an account prefix
//! yields events ordered by `(height, log_index)`.

use crate::{
    error::{Error, Result},
    types::{
        sibling_key, AccountId, Amount, Blockchain, DiscreteBalance, EdgeState, EventPosition, FlowChangeEvent,
        FlowExtensionEvent, RecomputeWatermark, TransferEvent,
    },
    Config,
};
use parking_lot::Mutex;
use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBCompactionStyle, Direction, IteratorMode,
    Options, WriteBatch, DB,
};
use num_traits::Zero;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Column family names
const CF_FLOW_EVENTS: &str = "flow_events";
const CF_FLOW_INDEX: &str = "flow_index";
const CF_EXTENSIONS: &str = "extensions";
const CF_EXTENSION_LINKS: &str = "extension_links";
const CF_EDGE_STATES: &str = "edge_states";
const CF_DISCRETE: &str = "discrete_balances";
const CF_WATERMARKS: &str = "watermarks";
const CF_TASKS: &str = "tasks";
const CF_META: &str = "meta";

const ALL_CFS: [&str; 9] = [
    CF_FLOW_EVENTS,
    CF_FLOW_INDEX,
    CF_EXTENSIONS,
    CF_EXTENSION_LINKS,
    CF_EDGE_STATES,
    CF_DISCRETE,
    CF_WATERMARKS,
    CF_TASKS,
    CF_META,
];

/// Key component separator. Chain IDs and addresses never contain NUL.
const SEP: u8 = 0;

/// Storage wrapper for RocksDB
pub struct Storage {
    db: Arc<DB>,

    /// Serializes read-modify-write on discrete balances
    transfer_lock: Mutex<()>,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("path", &self.db.path())
            .finish()
    }
}

impl Storage {
    /// Open or create database
    pub fn open(config: &Config) -> Result<Self> {
        let path = &config.data_dir;

        std::fs::create_dir_all(path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        db_opts.set_write_buffer_size(config.rocksdb.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(config.rocksdb.max_write_buffer_number);
        db_opts.set_target_file_size_base(config.rocksdb.target_file_size_mb * 1024 * 1024);
        db_opts.set_max_background_jobs(config.rocksdb.max_background_jobs);
        db_opts.set_compaction_style(DBCompactionStyle::Level);

        if config.rocksdb.enable_statistics {
            db_opts.enable_statistics();
        }

        let cf_descriptors = ALL_CFS
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name)))
            .collect::<Vec<_>>();

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        tracing::info!(
            path = ?path,
            column_families = ALL_CFS.len(),
            "Opened RocksDB"
        );

        Ok(Self {
            db: Arc::new(db),
            transfer_lock: Mutex::new(()),
        })
    }

    fn cf_options(name: &str) -> Options {
        let mut opts = Options::default();
        match name {
            // Logs are write-once, read on replay
            CF_FLOW_EVENTS | CF_EXTENSIONS => {
                opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
            }
            CF_FLOW_INDEX | CF_EXTENSION_LINKS => {
                opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
                let mut block_opts = rocksdb::BlockBasedOptions::default();
                block_opts.set_bloom_filter(10.0, false);
                opts.set_block_based_table_factory(&block_opts);
            }
            _ => {
                opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
            }
        }
        opts
    }

    fn cf_handle(&self, name: &str) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Storage(format!("Column family {} not found", name)))
    }

    /// Collect `(key, value)` pairs whose key starts with `prefix`, ascending
    fn scan_prefix(&self, cf_name: &str, prefix: &[u8]) -> Result<Vec<(Box<[u8]>, Box<[u8]>)>> {
        let cf = self.cf_handle(cf_name)?;
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(prefix, Direction::Forward));

        let mut out = Vec::new();
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            out.push((key, value));
        }
        Ok(out)
    }

    // Flow change operations

    /// Store flow change events with their per-account index entries (atomic)
    ///
    /// Re-storing an event at the same position overwrites it; index entries
    /// of parties the replaced event no longer names are removed in the same
    /// batch.
    pub fn put_flow_events(&self, events: &[FlowChangeEvent]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }

        let cf_events = self.cf_handle(CF_FLOW_EVENTS)?;
        let cf_index = self.cf_handle(CF_FLOW_INDEX)?;
        let mut batch = WriteBatch::default();
        let mut written: BTreeMap<Vec<u8>, &FlowChangeEvent> = BTreeMap::new();

        for event in events {
            event.validate()?;
            let position = event.position();
            let key = event_key(&event.blockchain, position);

            let previous = match written.get(&key) {
                Some(pending) => Some((*pending).clone()),
                None => self.get_flow_event(&event.blockchain, position)?,
            };
            if let Some(previous) = previous {
                for party in [&previous.from, &previous.to] {
                    if !event.touches(party) {
                        batch.delete_cf(&cf_index, index_key(&event.blockchain, party, position));
                    }
                }
            }

            let value = bincode::serialize(event)?;
            batch.put_cf(&cf_events, &key, &value);
            written.insert(key, event);
            batch.put_cf(
                &cf_index,
                index_key(&event.blockchain, &event.from, position),
                b"",
            );
            batch.put_cf(&cf_index, index_key(&event.blockchain, &event.to, position), b"");
        }

        self.db.write(batch)?;

        tracing::debug!(count = events.len(), "Flow change events stored");
        Ok(())
    }

    /// Get flow change event at a position
    pub fn get_flow_event(
        &self,
        blockchain: &Blockchain,
        position: EventPosition,
    ) -> Result<Option<FlowChangeEvent>> {
        let cf = self.cf_handle(CF_FLOW_EVENTS)?;
        match self.db.get_cf(&cf, event_key(blockchain, position))? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    /// All flow changes where `account` is payer or payee, ordered by position
    pub fn account_flow_events(
        &self,
        blockchain: &Blockchain,
        account: &AccountId,
    ) -> Result<Vec<FlowChangeEvent>> {
        let prefix = account_prefix(blockchain, account);
        let index_entries = self.scan_prefix(CF_FLOW_INDEX, &prefix)?;

        let mut events = Vec::with_capacity(index_entries.len());
        for (key, _) in index_entries {
            let position = EventPosition::from_key_bytes(&key[prefix.len()..]).ok_or_else(|| {
                Error::Storage(format!("Malformed flow index key for {}", account))
            })?;
            let event = self.get_flow_event(blockchain, position)?.ok_or_else(|| {
                Error::InvariantViolation(format!(
                    "Flow index for {} points at missing event {}",
                    account, position
                ))
            })?;
            events.push(event);
        }

        Ok(events)
    }

    /// Position of the newest flow change touching `account` (descending scan)
    pub fn latest_account_position(
        &self,
        blockchain: &Blockchain,
        account: &AccountId,
    ) -> Result<Option<EventPosition>> {
        let prefix = account_prefix(blockchain, account);
        let mut upper = prefix.clone();
        upper.extend_from_slice(&[0xFF; 12]);

        let cf = self.cf_handle(CF_FLOW_INDEX)?;
        let mut iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&upper, Direction::Reverse));

        match iter.next() {
            Some(item) => {
                let (key, _) = item?;
                if key.starts_with(&prefix) {
                    Ok(EventPosition::from_key_bytes(&key[prefix.len()..]))
                } else {
                    Ok(None)
                }
            }
            None => Ok(None),
        }
    }

    /// Every chain with at least one indexed flow change
    ///
    /// Seeks past each chain's key range instead of scanning its entries.
    pub fn flow_chains(&self) -> Result<Vec<Blockchain>> {
        let cf = self.cf_handle(CF_FLOW_INDEX)?;
        let mut chains = Vec::new();
        let mut from: Vec<u8> = Vec::new();

        loop {
            let next = self
                .db
                .iterator_cf(&cf, IteratorMode::From(&from, Direction::Forward))
                .next();
            let key = match next {
                Some(item) => item?.0,
                None => break,
            };
            let end = key
                .iter()
                .position(|b| *b == SEP)
                .ok_or_else(|| Error::Storage("Malformed flow index key".to_string()))?;
            let chain = std::str::from_utf8(&key[..end])
                .map_err(|e| Error::Storage(format!("Malformed chain in key: {}", e)))?;
            chains.push(Blockchain::new(chain));

            // First key past `chain || SEP || ...`
            from = key[..end].to_vec();
            from.push(SEP + 1);
        }

        Ok(chains)
    }

    /// Every account that ever appeared in a flow change on the chain
    pub fn chain_flow_accounts(&self, blockchain: &Blockchain) -> Result<BTreeSet<AccountId>> {
        let prefix = chain_prefix(blockchain);
        let mut accounts = BTreeSet::new();
        for (key, _) in self.scan_prefix(CF_FLOW_INDEX, &prefix)? {
            accounts.insert(account_from_key(&key, prefix.len())?);
        }
        Ok(accounts)
    }

    // Extension operations

    /// Store deposit events under their positional key and explicit link
    pub fn put_extension_events(&self, events: &[FlowExtensionEvent]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }

        let cf_ext = self.cf_handle(CF_EXTENSIONS)?;
        let cf_links = self.cf_handle(CF_EXTENSION_LINKS)?;
        let mut batch = WriteBatch::default();

        for event in events {
            let value = bincode::serialize(event)?;
            batch.put_cf(&cf_ext, event.sibling_key().as_bytes(), &value);
            if let Some(parent) = event.parent {
                batch.put_cf(&cf_links, event_key(&event.blockchain, parent), &value);
            }
        }

        self.db.write(batch)?;

        tracing::debug!(count = events.len(), "Flow extension events stored");
        Ok(())
    }

    /// Locate the deposit event of a flow change for the paying `account`
    ///
    /// Uses the explicit parent link when one was recorded, otherwise the
    /// positional sibling at `log_index + 1`.
    pub fn find_extension(
        &self,
        parent: &FlowChangeEvent,
        account: &AccountId,
    ) -> Result<Option<FlowExtensionEvent>> {
        let cf_links = self.cf_handle(CF_EXTENSION_LINKS)?;
        if let Some(value) = self
            .db
            .get_cf(&cf_links, event_key(&parent.blockchain, parent.position()))?
        {
            return Ok(Some(bincode::deserialize(&value)?));
        }

        let Some(sibling_index) = parent.log_index.checked_add(1) else {
            return Ok(None);
        };
        let key = sibling_key(&parent.blockchain, parent.height, account, sibling_index);

        let cf_ext = self.cf_handle(CF_EXTENSIONS)?;
        match self.db.get_cf(&cf_ext, key.as_bytes())? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    // Edge state operations

    /// Replace every edge row of an account in one atomic write
    ///
    /// Rows for edges absent from `states` are deleted. The watermark, when
    /// given, is written in the same batch.
    pub fn replace_edge_states(
        &self,
        blockchain: &Blockchain,
        account: &AccountId,
        states: &[EdgeState],
        watermark: Option<&RecomputeWatermark>,
    ) -> Result<()> {
        let prefix = account_prefix(blockchain, account);
        let cf_edges = self.cf_handle(CF_EDGE_STATES)?;
        let mut batch = WriteBatch::default();

        for (key, _) in self.scan_prefix(CF_EDGE_STATES, &prefix)? {
            batch.delete_cf(&cf_edges, key);
        }

        for state in states {
            let mut key = prefix.clone();
            key.extend_from_slice(state.edge_id.as_str().as_bytes());
            batch.put_cf(&cf_edges, key, bincode::serialize(state)?);
        }

        if let Some(watermark) = watermark {
            let cf_wm = self.cf_handle(CF_WATERMARKS)?;
            batch.put_cf(
                &cf_wm,
                scoped_key(blockchain, account),
                bincode::serialize(watermark)?,
            );
        }

        self.db.write(batch)?;

        tracing::debug!(
            blockchain = %blockchain,
            account = %account,
            edges = states.len(),
            "Edge states replaced"
        );
        Ok(())
    }

    /// Stored edge rows of one account
    pub fn account_edge_states(
        &self,
        blockchain: &Blockchain,
        account: &AccountId,
    ) -> Result<Vec<EdgeState>> {
        self.scan_prefix(CF_EDGE_STATES, &account_prefix(blockchain, account))?
            .into_iter()
            .map(|(_, value)| bincode::deserialize(&value).map_err(Error::from))
            .collect()
    }

    /// Stored edge rows of every account on a chain
    pub fn chain_edge_states(
        &self,
        blockchain: &Blockchain,
    ) -> Result<Vec<(AccountId, EdgeState)>> {
        let prefix = chain_prefix(blockchain);
        let mut out = Vec::new();
        for (key, value) in self.scan_prefix(CF_EDGE_STATES, &prefix)? {
            let account = account_from_key(&key, prefix.len())?;
            out.push((account, bincode::deserialize(&value)?));
        }
        Ok(out)
    }

    // Watermarks

    /// Last successful recompute of an account
    pub fn get_watermark(
        &self,
        blockchain: &Blockchain,
        account: &AccountId,
    ) -> Result<Option<RecomputeWatermark>> {
        let cf = self.cf_handle(CF_WATERMARKS)?;
        match self.db.get_cf(&cf, scoped_key(blockchain, account))? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    // Discrete ledger operations

    /// Discrete balance of an account (zero when never credited)
    pub fn get_discrete_balance(
        &self,
        blockchain: &Blockchain,
        account: &AccountId,
    ) -> Result<Amount> {
        let cf = self.cf_handle(CF_DISCRETE)?;
        match self.db.get_cf(&cf, scoped_key(blockchain, account))? {
            Some(value) => Ok(bincode::deserialize(&value)?),
            None => Ok(Amount::zero()),
        }
    }

    /// Every discrete balance on a chain, ordered by account
    pub fn chain_discrete_balances(
        &self,
        blockchain: &Blockchain,
    ) -> Result<Vec<DiscreteBalance>> {
        let prefix = chain_prefix(blockchain);
        let mut out = Vec::new();
        for (key, value) in self.scan_prefix(CF_DISCRETE, &prefix)? {
            let account = String::from_utf8(key[prefix.len()..].to_vec())
                .map_err(|e| Error::Storage(format!("Malformed balance key: {}", e)))?;
            out.push(DiscreteBalance {
                account: AccountId::new(account),
                balance: bincode::deserialize(&value)?,
            });
        }
        Ok(out)
    }

    /// Apply a transfer/mint/burn to the discrete ledger (atomic)
    ///
    /// Returns `false` when a transfer at the same position was already applied.
    pub fn apply_transfer(&self, transfer: &TransferEvent) -> Result<bool> {
        transfer.validate()?;

        let _guard = self.transfer_lock.lock();

        let marker = transfer_marker(transfer);
        let cf_meta = self.cf_handle(CF_META)?;
        if self.db.get_cf(&cf_meta, &marker)?.is_some() {
            tracing::debug!(
                blockchain = %transfer.blockchain,
                height = transfer.height,
                log_index = transfer.log_index,
                "Transfer already applied, skipping"
            );
            return Ok(false);
        }

        let cf = self.cf_handle(CF_DISCRETE)?;
        let mut batch = WriteBatch::default();

        if let (Some(from), Some(to)) = (&transfer.from, &transfer.to) {
            if from == to {
                // Self-transfer only needs the balance check
                let balance = self.get_discrete_balance(&transfer.blockchain, from)?;
                if balance < transfer.amount {
                    return Err(Error::InsufficientBalance {
                        account: from.to_string(),
                        available: balance,
                        required: transfer.amount.clone(),
                    });
                }
                batch.put_cf(&cf_meta, &marker, b"");
                self.db.write(batch)?;
                return Ok(true);
            }
        }

        if let Some(from) = &transfer.from {
            let balance = self.get_discrete_balance(&transfer.blockchain, from)?;
            if balance < transfer.amount {
                return Err(Error::InsufficientBalance {
                    account: from.to_string(),
                    available: balance,
                    required: transfer.amount.clone(),
                });
            }
            let remaining = balance - &transfer.amount;
            batch.put_cf(
                &cf,
                scoped_key(&transfer.blockchain, from),
                bincode::serialize(&remaining)?,
            );
        }

        if let Some(to) = &transfer.to {
            let credited = self.get_discrete_balance(&transfer.blockchain, to)? + &transfer.amount;
            batch.put_cf(
                &cf,
                scoped_key(&transfer.blockchain, to),
                bincode::serialize(&credited)?,
            );
        }

        batch.put_cf(&cf_meta, &marker, b"");
        self.db.write(batch)?;

        Ok(true)
    }

    // Work queue operations (opaque to this crate)

    /// Insert queue entries (atomic)
    pub fn put_tasks(&self, entries: &[(Vec<u8>, Vec<u8>)]) -> Result<()> {
        let cf = self.cf_handle(CF_TASKS)?;
        let mut batch = WriteBatch::default();
        for (key, value) in entries {
            batch.put_cf(&cf, key, value);
        }
        self.db.write(batch)?;
        Ok(())
    }

    /// Oldest `limit` queue entries in key order
    pub fn peek_tasks(&self, limit: usize) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let cf = self.cf_handle(CF_TASKS)?;
        let mut out = Vec::with_capacity(limit.min(1024));
        for item in self.db.iterator_cf(&cf, IteratorMode::Start).take(limit) {
            let (key, value) = item?;
            out.push((key.into_vec(), value.into_vec()));
        }
        Ok(out)
    }

    /// Remove acknowledged queue entries (atomic)
    pub fn delete_tasks(&self, keys: &[Vec<u8>]) -> Result<()> {
        let cf = self.cf_handle(CF_TASKS)?;
        let mut batch = WriteBatch::default();
        for key in keys {
            batch.delete_cf(&cf, key);
        }
        self.db.write(batch)?;
        Ok(())
    }

    /// Number of queued entries (exact scan)
    pub fn task_count(&self) -> Result<usize> {
        let cf = self.cf_handle(CF_TASKS)?;
        let mut count = 0;
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            item?;
            count += 1;
        }
        Ok(count)
    }

    // Metadata

    /// Read a metadata value
    pub fn get_meta(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let cf = self.cf_handle(CF_META)?;
        Ok(self.db.get_cf(&cf, key.as_bytes())?)
    }

    /// Write a metadata value
    pub fn put_meta(&self, key: &str, value: &[u8]) -> Result<()> {
        let cf = self.cf_handle(CF_META)?;
        self.db.put_cf(&cf, key.as_bytes(), value)?;
        Ok(())
    }
}

// Key helpers

fn chain_prefix(blockchain: &Blockchain) -> Vec<u8> {
    let mut key = blockchain.as_str().as_bytes().to_vec();
    key.push(SEP);
    key
}

fn account_prefix(blockchain: &Blockchain, account: &AccountId) -> Vec<u8> {
    let mut key = chain_prefix(blockchain);
    key.extend_from_slice(account.as_str().as_bytes());
    key.push(SEP);
    key
}

fn scoped_key(blockchain: &Blockchain, account: &AccountId) -> Vec<u8> {
    let mut key = chain_prefix(blockchain);
    key.extend_from_slice(account.as_str().as_bytes());
    key
}

fn event_key(blockchain: &Blockchain, position: EventPosition) -> Vec<u8> {
    let mut key = chain_prefix(blockchain);
    key.extend_from_slice(&position.to_key_bytes());
    key
}

fn index_key(blockchain: &Blockchain, account: &AccountId, position: EventPosition) -> Vec<u8> {
    let mut key = account_prefix(blockchain, account);
    key.extend_from_slice(&position.to_key_bytes());
    key
}

fn transfer_marker(transfer: &TransferEvent) -> String {
    format!(
        "transfer/{}/{}/{}",
        transfer.blockchain, transfer.height, transfer.log_index
    )
}

/// Account component of a `chain || SEP || account || SEP || ...` key
fn account_from_key(key: &[u8], chain_prefix_len: usize) -> Result<AccountId> {
    let rest = &key[chain_prefix_len..];
    let end = rest
        .iter()
        .position(|b| *b == SEP)
        .ok_or_else(|| Error::Storage("Malformed account-scoped key".to_string()))?;
    let account = std::str::from_utf8(&rest[..end])
        .map_err(|e| Error::Storage(format!("Malformed account in key: {}", e)))?;
    Ok(AccountId::new(account))
}
