//! The account store.
//!
//! A [`Bank`] owns the account table of one node. Every operation, reads
//! included, runs inside a single mutex-guarded critical section, and every
//! mutation rewrites the on-disk snapshot before the lock is released. If that
//! write fails the in-memory change is undone, so memory never runs ahead of
//! disk and a failed operation leaves no trace.
//!
//! Callers that need to do something between taking the lock and touching the
//! table (see [`crate::gate::CommitGate`]) use [`Bank::lock`] and the returned
//! [`Ledger`]. The convenience methods on `Bank` lock for a single call.

use std::{
    collections::BTreeMap,
    path::Path,
    sync::{Mutex, MutexGuard, PoisonError},
};

use thiserror::Error;

use crate::{
    events::Events,
    snapshot::{AccountRecord, NodeState, SnapshotError, SnapshotStore},
};

pub const ACCOUNT_NUMBER_MIN: u32 = 10_000;
pub const ACCOUNT_NUMBER_MAX: u32 = 99_999;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Account {
    pub number: u32,
    pub balance: i64,
}

#[derive(Debug, Error)]
pub enum BankError {
    #[error("amount must not be negative")]
    NegativeAmount,
    #[error("account number must be in range 10000-99999")]
    AccountOutOfRange,
    #[error("account does not exist")]
    AccountNotFound,
    #[error("insufficient funds")]
    InsufficientFunds,
    #[error("deposit would overflow the account balance")]
    BalanceOverflow,
    #[error("account numbers exhausted (10000-99999)")]
    NumbersExhausted,
    #[error("cannot remove an account with a non-zero balance")]
    NonZeroBalance,
    #[error("address {0} is not served by this bank")]
    ForeignAddress(String),
    #[error(transparent)]
    Persistence(#[from] SnapshotError),
}

impl BankError {
    /// Whether this failure is an infrastructure problem whose details must
    /// not be shown to clients.
    pub fn is_internal(&self) -> bool {
        matches!(self, BankError::Persistence(_))
    }
}

#[derive(Debug, Default)]
struct Table {
    last_assigned: u32,
    accounts: BTreeMap<u32, i64>,
}

impl Table {
    fn to_state(&self, address: &str) -> NodeState {
        NodeState {
            address: address.to_string(),
            last_assigned_number: self.last_assigned,
            accounts: self
                .accounts
                .iter()
                .map(|(&number, &balance)| AccountRecord { number, balance })
                .collect(),
        }
    }
}

pub struct Bank {
    address: String,
    snapshots: SnapshotStore,
    events: Events,
    table: Mutex<Table>,
}

impl Bank {
    /// Loads the last snapshot (or starts empty) and serves it as `address`.
    ///
    /// Discarding an unusable snapshot is reported as a `SNAPSHOT` warning.
    pub fn open(address: impl Into<String>, snapshots: SnapshotStore, events: Events) -> Self {
        let loaded = snapshots.load();
        if let Some(error) = &loaded.discarded {
            events.warn(
                "SNAPSHOT",
                format!("{error}; starting from an empty account table"),
            );
        }
        Self::from_state(address, loaded.state, snapshots, events)
    }

    /// Builds a bank from an already-loaded state.
    ///
    /// Records that break the account invariants are dropped with a warning,
    /// and the allocation cursor is raised to at least the highest number
    /// present so numbers are never handed out twice.
    pub fn from_state(
        address: impl Into<String>,
        state: NodeState,
        snapshots: SnapshotStore,
        events: Events,
    ) -> Self {
        let address = address.into();
        if !state.address.is_empty() && state.address != address {
            events.warn(
                "SNAPSHOT",
                format!(
                    "snapshot was written by {}, now serving it as {address}",
                    state.address
                ),
            );
        }

        let mut table = Table {
            last_assigned: state.last_assigned_number,
            accounts: BTreeMap::new(),
        };
        for record in state.accounts {
            if !in_range(record.number) || record.balance < 0 {
                events.warn(
                    "SNAPSHOT",
                    format!(
                        "ignoring invalid account {} with balance {}",
                        record.number, record.balance
                    ),
                );
                continue;
            }
            table.accounts.insert(record.number, record.balance);
        }
        if let Some(&highest) = table.accounts.keys().next_back() {
            table.last_assigned = table.last_assigned.max(highest);
        }

        Self {
            address,
            snapshots,
            events,
            table: Mutex::new(table),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn events(&self) -> &Events {
        &self.events
    }

    pub fn snapshot_path(&self) -> &Path {
        self.snapshots.path()
    }

    /// Enters the critical section. Holding the [`Ledger`] blocks every other
    /// operation on this bank.
    pub fn lock(&self) -> Ledger<'_> {
        // Every mutation is undone on failure, so a poisoned table is still consistent.
        let table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        Ledger { bank: self, table }
    }

    pub fn create_account(&self) -> Result<Account, BankError> {
        self.lock().create_account()
    }

    pub fn deposit(&self, number: u32, address: &str, amount: i64) -> Result<(), BankError> {
        self.lock().deposit(number, address, amount)
    }

    pub fn withdraw(&self, number: u32, address: &str, amount: i64) -> Result<(), BankError> {
        self.lock().withdraw(number, address, amount)
    }

    pub fn balance_of(&self, number: u32, address: &str) -> Result<i64, BankError> {
        self.lock().balance_of(number, address)
    }

    pub fn total_balance(&self) -> i128 {
        self.lock().total_balance()
    }

    pub fn account_count(&self) -> usize {
        self.lock().account_count()
    }

    pub fn remove_account(&self, number: u32, address: &str) -> Result<(), BankError> {
        self.lock().remove_account(number, address)
    }

    /// A consistent copy of the current state.
    pub fn snapshot(&self) -> NodeState {
        self.lock().table.to_state(&self.address)
    }
}

/// Exclusive access to a [`Bank`]'s table.
pub struct Ledger<'a> {
    bank: &'a Bank,
    table: MutexGuard<'a, Table>,
}

impl Ledger<'_> {
    pub fn create_account(&mut self) -> Result<Account, BankError> {
        let previous = self.table.last_assigned;
        let number = if previous < ACCOUNT_NUMBER_MIN {
            ACCOUNT_NUMBER_MIN
        } else {
            previous.saturating_add(1)
        };
        if number > ACCOUNT_NUMBER_MAX {
            return Err(BankError::NumbersExhausted);
        }

        self.table.last_assigned = number;
        self.table.accounts.insert(number, 0);
        self.persist(|table| {
            table.accounts.remove(&number);
            table.last_assigned = previous;
        })?;

        self.bank.events.info(
            "AC",
            format!("Created account {number}/{}", self.bank.address),
        );
        Ok(Account { number, balance: 0 })
    }

    pub fn deposit(&mut self, number: u32, address: &str, amount: i64) -> Result<(), BankError> {
        self.ensure_local(address)?;
        ensure_non_negative(amount)?;
        let previous = self.balance_mut(number).map(|balance| *balance)?;
        let updated = previous
            .checked_add(amount)
            .ok_or(BankError::BalanceOverflow)?;

        self.table.accounts.insert(number, updated);
        self.persist(|table| {
            table.accounts.insert(number, previous);
        })?;

        self.bank.events.info(
            "AD",
            format!("Deposited {amount} to {number}/{}", self.bank.address),
        );
        Ok(())
    }

    pub fn withdraw(&mut self, number: u32, address: &str, amount: i64) -> Result<(), BankError> {
        self.ensure_local(address)?;
        ensure_non_negative(amount)?;
        let previous = self.balance_mut(number).map(|balance| *balance)?;
        if previous < amount {
            return Err(BankError::InsufficientFunds);
        }

        self.table.accounts.insert(number, previous - amount);
        self.persist(|table| {
            table.accounts.insert(number, previous);
        })?;

        self.bank.events.info(
            "AW",
            format!("Withdrew {amount} from {number}/{}", self.bank.address),
        );
        Ok(())
    }

    pub fn balance_of(&mut self, number: u32, address: &str) -> Result<i64, BankError> {
        self.ensure_local(address)?;
        self.balance_mut(number).map(|balance| *balance)
    }

    pub fn total_balance(&self) -> i128 {
        self.table
            .accounts
            .values()
            .map(|&balance| i128::from(balance))
            .sum()
    }

    pub fn account_count(&self) -> usize {
        self.table.accounts.len()
    }

    pub fn remove_account(&mut self, number: u32, address: &str) -> Result<(), BankError> {
        self.ensure_local(address)?;
        let balance = self.balance_mut(number).map(|balance| *balance)?;
        if balance != 0 {
            return Err(BankError::NonZeroBalance);
        }

        self.table.accounts.remove(&number);
        self.persist(|table| {
            table.accounts.insert(number, balance);
        })?;

        self.bank.events.info(
            "AR",
            format!("Removed account {number}/{}", self.bank.address),
        );
        Ok(())
    }

    fn ensure_local(&self, address: &str) -> Result<(), BankError> {
        if address == self.bank.address {
            Ok(())
        } else {
            Err(BankError::ForeignAddress(address.to_string()))
        }
    }

    fn balance_mut(&mut self, number: u32) -> Result<&mut i64, BankError> {
        if !in_range(number) {
            return Err(BankError::AccountOutOfRange);
        }
        self.table
            .accounts
            .get_mut(&number)
            .ok_or(BankError::AccountNotFound)
    }

    /// Writes the snapshot, running `undo` on the table if the write fails.
    fn persist(&mut self, undo: impl FnOnce(&mut Table)) -> Result<(), BankError> {
        let state = self.table.to_state(&self.bank.address);
        if let Err(err) = self.bank.snapshots.save_atomic(&state) {
            undo(&mut *self.table);
            self.bank.events.error("SNAPSHOT", err.to_string());
            return Err(err.into());
        }
        Ok(())
    }
}

fn in_range(number: u32) -> bool {
    (ACCOUNT_NUMBER_MIN..=ACCOUNT_NUMBER_MAX).contains(&number)
}

fn ensure_non_negative(amount: i64) -> Result<(), BankError> {
    if amount < 0 {
        Err(BankError::NegativeAmount)
    } else {
        Ok(())
    }
}
