//! Quota ledger interface and an in-memory implementation.
//!
//! The relay reserves quota before contacting a backend and later either
//! releases the reservation (failure) or settles it against the measured
//! usage (success). [`QuotaReservation`] is neither `Clone` nor `Copy`, and
//! both `release` and `settle` take it by value, so a handle can end its
//! life exactly one way.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Mutex;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::{RelayError, Result};

/// Ledger events kept by [`InMemoryLedger`] (most recent).
pub const HISTORY_WINDOW: usize = 4096;

/// Handle for a tentative debit.
#[derive(Debug, PartialEq, Eq)]
pub struct QuotaReservation {
    id: Uuid,
    account: String,
    amount: i64,
}

impl QuotaReservation {
    /// Create a handle. Only ledgers should mint these.
    pub fn new(account: &str, amount: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            account: account.to_string(),
            amount,
        }
    }

    /// Unique id of the reservation.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Account debited.
    pub fn account(&self) -> &str {
        &self.account
    }

    /// Amount debited.
    pub fn amount(&self) -> i64 {
        self.amount
    }
}

impl fmt::Display for QuotaReservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.account, self.id, self.amount)
    }
}

/// Result of a settlement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settlement {
    /// Amount originally reserved.
    pub reserved: i64,
    /// Amount actually owed.
    pub actual: i64,
    /// `actual - reserved`; negative means credited back.
    pub delta: i64,
    /// Account balance afterwards; may be negative.
    pub balance: i64,
}

/// Prepaid quota store.
///
/// Implementations must serialize concurrent operations on the same account.
#[async_trait]
pub trait QuotaLedger: Send + Sync {
    /// Debit `amount` from `account`, failing with `InsufficientBalance` when
    /// the balance cannot cover it.
    async fn reserve(&self, account: &str, amount: i64) -> Result<QuotaReservation>;

    /// Credit the full reservation back.
    async fn release(&self, reservation: QuotaReservation) -> Result<()>;

    /// Reconcile the reservation against the amount actually owed.
    async fn settle(&self, reservation: QuotaReservation, actual: i64) -> Result<Settlement>;
}

/// Ledger operation, as recorded by [`InMemoryLedger`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerEvent {
    /// Reservation created.
    Reserved {
        /// Reservation id.
        id: Uuid,
        /// Amount debited.
        amount: i64,
    },
    /// Reservation credited back in full.
    Released {
        /// Reservation id.
        id: Uuid,
    },
    /// Reservation reconciled.
    Settled {
        /// Reservation id.
        id: Uuid,
        /// Amount owed.
        actual: i64,
    },
}

#[derive(Debug, Default)]
struct LedgerState {
    balances: HashMap<String, i64>,
    outstanding: HashMap<Uuid, (String, i64)>,
    history: VecDeque<LedgerEvent>,
}

impl LedgerState {
    fn record(&mut self, event: LedgerEvent) {
        self.history.push_back(event);
        if self.history.len() > HISTORY_WINDOW {
            self.history.pop_front();
        }
    }
}

/// Process-local ledger; one lock over all accounts.
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    state: Mutex<LedgerState>,
}

impl InMemoryLedger {
    /// Empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ledger seeded with account balances.
    pub fn with_accounts<I, S>(accounts: I) -> Self
    where
        I: IntoIterator<Item = (S, i64)>,
        S: Into<String>,
    {
        let ledger = Self::new();
        for (account, balance) in accounts {
            ledger.deposit(&account.into(), balance);
        }
        ledger
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LedgerState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Add quota to an account, creating it if needed.
    pub fn deposit(&self, account: &str, amount: i64) {
        *self.lock().balances.entry(account.to_string()).or_insert(0) += amount;
    }

    /// Current balance, if the account exists.
    pub fn balance(&self, account: &str) -> Option<i64> {
        self.lock().balances.get(account).copied()
    }

    /// Reservations neither released nor settled.
    pub fn outstanding(&self) -> usize {
        self.lock().outstanding.len()
    }

    /// Most recent operations, oldest first, up to [`HISTORY_WINDOW`].
    pub fn history(&self) -> Vec<LedgerEvent> {
        self.lock().history.iter().cloned().collect()
    }

    fn take(state: &mut LedgerState, reservation: &QuotaReservation) -> Result<(String, i64)> {
        match state.outstanding.remove(&reservation.id) {
            Some(entry) => Ok(entry),
            None => {
                tracing::error!(reservation = %reservation, "Ledger does not hold reservation");
                Err(RelayError::UnknownReservation(reservation.to_string()))
            },
        }
    }
}

#[async_trait]
impl QuotaLedger for InMemoryLedger {
    async fn reserve(&self, account: &str, amount: i64) -> Result<QuotaReservation> {
        let mut state = self.lock();

        let balance = state
            .balances
            .get_mut(account)
            .ok_or_else(|| RelayError::UnknownAccount(account.to_string()))?;

        if *balance < amount {
            return Err(RelayError::InsufficientBalance {
                account: account.to_string(),
                required: amount,
                available: *balance,
            });
        }
        *balance -= amount;

        let reservation = QuotaReservation::new(account, amount);
        state
            .outstanding
            .insert(reservation.id, (account.to_string(), amount));
        state.record(LedgerEvent::Reserved {
            id: reservation.id,
            amount,
        });

        Ok(reservation)
    }

    async fn release(&self, reservation: QuotaReservation) -> Result<()> {
        let mut state = self.lock();
        let (account, amount) = Self::take(&mut state, &reservation)?;

        *state.balances.entry(account).or_insert(0) += amount;
        state.record(LedgerEvent::Released { id: reservation.id });

        Ok(())
    }

    async fn settle(&self, reservation: QuotaReservation, actual: i64) -> Result<Settlement> {
        let mut state = self.lock();
        let (account, reserved) = Self::take(&mut state, &reservation)?;

        let delta = actual - reserved;
        let balance = state.balances.entry(account).or_insert(0);
        // Extra debit is never refused: the call already happened.
        *balance -= delta;
        let balance = *balance;

        state.record(LedgerEvent::Settled {
            id: reservation.id,
            actual,
        });

        Ok(Settlement {
            reserved,
            actual,
            delta,
            balance,
        })
    }
}
