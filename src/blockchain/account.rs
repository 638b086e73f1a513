use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

use std::fmt;
use std::sync::Arc;

/// Errors that can occur during account operations
#[derive(Debug, Error)]
pub enum AccountError {
    #[error("Account not found: {0}")]
    AccountNotFound(String),

    #[error("Account already exists: {0}")]
    AccountExists(String),

    #[error("Insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: u64, available: u64 },

    #[error("Balance overflow: {balance} + {amount}")]
    BalanceOverflow { balance: u64, amount: u64 },
}

/// Unique name of an account holder
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema)]
pub struct Identity(pub String);

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Identity {
    fn from(s: &str) -> Self {
        Identity(s.to_string())
    }
}

/// Represents an account holding NiceCoins
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Account {
    /// The account's identity
    pub identity: Identity,

    /// The account's live balance
    pub balance: u64,
}

impl Account {
    /// Creates a new account
    ///
    /// # Arguments
    ///
    /// * `identity` - The account's identity
    /// * `starting_balance` - The balance every account is opened with
    pub fn new(identity: impl Into<Identity>, starting_balance: u64) -> Self {
        Account {
            identity: identity.into(),
            balance: starting_balance,
        }
    }

    /// Decreases the account's balance
    ///
    /// Fails without touching the balance when `amount` exceeds it.
    pub fn debit(&mut self, amount: u64) -> Result<(), AccountError> {
        if amount > self.balance {
            return Err(AccountError::InsufficientFunds {
                required: amount,
                available: self.balance,
            });
        }

        self.balance -= amount;
        Ok(())
    }

    /// Increases the account's balance
    pub fn credit(&mut self, amount: u64) -> Result<(), AccountError> {
        self.balance = self
            .balance
            .checked_add(amount)
            .ok_or(AccountError::BalanceOverflow {
                balance: self.balance,
                amount,
            })?;
        Ok(())
    }
}

impl fmt::Display for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} currently has {} NiceCoins.", self.identity, self.balance)
    }
}

/// Registry of every opened account, keyed by identity
#[derive(Debug, Clone)]
pub struct AccountState {
    accounts: Arc<DashMap<Identity, Account>>,
    starting_balance: u64,
}

impl AccountState {
    /// Creates an empty registry whose accounts open with `starting_balance`
    pub fn new(starting_balance: u64) -> Self {
        AccountState {
            accounts: Arc::new(DashMap::new()),
            starting_balance,
        }
    }

    /// Opens a new account with the starting balance
    ///
    /// # Returns
    ///
    /// The new account, or `AccountExists` if the identity is taken
    pub fn open_account(&self, identity: Identity) -> Result<Account, AccountError> {
        match self.accounts.entry(identity.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(AccountError::AccountExists(identity.0))
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let account = Account::new(identity, self.starting_balance);
                entry.insert(account.clone());
                Ok(account)
            }
        }
    }

    /// Gets a snapshot of an account by identity
    pub fn get_account(&self, identity: &Identity) -> Result<Account, AccountError> {
        self.accounts
            .get(identity)
            .map(|account| account.clone())
            .ok_or_else(|| AccountError::AccountNotFound(identity.0.clone()))
    }

    /// Writes an account snapshot back into the registry
    pub fn update_account(&self, account: Account) {
        self.accounts.insert(account.identity.clone(), account);
    }

    /// Gets all accounts, ordered by identity
    pub fn get_all_accounts(&self) -> Vec<Account> {
        let mut accounts: Vec<Account> = self
            .accounts
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        accounts.sort_by(|a, b| a.identity.cmp(&b.identity));
        accounts
    }
}
