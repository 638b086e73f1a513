use actix_web::{web, HttpResponse, Responder};
use log::{error, info};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use std::sync::{Mutex, MutexGuard, TryLockError};

use crate::blockchain::{
    Account, AccountError, AccountState, Block, BlockError, Blockchain, BlockchainError,
    ChainStore, Identity, MiningHandle, Transaction,
};
use crate::config::LedgerConfig;

/// Shared ledger state behind the HTTP handlers
///
/// Every chain mutation holds the chain lock, which also serialises the
/// account snapshot / write-back around a transaction. Mining holds the lock
/// for the whole proof-of-work search.
pub struct AppState {
    pub chain: Mutex<Blockchain>,
    pub accounts: AccountState,
    pub mining: MiningHandle,
}

impl AppState {
    pub fn new(
        config: &LedgerConfig,
        store: Box<dyn ChainStore>,
    ) -> Result<Self, BlockchainError> {
        let chain = Blockchain::new(config, store)?;
        let mining = chain.cancel_handle();
        let accounts = AccountState::new(chain.starting_balance());

        Ok(AppState {
            chain: Mutex::new(chain),
            accounts,
            mining,
        })
    }
}

/// Data structure for the ledger state
pub type LedgerData = web::Data<AppState>;

/// Takes the chain lock without waiting
///
/// A mining run holds the lock until it finishes, so a busy lock answers
/// 409 instead of parking an async worker behind the search.
fn lock_chain(state: &AppState) -> Result<MutexGuard<'_, Blockchain>, HttpResponse> {
    state.chain.try_lock().map_err(|err| match err {
        TryLockError::WouldBlock => HttpResponse::Conflict().json(serde_json::json!({
            "error": "Mining in progress"
        })),
        TryLockError::Poisoned(_) => {
            error!("Chain lock poisoned");
            HttpResponse::InternalServerError().json(serde_json::json!({
                "error": "Chain state is unavailable"
            }))
        }
    })
}

fn account_error_response(err: &AccountError) -> HttpResponse {
    let body = serde_json::json!({ "error": err.to_string() });
    match err {
        AccountError::AccountNotFound(_) => HttpResponse::NotFound().json(body),
        AccountError::AccountExists(_) => HttpResponse::Conflict().json(body),
        AccountError::InsufficientFunds { .. } | AccountError::BalanceOverflow { .. } => {
            HttpResponse::BadRequest().json(body)
        }
    }
}

fn chain_error_response(err: &BlockchainError) -> HttpResponse {
    let body = serde_json::json!({ "error": err.to_string() });
    match err {
        BlockchainError::AccountError(err) => account_error_response(err),
        BlockchainError::DoubleSpendRejected { .. } | BlockchainError::InvalidAmount(_) => {
            HttpResponse::BadRequest().json(body)
        }
        BlockchainError::BlockFull { .. } => HttpResponse::Conflict().json(body),
        BlockchainError::BlockError(BlockError::InvalidCapacity(_)) => {
            HttpResponse::InternalServerError().json(body)
        }
        BlockchainError::BlockError(_) => HttpResponse::Conflict().json(body),
        BlockchainError::StorageError(_) | BlockchainError::ConfigError(_) => {
            HttpResponse::InternalServerError().json(body)
        }
    }
}

/// Response for the chain endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct ChainResponse {
    /// The length of the chain
    pub length: usize,

    /// The blocks in the chain
    pub chain: Vec<Block>,

    /// Whether the chain is valid
    pub is_valid: bool,

    /// Leading zero hex characters required of a mined hash
    pub difficulty: usize,

    /// Transactions per block
    pub block_capacity: usize,

    /// Balance new accounts are opened with
    pub starting_balance: u64,

    /// Hash of the most recently mined block, absent before the first mine
    pub last_mined_hash: Option<String>,

    /// Human-readable view of the current and previous blocks
    pub summary: String,
}

/// Get the full blockchain
///
/// Returns the entire blockchain and its validity status
#[utoipa::path(
    get,
    path = "/api/v1/chain",
    responses(
        (status = 200, description = "Blockchain retrieved successfully", body = ChainResponse),
        (status = 409, description = "Mining in progress"),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn get_chain(state: LedgerData) -> impl Responder {
    let chain = match lock_chain(&state) {
        Ok(chain) => chain,
        Err(response) => return response,
    };

    let response = ChainResponse {
        length: chain.blocks().len(),
        chain: chain.blocks().to_vec(),
        is_valid: chain.is_valid(),
        difficulty: chain.difficulty(),
        block_capacity: chain.capacity(),
        starting_balance: chain.starting_balance(),
        last_mined_hash: chain.last_mined_block().map(|block| block.hash.clone()),
        summary: chain.to_string(),
    };

    HttpResponse::Ok().json(response)
}

/// Check if the blockchain is valid
///
/// Recomputes every mined block's hash and checks the hash links
#[utoipa::path(
    get,
    path = "/api/v1/validate",
    responses(
        (status = 200, description = "Blockchain validation status", body = bool),
        (status = 409, description = "Mining in progress")
    )
)]
pub async fn validate_chain(state: LedgerData) -> impl Responder {
    match lock_chain(&state) {
        Ok(chain) => HttpResponse::Ok().json(chain.is_valid()),
        Err(response) => response,
    }
}

/// Request for the open account endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct OpenAccountRequest {
    /// The new account's identity
    pub identity: String,
}

/// Response describing an account
#[derive(Serialize, Deserialize, ToSchema)]
pub struct AccountResponse {
    /// The identity of the account
    pub identity: String,

    /// The live balance of the account
    pub balance: u64,

    /// The balance rebuilt from chain history, absent without history
    pub reconstructed_balance: Option<i64>,

    /// Human-readable summary
    pub summary: String,
}

impl AccountResponse {
    fn new(account: Account, chain: &Blockchain) -> Self {
        let reconstructed_balance = chain
            .reconstructed_balance(&account.identity)
            .and_then(|balance| i64::try_from(balance).ok());

        AccountResponse {
            summary: account.to_string(),
            identity: account.identity.0,
            balance: account.balance,
            reconstructed_balance,
        }
    }
}

/// Open an account
///
/// Creates an account holding the configured starting balance
#[utoipa::path(
    post,
    path = "/api/v1/accounts",
    request_body = OpenAccountRequest,
    responses(
        (status = 201, description = "Account opened successfully", body = Account),
        (status = 400, description = "Invalid identity"),
        (status = 409, description = "Account already exists")
    )
)]
pub async fn open_account(
    state: LedgerData,
    account_req: web::Json<OpenAccountRequest>,
) -> impl Responder {
    let identity = account_req.identity.trim();
    if identity.is_empty() {
        return HttpResponse::BadRequest().json(serde_json::json!({
            "error": "Identity must not be empty"
        }));
    }

    match state.accounts.open_account(Identity::from(identity)) {
        Ok(account) => {
            info!("Opened account {}", account);
            HttpResponse::Created().json(account)
        }
        Err(err) => account_error_response(&err),
    }
}

/// Get all accounts
///
/// Returns every opened account with its live and reconstructed balance
#[utoipa::path(
    get,
    path = "/api/v1/accounts",
    responses(
        (status = 200, description = "Accounts retrieved successfully", body = Vec<AccountResponse>)
    )
)]
pub async fn get_all_accounts(state: LedgerData) -> impl Responder {
    let chain = match lock_chain(&state) {
        Ok(chain) => chain,
        Err(response) => return response,
    };

    let account_responses: Vec<AccountResponse> = state
        .accounts
        .get_all_accounts()
        .into_iter()
        .map(|account| AccountResponse::new(account, &chain))
        .collect();

    HttpResponse::Ok().json(account_responses)
}

/// Get an account
///
/// Returns the live and reconstructed balance of one account
#[utoipa::path(
    get,
    path = "/api/v1/accounts/{identity}",
    params(
        ("identity" = String, Path, description = "Account identity")
    ),
    responses(
        (status = 200, description = "Account retrieved successfully", body = AccountResponse),
        (status = 404, description = "Account not found")
    )
)]
pub async fn get_account(state: LedgerData, identity: web::Path<String>) -> impl Responder {
    let identity = Identity(identity.into_inner());

    let chain = match lock_chain(&state) {
        Ok(chain) => chain,
        Err(response) => return response,
    };

    match state.accounts.get_account(&identity) {
        Ok(account) => HttpResponse::Ok().json(AccountResponse::new(account, &chain)),
        Err(err) => account_error_response(&err),
    }
}

/// Request for the transaction endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct TransactionRequest {
    /// The sender's identity
    pub sender: String,

    /// The receiver's identity
    pub receiver: String,

    /// The amount to transfer
    pub amount: u64,
}

/// Response for the transaction endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct TransactionResponse {
    /// The message
    pub message: String,

    /// The index of the block holding this transaction
    pub block_index: u64,

    /// The admitted transaction
    pub transaction: Transaction,
}

/// Create a new transaction
///
/// Moves coins between two accounts and appends the transaction to the open block
#[utoipa::path(
    post,
    path = "/api/v1/transactions",
    request_body = TransactionRequest,
    responses(
        (status = 201, description = "Transaction admitted", body = TransactionResponse),
        (status = 400, description = "Rejected: insufficient funds, double spending or invalid amount"),
        (status = 404, description = "Unknown account"),
        (status = 409, description = "The open block is full, or mining in progress")
    )
)]
pub async fn new_transaction(
    state: LedgerData,
    transaction_req: web::Json<TransactionRequest>,
) -> impl Responder {
    if transaction_req.sender == transaction_req.receiver {
        return HttpResponse::BadRequest().json(serde_json::json!({
            "error": "Sender and receiver must be different accounts"
        }));
    }

    let mut chain = match lock_chain(&state) {
        Ok(chain) => chain,
        Err(response) => return response,
    };

    let accounts = state
        .accounts
        .get_account(&Identity(transaction_req.sender.clone()))
        .and_then(|sender| {
            state
                .accounts
                .get_account(&Identity(transaction_req.receiver.clone()))
                .map(|receiver| (sender, receiver))
        });
    let (mut sender, mut receiver) = match accounts {
        Ok(accounts) => accounts,
        Err(err) => return account_error_response(&err),
    };

    match chain.add_transaction(transaction_req.amount, &mut sender, &mut receiver) {
        Ok(transaction) => {
            state.accounts.update_account(sender);
            state.accounts.update_account(receiver);

            let response = TransactionResponse {
                message: "Transaction added to the open block".to_string(),
                block_index: chain.open_block().index,
                transaction,
            };

            HttpResponse::Created().json(response)
        }
        Err(err) => chain_error_response(&err),
    }
}

/// Get the open block's transactions
///
/// Returns the transactions waiting for the open block to be mined
#[utoipa::path(
    get,
    path = "/api/v1/transactions/open",
    responses(
        (status = 200, description = "Open transactions retrieved successfully", body = Vec<Transaction>)
    )
)]
pub async fn get_open_transactions(state: LedgerData) -> impl Responder {
    match lock_chain(&state) {
        Ok(chain) => HttpResponse::Ok().json(&chain.open_block().transactions),
        Err(response) => response,
    }
}

/// Response for the mine endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct MineResponse {
    /// The message
    pub message: String,

    /// The newly mined block
    pub block: Block,
}

enum MineFailure {
    Poisoned,
    Chain(BlockchainError),
}

/// Mine the open block
///
/// Runs proof of work on the open block and opens the next one.
/// Fails unless the open block is full.
#[utoipa::path(
    post,
    path = "/api/v1/mine",
    responses(
        (status = 200, description = "Block mined successfully", body = MineResponse),
        (status = 409, description = "Block not full, or mining cancelled"),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn mine_block(state: LedgerData) -> impl Responder {
    let worker_state = state.clone();

    // Proof of work is CPU bound, keep it off the async workers
    let result = web::block(move || {
        let mut chain = worker_state
            .chain
            .lock()
            .map_err(|_| MineFailure::Poisoned)?;
        chain
            .add_block()
            .map(|block| block.clone())
            .map_err(MineFailure::Chain)
    })
    .await;

    match result {
        Ok(Ok(block)) => HttpResponse::Ok().json(MineResponse {
            message: "New Block Mined".to_string(),
            block,
        }),
        Ok(Err(MineFailure::Chain(err))) => chain_error_response(&err),
        Ok(Err(MineFailure::Poisoned)) | Err(_) => {
            error!("Mining worker failed");
            HttpResponse::InternalServerError().json(serde_json::json!({
                "error": "Mining worker failed"
            }))
        }
    }
}

/// Cancel mining
///
/// Signals a running proof-of-work search to stop
#[utoipa::path(
    post,
    path = "/api/v1/mine/cancel",
    responses(
        (status = 202, description = "Cancellation requested")
    )
)]
pub async fn cancel_mining(state: LedgerData) -> impl Responder {
    state.mining.cancel();
    info!("Mining cancellation requested");

    HttpResponse::Accepted().json(serde_json::json!({
        "message": "Cancellation requested"
    }))
}
