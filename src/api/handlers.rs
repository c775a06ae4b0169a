use actix_web::{web, HttpResponse, Responder};
use log::warn;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::blockchain::transaction::{sum_values, TransactionError};
use crate::blockchain::{Address, BlockSummary, Blockchain, BlockchainError, TxOutput};

/// Data structure for the blockchain state
pub type BlockchainData = web::Data<Blockchain>;

/// Response for the chain endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct ChainResponse {
    /// The number of blocks in the chain
    pub length: usize,

    /// The blocks in the chain, tip first
    pub chain: Vec<BlockSummary>,

    /// Whether every block links to its predecessor with a valid proof of work
    pub is_valid: bool,
}

/// Response for the balance endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct BalanceResponse {
    pub address: String,

    /// Sum of the unspent outputs
    pub balance: u64,

    /// The unspent outputs owned by the address
    pub utxos: Vec<TxOutput>,
}

/// Request for the send endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct SendRequest {
    /// The sender's address
    pub from: String,

    /// The recipient's address
    pub to: String,

    /// The amount to transfer
    pub amount: u64,
}

/// Response for the send endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct SendResponse {
    /// The message
    pub message: String,

    /// The block holding the transfer
    pub block: BlockSummary,
}

fn error_response(context: &str, err: BlockchainError) -> HttpResponse {
    warn!("{}: {}", context, err);

    let body = serde_json::json!({
        "error": format!("{}: {}", context, err)
    });

    match err {
        BlockchainError::TransactionError(TransactionError::InsufficientFunds { .. })
        | BlockchainError::TransactionError(TransactionError::InvalidAmount(_)) => {
            HttpResponse::BadRequest().json(body)
        }
        _ => HttpResponse::InternalServerError().json(body),
    }
}

/// Runs a chain operation on the blocking thread pool.
///
/// Chain reads hit sled and mining is CPU bound; neither may stall the async
/// workers.
async fn run_blocking<T, F>(blockchain: &BlockchainData, op: F) -> Result<T, BlockchainError>
where
    F: FnOnce(&Blockchain) -> Result<T, BlockchainError> + Send + 'static,
    T: Send + 'static,
{
    let chain = blockchain.clone();
    web::block(move || op(&chain))
        .await
        .map_err(|e| BlockchainError::SystemError(e.to_string()))?
}

/// Get the full blockchain
///
/// Returns a summary of every block, tip first, and the chain's validity
#[utoipa::path(
    get,
    path = "/api/v1/chain",
    responses(
        (status = 200, description = "Blockchain retrieved successfully", body = ChainResponse),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn get_chain(blockchain: BlockchainData) -> impl Responder {
    let result = run_blocking(&blockchain, |chain| Ok((chain.dump_chain()?, chain.is_valid()?))).await;
    let (chain, is_valid) = match result {
        Ok(read) => read,
        Err(err) => return error_response("Failed to read chain", err),
    };

    let response = ChainResponse {
        length: chain.len(),
        chain,
        is_valid,
    };

    HttpResponse::Ok().json(response)
}

/// Check if the blockchain is valid
///
/// Validates the entire blockchain
#[utoipa::path(
    get,
    path = "/api/v1/validate",
    responses(
        (status = 200, description = "Blockchain validation status", body = bool),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn validate_chain(blockchain: BlockchainData) -> impl Responder {
    match run_blocking(&blockchain, |chain| chain.is_valid()).await {
        Ok(is_valid) => HttpResponse::Ok().json(is_valid),
        Err(err) => error_response("Failed to validate chain", err),
    }
}

/// Get the balance of an address
///
/// Returns the balance and the unspent outputs of an address
#[utoipa::path(
    get,
    path = "/api/v1/balance/{address}",
    params(
        ("address" = String, Path, description = "Address to query")
    ),
    responses(
        (status = 200, description = "Balance retrieved successfully", body = BalanceResponse),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn get_balance(
    blockchain: BlockchainData,
    address: web::Path<String>,
) -> impl Responder {
    let address = Address(address.into_inner());
    let owner = address.clone();

    let result = run_blocking(&blockchain, move |chain| {
        let utxos = chain.find_utxo(&owner)?;
        let balance = sum_values(&utxos)?;
        Ok((utxos, balance))
    })
    .await;

    match result {
        Ok((utxos, balance)) => HttpResponse::Ok().json(BalanceResponse {
            balance,
            address: address.0,
            utxos,
        }),
        Err(err) => error_response("Failed to compute balance", err),
    }
}

/// Send coins
///
/// Builds a transfer and mines it into a new block
#[utoipa::path(
    post,
    path = "/api/v1/send",
    request_body = SendRequest,
    responses(
        (status = 200, description = "Transfer mined successfully", body = SendResponse),
        (status = 400, description = "Invalid transfer"),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn send(
    blockchain: BlockchainData,
    send_req: web::Json<SendRequest>,
) -> impl Responder {
    let send_req = send_req.into_inner();
    let from: Address = match send_req.from.parse() {
        Ok(address) => address,
        Err(err) => {
            return HttpResponse::BadRequest().json(serde_json::json!({
                "error": format!("Invalid sender: {}", err)
            }));
        }
    };
    let to: Address = match send_req.to.parse() {
        Ok(address) => address,
        Err(err) => {
            return HttpResponse::BadRequest().json(serde_json::json!({
                "error": format!("Invalid recipient: {}", err)
            }));
        }
    };

    let amount = send_req.amount;
    let result = run_blocking(&blockchain, move |chain| chain.send(&from, &to, amount)).await;

    match result {
        Ok(block) => HttpResponse::Ok().json(SendResponse {
            message: "Send successfully!".to_string(),
            block: BlockSummary::from_block(&block, blockchain.config().difficulty),
        }),
        Err(err) => error_response("Failed to send", err),
    }
}
