use std::path::{Path, PathBuf};

use actix_cors::Cors;
use actix_web::{middleware, web, App, HttpServer};
use anyhow::Context;
use clap::{Parser, Subcommand};
use log::info;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use pow_ledger::api;
use pow_ledger::blockchain::{self, proof::DEFAULT_DIFFICULTY, Address, Blockchain, BlockchainStorage, ChainConfig};

/// Command line arguments for the ledger.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Path to the block store
    #[clap(long, default_value = "./tmp/blocks")]
    db_path: PathBuf,

    /// Leading zero bits required in block hashes of a new chain; an
    /// existing chain keeps the difficulty it was created with
    #[clap(long, default_value_t = DEFAULT_DIFFICULTY)]
    difficulty: u32,

    /// Threads used to search for nonces
    #[clap(long, default_value_t = 1)]
    workers: usize,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a blockchain and send the genesis reward to ADDRESS
    #[clap(name = "createblockchain")]
    CreateBlockchain {
        #[clap(long)]
        address: Address,
    },

    /// Get the balance of ADDRESS
    #[clap(name = "getbalance")]
    GetBalance {
        #[clap(long)]
        address: Address,
    },

    /// Send AMOUNT from one address to another
    Send {
        #[clap(long)]
        from: Address,

        #[clap(long)]
        to: Address,

        #[clap(long)]
        amount: u64,
    },

    /// Print the blocks in the chain, newest first
    Print,

    /// List every raw entry in the block store
    #[clap(name = "dbcheck")]
    DbCheck,

    /// Serve the HTTP API
    Serve {
        #[clap(long, default_value = "127.0.0.1:8080")]
        bind: String,
    },
}

#[derive(OpenApi)]
#[openapi(
    paths(
        api::handlers::get_chain,
        api::handlers::validate_chain,
        api::handlers::get_balance,
        api::handlers::send
    ),
    components(
        schemas(
            blockchain::BlockSummary,
            blockchain::TxOutput,
            blockchain::Address,
            api::handlers::ChainResponse,
            api::handlers::BalanceResponse,
            api::handlers::SendRequest,
            api::handlers::SendResponse
        )
    ),
    tags(
        (name = "ledger", description = "Ledger API endpoints")
    ),
    info(
        title = "Ledger API",
        version = "1.0.0",
        description = "A single-node proof-of-work ledger",
        license(
            name = "MIT",
            url = "https://opensource.org/licenses/MIT"
        )
    )
)]
struct ApiDoc;

fn open_storage(path: &Path) -> anyhow::Result<BlockchainStorage> {
    std::fs::create_dir_all(path)
        .with_context(|| format!("Failed to create data directory {}", path.display()))?;
    BlockchainStorage::new(path)
        .with_context(|| format!("Failed to open block store at {}", path.display()))
}

fn continue_chain(args: &Args, config: ChainConfig) -> anyhow::Result<Blockchain> {
    let storage = open_storage(&args.db_path)?;
    Blockchain::open(storage, config).context("No existing blockchain found! Please create one")
}

fn print_chain(chain: &Blockchain) -> anyhow::Result<()> {
    for summary in chain.dump_chain()? {
        println!("Previous Hash: {}", summary.prev_hash);
        println!("Hash: {}", summary.hash);
        println!("POW: {}", summary.pow_valid);
        println!();
    }
    Ok(())
}

async fn serve(chain: Blockchain, bind: &str) -> anyhow::Result<()> {
    let blockchain = web::Data::new(chain);

    info!("Starting HTTP server at http://{}", bind);

    HttpServer::new(move || {
        // Configure CORS
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .wrap(middleware::Logger::default())
            .wrap(cors)
            .app_data(blockchain.clone())
            .configure(api::configure_routes)
            .service(
                SwaggerUi::new("/swagger-ui/{_:.*}")
                    .url("/api-docs/openapi.json", ApiDoc::openapi())
            )
    })
    .bind(bind)
    .with_context(|| format!("Failed to bind {}", bind))?
    .run()
    .await?;

    Ok(())
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logger
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let args = Args::parse();
    let config = ChainConfig::default()
        .with_difficulty(args.difficulty)
        .with_mining_workers(args.workers);
    config.validate()?;

    match &args.command {
        Command::CreateBlockchain { address } => {
            let storage = open_storage(&args.db_path)?;
            Blockchain::init(storage, config, address)?;
            println!("Finished!");
        }
        Command::GetBalance { address } => {
            let chain = continue_chain(&args, config)?;
            println!("Balance of {}: {}", address, chain.balance(address)?);
        }
        Command::Send { from, to, amount } => {
            let chain = continue_chain(&args, config)?;
            chain.send(from, to, *amount)?;
            println!("Send successfully!");
        }
        Command::Print => {
            let chain = continue_chain(&args, config)?;
            print_chain(&chain)?;
        }
        Command::DbCheck => {
            let storage = open_storage(&args.db_path)?;
            for (key, len) in storage.entries()? {
                println!("key={}, value_len={}", hex::encode(key), len);
            }
        }
        Command::Serve { bind } => {
            let chain = continue_chain(&args, config)?;
            serve(chain, bind).await?;
        }
    }

    Ok(())
}
