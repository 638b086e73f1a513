use actix_cors::Cors;
use actix_web::{middleware, web, App, HttpServer};
use anyhow::Context;
use log::info;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

mod api;
mod blockchain;
mod config;

use config::LedgerConfig;

#[derive(OpenApi)]
#[openapi(
    paths(
        api::handlers::get_chain,
        api::handlers::validate_chain,
        api::handlers::open_account,
        api::handlers::get_all_accounts,
        api::handlers::get_account,
        api::handlers::new_transaction,
        api::handlers::get_open_transactions,
        api::handlers::mine_block,
        api::handlers::cancel_mining
    ),
    components(
        schemas(
            blockchain::Account,
            blockchain::Block,
            blockchain::Identity,
            blockchain::Transaction,
            api::handlers::ChainResponse,
            api::handlers::OpenAccountRequest,
            api::handlers::AccountResponse,
            api::handlers::TransactionRequest,
            api::handlers::TransactionResponse,
            api::handlers::MineResponse
        )
    ),
    tags(
        (name = "ledger", description = "NiceCoin ledger API endpoints")
    ),
    info(
        title = "NiceCoin API",
        version = "0.1.0",
        description = "A single-node proof-of-work ledger",
        license(
            name = "MIT",
            url = "https://opensource.org/licenses/MIT"
        )
    )
)]
struct ApiDoc;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env file is fine
    let _ = dotenvy::dotenv();

    // Initialize logger
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let config = LedgerConfig::from_env().context("invalid ledger configuration")?;
    info!(
        "Ledger config: difficulty {}, block capacity {}, starting balance {}, {:?} store at {}",
        config.difficulty,
        config.block_capacity,
        config.starting_balance,
        config.store,
        config.data_path.display()
    );

    let store = blockchain::open_store(&config)
        .with_context(|| format!("failed to open store at {}", config.data_path.display()))?;
    let state = api::AppState::new(&config, store).context("failed to build the chain")?;
    let state = web::Data::new(state);

    info!("Starting HTTP server at http://{}:{}", config.host, config.port);

    HttpServer::new(move || {
        // Configure CORS
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        // Configure OpenAPI documentation
        let openapi = ApiDoc::openapi();

        App::new()
            .wrap(middleware::Logger::default())
            .wrap(cors)
            .app_data(state.clone())
            // API routes
            .configure(api::configure_routes)
            // Swagger UI
            .service(
                SwaggerUi::new("/swagger-ui/{_:.*}")
                    .url("/api-docs/openapi.json", openapi.clone())
            )
    })
    .bind((config.host.as_str(), config.port))?
    .run()
    .await?;

    Ok(())
}
