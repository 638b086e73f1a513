use actix_web::web;

use super::handlers;

/// Configures the API routes
///
/// # Arguments
///
/// * `cfg` - The service configuration
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            .route("/chain", web::get().to(handlers::get_chain))
            .route("/validate", web::get().to(handlers::validate_chain))
            .route("/accounts", web::post().to(handlers::open_account))
            .route("/accounts", web::get().to(handlers::get_all_accounts))
            .route("/accounts/{identity}", web::get().to(handlers::get_account))
            .route("/transactions", web::post().to(handlers::new_transaction))
            .route("/transactions/open", web::get().to(handlers::get_open_transactions))
            .route("/mine", web::post().to(handlers::mine_block))
            .route("/mine/cancel", web::post().to(handlers::cancel_mining))
    );
}
