use actix::Actor;
use actix_web::middleware::Logger;
use actix_web::web::Data;
use actix_web::{App, HttpServer};
use anyhow::Context;
use env_logger::Env;
use livepoll::db::{get_db_pool, init_db};
use livepoll::vote::VoteService;
use livepoll::web::poll_ws::PollServer;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    init_lib_mods();
    livepoll::app_config::init();

    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    init_db(database_url).await;

    let config = livepoll::app_config::get_config();

    // The vote service holds the dispatcher handle explicitly; handlers
    // get both through app data, never through ambient process state.
    let poll_server = PollServer::new(get_db_pool(), config.realtime.room_sweep_interval()).start();
    let vote_service = Data::new(VoteService::new(get_db_pool(), poll_server.clone()));
    let poll_server = Data::new(poll_server);

    log::info!("Listening on {}", config.server.listen);

    HttpServer::new(move || {
        App::new()
            .app_data(vote_service.clone())
            .app_data(poll_server.clone())
            .wrap(Logger::new("%a %{User-Agent}i"))
            .configure(livepoll::web::configure)
    })
    .bind(&config.server.listen)?
    .run()
    .await?;

    Ok(())
}

/// Initialize third party crates we rely on but don't have control over.
fn init_lib_mods() {
    dotenv::dotenv().ok();
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
}
