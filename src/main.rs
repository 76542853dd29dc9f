use std::sync::Arc;

use dotenvy::dotenv;
use snafu::ResultExt;

use hoshiyomi::database::SurrealStore;
use hoshiyomi::error::{
    ApplicationError, ConnectDatabaseSnafu, SchedulerStoppedSnafu, WaitForSignalSnafu,
};
use hoshiyomi::pipeline::Pipeline;
use hoshiyomi::push::WebPush;
use hoshiyomi::scheduler::Scheduler;
use hoshiyomi::time::SystemClock;
use hoshiyomi::{config, logger, youtube};

#[tokio::main]
async fn main() -> Result<(), ApplicationError> {
    dotenv().ok();

    let config = config::load()?;

    let _guard = logger::init(&config.log_dir)?;

    let store = SurrealStore::connect(&config.database)
        .await
        .context(ConnectDatabaseSnafu)?;
    let youtube = youtube::connect(&config.youtube)?;
    let push = WebPush::new(&config.push)?;

    let pipeline = Pipeline::new(
        Arc::new(store),
        Arc::new(youtube),
        Arc::new(push),
        SystemClock,
        &config.stats,
        config.schedule.utc_offset,
    );
    let scheduler = Scheduler::new(Arc::new(pipeline), config.schedule, SystemClock).spawn();

    tokio::signal::ctrl_c().await.context(WaitForSignalSnafu)?;
    tracing::info!("shutting down");

    scheduler.shutdown().await.context(SchedulerStoppedSnafu)
}
