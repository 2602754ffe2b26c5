use agenda_printer::pipeline::Pipeline;
use agenda_printer::scheduler::{AgendaScheduler, ScheduleTrigger};
use agenda_printer::signals::shutdown_signal;
use agenda_printer::AppConfig;
use anyhow::Context;
use clap::Parser;
use dotenv::dotenv;
use std::sync::Arc;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Print today's agenda once and exit instead of running on the schedule
    #[arg(short, long)]
    now: bool,
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let cli = Cli::parse();

    let config = AppConfig::load().context("failed to load configuration")?;
    let pipeline = Pipeline::from_config(&config)?;

    if cli.now {
        log::info!("running agenda once");
        pipeline.run_once().await?;
        return Ok(());
    }

    let trigger = ScheduleTrigger::from_config(&config.schedule)?;
    let mut scheduler = AgendaScheduler::new(&trigger, Arc::new(pipeline));

    scheduler
        .start()
        .await
        .context("failed to start agenda scheduler")?;

    shutdown_signal().await?;

    scheduler.stop().await?;

    Ok(())
}
