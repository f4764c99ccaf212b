mod app;
mod cli;
mod config;
mod error;
mod external;
mod llm;
mod pipeline;
mod scheduler;
mod steps;
mod store;
mod tracker;
mod translate;
mod ui;
mod workspace;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use app::App;
use cli::{Cli, Command};
use config::RelayConfig;
use store::NewUnit;

fn init_logging(verbose: bool) {
    let default = if verbose { "vidrelay=debug,info" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = RelayConfig::load(cli.config.as_deref())?;
    let app = App::open(config)?;

    match cli.command {
        Command::Run => app.run().await?,
        Command::Submit {
            source_ref,
            url,
            title,
            description,
            subtitles,
        } => {
            let mut unit = NewUnit::new(source_ref);
            unit.url = url.unwrap_or_default();
            unit.title = title.unwrap_or_default();
            unit.description = description.unwrap_or_default();
            if let Some(path) = subtitles {
                unit.subtitles = App::load_cues(&path)?;
            }
            let (stored, created) = app.submit(unit)?;
            if created {
                println!("Submitted {}", stored.source_ref);
            } else {
                println!("{} already exists ({})", stored.source_ref, stored.status);
            }
        }
        Command::Status { unit_ref: None } => ui::print_units(&app.units()?),
        Command::Status {
            unit_ref: Some(unit_ref),
        } => {
            let (unit, steps, progress) = app.unit_status(&unit_ref)?;
            ui::print_unit(&unit, &steps, &progress);
        }
        Command::Retry { unit_ref, step } => {
            app.retry(&unit_ref, &step)?;
            println!("{unit_ref}/{step} reset; it runs on the next ingestion tick");
        }
        Command::Publish { unit_ref, phase } => {
            let spinner = ui::Spinner::start(&format!("Publishing {unit_ref} ({phase:?})"));
            match app.publish(&unit_ref, phase).await {
                Ok(status) => spinner.succeed(&format!("{unit_ref} is now {status}")),
                Err(e) => {
                    spinner.fail(&e.to_string());
                    return Err(e.into());
                }
            }
        }
        Command::Translate { input, output } => {
            let spinner = ui::Spinner::start(&format!("Translating {}", input.display()));
            match app.translate_file(&input, &output).await {
                Ok(summary) => {
                    spinner.succeed(&format!("Wrote {}", output.display()));
                    ui::print_validation(&summary);
                }
                Err(e) => {
                    spinner.fail(&e.to_string());
                    return Err(e.into());
                }
            }
        }
    }
    Ok(())
}
