//! Jobwire CLI - run a program as a tracked job.
//!
//! Connects to the tracking service, exposes a `process` controller for the
//! child, streams its output into the job log and reports the final status
//! derived from how the child exited.

mod runner;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use jobwire::config::EndpointConfig;
use jobwire::{Client, ClientOptions, Identity, JobContext, UserSelection};
use std::process::ExitCode;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "jobwire")]
#[command(about = "Track a program's run on a jobwire service")]
struct Args {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a program and track it as a job
    Run(RunArgs),
}

#[derive(clap::Args, Debug, Clone, Default)]
struct RunArgs {
    /// Service host (overrides JOBWIRE_HOST and the account host)
    #[arg(long)]
    host: Option<String>,

    /// Service port (overrides JOBWIRE_PORT and the account port)
    #[arg(long)]
    port: Option<u16>,

    /// Account name from the home configuration
    #[arg(long)]
    account: Option<String>,

    /// Project public name, used together with --account
    #[arg(long)]
    project: Option<String>,

    /// Job title
    #[arg(long)]
    title: Option<String>,

    /// Program and its arguments
    #[arg(trailing_var_arg = true, required = true, num_args = 1..)]
    program: Vec<String>,
}

/// Build client options from flags, falling back to `env` for the rest.
fn build_options<F>(args: &RunArgs, env: F) -> jobwire::Result<ClientOptions>
where
    F: Fn(&str) -> Option<String>,
{
    let directory = std::env::current_dir()?;
    let selection = UserSelection {
        account: args.account.clone(),
        project: args.project.clone(),
        directory,
    };

    let lookup = |key: &str| match key {
        EndpointConfig::HOST_VAR => args.host.clone().or_else(|| env(key)),
        EndpointConfig::PORT_VAR => args.port.map(|p| p.to_string()).or_else(|| env(key)),
        _ => env(key),
    };
    let mut options = ClientOptions::from_lookup(lookup, &selection, jobwire::HomeConfig::load)?;

    if let Identity::User { account, .. } = &mut options.identity {
        if let Some(host) = &args.host {
            account.host = host.clone();
        }
        if let Some(port) = args.port {
            account.port = port;
        }
    }
    Ok(options)
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    // Set up logging
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    match args.command {
        Command::Run(run) => {
            let options = build_options(&run, |key| std::env::var(key).ok())
                .context("Failed to configure the tracking client")?;
            info!("Tracking {} on {}", run.program.join(" "), options.identity.endpoint());

            let client = Client::connect(options)?;
            let context = JobContext::new(client.clone());
            if let Some(title) = &run.title {
                context.set_title(title);
            }

            let finished = runner::run(&client, &context, &run.program).await?;
            info!("Program finished: {:?}", finished.outcome);

            context
                .shutdown(finished.outcome)
                .await
                .context("Failed to shut the tracking client down")?;
            Ok(ExitCode::from(finished.exit_code))
        }
    }
}
