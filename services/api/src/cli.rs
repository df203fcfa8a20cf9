use crate::demo::{run_demo, DemoArgs};
use crate::server;
use agenda::error::AppError;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "Agenda",
    about = "Run or demonstrate the appointment scheduling service from the command line",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the HTTP service (default command)
    Serve(ServeArgs),
    /// Book, reject and cancel against an in-memory store, then print the audit trail
    Demo(DemoArgs),
}

#[derive(Args, Debug, Default)]
pub(crate) struct ServeArgs {
    /// Bind address, overriding APP_HOST
    #[arg(long)]
    pub(crate) host: Option<String>,
    /// Listen port, overriding APP_PORT
    #[arg(long)]
    pub(crate) port: Option<u16>,
    /// JSON file holding the company settings, overriding APP_SETTINGS_PATH
    #[arg(long)]
    pub(crate) settings: Option<PathBuf>,
}

pub(crate) async fn run() -> Result<(), AppError> {
    let command = Cli::parse()
        .command
        .unwrap_or_else(|| Command::Serve(ServeArgs::default()));

    match command {
        Command::Serve(args) => server::run(args).await,
        Command::Demo(args) => run_demo(args),
    }
}
