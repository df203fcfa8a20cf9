//! HTTP and CLI front end for the appointment scheduling engine.

mod cli;
mod demo;
mod infra;
mod routes;
mod server;

use agenda::error::AppError;

/// Parses the command line and runs the selected command to completion.
pub async fn run() -> Result<(), AppError> {
    cli::run().await
}
