use anyhow::Result;
use holeguard::cli::{start, telemetry};

// Main function
#[tokio::main]
async fn main() -> Result<()> {
    // Start the program
    let (globals, action) = start()?;

    // Handle the action
    let result = action.execute(&globals).await;

    telemetry::shutdown_tracer();

    result
}
