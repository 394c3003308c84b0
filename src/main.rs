use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    scale_bridge_lib::run().await
}
