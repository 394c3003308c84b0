#[macro_use]
mod logging;

pub mod bridge;
pub mod io;
pub mod publish;
pub mod scale;
pub mod settings;

use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;

use crate::bridge::ScaleBridge;
use crate::io::{list_serial_ports, DeviceConnector, SerialConnector};
use crate::scale::{LogObserver, SessionObservers, SimulatedConnector};
use crate::settings::{BridgeSettings, Cli, Command};

// ============================================================================
// Commands
// ============================================================================

fn print_ports() -> ExitCode {
    match list_serial_ports() {
        Ok(ports) if ports.is_empty() => {
            println!("No serial ports found");
            ExitCode::SUCCESS
        }
        Ok(ports) => {
            for port in ports {
                let description = [port.manufacturer, port.product]
                    .into_iter()
                    .flatten()
                    .collect::<Vec<_>>()
                    .join(" ");
                match (port.vid, port.pid) {
                    (Some(vid), Some(pid)) => println!(
                        "{}\t{}\t{:04x}:{:04x}\t{}",
                        port.port_name, port.port_type, vid, pid, description
                    ),
                    _ => println!("{}\t{}\t\t{}", port.port_name, port.port_type, description),
                }
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            tlog!("[ports] {}", e);
            ExitCode::FAILURE
        }
    }
}

/// Run the bridge until Ctrl-C
async fn serve(cli: Cli) -> ExitCode {
    let mut settings = match BridgeSettings::load_or_default(cli.config.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            tlog!("[setup] {}", e);
            return ExitCode::FAILURE;
        }
    };
    cli.apply(&mut settings);

    if let Some(dir) = &settings.log_dir {
        if let Err(e) = logging::init_file_logging(dir) {
            tlog!("[setup] {}", e);
        }
    }

    let (connection, publish) = match settings.validate() {
        Ok(configs) => configs,
        Err(e) => {
            tlog!("[setup] {}", e);
            logging::stop_file_logging();
            return ExitCode::FAILURE;
        }
    };

    let connector: Arc<dyn DeviceConnector> = if cli.simulate {
        Arc::new(SimulatedConnector)
    } else {
        Arc::new(SerialConnector)
    };
    let observer = Arc::new(LogObserver {
        verbose: settings.verbose,
    });
    let bridge = ScaleBridge::with_connector(connector)
        .with_observers(SessionObservers::from_one(observer));

    let code = match bridge.start(connection, publish).await {
        Ok(message) => {
            println!("{}", message);
            if let Err(e) = tokio::signal::ctrl_c().await {
                tlog!("[setup] Failed to wait for Ctrl-C: {}", e);
            }
            println!("{}", bridge.stop().await);
            ExitCode::SUCCESS
        }
        Err(e) => {
            tlog!("[setup] {}", e);
            ExitCode::FAILURE
        }
    };

    logging::stop_file_logging();
    code
}

pub async fn run() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Some(Command::Ports) => print_ports(),
        None => serve(cli).await,
    }
}
