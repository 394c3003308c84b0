// src/settings.rs
//
// Bridge settings: an optional TOML file, overridden by command-line flags,
// validated into the runtime configs before anything is opened.

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::io::{BridgeError, FramingEncoding, Parity, SerialLineSettings, ValidationError};
use crate::publish::PublishConfig;
use crate::scale::{ConnectionConfig, DecoderConfig};

/// Device path used with --simulate when none is given
const SIMULATED_DEVICE: &str = "simulated";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeSettings {
    #[serde(default)]
    pub device_path: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: i64,
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    #[serde(default)]
    pub parity: Parity,
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: i64,
    /// Poll request as hex, e.g. "05" for ENQ
    #[serde(default = "default_request_frame")]
    pub request_frame: String,
    #[serde(default = "default_open_timeout_ms")]
    pub open_timeout_ms: i64,
    #[serde(default)]
    pub framing: FramingEncoding,
    #[serde(default)]
    pub decoder: DecoderConfig,
    #[serde(default)]
    pub http_port: Option<i64>,
    #[serde(default)]
    pub ws_port: Option<i64>,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    /// Echo readings to the terminal
    #[serde(default)]
    pub display: bool,
    /// Log every decoded frame and skipped poll
    #[serde(default)]
    pub verbose: bool,
}

fn default_baud_rate() -> i64 {
    9600
}
fn default_data_bits() -> u8 {
    8
}
fn default_stop_bits() -> u8 {
    1
}
fn default_poll_interval_ms() -> i64 {
    500
}
fn default_request_frame() -> String {
    "05".to_string()
}
fn default_open_timeout_ms() -> i64 {
    3000
}
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            device_path: String::new(),
            baud_rate: default_baud_rate(),
            data_bits: default_data_bits(),
            parity: Parity::default(),
            stop_bits: default_stop_bits(),
            poll_interval_ms: default_poll_interval_ms(),
            request_frame: default_request_frame(),
            open_timeout_ms: default_open_timeout_ms(),
            framing: FramingEncoding::default(),
            decoder: DecoderConfig::default(),
            http_port: None,
            ws_port: None,
            bind_address: default_bind_address(),
            log_dir: None,
            display: false,
            verbose: false,
        }
    }
}

impl BridgeSettings {
    pub fn load(path: &Path) -> Result<Self, BridgeError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            BridgeError::Settings(format!("Failed to read {}: {}", path.display(), e))
        })?;
        toml::from_str(&content).map_err(|e| {
            BridgeError::Settings(format!("Failed to parse {}: {}", path.display(), e))
        })
    }

    /// Settings file if given, defaults otherwise
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, BridgeError> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    /// Check every field and build the runtime configs.
    /// Nothing is opened or bound here.
    pub fn validate(&self) -> Result<(ConnectionConfig, PublishConfig), ValidationError> {
        if self.device_path.trim().is_empty() {
            return Err(ValidationError::EmptyDevicePath);
        }
        let baud_rate = u32::try_from(self.baud_rate)
            .ok()
            .filter(|b| *b > 0)
            .ok_or_else(|| ValidationError::InvalidBaudRate(self.baud_rate.to_string()))?;
        let poll_interval_ms = u64::try_from(self.poll_interval_ms)
            .ok()
            .filter(|p| *p > 0)
            .ok_or_else(|| ValidationError::InvalidPollInterval(self.poll_interval_ms.to_string()))?;
        let open_timeout_ms = u64::try_from(self.open_timeout_ms)
            .ok()
            .filter(|t| *t > 0)
            .ok_or_else(|| ValidationError::InvalidOpenTimeout(self.open_timeout_ms.to_string()))?;
        let request_frame = parse_hex_frame(&self.request_frame)?;

        let line = SerialLineSettings {
            data_bits: self.data_bits,
            parity: self.parity,
            stop_bits: self.stop_bits,
        };

        let connection = ConnectionConfig {
            device_path: self.device_path.trim().to_string(),
            baud_rate,
            line,
            poll_interval_ms,
            request_frame,
            framing: self.framing.clone(),
            decoder: self.decoder.clone(),
            open_timeout_ms,
        };
        connection.validate()?;

        let publish = PublishConfig::from_raw(
            self.http_port,
            self.ws_port,
            Some(self.bind_address.clone()),
            self.display,
        )?;

        Ok((connection, publish))
    }
}

/// "05", "0x05", "02 57 03" and "0x02 0x57 0x03" all accepted
fn parse_hex_frame(text: &str) -> Result<Vec<u8>, ValidationError> {
    let compact: String = text
        .split_whitespace()
        .map(|token| {
            token
                .strip_prefix("0x")
                .or_else(|| token.strip_prefix("0X"))
                .unwrap_or(token)
        })
        .collect();
    match hex::decode(&compact) {
        Ok(bytes) if !bytes.is_empty() => Ok(bytes),
        _ => Err(ValidationError::InvalidRequestFrame(text.to_string())),
    }
}

// ============================================================================
// Command Line
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "scale-bridge", version, about = "Polls a serial weighing scale and republishes the weight over HTTP and WebSocket")]
pub struct Cli {
    /// TOML settings file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Serial device, e.g. /dev/ttyUSB0 or COM3
    #[arg(short = 'd', long)]
    pub device: Option<String>,

    #[arg(short, long, allow_negative_numbers = true)]
    pub baud: Option<i64>,

    /// Poll interval in milliseconds
    #[arg(long, allow_negative_numbers = true)]
    pub poll_ms: Option<i64>,

    /// Serve GET /peso on this port
    #[arg(long, allow_negative_numbers = true)]
    pub http_port: Option<i64>,

    /// Push readings to WebSocket clients on this port
    #[arg(long, allow_negative_numbers = true)]
    pub ws_port: Option<i64>,

    /// Address the HTTP and WebSocket servers bind to
    #[arg(long)]
    pub bind: Option<String>,

    /// Accept the first number in otherwise unrecognised frames
    #[arg(long)]
    pub permissive: bool,

    /// Use the built-in simulated scale instead of a serial port
    #[arg(long)]
    pub simulate: bool,

    /// Print each weight change to the terminal
    #[arg(long)]
    pub display: bool,

    #[arg(short, long)]
    pub verbose: bool,

    /// Also write the log to this directory
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// List available serial ports and exit
    Ports,
}

impl Cli {
    /// Flags given on the command line win over the settings file
    pub fn apply(&self, settings: &mut BridgeSettings) {
        if let Some(device) = &self.device {
            settings.device_path = device.clone();
        }
        if let Some(baud) = self.baud {
            settings.baud_rate = baud;
        }
        if let Some(poll_ms) = self.poll_ms {
            settings.poll_interval_ms = poll_ms;
        }
        if let Some(port) = self.http_port {
            settings.http_port = Some(port);
        }
        if let Some(port) = self.ws_port {
            settings.ws_port = Some(port);
        }
        if let Some(bind) = &self.bind {
            settings.bind_address = bind.clone();
        }
        if let Some(dir) = &self.log_dir {
            settings.log_dir = Some(dir.clone());
        }
        settings.decoder.permissive |= self.permissive;
        settings.display |= self.display;
        settings.verbose |= self.verbose;

        if self.simulate && settings.device_path.trim().is_empty() {
            settings.device_path = SIMULATED_DEVICE.to_string();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scale::{DecoderMode, LabeledFlagPolicy};
    use std::io::Write;

    fn with_device() -> BridgeSettings {
        BridgeSettings {
            device_path: "/dev/ttyUSB0".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults_validate() {
        let (connection, publish) = with_device().validate().unwrap();
        assert_eq!(connection.baud_rate, 9600);
        assert_eq!(connection.poll_interval_ms, 500);
        assert_eq!(connection.request_frame, vec![0x05]);
        assert_eq!(connection.line.describe(), "8-N-1");
        assert_eq!(publish.http_port, None);
        assert_eq!(publish.bind_address, "0.0.0.0");
    }

    #[test]
    fn test_each_field_has_its_own_error() {
        assert_eq!(
            BridgeSettings::default().validate(),
            Err(ValidationError::EmptyDevicePath)
        );

        let s = BridgeSettings { baud_rate: -9600, ..with_device() };
        assert_eq!(s.validate(), Err(ValidationError::InvalidBaudRate("-9600".into())));

        let s = BridgeSettings { poll_interval_ms: 0, ..with_device() };
        assert_eq!(s.validate(), Err(ValidationError::InvalidPollInterval("0".into())));

        let s = BridgeSettings { request_frame: "zz".into(), ..with_device() };
        assert_eq!(s.validate(), Err(ValidationError::InvalidRequestFrame("zz".into())));

        let s = BridgeSettings { http_port: Some(0), ..with_device() };
        assert_eq!(s.validate(), Err(ValidationError::InvalidHttpPort("0".into())));

        let s = BridgeSettings { ws_port: Some(-5), ..with_device() };
        assert_eq!(s.validate(), Err(ValidationError::InvalidWsPort("-5".into())));

        let s = BridgeSettings { data_bits: 9, ..with_device() };
        assert_eq!(s.validate(), Err(ValidationError::InvalidDataBits("9".into())));
    }

    #[test]
    fn test_request_frame_forms() {
        assert_eq!(parse_hex_frame("05"), Ok(vec![0x05]));
        assert_eq!(parse_hex_frame("0x05"), Ok(vec![0x05]));
        assert_eq!(parse_hex_frame("02 57 03"), Ok(vec![0x02, 0x57, 0x03]));
        assert_eq!(parse_hex_frame("0x02 0x57 0X03"), Ok(vec![0x02, 0x57, 0x03]));
        assert_eq!(parse_hex_frame(" 0x0203 "), Ok(vec![0x02, 0x03]));
        assert!(parse_hex_frame("0x").is_err());
        assert!(parse_hex_frame("").is_err());
        assert!(parse_hex_frame("5").is_err());
    }

    #[test]
    fn test_load_toml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
device_path = "/dev/ttyS1"
baud_rate = 4800
parity = "even"
http_port = 3000
ws_port = 3001

[framing]
type = "stx_etx"
max_length = 32

[decoder]
mode = "auto"
permissive = true
labeled_flag = {{ policy = "require_stable", stable_flag = "S" }}
"#
        )
        .unwrap();

        let settings = BridgeSettings::load(file.path()).unwrap();
        let (connection, publish) = settings.validate().unwrap();
        assert_eq!(connection.device_path, "/dev/ttyS1");
        assert_eq!(connection.baud_rate, 4800);
        assert_eq!(connection.line.parity, Parity::Even);
        assert_eq!(connection.framing, FramingEncoding::StxEtx { max_length: 32 });
        assert_eq!(connection.decoder.mode, DecoderMode::Auto);
        assert!(connection.decoder.permissive);
        assert_eq!(
            connection.decoder.labeled_flag,
            LabeledFlagPolicy::RequireStable { stable_flag: 'S' }
        );
        assert_eq!(publish.http_port, Some(3000));
        assert_eq!(publish.ws_port, Some(3001));
    }

    #[test]
    fn test_load_reports_bad_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "baud_rate = \"fast\"").unwrap();
        assert!(matches!(
            BridgeSettings::load(file.path()),
            Err(BridgeError::Settings(_))
        ));
        assert!(matches!(
            BridgeSettings::load(Path::new("/nonexistent/scale.toml")),
            Err(BridgeError::Settings(_))
        ));
    }

    #[test]
    fn test_cli_overrides_file() {
        let cli = Cli::parse_from([
            "scale-bridge",
            "--device",
            "/dev/ttyACM0",
            "--baud",
            "19200",
            "--ws-port",
            "-1",
            "--permissive",
        ]);
        let mut settings = BridgeSettings {
            device_path: "/dev/ttyS0".into(),
            ..Default::default()
        };
        cli.apply(&mut settings);

        assert_eq!(settings.device_path, "/dev/ttyACM0");
        assert_eq!(settings.baud_rate, 19200);
        assert!(settings.decoder.permissive);
        assert_eq!(settings.validate(), Err(ValidationError::InvalidWsPort("-1".into())));
    }

    #[test]
    fn test_simulate_fills_device() {
        let cli = Cli::parse_from(["scale-bridge", "--simulate"]);
        let mut settings = BridgeSettings::default();
        cli.apply(&mut settings);
        assert_eq!(settings.device_path, SIMULATED_DEVICE);

        let cli = Cli::parse_from(["scale-bridge", "ports"]);
        assert_eq!(cli.command, Some(Command::Ports));
    }
}
