// src/io/serial/utils.rs
//
// Character framing on the serial line and its mapping onto serialport types.

use serde::{Deserialize, Serialize};
use serialport::{DataBits, SerialPortBuilder, StopBits};

use crate::io::ValidationError;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
}

impl From<Parity> for serialport::Parity {
    fn from(parity: Parity) -> Self {
        match parity {
            Parity::None => serialport::Parity::None,
            Parity::Odd => serialport::Parity::Odd,
            Parity::Even => serialport::Parity::Even,
        }
    }
}

/// Data bits, parity and stop bits. Scales are almost always 8-N-1.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialLineSettings {
    pub data_bits: u8,
    pub parity: Parity,
    pub stop_bits: u8,
}

impl Default for SerialLineSettings {
    fn default() -> Self {
        Self {
            data_bits: 8,
            parity: Parity::None,
            stop_bits: 1,
        }
    }
}

impl SerialLineSettings {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !(5..=8).contains(&self.data_bits) {
            return Err(ValidationError::InvalidDataBits(self.data_bits.to_string()));
        }
        if !(1..=2).contains(&self.stop_bits) {
            return Err(ValidationError::InvalidStopBits(self.stop_bits.to_string()));
        }
        Ok(())
    }

    /// Short form for log lines, e.g. `8-N-1`
    pub fn describe(&self) -> String {
        let parity = match self.parity {
            Parity::None => 'N',
            Parity::Odd => 'O',
            Parity::Even => 'E',
        };
        format!("{}-{}-{}", self.data_bits, parity, self.stop_bits)
    }

    /// Out-of-range values fall back to 8 data bits / 1 stop bit; validate() rejects them first.
    fn serial_data_bits(&self) -> DataBits {
        match self.data_bits {
            5 => DataBits::Five,
            6 => DataBits::Six,
            7 => DataBits::Seven,
            _ => DataBits::Eight,
        }
    }

    fn serial_stop_bits(&self) -> StopBits {
        if self.stop_bits == 2 {
            StopBits::Two
        } else {
            StopBits::One
        }
    }

    /// Apply these settings to a port builder
    pub fn configure(&self, builder: SerialPortBuilder) -> SerialPortBuilder {
        builder
            .data_bits(self.serial_data_bits())
            .parity(self.parity.into())
            .stop_bits(self.serial_stop_bits())
    }
}
