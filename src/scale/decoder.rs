// src/scale/decoder.rs
//
// Frame decoder: turns one reply from the scale into a WeightReading.
//
// Scale firmware in the field speaks several incompatible framings. Each
// framing has its own decode function returning Option<WeightReading>; the
// decoder tries them in a fixed priority order (most specific first) and
// falls back to an invalid reading when nothing matches. Decoding never
// fails: a noisy line on the wire becomes `valid = false, grams = 0`.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::io::serial::framer::{ETX, STX};
use crate::io::{Anomaly, FrameFormat, WeightReading};

/// Status tokens of the fixed-width format
const STATUS_UNSTABLE: &str = "11111";
const STATUS_ZERO_OR_NEGATIVE: &str = "00000";
const STATUS_OVERLOAD: &str = "SSSSS";

// =============================================================================
// Configuration
// =============================================================================

/// Which framings the decoder attempts
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecoderMode {
    /// Try every structured format in priority order
    Auto,
    FixedStatus,
    LabeledStability,
    BareDigits,
    FirstNumber,
}

impl Default for DecoderMode {
    fn default() -> Self {
        DecoderMode::Auto
    }
}

/// How the flag character of the labeled format affects validity.
///
/// Firmware in the field has been seen reporting the flag without anyone
/// checking it, so readings taken while the scale settles come out valid.
/// `Ignore` keeps that behavior; `RequireStable` marks any other flag unstable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum LabeledFlagPolicy {
    Ignore,
    RequireStable { stable_flag: char },
}

impl Default for LabeledFlagPolicy {
    fn default() -> Self {
        LabeledFlagPolicy::Ignore
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecoderConfig {
    #[serde(default)]
    pub mode: DecoderMode,
    /// Allow the first-number fallback in auto mode
    #[serde(default)]
    pub permissive: bool,
    #[serde(default)]
    pub labeled_flag: LabeledFlagPolicy,
}

impl DecoderConfig {
    /// Formats to attempt, in order
    pub fn formats(&self) -> Vec<FrameFormat> {
        match self.mode {
            DecoderMode::Auto => {
                let mut formats = vec![
                    FrameFormat::FixedStatus,
                    FrameFormat::LabeledStability,
                    FrameFormat::BareDigits,
                ];
                if self.permissive {
                    formats.push(FrameFormat::FirstNumber);
                }
                formats
            }
            DecoderMode::FixedStatus => vec![FrameFormat::FixedStatus],
            DecoderMode::LabeledStability => vec![FrameFormat::LabeledStability],
            DecoderMode::BareDigits => vec![FrameFormat::BareDigits],
            DecoderMode::FirstNumber => vec![FrameFormat::FirstNumber],
        }
    }
}

// =============================================================================
// Observer
// =============================================================================

/// Receives decode diagnostics. All methods default to no-ops.
pub trait DecodeObserver: Send + Sync {
    fn format_matched(&self, _format: FrameFormat, _reading: &WeightReading) {}
    fn frame_rejected(&self, _raw: &[u8]) {}
}

/// Observer that drops every event
pub struct SilentObserver;

impl DecodeObserver for SilentObserver {}

// =============================================================================
// Decoder
// =============================================================================

#[derive(Clone)]
pub struct FrameDecoder {
    config: DecoderConfig,
    observer: Arc<dyn DecodeObserver>,
}

impl FrameDecoder {
    pub fn new(config: DecoderConfig) -> Self {
        Self {
            config,
            observer: Arc::new(SilentObserver),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn DecodeObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    /// Decode one frame. Unrecognised input yields an invalid zero reading.
    pub fn decode(&self, raw: &[u8]) -> WeightReading {
        let line = clean_line(raw);

        for format in self.config.formats() {
            let decoded = match format {
                FrameFormat::FixedStatus => decode_fixed_status(&line, raw),
                FrameFormat::LabeledStability => {
                    decode_labeled_stability(&line, raw, self.config.labeled_flag)
                }
                FrameFormat::BareDigits => decode_bare_digits(&line, raw),
                FrameFormat::FirstNumber => decode_first_number(&line, raw),
            };
            if let Some(reading) = decoded {
                self.observer.format_matched(format, &reading);
                return reading;
            }
        }

        self.observer.frame_rejected(raw);
        WeightReading::unparsable(raw)
    }
}

/// Drop STX/ETX and surrounding whitespace
fn clean_line(raw: &[u8]) -> String {
    let stripped: Vec<u8> = raw
        .iter()
        .copied()
        .filter(|&b| b != STX && b != ETX)
        .collect();
    String::from_utf8_lossy(&stripped).trim().to_string()
}

fn all_digits(bytes: &[u8]) -> bool {
    !bytes.is_empty() && bytes.iter().all(u8::is_ascii_digit)
}

fn digits_value(bytes: &[u8]) -> Option<u64> {
    bytes.iter().try_fold(0u64, |acc, &b| {
        acc.checked_mul(10)?.checked_add(u64::from(b - b'0'))
    })
}

/// `iiiii` integer kilograms and `dd` hundredths, to grams
fn kg_fields_to_grams(integer: &[u8], fraction: &[u8]) -> Option<u64> {
    let kg = digits_value(integer)?;
    let hundredths = digits_value(fraction)?;
    kg.checked_mul(1000)?.checked_add(hundredths * 10)
}

// =============================================================================
// Formats
// =============================================================================

/// `ppppppp` + `iiiii`: 7 digits (5 integer + 2 fractional kg) and a
/// 5-character status made of `0`, `1` or `S`.
///
/// `11111` is unstable, `SSSSS` overload, `00000` zero-or-negative: valid only
/// when the weight is exactly zero. Any other status token is reported invalid.
pub fn decode_fixed_status(line: &str, raw: &[u8]) -> Option<WeightReading> {
    let bytes = line.as_bytes();
    if bytes.len() != 12 {
        return None;
    }
    let (weight, status) = bytes.split_at(7);
    if !all_digits(weight) || !status.iter().all(|&b| matches!(b, b'0' | b'1' | b'S')) {
        return None;
    }

    let grams = kg_fields_to_grams(&weight[..5], &weight[5..])?;
    let format = FrameFormat::FixedStatus;
    // status is ASCII, checked above
    let status = std::str::from_utf8(status).ok()?;

    let reading = match status {
        STATUS_UNSTABLE => WeightReading::rejected(grams, raw, format, Anomaly::Unstable),
        STATUS_OVERLOAD => WeightReading::rejected(grams, raw, format, Anomaly::Overload),
        STATUS_ZERO_OR_NEGATIVE if grams == 0 => WeightReading::valid(0, raw, format),
        STATUS_ZERO_OR_NEGATIVE => WeightReading::rejected(grams, raw, format, Anomaly::Negative),
        _ => WeightReading::rejected(grams, raw, format, Anomaly::UnknownStatus),
    };
    Some(reading)
}

/// `<flag> I <ddddd>.<dd>kg` where the flag is one character.
pub fn decode_labeled_stability(
    line: &str,
    raw: &[u8],
    policy: LabeledFlagPolicy,
) -> Option<WeightReading> {
    let (flag, grams) = parse_labeled(line)?;
    let format = FrameFormat::LabeledStability;

    let reading = match policy {
        LabeledFlagPolicy::Ignore => WeightReading::valid(grams, raw, format),
        LabeledFlagPolicy::RequireStable { stable_flag } if flag == stable_flag => {
            WeightReading::valid(grams, raw, format)
        }
        LabeledFlagPolicy::RequireStable { .. } => {
            WeightReading::rejected(grams, raw, format, Anomaly::Unstable)
        }
    };
    Some(reading)
}

fn parse_labeled(line: &str) -> Option<(char, u64)> {
    let mut chars = line.chars();
    let flag = chars.next()?;
    if let Some(body) = chars.as_str().trim_start().strip_prefix('I') {
        if let Some(grams) = parse_kg_body(body.trim_start()) {
            return Some((flag, grams));
        }
    }
    // A blank flag is lost when the line is trimmed
    let body = line.strip_prefix('I')?;
    if !body.starts_with(char::is_whitespace) {
        return None;
    }
    parse_kg_body(body.trim_start()).map(|grams| (' ', grams))
}

/// `ddddd.ddkg`
fn parse_kg_body(body: &str) -> Option<u64> {
    let bytes = body.as_bytes();
    if bytes.len() < 8 || bytes[5] != b'.' {
        return None;
    }
    let (integer, fraction) = (&bytes[..5], &bytes[6..8]);
    if !all_digits(integer) || !all_digits(fraction) {
        return None;
    }
    // first 8 bytes are ASCII, so index 8 is a char boundary
    if !body[8..].trim_start().eq_ignore_ascii_case("kg") {
        return None;
    }
    kg_fields_to_grams(integer, fraction)
}

/// Digits only: the whole string is an integer gram count
pub fn decode_bare_digits(line: &str, raw: &[u8]) -> Option<WeightReading> {
    let bytes = line.as_bytes();
    if !all_digits(bytes) {
        return None;
    }
    let grams = digits_value(bytes)?;
    Some(WeightReading::valid(grams, raw, FrameFormat::BareDigits))
}

/// First run of digits anywhere in the line, taken as integer grams
pub fn decode_first_number(line: &str, raw: &[u8]) -> Option<WeightReading> {
    let bytes = line.as_bytes();
    let start = bytes.iter().position(u8::is_ascii_digit)?;
    let len = bytes[start..]
        .iter()
        .take_while(|b| b.is_ascii_digit())
        .count();
    let grams = digits_value(&bytes[start..start + len])?;
    Some(WeightReading::valid(grams, raw, FrameFormat::FirstNumber))
}
