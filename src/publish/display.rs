// src/publish/display.rs
//
// Terminal weight display. Prints `<grams>g`, or `--` while there is no
// valid reading, and only when the shown text changes.

use std::sync::Mutex;

use super::ReadingPublisher;
use crate::io::WeightReading;

pub const PLACEHOLDER: &str = "--";

/// Text shown for a reading
pub fn render(reading: &WeightReading) -> String {
    if reading.is_valid() {
        format!("{}g", reading.grams())
    } else {
        PLACEHOLDER.to_string()
    }
}

#[derive(Default)]
pub struct DisplaySink {
    shown: Mutex<Option<String>>,
}

impl DisplaySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Text currently on screen, if anything was shown yet
    pub fn current(&self) -> Option<String> {
        match self.shown.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Update the shown text. Returns true when it changed.
    fn show(&self, text: String) -> bool {
        let mut guard = match self.shown.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if guard.as_deref() == Some(text.as_str()) {
            return false;
        }
        *guard = Some(text);
        true
    }
}

impl ReadingPublisher for DisplaySink {
    fn publish(&self, reading: &WeightReading) {
        let text = render(reading);
        if self.show(text.clone()) {
            println!("{}", text);
        }
    }

    fn name(&self) -> &'static str {
        "display"
    }
}
