//! Serial number extraction from recognized text

use regex::Regex;

/// Serial tokens are 10 to 12 uppercase letters or digits on word boundaries
const SERIAL_PATTERN: &str = r"\b[A-Z0-9]{10,12}\b";

/// Character pairs the recognizer commonly confuses on serial labels.
/// Serials never contain the letters, so the digit always wins.
const CONFUSIONS: &[(char, char)] = &[('I', '1'), ('O', '0')];

/// Normalizes OCR text and pulls out serial-shaped tokens
#[derive(Debug, Clone)]
pub struct SerialExtractor {
    pattern: Regex,
}

impl Default for SerialExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl SerialExtractor {
    /// Create an extractor for the standard serial pattern
    pub fn new() -> Self {
        Self {
            pattern: Regex::new(SERIAL_PATTERN).expect("serial pattern is a valid regex"),
        }
    }

    /// Apply the confusion corrections to `text`
    pub fn normalize(text: &str) -> String {
        text.chars()
            .map(|c| {
                CONFUSIONS
                    .iter()
                    .find(|(from, _)| *from == c)
                    .map(|(_, to)| *to)
                    .unwrap_or(c)
            })
            .collect()
    }

    /// Clean up an operator-typed serial: trim, uppercase, correct confusions
    pub fn normalize_manual(serial: &str) -> String {
        Self::normalize(&serial.trim().to_uppercase())
    }

    /// Every serial-shaped token in `text`, in reading order.
    ///
    /// Repeats are kept: each occurrence is a separate vote.
    pub fn extract(&self, text: &str) -> Vec<String> {
        let normalized = Self::normalize(text);
        self.pattern
            .find_iter(&normalized)
            .map(|m| m.as_str().to_string())
            .collect()
    }

    /// Whether `serial` as a whole has the serial shape
    pub fn is_serial(&self, serial: &str) -> bool {
        self.pattern
            .find(serial)
            .map(|m| m.start() == 0 && m.end() == serial.len())
            .unwrap_or(false)
    }
}
