//! Tag inventory reports.
//!
//! The reader module reports one line of text per tag observation
//! during an inventory round. This module parses those lines into
//! structured [`TagReport`] values.

use bytes::Bytes;
use chrono::{DateTime, Utc};

/// One tag observation from an inventory round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagReport {
    /// The tag's EPC, as raw bytes.
    pub epc: Bytes,
    /// Signal strength of the observation in dBm, when reported.
    pub rssi: Option<i16>,
    /// Host timestamp of the observation.
    pub seen_at: DateTime<Utc>,
}

impl TagReport {
    /// Parse a raw inventory line.
    ///
    /// The module reports the EPC as a hex string, optionally followed
    /// by an RSSI value separated by whitespace or a comma, e.g.
    /// `"E2000017221101441890A1B2 -54"`. Returns `None` for lines that
    /// carry no parseable EPC.
    pub fn parse(line: &str) -> Option<Self> {
        let mut fields = line.split(|c: char| c.is_whitespace() || c == ',').filter(|f| !f.is_empty());

        let epc_hex = fields.next()?;
        let epc = decode_hex(epc_hex)?;
        if epc.is_empty() {
            return None;
        }

        let rssi = fields.next().and_then(|f| f.parse::<i16>().ok());

        Some(Self {
            epc: Bytes::from(epc),
            rssi,
            seen_at: Utc::now(),
        })
    }

    /// The EPC as an upper-case hex string.
    pub fn epc_hex(&self) -> String {
        self.epc.iter().map(|b| format!("{b:02X}")).collect()
    }
}

impl std::fmt::Display for TagReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.rssi {
            Some(rssi) => write!(f, "{} ({} dBm)", self.epc_hex(), rssi),
            None => write!(f, "{}", self.epc_hex()),
        }
    }
}

fn decode_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    s.as_bytes()
        .chunks(2)
        .map(|pair| {
            let hi = (pair[0] as char).to_digit(16)?;
            let lo = (pair[1] as char).to_digit(16)?;
            Some((hi << 4 | lo) as u8)
        })
        .collect()
}
