//! NMEA 0183 sentence parsing for GPS telemetry payloads.
//!
//! Devices report position as raw NMEA sentences. Only the GGA fix sentence
//! carries data the gateway acts on; RMC is recognized so that newer firmware
//! emitting it is not treated as malformed. Everything else is an
//! [`NmeaError::UnknownSentence`].

mod error;
mod sentence;

pub use error::{NmeaError, Result};
pub use sentence::{gga_sentence, parse_sentence, GgaSentence, RmcSentence, Sentence};
