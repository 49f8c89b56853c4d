use chrono::{NaiveDate, NaiveTime};

use crate::error::{NmeaError, Result};

// Minimum field counts per sentence, including the talker/type field itself.
const GGA_FIELDS: usize = 15;
const RMC_FIELDS: usize = 12;

/// A GGA fix sentence: time of day, position and fix quality.
#[derive(Debug, Clone, PartialEq)]
pub struct GgaSentence {
    pub talker: String,
    pub time: Option<NaiveTime>,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
    /// 0 means no fix; 1+ is a usable fix.
    pub quality: u8,
    pub satellites: u8,
    pub hdop: Option<f64>,
    pub altitude: Option<f64>,
}

impl GgaSentence {
    /// Position in decimal degrees, present only when the fix is usable.
    pub fn position(&self) -> Option<(f64, f64)> {
        if self.quality == 0 {
            return None;
        }
        match (self.lat, self.lng) {
            (Some(lat), Some(lng)) => Some((lat, lng)),
            _ => None,
        }
    }
}

/// An RMC recommended-minimum sentence. Parsed but not acted upon.
#[derive(Debug, Clone, PartialEq)]
pub struct RmcSentence {
    pub talker: String,
    pub time: Option<NaiveTime>,
    pub valid: bool,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
    pub speed_knots: Option<f64>,
    pub course: Option<f64>,
    pub date: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Sentence {
    Gga(GgaSentence),
    Rmc(RmcSentence),
}

/// Parse a single NMEA sentence, validating the `*XX` checksum.
pub fn parse_sentence(raw: &str) -> Result<Sentence> {
    let raw = raw.trim();
    let body = raw.strip_prefix('$').ok_or(NmeaError::MissingPrefix)?;

    let (payload, given) = body.rsplit_once('*').ok_or(NmeaError::MissingChecksum)?;
    let computed = checksum(payload);
    let expected = format!("{:02X}", computed);
    if !given.eq_ignore_ascii_case(&expected) {
        return Err(NmeaError::InvalidChecksum {
            expected,
            actual: given.to_string(),
        });
    }

    let fields: Vec<&str> = payload.split(',').collect();
    let id = fields[0];
    if id.len() < 5 {
        return Err(NmeaError::UnknownSentence(id.to_string()));
    }
    let talker = &id[..id.len() - 3];
    match &id[id.len() - 3..] {
        "GGA" => parse_gga(talker, &fields).map(Sentence::Gga),
        "RMC" => parse_rmc(talker, &fields).map(Sentence::Rmc),
        other => Err(NmeaError::UnknownSentence(other.to_string())),
    }
}

fn parse_gga(talker: &str, fields: &[&str]) -> Result<GgaSentence> {
    if fields.len() < GGA_FIELDS {
        return Err(NmeaError::FieldCount {
            sentence: "GGA",
            expected: GGA_FIELDS,
            actual: fields.len(),
        });
    }

    Ok(GgaSentence {
        talker: talker.to_string(),
        time: parse_time(fields[1])?,
        lat: parse_coordinate(fields[2], fields[3])?,
        lng: parse_coordinate(fields[4], fields[5])?,
        quality: parse_int(fields[6], "quality")?,
        satellites: parse_int(fields[7], "satellites")?,
        hdop: parse_float(fields[8], "hdop")?,
        altitude: parse_float(fields[9], "altitude")?,
    })
}

fn parse_rmc(talker: &str, fields: &[&str]) -> Result<RmcSentence> {
    if fields.len() < RMC_FIELDS {
        return Err(NmeaError::FieldCount {
            sentence: "RMC",
            expected: RMC_FIELDS,
            actual: fields.len(),
        });
    }

    Ok(RmcSentence {
        talker: talker.to_string(),
        time: parse_time(fields[1])?,
        valid: fields[2] == "A",
        lat: parse_coordinate(fields[3], fields[4])?,
        lng: parse_coordinate(fields[5], fields[6])?,
        speed_knots: parse_float(fields[7], "speed")?,
        course: parse_float(fields[8], "course")?,
        date: parse_date(fields[9])?,
    })
}

/// XOR of all payload bytes between `$` and `*`.
fn checksum(payload: &str) -> u8 {
    payload.bytes().fold(0, |acc, b| acc ^ b)
}

/// Convert a `ddmm.mmmm` / `dddmm.mmmm` coordinate plus hemisphere letter to
/// signed decimal degrees. Empty fields mean the receiver had no value.
fn parse_coordinate(value: &str, hemisphere: &str) -> Result<Option<f64>> {
    if value.is_empty() || hemisphere.is_empty() {
        return Ok(None);
    }
    let dot = value.find('.').ok_or_else(|| NmeaError::InvalidField {
        field: "coordinate",
        value: value.to_string(),
    })?;
    if dot < 3 {
        return Err(NmeaError::InvalidField {
            field: "coordinate",
            value: value.to_string(),
        });
    }
    let (degrees, minutes) = value.split_at(dot - 2);
    let degrees: f64 = degrees.parse().map_err(|_| NmeaError::InvalidField {
        field: "coordinate",
        value: value.to_string(),
    })?;
    let minutes: f64 = minutes.parse().map_err(|_| NmeaError::InvalidField {
        field: "coordinate",
        value: value.to_string(),
    })?;
    let magnitude = degrees + minutes / 60.0;

    match hemisphere {
        "N" | "E" => Ok(Some(magnitude)),
        "S" | "W" => Ok(Some(-magnitude)),
        other => Err(NmeaError::InvalidField {
            field: "hemisphere",
            value: other.to_string(),
        }),
    }
}

/// `hhmmss.sss` time of day.
fn parse_time(value: &str) -> Result<Option<NaiveTime>> {
    if value.is_empty() {
        return Ok(None);
    }
    let invalid = || NmeaError::InvalidField {
        field: "time",
        value: value.to_string(),
    };
    if value.len() < 6 {
        return Err(invalid());
    }
    let hour: u32 = value[0..2].parse().map_err(|_| invalid())?;
    let minute: u32 = value[2..4].parse().map_err(|_| invalid())?;
    let seconds: f64 = value[4..].parse().map_err(|_| invalid())?;
    let millis = (seconds * 1000.0).round() as u32;
    NaiveTime::from_hms_milli_opt(hour, minute, millis / 1000, millis % 1000)
        .map(Some)
        .ok_or_else(invalid)
}

/// `ddmmyy` date as used by RMC.
fn parse_date(value: &str) -> Result<Option<NaiveDate>> {
    if value.is_empty() {
        return Ok(None);
    }
    let invalid = || NmeaError::InvalidField {
        field: "date",
        value: value.to_string(),
    };
    if value.len() != 6 {
        return Err(invalid());
    }
    let day: u32 = value[0..2].parse().map_err(|_| invalid())?;
    let month: u32 = value[2..4].parse().map_err(|_| invalid())?;
    let year: i32 = value[4..6].parse().map_err(|_| invalid())?;
    NaiveDate::from_ymd_opt(2000 + year, month, day)
        .map(Some)
        .ok_or_else(invalid)
}

fn parse_int(value: &str, field: &'static str) -> Result<u8> {
    if value.is_empty() {
        return Ok(0);
    }
    value.parse().map_err(|_| NmeaError::InvalidField {
        field,
        value: value.to_string(),
    })
}

fn parse_float(value: &str, field: &'static str) -> Result<Option<f64>> {
    if value.is_empty() {
        return Ok(None);
    }
    value
        .parse()
        .map(Some)
        .map_err(|_| NmeaError::InvalidField {
            field,
            value: value.to_string(),
        })
}

/// Render a GGA sentence for a known position, checksum included.
///
/// Used to synthesize a GPS application message when an operator places a
/// device on the map by hand, so downstream consumers observe the same event
/// shape a real receiver would produce.
pub fn gga_sentence(lat: f64, lng: f64, time: NaiveTime) -> String {
    let payload = format!(
        "GPGGA,{},{},{},{},{},1,04,1.0,0.0,M,0.0,M,,",
        time.format("%H%M%S.00"),
        format_coordinate(lat, 2),
        if lat < 0.0 { "S" } else { "N" },
        format_coordinate(lng, 3),
        if lng < 0.0 { "W" } else { "E" },
    );
    format!("${}*{:02X}", payload, checksum(&payload))
}

fn format_coordinate(value: f64, degree_digits: usize) -> String {
    let magnitude = value.abs();
    let degrees = magnitude.trunc();
    let minutes = (magnitude - degrees) * 60.0;
    format!(
        "{:0width$}{:07.4}",
        degrees as u32,
        minutes,
        width = degree_digits
    )
}
