//! Validation of stream definitions on create and update.

use std::time::Duration;

use super::stream::{DataStream, Retention, Source};
use crate::error::{Error, Result};

/// Validate a stream that is about to be created
pub fn validate_create(stream: &DataStream) -> Result<()> {
    validate_name(&stream.name)?;
    validate_writable_fields(stream)
}

/// Validate an update against the stored definition
pub fn validate_update(old: &DataStream, new: &DataStream) -> Result<()> {
    if new.name != old.name {
        return Err(Error::conflict(format!(
            "conflicting name '{}': name of stream '{}' is read-only",
            new.name, old.name
        )));
    }
    if new.value_type != old.value_type {
        return Err(Error::conflict(format!(
            "conflicting type '{}': type of stream '{}' is read-only",
            new.value_type, old.name
        )));
    }
    validate_writable_fields(new)
}

fn validate_writable_fields(stream: &DataStream) -> Result<()> {
    validate_retention(&stream.retention)?;
    match &stream.source {
        Some(Source::Mqtt(src)) => {
            src.endpoint()?;
            if src.topic.is_empty() {
                return Err(Error::bad_request("MQTT source requires a topic"));
            }
            if src.qos > 2 {
                return Err(Error::bad_request(format!(
                    "invalid MQTT QoS {}: must be 0, 1 or 2",
                    src.qos
                )));
            }
        }
        Some(Source::Series(src)) => {
            if src.name.is_empty() {
                return Err(Error::bad_request("Series source requires a name"));
            }
        }
        None => {}
    }
    Ok(())
}

/// Stream names start with an ASCII alphanumeric and may continue with `-:./_`
pub fn validate_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return Err(Error::bad_request("stream name must not be empty"));
    };
    if !first.is_ascii_alphanumeric() {
        return Err(Error::bad_request(format!(
            "invalid stream name '{name}': must start with a letter or digit"
        )));
    }
    if let Some(bad) = chars.find(|c| !(c.is_ascii_alphanumeric() || "-:./_".contains(*c))) {
        return Err(Error::bad_request(format!(
            "invalid stream name '{name}': character '{bad}' is not allowed"
        )));
    }
    Ok(())
}

fn validate_retention(retention: &Retention) -> Result<()> {
    let min = retention
        .min
        .as_deref()
        .map(|d| parse_duration(d).map_err(|e| e.context("invalid retention.min")))
        .transpose()?;
    let max = retention
        .max
        .as_deref()
        .map(|d| parse_duration(d).map_err(|e| e.context("invalid retention.max")))
        .transpose()?;
    if let (Some(min), Some(max)) = (min, max) {
        if min > max {
            return Err(Error::bad_request(
                "retention.min must not be greater than retention.max",
            ));
        }
    }
    Ok(())
}

/// Parse a duration such as `90m`, `1h30m`, `7d` or `1.5w`
pub fn parse_duration(input: &str) -> Result<Duration> {
    let err = || Error::bad_request(format!("invalid duration '{input}'"));
    if input.is_empty() {
        return Err(err());
    }

    let mut total = 0f64;
    let mut rest = input;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(err)?;
        if number_len == 0 {
            return Err(err());
        }
        let number: f64 = rest[..number_len].parse().map_err(|_| err())?;
        rest = &rest[number_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let seconds_per_unit = match &rest[..unit_len] {
            "ns" => 1e-9,
            "us" | "µs" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            "d" => 86_400.0,
            "w" => 604_800.0,
            _ => return Err(err()),
        };
        total += number * seconds_per_unit;
        rest = &rest[unit_len..];
    }

    Duration::try_from_secs_f64(total).map_err(|_| err())
}
