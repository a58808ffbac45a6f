//! SenML records and packs (JSON representation).
//!
//! Incoming packs are normalized before anything else touches them: base
//! fields are folded into every record and relative times are resolved
//! against the current clock. Outgoing packs are compacted again according to
//! a [`DenormMask`].

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::ops::BitOr;

use crate::error::{Error, Result};
use crate::registry::ValueType;

/// Times below this value (2^28 seconds) are relative to now
pub const RELATIVE_TIME_THRESHOLD: f64 = 268_435_456.0;

/// Latest accepted record time: 3000-01-01T00:00:00Z
pub const MAX_RECORD_TIME: f64 = 32_503_680_000.0;

pub const MEDIA_TYPE_SENML_JSON: &str = "application/senml+json";

/// One SenML record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Record {
    #[serde(rename = "bn", default, skip_serializing_if = "String::is_empty")]
    pub base_name: String,
    #[serde(rename = "bt", default, skip_serializing_if = "is_zero")]
    pub base_time: f64,
    #[serde(rename = "bu", default, skip_serializing_if = "String::is_empty")]
    pub base_unit: String,
    #[serde(rename = "bv", default, skip_serializing_if = "Option::is_none")]
    pub base_value: Option<f64>,
    #[serde(rename = "bs", default, skip_serializing_if = "Option::is_none")]
    pub base_sum: Option<f64>,
    #[serde(rename = "n", default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(rename = "u", default, skip_serializing_if = "String::is_empty")]
    pub unit: String,
    #[serde(rename = "t", default, skip_serializing_if = "is_zero")]
    pub time: f64,
    #[serde(rename = "ut", default, skip_serializing_if = "is_zero")]
    pub update_time: f64,
    #[serde(rename = "v", default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(rename = "vs", default, skip_serializing_if = "Option::is_none")]
    pub string_value: Option<String>,
    #[serde(rename = "vb", default, skip_serializing_if = "Option::is_none")]
    pub bool_value: Option<bool>,
    #[serde(rename = "vd", default, skip_serializing_if = "Option::is_none")]
    pub data_value: Option<String>,
    #[serde(rename = "s", default, skip_serializing_if = "Option::is_none")]
    pub sum: Option<f64>,
}

fn is_zero(v: &f64) -> bool {
    *v == 0.0
}

pub type Pack = Vec<Record>;

impl Record {
    fn value_fields_present(&self) -> usize {
        [
            self.value.is_some(),
            self.string_value.is_some(),
            self.bool_value.is_some(),
            self.data_value.is_some(),
        ]
        .into_iter()
        .filter(|present| *present)
        .count()
    }

    /// Type implied by the record's value fields, used for auto-registration
    pub fn inferred_type(&self) -> Option<ValueType> {
        if self.value.is_some() || self.sum.is_some() {
            Some(ValueType::Float)
        } else if self.string_value.as_deref().is_some_and(|s| !s.is_empty()) {
            Some(ValueType::String)
        } else if self.bool_value.is_some() {
            Some(ValueType::Bool)
        } else if self.data_value.as_deref().is_some_and(|s| !s.is_empty()) {
            Some(ValueType::Data)
        } else {
            None
        }
    }

    /// Check that exactly the value field of `value_type` is set.
    ///
    /// A record without any value is accepted for float streams when it
    /// carries a sum.
    pub fn check_type(&self, value_type: ValueType) -> Result<()> {
        let mismatch = || {
            Error::bad_request(format!(
                "value type mismatch for record '{}': stream expects {value_type}",
                self.name
            ))
        };
        match self.value_fields_present() {
            0 if value_type == ValueType::Float && self.sum.is_some() => Ok(()),
            0 => Err(Error::bad_request(format!(
                "record '{}' has no value",
                self.name
            ))),
            1 => {
                let matches = match value_type {
                    ValueType::Float => self.value.is_some(),
                    ValueType::String => self.string_value.is_some(),
                    ValueType::Bool => self.bool_value.is_some(),
                    ValueType::Data => self.data_value.is_some(),
                };
                if matches {
                    Ok(())
                } else {
                    Err(mismatch())
                }
            }
            _ => Err(mismatch()),
        }
    }
}

/// Decode a JSON pack
pub fn decode(payload: &[u8]) -> Result<Pack> {
    serde_json::from_slice(payload)
        .map_err(|e| Error::bad_request(format!("error decoding SenML pack: {e}")))
}

pub fn encode(pack: &[Record]) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(pack)?)
}

/// Resolve base fields and relative times into every record
pub fn normalize(pack: &[Record]) -> Result<Pack> {
    normalize_at(pack, now_secs())
}

pub(crate) fn now_secs() -> f64 {
    let now = Utc::now();
    now.timestamp() as f64 + f64::from(now.timestamp_subsec_micros()) / 1e6
}

fn normalize_at(pack: &[Record], now: f64) -> Result<Pack> {
    let mut base_name = "";
    let mut base_time = 0.0;
    let mut base_unit = "";
    let mut base_value: Option<f64> = None;
    let mut base_sum: Option<f64> = None;

    let mut records = Vec::with_capacity(pack.len());
    for r in pack {
        if !r.base_name.is_empty() {
            base_name = &r.base_name;
        }
        if r.base_time != 0.0 {
            base_time = r.base_time;
        }
        if !r.base_unit.is_empty() {
            base_unit = &r.base_unit;
        }
        if r.base_value.is_some() {
            base_value = r.base_value;
        }
        if r.base_sum.is_some() {
            base_sum = r.base_sum;
        }

        let name = format!("{base_name}{}", r.name);
        if name.is_empty() {
            return Err(Error::bad_request("SenML record without a name"));
        }

        let mut time = base_time + r.time;
        if time < RELATIVE_TIME_THRESHOLD {
            time += now;
        }

        let has_other_value =
            r.string_value.is_some() || r.bool_value.is_some() || r.data_value.is_some();
        let value = match (r.value, base_value) {
            (Some(v), Some(bv)) => Some(v + bv),
            (Some(v), None) => Some(v),
            (None, Some(bv)) if !has_other_value => Some(bv),
            (None, _) => None,
        };
        let sum = match (r.sum, base_sum) {
            (Some(s), Some(bs)) => Some(s + bs),
            (Some(s), None) => Some(s),
            (None, bs) => bs,
        };

        records.push(Record {
            name,
            unit: if r.unit.is_empty() {
                base_unit.to_string()
            } else {
                r.unit.clone()
            },
            time,
            value,
            string_value: r.string_value.clone(),
            bool_value: r.bool_value,
            data_value: r.data_value.clone(),
            sum,
            ..Record::default()
        });
    }
    Ok(records)
}

/// Fields that must appear on every record of a response
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct DenormMask(u8);

impl DenormMask {
    pub const NONE: DenormMask = DenormMask(0);
    pub const NAME: DenormMask = DenormMask(1);
    pub const TIME: DenormMask = DenormMask(1 << 1);
    pub const UNIT: DenormMask = DenormMask(1 << 2);
    pub const VALUE: DenormMask = DenormMask(1 << 3);
    pub const SUM: DenormMask = DenormMask(1 << 4);
    pub const ALL: DenormMask = DenormMask(0b1_1111);

    pub fn bits(&self) -> u8 {
        self.0
    }

    pub fn from_bits(bits: u8) -> Self {
        DenormMask(bits & Self::ALL.0)
    }

    pub fn contains(&self, other: DenormMask) -> bool {
        self.0 & other.0 == other.0
    }

    /// Parse field names (`time|t`, `name|n`, `unit|u`, `value|v`, `sum|s`)
    pub fn parse<'a>(fields: impl IntoIterator<Item = &'a str>) -> Result<Self> {
        let mut mask = DenormMask::NONE;
        for field in fields {
            let field = field.trim().to_ascii_lowercase();
            mask = mask
                | match field.as_str() {
                    "" => DenormMask::NONE,
                    "time" | "t" => DenormMask::TIME,
                    "name" | "n" => DenormMask::NAME,
                    "unit" | "u" => DenormMask::UNIT,
                    "value" | "v" => DenormMask::VALUE,
                    "sum" | "s" => DenormMask::SUM,
                    other => {
                        return Err(Error::bad_request(format!(
                            "unexpected senml field: {other}"
                        )))
                    }
                };
        }
        Ok(mask)
    }

    /// Short field names, in a stable order
    pub fn field_names(&self) -> Vec<&'static str> {
        [
            (DenormMask::TIME, "t"),
            (DenormMask::NAME, "n"),
            (DenormMask::UNIT, "u"),
            (DenormMask::VALUE, "v"),
            (DenormMask::SUM, "s"),
        ]
        .into_iter()
        .filter(|(bit, _)| self.contains(*bit))
        .map(|(_, name)| name)
        .collect()
    }
}

impl BitOr for DenormMask {
    type Output = DenormMask;

    fn bitor(self, rhs: DenormMask) -> DenormMask {
        DenormMask(self.0 | rhs.0)
    }
}

/// Factor fields not selected by `mask` into base fields of the first record.
///
/// Names, units, values and sums are only factored when every record agrees
/// on them; times are always expressed relative to the first record.
pub fn compact(mut records: Pack, mask: DenormMask) -> Pack {
    let Some(first) = records.first().cloned() else {
        return records;
    };

    if !mask.contains(DenormMask::NAME) && records.iter().all(|r| r.name == first.name) {
        for r in records.iter_mut() {
            r.name.clear();
        }
        records[0].base_name = first.name.clone();
    }

    if !mask.contains(DenormMask::TIME) {
        for r in records.iter_mut() {
            r.time -= first.time;
        }
        records[0].base_time = first.time;
    }

    if !mask.contains(DenormMask::UNIT)
        && !first.unit.is_empty()
        && records.iter().all(|r| r.unit == first.unit)
    {
        for r in records.iter_mut() {
            r.unit.clear();
        }
        records[0].base_unit = first.unit.clone();
    }

    if !mask.contains(DenormMask::VALUE)
        && first.value.is_some()
        && records.iter().all(|r| r.value == first.value)
    {
        for r in records.iter_mut() {
            r.value = None;
        }
        records[0].base_value = first.value;
    }

    if !mask.contains(DenormMask::SUM)
        && first.sum.is_some()
        && records.iter().all(|r| r.sum == first.sum)
    {
        for r in records.iter_mut() {
            r.sum = None;
        }
        records[0].base_sum = first.sum;
    }

    records
}
