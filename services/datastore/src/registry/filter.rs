//! Field filters over stream records.

use serde_json::Value;
use std::str::FromStr;

use super::stream::DataStream;
use crate::error::{Error, Result};

/// Comparison applied to the addressed field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Equals,
    Prefix,
    Suffix,
    Contains,
}

impl FromStr for FilterOp {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "equals" => Ok(FilterOp::Equals),
            "prefix" => Ok(FilterOp::Prefix),
            "suffix" => Ok(FilterOp::Suffix),
            "contains" => Ok(FilterOp::Contains),
            other => Err(Error::bad_request(format!("unknown filter operator '{other}'"))),
        }
    }
}

/// Dotted path, operator and operand
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    pub path: String,
    pub op: FilterOp,
    pub value: String,
}

impl Filter {
    pub fn new(path: impl Into<String>, op: FilterOp, value: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            op,
            value: value.into(),
        }
    }

    pub fn parse(path: &str, op: &str, value: &str) -> Result<Self> {
        if path.is_empty() {
            return Err(Error::bad_request("filter path must not be empty"));
        }
        Ok(Self::new(path, op.parse()?, value))
    }

    /// Match against the user-facing encoding, so credentials are never matchable
    pub fn matches(&self, stream: &DataStream) -> bool {
        let Ok(doc) = serde_json::to_value(stream.redacted()) else {
            return false;
        };
        let Some(field) = lookup(&doc, &self.path) else {
            return false;
        };
        let text = match field {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        match self.op {
            FilterOp::Equals => text == self.value,
            FilterOp::Prefix => text.starts_with(&self.value),
            FilterOp::Suffix => text.ends_with(&self.value),
            FilterOp::Contains => text.contains(&self.value),
        }
    }
}

fn lookup<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(doc, |node, key| match node {
        Value::Object(map) => map.get(key),
        Value::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}
