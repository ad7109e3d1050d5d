//! Typed views over the metrics in received payloads.
//!
//! The message callback hands applications the raw protobuf payload; these
//! helpers lift its metrics into structured form, enforcing the birth-time
//! uniqueness rules in the process.

use std::collections::HashSet;

use thiserror::Error;

use spb_types::payload::{DataType, Metric};
use spb_types::{MetricId, MetricValue};

#[derive(Debug, Error, PartialEq)]
pub enum MetricExtractError {
    #[error("metric has neither a name nor an alias")]
    MissingIdentifier,
    #[error("birth metric has no name")]
    MissingName,
    #[error("metric {0:?} has no datatype")]
    MissingDatatype(String),
    #[error("metric {name:?} has an unknown datatype {datatype}")]
    UnknownDatatype { name: String, datatype: u32 },
    #[error("metric has neither a value nor an is_null marker")]
    MissingValue,
    #[error("duplicate metric name {0:?} in birth payload")]
    DuplicateName(String),
    #[error("duplicate metric alias {0} in birth payload")]
    DuplicateAlias(u64),
}

/// Identity a birth payload establishes for one metric.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricBirthDetails {
    pub name: String,
    pub alias: Option<u64>,
    pub datatype: DataType,
}

impl MetricBirthDetails {
    /// The identifier later data messages will use: the alias when one was
    /// established, the name otherwise.
    pub fn metric_id(&self) -> MetricId {
        match self.alias {
            Some(alias) => MetricId::Alias(alias),
            None => MetricId::Name(self.name.clone()),
        }
    }
}

/// The value-bearing part of a received metric. `value` is `None` for an
/// explicit null.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricDetails {
    pub value: Option<MetricValue>,
    pub timestamp: Option<u64>,
    pub is_historical: bool,
    pub is_transient: bool,
}

fn details_from_metric(metric: &Metric) -> Result<MetricDetails, MetricExtractError> {
    let value = match (&metric.value, metric.is_null) {
        (Some(value), _) => Some(MetricValue(value.clone())),
        (None, Some(true)) => None,
        _ => return Err(MetricExtractError::MissingValue),
    };
    Ok(MetricDetails {
        value,
        timestamp: metric.timestamp,
        is_historical: metric.is_historical.unwrap_or(false),
        is_transient: metric.is_transient.unwrap_or(false),
    })
}

/// Extract the metrics of an NBIRTH/DBIRTH payload.
///
/// Birth metrics must carry a name and a datatype; names and aliases must
/// be unique within the payload.
pub fn birth_metrics(
    metrics: &[Metric],
) -> Result<Vec<(MetricBirthDetails, MetricDetails)>, MetricExtractError> {
    let mut seen_names = HashSet::with_capacity(metrics.len());
    let mut seen_aliases = HashSet::with_capacity(metrics.len());
    let mut results = Vec::with_capacity(metrics.len());

    for metric in metrics {
        let name = metric.name.clone().ok_or(MetricExtractError::MissingName)?;
        if !seen_names.insert(name.clone()) {
            return Err(MetricExtractError::DuplicateName(name));
        }
        let datatype_raw = metric
            .datatype
            .ok_or_else(|| MetricExtractError::MissingDatatype(name.clone()))?;
        let datatype =
            DataType::try_from(datatype_raw).map_err(|_| MetricExtractError::UnknownDatatype {
                name: name.clone(),
                datatype: datatype_raw,
            })?;
        if let Some(alias) = metric.alias {
            if !seen_aliases.insert(alias) {
                return Err(MetricExtractError::DuplicateAlias(alias));
            }
        }

        let birth_details = MetricBirthDetails {
            name,
            alias: metric.alias,
            datatype,
        };
        let details = details_from_metric(metric)?;
        results.push((birth_details, details));
    }
    Ok(results)
}

/// Extract the metrics of an NDATA/DDATA/NCMD/DCMD payload, keyed by alias
/// when present and name otherwise.
pub fn data_metrics(
    metrics: &[Metric],
) -> Result<Vec<(MetricId, MetricDetails)>, MetricExtractError> {
    let mut results = Vec::with_capacity(metrics.len());
    for metric in metrics {
        let id = if let Some(alias) = metric.alias {
            MetricId::Alias(alias)
        } else if let Some(name) = &metric.name {
            MetricId::Name(name.clone())
        } else {
            return Err(MetricExtractError::MissingIdentifier);
        };
        results.push((id, details_from_metric(metric)?));
    }
    Ok(results)
}
