//! Aggregation folds
//!
//! Pure functions that seed a new [`Reading`] from the first sample, or fold
//! a further sample into an existing one. Every [`AggregationKind`] is
//! handled in one exhaustive match so adding semantics for `range` or `func`
//! touches a single place.

use chrono::{DateTime, Utc};
use tally_common::{
    AggregationKind, DurationData, Event, Meter, Reading, Result, SampleType, Segment, TallyError,
};

use crate::extract::ValuePath;

const MILLIS_PER_HOUR: f64 = 3_600_000.0;

/// The value an event contributes to a reading
#[derive(Debug, Clone, PartialEq)]
pub enum Sample {
    /// The event counts, no value is read
    Tick,
    Number(f64),
    Text(String),
}

impl Sample {
    /// Extract the sample a meter needs from an event
    pub fn from_event(meter: &Meter, event: &Event) -> Result<Self> {
        if let kind @ (AggregationKind::Range | AggregationKind::Func) = meter.aggregation {
            return Err(TallyError::UnsupportedAggregation(kind));
        }

        match meter.aggregation.sample_type() {
            SampleType::None => Ok(Sample::Tick),
            SampleType::Number => {
                let path = ValuePath::parse(&meter.value_property)?;
                Ok(Sample::Number(path.number(&event.data)?))
            }
            SampleType::Text => {
                let path = ValuePath::parse(&meter.value_property)?;
                Ok(Sample::Text(path.text(&event.data)?))
            }
        }
    }

    fn number(&self, kind: AggregationKind) -> Result<f64> {
        match self {
            Sample::Number(v) => Ok(*v),
            _ => Err(TallyError::Internal(format!("{} expects a numeric sample", kind))),
        }
    }

    fn text(&self, kind: AggregationKind) -> Result<&str> {
        match self {
            Sample::Text(v) => Ok(v),
            _ => Err(TallyError::Internal(format!("{} expects a text sample", kind))),
        }
    }
}

/// Seed a reading from its first sample. `count` starts at 1.
pub fn seed(
    meter: &Meter,
    subject: &str,
    segment: &Segment,
    sample: &Sample,
    at: DateTime<Utc>,
) -> Result<Reading> {
    let kind = meter.aggregation;
    let mut reading = Reading::empty(meter, subject, segment);
    reading.count = 1;

    match kind {
        AggregationKind::Count => {}
        AggregationKind::Sum => reading.sum = sample.number(kind)?,
        AggregationKind::Avg => reading.avg = sample.number(kind)?,
        AggregationKind::Max => reading.max = sample.number(kind)?,
        AggregationKind::Min => reading.min = sample.number(kind)?,
        AggregationKind::Duration => {
            reading.duration_data = Some(DurationData {
                total: 0.0,
                unit: sample.number(kind)?,
                last_calculated: at,
            });
        }
        AggregationKind::Unique => {
            reading.unique.insert(sample.text(kind)?.to_string(), 1);
        }
        AggregationKind::Range | AggregationKind::Func => {
            return Err(TallyError::UnsupportedAggregation(kind));
        }
    }

    Ok(reading)
}

/// Fold one more sample into an existing reading
pub fn fold(reading: &mut Reading, sample: &Sample, at: DateTime<Utc>) -> Result<()> {
    let kind = reading.kind;

    match kind {
        AggregationKind::Count => reading.count += 1,
        AggregationKind::Sum => {
            reading.sum += sample.number(kind)?;
            reading.count += 1;
        }
        AggregationKind::Avg => {
            let value = sample.number(kind)?;
            let n = reading.count as f64;
            reading.avg = (reading.avg * n + value) / (n + 1.0);
            reading.count += 1;
        }
        AggregationKind::Max => {
            let value = sample.number(kind)?;
            if value > reading.max {
                reading.max = value;
            }
            reading.count += 1;
        }
        AggregationKind::Min => {
            let value = sample.number(kind)?;
            if value < reading.min {
                reading.min = value;
            }
            reading.count += 1;
        }
        AggregationKind::Duration => {
            let value = sample.number(kind)?;
            let data = reading.duration_data.get_or_insert(DurationData {
                total: 0.0,
                unit: 0.0,
                last_calculated: at,
            });
            let hours = (at - data.last_calculated).num_milliseconds() as f64 / MILLIS_PER_HOUR;
            data.total += hours * data.unit;
            data.unit = value;
            data.last_calculated = at;
            reading.count += 1;
        }
        AggregationKind::Unique => {
            // distinct values live in the map; count stays put
            *reading.unique.entry(sample.text(kind)?.to_string()).or_insert(0) += 1;
        }
        AggregationKind::Range | AggregationKind::Func => {
            return Err(TallyError::UnsupportedAggregation(kind));
        }
    }

    Ok(())
}

/// Next state of a reading given the stored one (if any)
pub fn accumulate(
    current: Option<Reading>,
    meter: &Meter,
    subject: &str,
    segment: &Segment,
    sample: &Sample,
    at: DateTime<Utc>,
) -> Result<Reading> {
    match current {
        None => seed(meter, subject, segment, sample, at),
        Some(mut reading) => {
            if reading.kind != meter.aggregation {
                return Err(TallyError::KindMismatch {
                    stored: reading.kind,
                    expected: meter.aggregation,
                });
            }
            fold(&mut reading, sample, at)?;
            Ok(reading)
        }
    }
}
