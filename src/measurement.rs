//! Optional measurement sink.
//!
//! A [`Recorder`] is handed to enqueue calls; the scheduler records every transfer
//! and kernel event under a symbolic name. [`Recorder::report`] resolves the events
//! into serializable [`Measurement`] rows once they have completed.

use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::backend::DeviceEvent;
use crate::error::Result;

/// Unit a data point is reported in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Unit {
    Microsecond,
    Byte,
}

impl Unit {
    pub const fn symbol(&self) -> &'static str {
        match self {
            Unit::Microsecond => "us",
            Unit::Byte => "B",
        }
    }
}

/// Kind of a recorded data point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DataPointKind {
    HostToDevice,
    DeviceToHost,
    Kernel,
    Marker,
}

impl DataPointKind {
    pub const ALL: [DataPointKind; 4] = [
        DataPointKind::HostToDevice,
        DataPointKind::DeviceToHost,
        DataPointKind::Kernel,
        DataPointKind::Marker,
    ];

    /// Display name.
    pub const fn name(&self) -> &'static str {
        match self {
            DataPointKind::HostToDevice => "H2D",
            DataPointKind::DeviceToHost => "D2H",
            DataPointKind::Kernel => "Kernel",
            DataPointKind::Marker => "Marker",
        }
    }

    pub const fn unit(&self) -> Unit {
        Unit::Microsecond
    }
}

struct Record<E> {
    name: String,
    kind: DataPointKind,
    event: E,
    bytes: Option<usize>,
}

/// One resolved data point.
#[derive(Debug, Clone, Serialize)]
pub struct Measurement {
    pub name: String,
    pub kind: &'static str,
    pub unit: &'static str,
    pub duration_us: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes: Option<usize>,
}

/// Shared event sink. Clones record into the same list.
pub struct Recorder<E> {
    records: Arc<Mutex<Vec<Record<E>>>>,
}

impl<E> Clone for Recorder<E> {
    fn clone(&self) -> Self {
        Self {
            records: Arc::clone(&self.records),
        }
    }
}

impl<E> Default for Recorder<E> {
    fn default() -> Self {
        Self {
            records: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl<E: DeviceEvent> Recorder<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, name: impl Into<String>, kind: DataPointKind, event: E) {
        self.push(name.into(), kind, event, None);
    }

    /// Record a transfer together with its size.
    pub fn record_transfer(
        &self,
        name: impl Into<String>,
        kind: DataPointKind,
        event: E,
        bytes: usize,
    ) {
        self.push(name.into(), kind, event, Some(bytes));
    }

    fn push(&self, name: String, kind: DataPointKind, event: E, bytes: Option<usize>) {
        let mut records = self
            .records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        records.push(Record {
            name,
            kind,
            event,
            bytes,
        });
    }

    pub fn len(&self) -> usize {
        self.records
            .lock()
            .map(|r| r.len())
            .unwrap_or_else(|poisoned| poisoned.into_inner().len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Count of records of one kind.
    pub fn count(&self, kind: DataPointKind) -> usize {
        let records = self
            .records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        records.iter().filter(|r| r.kind == kind).count()
    }

    /// Wait for every recorded event and resolve it into a row.
    pub fn report(&self) -> Result<Vec<Measurement>> {
        let records = self
            .records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut rows = Vec::with_capacity(records.len());
        for record in records.iter() {
            record.event.wait()?;
            rows.push(Measurement {
                name: record.name.clone(),
                kind: record.kind.name(),
                unit: record.kind.unit().symbol(),
                duration_us: record.event.elapsed().map(|d| d.as_secs_f64() * 1e6),
                bytes: record.bytes,
            });
        }
        Ok(rows)
    }

    /// [`report`](Self::report) rendered as a JSON array.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.report()?)?)
    }
}
