//! Consistent read views of a run and its metric history.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::store::{MetricSeries, RunRegistry};
use crate::types::{MetricPoint, ModelMetric, RunView, TrainingRun};

/// A run together with exactly `run.epochs_completed` metric points
/// (or the last `limit` of them for a recent view).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub run: RunView,
    pub metrics: Vec<MetricPoint>,
}

/// Assembles snapshots from the registry and the metric series.
///
/// The run is read before the series. Within a tick the series append
/// precedes the registry write, so the series is never shorter than the
/// run implies; any extra trailing point is trimmed.
#[derive(Clone)]
pub struct SnapshotReader {
    runs: Arc<dyn RunRegistry>,
    metrics: Arc<dyn MetricSeries>,
}

impl SnapshotReader {
    pub fn new(runs: Arc<dyn RunRegistry>, metrics: Arc<dyn MetricSeries>) -> Self {
        Self { runs, metrics }
    }

    pub fn assemble_snapshot(&self, run_id: Uuid) -> Result<RunSnapshot> {
        let (run, points) = self.read(run_id)?;
        Ok(RunSnapshot {
            run: RunView::from(&run),
            metrics: points.iter().map(MetricPoint::from).collect(),
        })
    }

    /// Like [`assemble_snapshot`](Self::assemble_snapshot) but keeps only
    /// the last `limit` points.
    pub fn assemble_recent(&self, run_id: Uuid, limit: usize) -> Result<RunSnapshot> {
        let (run, points) = self.read(run_id)?;
        let skip = points.len().saturating_sub(limit);
        Ok(RunSnapshot {
            run: RunView::from(&run),
            metrics: points[skip..].iter().map(MetricPoint::from).collect(),
        })
    }

    pub fn fetch_run(&self, run_id: Uuid) -> Result<RunView> {
        Ok(RunView::from(&self.runs.get(run_id)?))
    }

    pub fn fetch_metrics(&self, run_id: Uuid) -> Result<Vec<MetricPoint>> {
        Ok(self.read(run_id)?.1.iter().map(MetricPoint::from).collect())
    }

    fn read(&self, run_id: Uuid) -> Result<(TrainingRun, Vec<ModelMetric>)> {
        let run = self.runs.get(run_id)?;
        let mut points = self.metrics.list(run_id)?;
        points.truncate(run.epochs_completed as usize);
        Ok((run, points))
    }
}
