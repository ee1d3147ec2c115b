//! JSON-file store backends.
//!
//! Each backend keeps its table in memory and rewrites the affected snapshot
//! file after every mutation. When the write fails the in-memory table is
//! rolled back, so memory never runs ahead of disk.

use std::path::PathBuf;
use std::sync::RwLock;

use tracing::{debug, info, warn};
use uuid::Uuid;

use super::memory::{MetricTable, ModelTable, RunTable};
use super::{MetricSeries, ModelStore, RunRegistry, poisoned};
use crate::error::Result;
use crate::persistence::{atomic_write_json, load_json, remove_file};
use crate::types::{AiModel, ModelMetric, ProgressUpdate, RunStatus, TrainingRun};

/// Run registry persisted to a single `runs.json` snapshot.
#[derive(Debug)]
pub struct FileRunRegistry {
    path: PathBuf,
    table: RwLock<RunTable>,
}

impl FileRunRegistry {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let runs: Vec<TrainingRun> = load_json(&path)?.unwrap_or_default();
        info!(count = runs.len(), path = %path.display(), "Loaded runs");
        Ok(Self {
            path,
            table: RwLock::new(RunTable::from_runs(runs)),
        })
    }

    fn write<R>(&self, f: impl FnOnce(&mut RunTable) -> Result<R>) -> Result<R> {
        let mut table = self.table.write().map_err(poisoned)?;
        let before = table.clone();
        let out = f(&mut *table)?;
        if let Err(e) = atomic_write_json(&self.path, &table.snapshot()) {
            warn!(error = %e, path = %self.path.display(), "Failed to persist runs");
            *table = before;
            return Err(e.into());
        }
        Ok(out)
    }
}

impl RunRegistry for FileRunRegistry {
    fn create(&self, run: TrainingRun) -> Result<Uuid> {
        self.write(|t| t.create(run))
    }

    fn get(&self, id: Uuid) -> Result<TrainingRun> {
        self.table.read().map_err(poisoned)?.get(id)
    }

    fn list(&self) -> Result<Vec<TrainingRun>> {
        Ok(self.table.read().map_err(poisoned)?.snapshot())
    }

    fn set_status(&self, id: Uuid, from: RunStatus, to: RunStatus) -> Result<TrainingRun> {
        self.write(|t| t.set_status(id, from, to))
    }

    fn update_progress(&self, id: Uuid, update: &ProgressUpdate) -> Result<TrainingRun> {
        self.write(|t| t.update_progress(id, update))
    }

    fn fail(&self, id: Uuid, message: &str) -> Result<TrainingRun> {
        self.write(|t| t.fail(id, message))
    }

    fn reset(&self, id: Uuid) -> Result<TrainingRun> {
        self.write(|t| t.reset(id))
    }

    fn delete(&self, id: Uuid) -> Result<()> {
        self.write(|t| t.delete(id))
    }
}

/// Metric series persisted as one `<run_id>.json` file per run.
#[derive(Debug)]
pub struct FileMetricSeries {
    dir: PathBuf,
    table: RwLock<MetricTable>,
}

impl FileMetricSeries {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let mut table = MetricTable::default();
        let mut loaded = 0usize;
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(run_id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| Uuid::parse_str(s).ok())
            else {
                debug!(path = %path.display(), "Skipping non-series file");
                continue;
            };
            let points: Vec<ModelMetric> = load_json(&path)?.unwrap_or_default();
            table.insert_series(run_id, points);
            loaded += 1;
        }
        info!(series = loaded, dir = %dir.display(), "Loaded metric series");
        Ok(Self {
            dir,
            table: RwLock::new(table),
        })
    }

    fn series_path(&self, run_id: Uuid) -> PathBuf {
        self.dir.join(format!("{run_id}.json"))
    }

    fn persist(&self, table: &MetricTable, run_id: Uuid) -> std::io::Result<()> {
        atomic_write_json(&self.series_path(run_id), &table.series(run_id))
    }
}

impl MetricSeries for FileMetricSeries {
    fn append(&self, metric: ModelMetric) -> Result<()> {
        let mut table = self.table.write().map_err(poisoned)?;
        let (run_id, epoch) = (metric.run_id, metric.epoch);
        table.append(metric)?;
        if let Err(e) = self.persist(&table, run_id) {
            table.retract(run_id, epoch);
            return Err(e.into());
        }
        Ok(())
    }

    fn list(&self, run_id: Uuid) -> Result<Vec<ModelMetric>> {
        Ok(self.table.read().map_err(poisoned)?.series(run_id).to_vec())
    }

    fn len(&self, run_id: Uuid) -> Result<usize> {
        Ok(self.table.read().map_err(poisoned)?.series(run_id).len())
    }

    fn retract(&self, run_id: Uuid, epoch: u32) -> Result<bool> {
        let mut table = self.table.write().map_err(poisoned)?;
        let Some(removed) = table.retract(run_id, epoch) else {
            return Ok(false);
        };
        if let Err(e) = self.persist(&table, run_id) {
            table.append(removed)?;
            return Err(e.into());
        }
        Ok(true)
    }

    fn delete_run(&self, run_id: Uuid) -> Result<()> {
        let mut table = self.table.write().map_err(poisoned)?;
        let removed = table.remove(run_id);
        if let Err(e) = remove_file(&self.series_path(run_id)) {
            if let Some(points) = removed {
                table.insert_series(run_id, points);
            }
            return Err(e.into());
        }
        Ok(())
    }
}

/// Model store persisted to a single `models.json` snapshot.
#[derive(Debug)]
pub struct FileModelStore {
    path: PathBuf,
    table: RwLock<ModelTable>,
}

impl FileModelStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let models: Vec<AiModel> = load_json(&path)?.unwrap_or_default();
        info!(count = models.len(), path = %path.display(), "Loaded models");
        Ok(Self {
            path,
            table: RwLock::new(ModelTable::from_models(models)),
        })
    }

    fn write<R>(&self, f: impl FnOnce(&mut ModelTable) -> Result<R>) -> Result<R> {
        let mut table = self.table.write().map_err(poisoned)?;
        let before = table.clone();
        let out = f(&mut *table)?;
        if let Err(e) = atomic_write_json(&self.path, &table.snapshot()) {
            warn!(error = %e, path = %self.path.display(), "Failed to persist models");
            *table = before;
            return Err(e.into());
        }
        Ok(out)
    }
}

impl ModelStore for FileModelStore {
    fn insert(&self, model: AiModel) -> Result<Uuid> {
        self.write(|t| t.insert(model))
    }

    fn get(&self, id: Uuid) -> Result<AiModel> {
        self.table.read().map_err(poisoned)?.get(id)
    }

    fn list(&self) -> Result<Vec<AiModel>> {
        Ok(self.table.read().map_err(poisoned)?.snapshot())
    }

    fn modify(&self, id: Uuid, f: &mut dyn FnMut(&mut AiModel)) -> Result<AiModel> {
        self.write(|t| t.modify(id, f))
    }
}
