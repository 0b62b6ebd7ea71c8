/// Hot-reloadable per-symbol exit overrides
///
/// The overrides document is a JSON map from symbol to exit parameters,
/// shared with the operator/dashboard. We cache it against the file's
/// modification time and only re-read when that watermark moves. Writers
/// do read-modify-write of the whole document behind a lock file, so two
/// processes cannot interleave partial updates; two writers racing on the
/// *same* symbol key still last-write-wins without sub-field merging.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{BrokerError, BrokerResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverrideMode {
    Percent,
    Absolute,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct OverrideRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<OverrideMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_pct: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_pct: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trail_pct: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_cost: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eod_close: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eod_cutoff_min: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eod_close_pct: Option<f64>,
}

impl OverrideRecord {
    /// Overlay `patch` onto self: set fields win, unset fields keep ours.
    pub fn merge(&mut self, patch: &OverrideRecord) {
        macro_rules! take {
            ($field:ident) => {
                if patch.$field.is_some() {
                    self.$field = patch.$field;
                }
            };
        }
        take!(mode);
        take!(target);
        take!(stop);
        take!(target_pct);
        take!(stop_pct);
        take!(trail_pct);
        take!(avg_cost);
        take!(eod_close);
        take!(eod_cutoff_min);
        take!(eod_close_pct);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitSource {
    Config,
    OverridesAbsolute,
    OverridesPercent,
}

impl std::fmt::Display for ExitSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitSource::Config => write!(f, "config"),
            ExitSource::OverridesAbsolute => write!(f, "overrides:absolute"),
            ExitSource::OverridesPercent => write!(f, "overrides:percent"),
        }
    }
}

/// Where to exit on this tick. Recomputed every tick; never cached, since
/// both the overrides and the high-water price move underneath it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExitPlan {
    pub target: f64,
    pub stop: f64,
    pub source: ExitSource,
}

fn trailing_stop(base_stop: f64, trail_pct: Option<f64>, high_water: f64) -> f64 {
    match trail_pct {
        Some(pct) if pct > 0.0 && high_water.is_finite() => {
            base_stop.max(high_water * (1.0 - pct / 100.0))
        }
        _ => base_stop,
    }
}

type Doc = HashMap<String, OverrideRecord>;

pub struct OverrideStore {
    path: PathBuf,
    cache: RwLock<Doc>,
    watermark: RwLock<Option<SystemTime>>,
    write_gate: tokio::sync::Mutex<()>,
}

impl OverrideStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cache: RwLock::new(HashMap::new()),
            watermark: RwLock::new(None),
            write_gate: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Re-read the document only when the file's mtime has moved.
    fn load_if_changed(&self) {
        let Ok(meta) = fs::metadata(&self.path) else {
            return; // no document yet; absence means "base config"
        };
        let Ok(mtime) = meta.modified() else { return };
        if *self.watermark.read().unwrap() == Some(mtime) {
            return;
        }
        match read_doc(&self.path) {
            Ok(doc) => {
                *self.cache.write().unwrap() = doc;
                *self.watermark.write().unwrap() = Some(mtime);
                debug!(path = %self.path.display(), "overrides reloaded");
            }
            Err(err) => warn!(%err, "failed to reload overrides; keeping cached copy"),
        }
    }

    pub fn get(&self, symbol: &str) -> OverrideRecord {
        self.load_if_changed();
        self.cache
            .read()
            .unwrap()
            .get(symbol)
            .cloned()
            .unwrap_or_default()
    }

    /// Poll the document for external edits every few seconds.
    pub fn watch(self: Arc<Self>) -> JoinHandle<()> {
        let store = self;
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(std::time::Duration::from_secs(5));
            loop {
                timer.tick().await;
                store.load_if_changed();
            }
        })
    }

    /// Merge one symbol's fields into the persisted document. Whole-document
    /// read-modify-write behind the lock file; atomic replace; the cache and
    /// watermark are refreshed so an immediate read-back sees this write.
    pub async fn upsert(&self, symbol: &str, patch: OverrideRecord) -> BrokerResult<()> {
        let _gate = self.write_gate.lock().await;
        let _lock = FileLock::acquire(&self.path)?;

        let mut doc = match read_doc(&self.path) {
            Ok(doc) => doc,
            Err(BrokerError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => Doc::new(),
            Err(err) => return Err(err),
        };
        doc.entry(symbol.to_string()).or_default().merge(&patch);
        write_doc_atomic(&self.path, &doc)?;

        let mtime = fs::metadata(&self.path)?.modified()?;
        *self.cache.write().unwrap() = doc;
        *self.watermark.write().unwrap() = Some(mtime);
        Ok(())
    }

    /// Build the exit plan for a tick: config bracket, overridden by an
    /// absolute or percent record, with the trailing stop applied last.
    /// The trailing stop only ever raises the stop.
    pub fn compute_exits(
        &self,
        symbol: &str,
        base_target: Option<f64>,
        base_stop: Option<f64>,
        avg_cost: f64,
        high_water: f64,
        config_trail_pct: Option<f64>,
    ) -> ExitPlan {
        let o = self.get(symbol);
        let mut target = base_target.unwrap_or(f64::MAX);
        let mut stop = base_stop.unwrap_or(0.0);
        let mut source = ExitSource::Config;

        match o.mode {
            Some(OverrideMode::Absolute) => {
                if let Some(t) = o.target.filter(|t| t.is_finite()) {
                    target = t;
                }
                if let Some(s) = o.stop.filter(|s| s.is_finite()) {
                    stop = s;
                }
                source = ExitSource::OverridesAbsolute;
            }
            Some(OverrideMode::Percent) => {
                if let Some(tp) = o.target_pct.filter(|t| t.is_finite()) {
                    target = avg_cost * (1.0 + tp / 100.0);
                }
                if let Some(sp) = o.stop_pct.filter(|s| s.is_finite()) {
                    stop = avg_cost * (1.0 - sp / 100.0);
                }
                source = ExitSource::OverridesPercent;
            }
            None => {}
        }

        let trail = o.trail_pct.or(config_trail_pct);
        ExitPlan {
            target,
            stop: trailing_stop(stop, trail, high_water),
            source,
        }
    }
}

fn read_doc(path: &Path) -> BrokerResult<Doc> {
    let raw = fs::read_to_string(path)?;
    if raw.trim().is_empty() {
        return Ok(Doc::new());
    }
    Ok(serde_json::from_str(&raw)?)
}

fn write_doc_atomic(path: &Path, doc: &Doc) -> BrokerResult<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, serde_json::to_string_pretty(doc)?)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Cross-process exclusion for document writers. Created with
/// create-new semantics; an existing lock file means another writer is
/// mid-update and the caller should retry with backoff.
struct FileLock {
    path: PathBuf,
}

impl FileLock {
    fn acquire(doc_path: &Path) -> BrokerResult<Self> {
        let path = doc_path.with_extension("json.lock");
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => Ok(Self { path }),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(BrokerError::OverridesLocked)
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}
