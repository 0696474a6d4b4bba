//! Stage library, loader seam and isolation release handles.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use conduit_types::{ConduitError, Result, StageConfiguration, StageDefinition};

use crate::stage::Stage;

// ---------------------------------------------------------------------------
// StageLibrary
// ---------------------------------------------------------------------------

pub type StageFactory = Arc<dyn Fn(&StageConfiguration) -> Result<Box<dyn Stage>> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct StageKey {
    library: String,
    name: String,
    version: String,
}

struct LibraryEntry {
    definition: StageDefinition,
    factory: StageFactory,
}

/// Registry of available stages keyed by `(library, name, version)`.
#[derive(Default)]
pub struct StageLibrary {
    stages: BTreeMap<StageKey, LibraryEntry>,
}

impl fmt::Debug for StageLibrary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.stages.values().map(|e| e.definition.qualified_name()))
            .finish()
    }
}

impl StageLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, definition: StageDefinition, factory: F)
    where
        F: Fn(&StageConfiguration) -> Result<Box<dyn Stage>> + Send + Sync + 'static,
    {
        let key = StageKey {
            library: definition.library.clone(),
            name: definition.name.clone(),
            version: definition.version.clone(),
        };
        self.stages.insert(
            key,
            LibraryEntry {
                definition,
                factory: Arc::new(factory),
            },
        );
    }

    pub fn definition(&self, library: &str, name: &str, version: &str) -> Option<&StageDefinition> {
        self.entry(library, name, version).map(|e| &e.definition)
    }

    /// Definition for the stage a configuration refers to.
    pub fn definition_for(&self, conf: &StageConfiguration) -> Option<&StageDefinition> {
        self.definition(&conf.library, &conf.stage_name, &conf.stage_version)
    }

    pub fn has(&self, library: &str, name: &str, version: &str) -> bool {
        self.entry(library, name, version).is_some()
    }

    /// All definitions, ordered by library, name and version.
    pub fn definitions(&self) -> impl Iterator<Item = &StageDefinition> {
        self.stages.values().map(|e| &e.definition)
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Instantiate the stage a configuration refers to.
    pub fn create(&self, conf: &StageConfiguration) -> Result<(StageDefinition, Box<dyn Stage>)> {
        let entry = self
            .entry(&conf.library, &conf.stage_name, &conf.stage_version)
            .ok_or_else(|| ConduitError::StageLoad {
                library: conf.library.clone(),
                stage: conf.stage_name.clone(),
                message: format!("version '{}' is not in the stage library", conf.stage_version),
            })?;
        let stage = (entry.factory)(conf)?;
        Ok((entry.definition.clone(), stage))
    }

    fn entry(&self, library: &str, name: &str, version: &str) -> Option<&LibraryEntry> {
        self.stages.get(&StageKey {
            library: library.to_string(),
            name: name.to_string(),
            version: version.to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// ReleaseHandle
// ---------------------------------------------------------------------------

type ReleaseFn = Box<dyn FnOnce() -> Result<()> + Send>;

/// Single-use capability that frees a stage's isolation context.
///
/// `release` consumes the handle, so a handle can never be released twice.
pub struct ReleaseHandle {
    instance_name: String,
    release: ReleaseFn,
}

impl ReleaseHandle {
    pub fn new<F>(instance_name: impl Into<String>, release: F) -> Self
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        Self {
            instance_name: instance_name.into(),
            release: Box::new(release),
        }
    }

    /// A handle with nothing to free.
    pub fn noop(instance_name: impl Into<String>) -> Self {
        Self::new(instance_name, || Ok(()))
    }

    pub fn instance_name(&self) -> &str {
        &self.instance_name
    }

    pub fn release(self) -> Result<()> {
        (self.release)()
    }
}

impl fmt::Debug for ReleaseHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReleaseHandle")
            .field("instance_name", &self.instance_name)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// StageLoader
// ---------------------------------------------------------------------------

/// A freshly instantiated stage plus the handle that frees its isolation context.
pub struct LoadedStage {
    pub stage: Box<dyn Stage>,
    pub definition: StageDefinition,
    pub release: ReleaseHandle,
}

/// Instantiates stage plugins for a pipeline.
pub trait StageLoader: Send + Sync {
    fn load(&self, conf: &StageConfiguration) -> Result<LoadedStage>;
}

// ---------------------------------------------------------------------------
// IsolationTracker
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct TrackerState {
    live: HashSet<String>,
    opened: HashMap<String, usize>,
    released: HashMap<String, usize>,
    failing: HashSet<String>,
}

/// Bookkeeping of open isolation contexts, shared by the loader and its handles.
#[derive(Debug, Clone, Default)]
pub struct IsolationTracker {
    state: Arc<Mutex<TrackerState>>,
}

impl IsolationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        // the state stays consistent even if a holder panicked
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn open(&self, instance_name: &str) {
        let mut state = self.lock();
        state.live.insert(instance_name.to_string());
        *state.opened.entry(instance_name.to_string()).or_default() += 1;
    }

    fn close(&self, instance_name: &str) -> Result<()> {
        let mut state = self.lock();
        *state.released.entry(instance_name.to_string()).or_default() += 1;
        state.live.remove(instance_name);
        if state.failing.contains(instance_name) {
            return Err(ConduitError::Release {
                instance_name: instance_name.to_string(),
                message: "isolation context refused to close".to_string(),
            });
        }
        Ok(())
    }

    /// Make releasing `instance_name` report a failure.
    pub fn fail_release_for(&self, instance_name: impl Into<String>) {
        self.lock().failing.insert(instance_name.into());
    }

    /// Number of contexts opened and not yet released.
    pub fn live(&self) -> usize {
        self.lock().live.len()
    }

    pub fn opened(&self, instance_name: &str) -> usize {
        self.lock().opened.get(instance_name).copied().unwrap_or(0)
    }

    pub fn release_count(&self, instance_name: &str) -> usize {
        self.lock().released.get(instance_name).copied().unwrap_or(0)
    }

    pub fn total_released(&self) -> usize {
        self.lock().released.values().sum()
    }
}

// ---------------------------------------------------------------------------
// LibraryLoader
// ---------------------------------------------------------------------------

/// Loads stages from a [`StageLibrary`], one isolation context per instance.
#[derive(Debug, Clone)]
pub struct LibraryLoader {
    library: Arc<StageLibrary>,
    tracker: IsolationTracker,
}

impl LibraryLoader {
    pub fn new(library: Arc<StageLibrary>) -> Self {
        Self {
            library,
            tracker: IsolationTracker::new(),
        }
    }

    pub fn with_tracker(library: Arc<StageLibrary>, tracker: IsolationTracker) -> Self {
        Self { library, tracker }
    }

    pub fn tracker(&self) -> &IsolationTracker {
        &self.tracker
    }

    pub fn library(&self) -> &Arc<StageLibrary> {
        &self.library
    }
}

impl StageLoader for LibraryLoader {
    fn load(&self, conf: &StageConfiguration) -> Result<LoadedStage> {
        let (definition, stage) = self.library.create(conf)?;
        self.tracker.open(&conf.instance_name);
        let tracker = self.tracker.clone();
        let instance = conf.instance_name.clone();
        tracing::debug!(stage = %conf.instance_name, definition = %definition.qualified_name(), "Opened isolation context");
        Ok(LoadedStage {
            stage,
            definition,
            release: ReleaseHandle::new(conf.instance_name.clone(), move || {
                tracker.close(&instance)
            }),
        })
    }
}
