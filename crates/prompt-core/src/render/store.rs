//! Template storage with explicit change-driven reload.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::render::template::{TemplateEntry, TemplateKind, TemplateSet};
use crate::render::RenderError;

/// Backing storage for template texts.
#[async_trait]
pub trait TemplateSource: Send + Sync {
    async fn load(&self, id: &str) -> Result<String, RenderError>;

    /// Modification marker for a template; `None` when the source has none.
    async fn last_modified(&self, id: &str) -> Result<Option<SystemTime>, RenderError>;
}

/// Templates stored as files under a directory, one file per id.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }
}

#[async_trait]
impl TemplateSource for DirectorySource {
    async fn load(&self, id: &str) -> Result<String, RenderError> {
        tokio::fs::read_to_string(self.path_for(id))
            .await
            .map_err(|e| RenderError::Source {
                id: id.to_string(),
                message: e.to_string(),
            })
    }

    async fn last_modified(&self, id: &str) -> Result<Option<SystemTime>, RenderError> {
        let metadata = tokio::fs::metadata(self.path_for(id))
            .await
            .map_err(|e| RenderError::Source {
                id: id.to_string(),
                message: e.to_string(),
            })?;
        Ok(metadata.modified().ok())
    }
}

/// In-process template source; every `insert` bumps the marker.
#[derive(Debug, Default)]
pub struct MemorySource {
    templates: RwLock<HashMap<String, (String, u64)>>,
    version: std::sync::atomic::AtomicU64,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: impl Into<String>, text: impl Into<String>) {
        let version = self
            .version
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst)
            + 1;
        let mut templates = self
            .templates
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        templates.insert(id.into(), (text.into(), version));
    }
}

#[async_trait]
impl TemplateSource for MemorySource {
    async fn load(&self, id: &str) -> Result<String, RenderError> {
        let templates = self
            .templates
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        templates
            .get(id)
            .map(|(text, _)| text.clone())
            .ok_or_else(|| RenderError::Source {
                id: id.to_string(),
                message: "template not found".to_string(),
            })
    }

    async fn last_modified(&self, id: &str) -> Result<Option<SystemTime>, RenderError> {
        let templates = self
            .templates
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(templates
            .get(id)
            .map(|(_, version)| UNIX_EPOCH + Duration::from_nanos(*version)))
    }
}

type Markers = HashMap<String, Option<SystemTime>>;

/// Owns one feature's template set.
///
/// The set is loaded once and replaced as a whole when `refresh_if_changed`
/// observes a different modification marker on any of its templates.
pub struct TemplateStore {
    source: Arc<dyn TemplateSource>,
    layout: Vec<(TemplateKind, String)>,
    current: RwLock<Arc<TemplateSet>>,
    markers: Mutex<Markers>,
}

impl std::fmt::Debug for TemplateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemplateStore")
            .field("layout", &self.layout)
            .finish()
    }
}

impl TemplateStore {
    /// Load every template named in `layout` (in order) and validate the set.
    pub async fn load(
        source: Arc<dyn TemplateSource>,
        layout: Vec<(TemplateKind, String)>,
    ) -> Result<Self, RenderError> {
        let markers = read_markers(source.as_ref(), &layout).await?;
        let set = load_set(source.as_ref(), &layout).await?;
        tracing::debug!("Loaded template set with {} templates", layout.len());

        Ok(Self {
            source,
            layout,
            current: RwLock::new(Arc::new(set)),
            markers: Mutex::new(markers),
        })
    }

    /// Build a store from in-memory entries.
    pub async fn from_entries(entries: Vec<TemplateEntry>) -> Result<Self, RenderError> {
        let source = MemorySource::new();
        let mut layout = Vec::with_capacity(entries.len());
        for entry in entries {
            layout.push((entry.kind, entry.id.clone()));
            source.insert(entry.id, entry.text);
        }
        Self::load(Arc::new(source), layout).await
    }

    /// The current set; unaffected by later reloads.
    pub fn snapshot(&self) -> Arc<TemplateSet> {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Reload the whole set if any marker changed. Returns whether it reloaded.
    ///
    /// On a failed reload the previous set stays in place.
    pub async fn refresh_if_changed(&self) -> Result<bool, RenderError> {
        let latest = read_markers(self.source.as_ref(), &self.layout).await?;
        {
            let markers = self
                .markers
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if *markers == latest {
                return Ok(false);
            }
        }

        let set = load_set(self.source.as_ref(), &self.layout).await?;
        *self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Arc::new(set);
        *self
            .markers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = latest;

        tracing::info!("Template set reloaded");
        Ok(true)
    }
}

async fn read_markers(
    source: &dyn TemplateSource,
    layout: &[(TemplateKind, String)],
) -> Result<Markers, RenderError> {
    let mut markers = HashMap::with_capacity(layout.len());
    for (_, id) in layout {
        markers.insert(id.clone(), source.last_modified(id).await?);
    }
    Ok(markers)
}

async fn load_set(
    source: &dyn TemplateSource,
    layout: &[(TemplateKind, String)],
) -> Result<TemplateSet, RenderError> {
    let mut entries = Vec::with_capacity(layout.len());
    for (kind, id) in layout {
        let text = source.load(id).await?;
        entries.push(TemplateEntry::new(*kind, id.clone(), text));
    }
    TemplateSet::from_entries(&entries)
}
