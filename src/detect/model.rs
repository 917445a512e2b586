//! Model weights: selection, download and session caching

use crate::error::{Error, Result};
use futures_util::StreamExt;
use lru::LruCache;
use ort::execution_providers::{CPUExecutionProvider, CUDAExecutionProvider};
use ort::session::Session;
use parking_lot::Mutex;
use std::fmt;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;

/// Preset used when no model is named
pub const DEFAULT_MODEL: &str = "FFDNet-L";

const HUB_BASE_URL: &str = "https://huggingface.co";

/// Published FFDNet checkpoints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Preset {
    Small,
    Large,
}

impl Preset {
    pub fn name(&self) -> &'static str {
        match self {
            Preset::Small => "FFDNet-S",
            Preset::Large => "FFDNet-L",
        }
    }

    /// Hub repository holding the ONNX export
    pub fn repo(&self) -> &'static str {
        match self {
            Preset::Small => "jbarrow/FFDNet-S-cpu",
            Preset::Large => "jbarrow/FFDNet-L-cpu",
        }
    }

    pub fn file_name(&self) -> String {
        format!("{}.onnx", self.name())
    }
}

/// Where the weights come from
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ModelSource {
    Preset(Preset),
    Path(PathBuf),
}

impl ModelSource {
    /// Preset names match case-insensitively; anything else is a file path
    pub fn parse(model: &str) -> Self {
        match model.trim().to_ascii_lowercase().as_str() {
            "ffdnet-s" => ModelSource::Preset(Preset::Small),
            "ffdnet-l" => ModelSource::Preset(Preset::Large),
            _ => ModelSource::Path(PathBuf::from(model)),
        }
    }
}

impl fmt::Display for ModelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelSource::Preset(preset) => f.write_str(preset.name()),
            ModelSource::Path(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Inference device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Device {
    Cpu,
    Cuda(i32),
}

impl FromStr for Device {
    type Err = Error;

    /// Accepts `cpu`, `cuda`, `cuda:N` or a bare GPU index `N`
    fn from_str(s: &str) -> Result<Self> {
        let value = s.trim().to_ascii_lowercase();
        let invalid = || Error::Model {
            reason: format!("Unsupported device: {}", s),
        };

        match value.as_str() {
            "cpu" => Ok(Device::Cpu),
            "cuda" => Ok(Device::Cuda(0)),
            other => {
                let index = other.strip_prefix("cuda:").unwrap_or(other);
                let id: i32 = index.parse().map_err(|_| invalid())?;
                if id < 0 {
                    return Err(invalid());
                }
                Ok(Device::Cuda(id))
            }
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => f.write_str("cpu"),
            Device::Cuda(id) => write!(f, "cuda:{}", id),
        }
    }
}

/// Resolves a [`ModelSource`] to an ONNX file on disk, downloading presets
/// into a local directory the first time they are used.
///
/// Downloads are serialized across clones of the store, and each one streams
/// into its own temporary file before being moved into place.
#[derive(Debug, Clone)]
pub struct ModelStore {
    dir: PathBuf,
    max_download_bytes: u64,
    base_url: String,
    download_lock: Arc<tokio::sync::Mutex<()>>,
}

impl ModelStore {
    pub fn new(dir: impl Into<PathBuf>, max_download_bytes: u64) -> Self {
        Self {
            dir: dir.into(),
            max_download_bytes,
            base_url: HUB_BASE_URL.to_string(),
            download_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Point preset downloads at a mirror
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// `$PDF_FORMIFY_MODEL_DIR`, else the user cache directory
    pub fn default_dir() -> PathBuf {
        if let Some(dir) = std::env::var_os("PDF_FORMIFY_MODEL_DIR") {
            return PathBuf::from(dir);
        }
        let cache_root = std::env::var_os("XDG_CACHE_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".cache")))
            .unwrap_or_else(std::env::temp_dir);
        cache_root.join("pdf-formify").join("models")
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Local path a preset is stored at
    pub fn preset_path(&self, preset: Preset) -> PathBuf {
        self.dir.join(preset.name()).join(preset.file_name())
    }

    fn preset_url(&self, preset: Preset) -> String {
        format!(
            "{}/{}/resolve/main/{}",
            self.base_url,
            preset.repo(),
            preset.file_name()
        )
    }

    /// Local ONNX file for `source`, fetching it when needed
    pub async fn resolve(&self, source: &ModelSource) -> Result<PathBuf> {
        match source {
            ModelSource::Path(path) => {
                if !path.is_file() {
                    return Err(Error::Model {
                        reason: format!("Model file not found: {}", path.display()),
                    });
                }
                Ok(path.clone())
            }
            ModelSource::Preset(preset) => {
                let path = self.preset_path(*preset);
                if path.is_file() {
                    return Ok(path);
                }

                let _guard = self.download_lock.lock().await;
                // Another request may have finished the download while we waited
                if path.is_file() {
                    return Ok(path);
                }
                self.download(&self.preset_url(*preset), &path).await?;
                Ok(path)
            }
        }
    }

    /// Stream `url` into `dest`; the file only appears once fully written
    async fn download(&self, url: &str, dest: &Path) -> Result<()> {
        tracing::info!(url, dest = %dest.display(), "downloading model weights");

        let parent = dest.parent().unwrap_or_else(|| Path::new("."));
        tokio::fs::create_dir_all(parent).await?;

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(600))
            .build()
            .map_err(Error::HttpRequest)?;

        let response = client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(Error::ModelDownload {
                reason: format!("HTTP request failed with status: {}", response.status()),
            });
        }

        if let Some(content_length) = response.content_length() {
            if content_length > self.max_download_bytes {
                return Err(Error::ModelDownload {
                    reason: format!(
                        "Model is {} bytes, limit is {}",
                        content_length, self.max_download_bytes
                    ),
                });
            }
        }

        // Removed on drop unless persisted
        let partial = tempfile::Builder::new()
            .suffix(".onnx.part")
            .tempfile_in(parent)?
            .into_temp_path();
        self.stream_to_file(response, &partial).await?;

        partial.persist(dest).map_err(|e| Error::Io(e.error))?;
        Ok(())
    }

    async fn stream_to_file(&self, response: reqwest::Response, path: &Path) -> Result<()> {
        let mut file = tokio::fs::File::create(path).await?;
        let mut written: u64 = 0;
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(Error::HttpRequest)?;
            written += chunk.len() as u64;
            if written > self.max_download_bytes {
                return Err(Error::ModelDownload {
                    reason: format!("Model exceeds {} bytes", self.max_download_bytes),
                });
            }
            file.write_all(&chunk).await?;
        }

        file.flush().await?;
        tracing::debug!(bytes = written, "model download complete");
        Ok(())
    }
}

/// A loaded ONNX session shared between requests
pub type SharedSession = Arc<Mutex<Session>>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SessionKey {
    model: PathBuf,
    fast: bool,
    device: Device,
}

/// Loaded sessions keyed by model file, mode and device.
///
/// Owned by whoever drives the pipeline (the MCP server holds one for its
/// lifetime). Loading happens outside the lock, so two requests racing on a
/// cold key may both load; the later insert wins.
pub struct ModelCache {
    inner: Mutex<LruCache<SessionKey, SharedSession>>,
}

impl ModelCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Cached session for the key, loading it on a miss
    pub fn get_or_load(&self, model: &Path, fast: bool, device: Device) -> Result<SharedSession> {
        let key = SessionKey {
            model: model.to_path_buf(),
            fast,
            device,
        };

        if let Some(session) = self.inner.lock().get(&key) {
            return Ok(Arc::clone(session));
        }

        let session = Arc::new(Mutex::new(load_session(model, device)?));
        self.inner.lock().put(key, Arc::clone(&session));
        Ok(session)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }
}

impl Default for ModelCache {
    fn default() -> Self {
        Self::new(4)
    }
}

fn model_error<E: fmt::Display>(path: &Path) -> impl Fn(E) -> Error + '_ {
    move |e| Error::Model {
        reason: format!("{}: {}", path.display(), e),
    }
}

fn load_session(path: &Path, device: Device) -> Result<Session> {
    tracing::info!(model = %path.display(), %device, "loading detection model");

    let builder = Session::builder().map_err(model_error(path))?;
    let builder = match device {
        Device::Cpu => builder.with_execution_providers([CPUExecutionProvider::default().build()]),
        Device::Cuda(id) => builder.with_execution_providers([
            CUDAExecutionProvider::default().with_device_id(id).build(),
            CPUExecutionProvider::default().build(),
        ]),
    }
    .map_err(model_error(path))?;

    builder.commit_from_file(path).map_err(model_error(path))
}
