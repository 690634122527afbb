//! Embedding model wrapper for fastembed.
//!
//! Provides a high-level interface for generating embeddings:
//! - `TextEmbedder`: the backend seam (fastembed in production)
//! - `Embedder`: the shared handle, loading its backend exactly once
//! - Blank-input fallback and unit normalization of every output vector

use fastembed::{InitOptions, TextEmbedding};
use once_cell::sync::OnceCell;
use std::path::PathBuf;
use std::sync::Mutex;

/// Input used in place of empty or whitespace-only text.
const BLANK_INPUT: &str = " ";

/// Error type for embedding operations
#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("Embedding model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("Embedding generation failed: {0}")]
    EmbeddingFailed(String),

    #[error("Invalid model name: {0}")]
    InvalidModel(String),

    #[error("Dimension mismatch: model produces {got}, configured {expected}")]
    DimensionMismatch { expected: usize, got: usize },
}

/// A text → vector backend.
pub trait TextEmbedder: Send + Sync {
    /// Output dimension of every vector this backend produces.
    fn dimensions(&self) -> usize;

    /// Embed a single, already-prepared text.
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;
}

/// Wrapper around fastembed's TextEmbedding model.
/// Uses a Mutex because fastembed's embed() requires &mut self.
pub struct EmbeddingModel {
    model: Mutex<TextEmbedding>,
    model_name: String,
    dimensions: usize,
}

impl EmbeddingModel {
    /// Create a new embedding model with the given name.
    ///
    /// The model will be downloaded into `cache_dir` on first use if not cached.
    pub fn new(model_name: &str, cache_dir: PathBuf) -> Result<Self, EmbeddingError> {
        let model_enum = Self::parse_model_name(model_name)?;

        std::fs::create_dir_all(&cache_dir).map_err(|e| {
            EmbeddingError::ModelUnavailable(format!("Failed to create models directory: {}", e))
        })?;

        let options = InitOptions::new(model_enum)
            .with_cache_dir(cache_dir)
            .with_show_download_progress(false);

        let mut model = TextEmbedding::try_new(options)
            .map_err(|e| EmbeddingError::ModelUnavailable(e.to_string()))?;

        // Get model dimensions by embedding a test string
        let dimensions = Self::probe_dimensions(&mut model)?;

        Ok(Self {
            model: Mutex::new(model),
            model_name: model_name.to_string(),
            dimensions,
        })
    }

    /// Get the model name
    pub fn name(&self) -> &str {
        &self.model_name
    }

    /// Parse model name string to fastembed enum.
    fn parse_model_name(name: &str) -> Result<fastembed::EmbeddingModel, EmbeddingError> {
        match name.to_lowercase().as_str() {
            "all-minilm-l6-v2" | "sentence-transformers/all-minilm-l6-v2" => {
                Ok(fastembed::EmbeddingModel::AllMiniLML6V2)
            }
            "all-minilm-l6-v2-q" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2Q),
            "bge-small-en-v1.5" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
            "bge-small-en-v1.5-q" => Ok(fastembed::EmbeddingModel::BGESmallENV15Q),
            "bge-base-en-v1.5" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
            "bge-base-en-v1.5-q" => Ok(fastembed::EmbeddingModel::BGEBaseENV15Q),
            "bge-large-en-v1.5" => Ok(fastembed::EmbeddingModel::BGELargeENV15),
            "bge-large-en-v1.5-q" => Ok(fastembed::EmbeddingModel::BGELargeENV15Q),
            _ => Err(EmbeddingError::InvalidModel(format!(
                "Unknown model: {}. Supported models: all-MiniLM-L6-v2, bge-small-en-v1.5, bge-base-en-v1.5, bge-large-en-v1.5 (add -q suffix for quantized)",
                name
            ))),
        }
    }

    /// Probe the model to determine embedding dimensions.
    fn probe_dimensions(model: &mut TextEmbedding) -> Result<usize, EmbeddingError> {
        let test_embeddings = model.embed(vec!["test"], None).map_err(|e| {
            EmbeddingError::ModelUnavailable(format!("Failed to probe dimensions: {}", e))
        })?;

        test_embeddings
            .first()
            .map(|v| v.len())
            .ok_or_else(|| EmbeddingError::ModelUnavailable("Model returned no embedding".to_string()))
    }
}

impl TextEmbedder for EmbeddingModel {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let mut model = self.model.lock().map_err(|e| {
            EmbeddingError::EmbeddingFailed(format!("Failed to acquire model lock: {}", e))
        })?;

        let embeddings = model
            .embed(vec![text], None)
            .map_err(|e| EmbeddingError::EmbeddingFailed(e.to_string()))?;

        embeddings
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::EmbeddingFailed("No embedding returned".to_string()))
    }
}

type Loader = Box<dyn Fn() -> Result<Box<dyn TextEmbedder>, EmbeddingError> + Send + Sync>;

/// Shared, lazily-loaded embedder.
///
/// The backend is constructed on the first `load`/`embed` call and cached for
/// the lifetime of the handle. Concurrent first calls block on the same
/// initialization, so the loader runs at most once per successful load.
pub struct Embedder {
    model_name: String,
    dimensions: usize,
    backend: OnceCell<Box<dyn TextEmbedder>>,
    loader: Loader,
}

impl Embedder {
    /// Embedder backed by a fastembed model, downloaded into `cache_dir`.
    pub fn fastembed(model_name: &str, cache_dir: PathBuf, dimensions: usize) -> Self {
        let name = model_name.to_string();
        Self::with_loader(model_name, dimensions, move || {
            log::info!("Loading embedding model '{}'", name);
            let model = EmbeddingModel::new(&name, cache_dir.clone())?;
            log::info!("Loaded '{}' ({} dimensions)", model.name(), model.dimensions());
            Ok(Box::new(model) as Box<dyn TextEmbedder>)
        })
    }

    /// Embedder with a custom backend constructor.
    pub fn with_loader<F>(model_name: &str, dimensions: usize, loader: F) -> Self
    where
        F: Fn() -> Result<Box<dyn TextEmbedder>, EmbeddingError> + Send + Sync + 'static,
    {
        Self {
            model_name: model_name.to_string(),
            dimensions,
            backend: OnceCell::new(),
            loader: Box::new(loader),
        }
    }

    /// Embedder around an already-constructed backend.
    #[cfg(test)]
    pub fn with_backend<B: TextEmbedder + 'static>(model_name: &str, backend: B) -> Self {
        let dimensions = backend.dimensions();
        let embedder = Self::with_loader(model_name, dimensions, || {
            Err(EmbeddingError::ModelUnavailable("backend already set".to_string()))
        });
        // The cell is fresh, so this cannot fail.
        let _ = embedder.backend.set(Box::new(backend));
        embedder
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    /// Configured output dimension.
    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn is_loaded(&self) -> bool {
        self.backend.get().is_some()
    }

    /// Load the backend if it is not loaded yet, checking its dimension.
    pub fn load(&self) -> Result<&dyn TextEmbedder, EmbeddingError> {
        let backend = self.backend.get_or_try_init(|| {
            let backend = (self.loader)()?;
            if backend.dimensions() != self.dimensions {
                return Err(EmbeddingError::DimensionMismatch {
                    expected: self.dimensions,
                    got: backend.dimensions(),
                });
            }
            Ok(backend)
        })?;
        Ok(backend.as_ref())
    }

    /// Load the model and run one probe embedding so startup fails fast.
    pub fn warm_up(&self) -> Result<(), EmbeddingError> {
        self.embed("warm up").map(|_| ())
    }

    /// Embed `text` into a unit-length vector.
    ///
    /// Blank input is embedded as a single space.
    pub fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let backend = self.load()?;

        let text = text.trim();
        let input = if text.is_empty() { BLANK_INPUT } else { text };

        let mut vector = backend.embed(input)?;
        if vector.len() != self.dimensions {
            return Err(EmbeddingError::DimensionMismatch {
                expected: self.dimensions,
                got: vector.len(),
            });
        }
        normalize(&mut vector);
        Ok(vector)
    }
}

/// Scale `vector` to unit L2 norm in place. Zero vectors are left untouched.
pub fn normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm < f32::EPSILON {
        return;
    }
    for value in vector.iter_mut() {
        *value /= norm;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Backend returning a fixed, unnormalized vector and remembering inputs.
    struct FixedBackend {
        inputs: Arc<Mutex<Vec<String>>>,
        output: Vec<f32>,
    }

    impl TextEmbedder for FixedBackend {
        fn dimensions(&self) -> usize {
            self.output.len()
        }

        fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
            self.inputs.lock().unwrap().push(text.to_string());
            Ok(self.output.clone())
        }
    }

    fn fixed(output: Vec<f32>) -> (Embedder, Arc<Mutex<Vec<String>>>) {
        let inputs = Arc::new(Mutex::new(Vec::new()));
        let backend = FixedBackend {
            inputs: inputs.clone(),
            output,
        };
        (Embedder::with_backend("fixed", backend), inputs)
    }

    #[test]
    fn test_output_is_unit_normalized() {
        let (embedder, _) = fixed(vec![3.0, 4.0, 0.0]);
        let vector = embedder.embed("hello").unwrap();

        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
        assert!((vector[0] - 0.6).abs() < 1e-6);
        assert!((vector[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_blank_input_falls_back_to_space() {
        let (embedder, inputs) = fixed(vec![1.0, 0.0]);
        embedder.embed("").unwrap();
        embedder.embed("   \n\t").unwrap();
        embedder.embed("  padded  ").unwrap();

        let inputs = inputs.lock().unwrap();
        assert_eq!(inputs.as_slice(), &[" ", " ", "padded"]);
    }

    #[test]
    fn test_loader_runs_once_under_concurrent_first_use() {
        let loads = Arc::new(AtomicUsize::new(0));
        let counter = loads.clone();
        let embedder = Arc::new(Embedder::with_loader("counted", 2, move || {
            counter.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(std::time::Duration::from_millis(20));
            Ok(Box::new(FixedBackend {
                inputs: Arc::new(Mutex::new(Vec::new())),
                output: vec![1.0, 1.0],
            }) as Box<dyn TextEmbedder>)
        }));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let embedder = embedder.clone();
                std::thread::spawn(move || embedder.embed("text").unwrap())
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert!(embedder.is_loaded());
    }

    #[test]
    fn test_failed_load_fails_every_call() {
        let embedder = Embedder::with_loader("broken", 4, || {
            Err(EmbeddingError::ModelUnavailable("no weights".to_string()))
        });

        assert!(matches!(
            embedder.embed("a"),
            Err(EmbeddingError::ModelUnavailable(_))
        ));
        assert!(matches!(
            embedder.embed("b"),
            Err(EmbeddingError::ModelUnavailable(_))
        ));
        assert!(!embedder.is_loaded());
    }

    #[test]
    fn test_backend_dimension_mismatch_rejected_at_load() {
        let embedder = Embedder::with_loader("wrong-dim", 384, || {
            Ok(Box::new(FixedBackend {
                inputs: Arc::new(Mutex::new(Vec::new())),
                output: vec![1.0; 768],
            }) as Box<dyn TextEmbedder>)
        });

        let result = embedder.load();
        assert!(matches!(
            result,
            Err(EmbeddingError::DimensionMismatch {
                expected: 384,
                got: 768
            })
        ));
    }

    #[test]
    fn test_warm_up_loads_backend() {
        let embedder = Embedder::with_loader("lazy", 2, || {
            Ok(Box::new(FixedBackend {
                inputs: Arc::new(Mutex::new(Vec::new())),
                output: vec![0.0, 2.0],
            }) as Box<dyn TextEmbedder>)
        });
        assert!(!embedder.is_loaded());
        embedder.warm_up().unwrap();
        assert!(embedder.is_loaded());
    }

    #[test]
    fn test_normalize_leaves_zero_vector() {
        let mut zero = vec![0.0, 0.0];
        normalize(&mut zero);
        assert_eq!(zero, vec![0.0, 0.0]);
    }

    #[test]
    fn test_invalid_model_name() {
        let temp_dir = std::env::temp_dir().join("search-service-embed-invalid");
        let result = EmbeddingModel::new("nonexistent-model", temp_dir);
        assert!(matches!(result, Err(EmbeddingError::InvalidModel(_))));
    }

    // Integration tests require model download - run with --ignored
    #[test]
    #[ignore = "requires model download"]
    fn test_model_creation() {
        let temp_dir = tempfile::tempdir().unwrap();
        let model = EmbeddingModel::new("all-MiniLM-L6-v2", temp_dir.path().to_path_buf()).unwrap();
        assert_eq!(model.name(), "all-MiniLM-L6-v2");
        assert_eq!(model.dimensions(), 384);
    }

    #[test]
    #[ignore = "requires model download"]
    fn test_embedding_is_deterministic() {
        let temp_dir = tempfile::tempdir().unwrap();
        let embedder =
            Embedder::fastembed("all-MiniLM-L6-v2", temp_dir.path().to_path_buf(), 384);

        let first = embedder.embed("Hello, world!").unwrap();
        let second = embedder.embed("Hello, world!").unwrap();
        assert_eq!(first.len(), 384);
        assert_eq!(first, second);
    }
}
