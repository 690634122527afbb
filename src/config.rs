use std::fmt::Debug;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use homedir::my_home;
use serde::{Deserialize, Serialize};

use crate::semantic::{DEFAULT_DIMENSIONS, DEFAULT_MODEL};
use crate::store::{IvfSettings, PgParams};

const DEFAULT_BIND: &str = "0.0.0.0:8000";
const DEFAULT_BOOTSTRAP_SERVERS: &str = "localhost:9092";
const DEFAULT_TOPIC: &str = "post.events";
const DEFAULT_GROUP_ID: &str = "search-service";
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
/// pgvector cannot index vectors wider than this.
const MAX_DIMENSIONS: usize = 65535;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Kafka,
    File,
    Stdin,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Postgres,
    Local,
}

fn parse_transport(value: &str) -> anyhow::Result<Transport> {
    match value.trim().to_lowercase().as_str() {
        "kafka" => Ok(Transport::Kafka),
        "file" => Ok(Transport::File),
        "stdin" => Ok(Transport::Stdin),
        other => bail!("EVENT_TRANSPORT must be kafka, file or stdin, got '{}'", other),
    }
}

fn parse_backend(value: &str) -> anyhow::Result<StoreBackend> {
    match value.trim().to_lowercase().as_str() {
        "postgres" => Ok(StoreBackend::Postgres),
        "local" => Ok(StoreBackend::Local),
        other => bail!("VECTOR_STORE must be postgres or local, got '{}'", other),
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventsConfig {
    #[serde(default = "default_transport")]
    pub transport: Transport,

    /// Comma-separated broker list
    #[serde(default = "default_bootstrap_servers")]
    pub bootstrap_servers: String,

    #[serde(default = "default_topic")]
    pub topic: String,

    #[serde(default = "default_group_id")]
    pub group_id: String,

    /// JSONL file read by the `file` transport
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            transport: default_transport(),
            bootstrap_servers: default_bootstrap_servers(),
            topic: default_topic(),
            group_id: default_group_id(),
            file: None,
        }
    }
}

fn default_transport() -> Transport {
    Transport::Kafka
}

fn default_bootstrap_servers() -> String {
    DEFAULT_BOOTSTRAP_SERVERS.to_string()
}

fn default_topic() -> String {
    DEFAULT_TOPIC.to_string()
}

fn default_group_id() -> String {
    DEFAULT_GROUP_ID.to_string()
}

#[derive(Clone, Serialize, Deserialize)]
pub struct PostgresConfig {
    #[serde(default = "default_pg_host")]
    pub host: String,
    #[serde(default = "default_pg_port")]
    pub port: u16,
    #[serde(default = "default_pg_db")]
    pub db: String,
    #[serde(default = "default_pg_user")]
    pub user: String,
    #[serde(default = "default_pg_password")]
    pub password: String,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Debug for PostgresConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "PostgresConfig {{ host: {:?}, port: {}, db: {:?}, user: {:?}, password: [REDACTED], connect_timeout_secs: {} }}",
            self.host, self.port, self.db, self.user, self.connect_timeout_secs
        )
    }
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            host: default_pg_host(),
            port: default_pg_port(),
            db: default_pg_db(),
            user: default_pg_user(),
            password: default_pg_password(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl PostgresConfig {
    pub fn params(&self) -> PgParams {
        PgParams {
            host: self.host.clone(),
            port: self.port,
            dbname: self.db.clone(),
            user: self.user.clone(),
            password: self.password.clone(),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
        }
    }
}

fn default_pg_host() -> String {
    "localhost".to_string()
}

fn default_pg_port() -> u16 {
    5432
}

fn default_pg_db() -> String {
    "search".to_string()
}

fn default_pg_user() -> String {
    "postgres".to_string()
}

fn default_pg_password() -> String {
    "postgres".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_SECS
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_backend")]
    pub backend: StoreBackend,

    #[serde(default)]
    pub postgres: PostgresConfig,

    /// vectors.bin location for the `local` backend (defaults under the data dir)
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// IVF partition count
    #[serde(default = "default_ivf_lists")]
    pub ivf_lists: usize,

    /// Partitions probed per query
    #[serde(default = "default_ivf_probes")]
    pub ivf_probes: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            postgres: PostgresConfig::default(),
            path: None,
            ivf_lists: default_ivf_lists(),
            ivf_probes: default_ivf_probes(),
        }
    }
}

impl StoreConfig {
    pub fn ivf(&self) -> IvfSettings {
        IvfSettings {
            lists: self.ivf_lists,
            probes: self.ivf_probes,
        }
    }
}

fn default_backend() -> StoreBackend {
    StoreBackend::Postgres
}

fn default_ivf_lists() -> usize {
    IvfSettings::default().lists
}

fn default_ivf_probes() -> usize {
    IvfSettings::default().probes
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Model name for embeddings (e.g., "all-MiniLM-L6-v2")
    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_dimensions")]
    pub dimensions: usize,

    /// Model download cache (defaults under the data dir)
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            dimensions: default_dimensions(),
            cache_dir: None,
        }
    }
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_dimensions() -> usize {
    DEFAULT_DIMENSIONS
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default)]
    pub events: EventsConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,

    #[serde(skip_serializing, skip_deserializing)]
    data_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            events: EventsConfig::default(),
            store: StoreConfig::default(),
            embedding: EmbeddingConfig::default(),
            data_dir: PathBuf::new(),
        }
    }
}

fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}

/// `SEARCH_SERVICE_HOME`, else `~/.local/share/search-service`.
fn data_dir<F>(lookup: &F) -> anyhow::Result<PathBuf>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(path) = lookup("SEARCH_SERVICE_HOME") {
        return Ok(PathBuf::from(path));
    }
    let home = my_home()
        .context("couldnt resolve home dir")?
        .context("couldnt find home dir")?;
    Ok(home.join(".local/share/search-service"))
}

impl Config {
    /// Defaults, then the YAML file at `path` (if any), then the process environment.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        Self::load_with(path, |name| std::env::var(name).ok())
    }

    /// Like `load`, reading variables through `lookup` instead of the process environment.
    pub fn load_with<F>(path: Option<&Path>, lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config {}", path.display()))?;
                serde_yml::from_str::<Self>(&text)
                    .with_context(|| format!("config {} is malformed", path.display()))?
            }
            None => Self::default(),
        };

        config.data_dir = data_dir(&lookup)?;
        config.apply_env(lookup)?;
        config.validate()?;

        Ok(config)
    }

    /// Override fields from environment variables read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn number<T: std::str::FromStr>(name: &str, value: String) -> anyhow::Result<T>
        where
            T::Err: std::error::Error + Send + Sync + 'static,
        {
            value
                .trim()
                .parse()
                .with_context(|| format!("{} is not a valid number: '{}'", name, value))
        }

        if let Some(value) = lookup("SEARCH_BIND") {
            self.bind = value;
        }

        if let Some(value) = lookup("EVENT_TRANSPORT") {
            self.events.transport = parse_transport(&value)?;
        }
        if let Some(value) = lookup("KAFKA_BOOTSTRAP_SERVERS") {
            self.events.bootstrap_servers = value;
        }
        if let Some(value) = lookup("KAFKA_TOPIC_POST_EVENTS") {
            self.events.topic = value;
        }
        if let Some(value) = lookup("KAFKA_GROUP_ID") {
            self.events.group_id = value;
        }
        if let Some(value) = lookup("EVENTS_FILE") {
            self.events.file = Some(PathBuf::from(value));
        }

        if let Some(value) = lookup("VECTOR_STORE") {
            self.store.backend = parse_backend(&value)?;
        }
        let pg = &mut self.store.postgres;
        if let Some(value) = lookup("POSTGRES_HOST") {
            pg.host = value;
        }
        if let Some(value) = lookup("POSTGRES_PORT") {
            pg.port = number("POSTGRES_PORT", value)?;
        }
        if let Some(value) = lookup("POSTGRES_DB") {
            pg.db = value;
        }
        if let Some(value) = lookup("POSTGRES_USER") {
            pg.user = value;
        }
        if let Some(value) = lookup("POSTGRES_PASSWORD") {
            pg.password = value;
        }
        if let Some(value) = lookup("POSTGRES_CONNECT_TIMEOUT_SECS") {
            pg.connect_timeout_secs = number("POSTGRES_CONNECT_TIMEOUT_SECS", value)?;
        }
        if let Some(value) = lookup("VECTOR_STORE_PATH") {
            self.store.path = Some(PathBuf::from(value));
        }
        if let Some(value) = lookup("IVF_LISTS") {
            self.store.ivf_lists = number("IVF_LISTS", value)?;
        }
        if let Some(value) = lookup("IVF_PROBES") {
            self.store.ivf_probes = number("IVF_PROBES", value)?;
        }

        if let Some(value) = lookup("EMBEDDING_MODEL") {
            self.embedding.model = value;
        }
        if let Some(value) = lookup("EMBEDDING_DIM") {
            self.embedding.dimensions = number("EMBEDDING_DIM", value)?;
        }
        if let Some(value) = lookup("MODEL_CACHE_DIR") {
            self.embedding.cache_dir = Some(PathBuf::from(value));
        }

        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.bind_addr()?;

        let dims = self.embedding.dimensions;
        if dims == 0 || dims > MAX_DIMENSIONS {
            bail!(
                "embedding.dimensions must be between 1 and {}, got {}",
                MAX_DIMENSIONS,
                dims
            );
        }
        if self.embedding.model.trim().is_empty() {
            bail!("embedding.model must not be empty");
        }

        if self.store.ivf_lists == 0 {
            bail!("store.ivf_lists must be greater than 0");
        }
        if self.store.ivf_probes == 0 || self.store.ivf_probes > self.store.ivf_lists {
            bail!(
                "store.ivf_probes must be between 1 and ivf_lists ({}), got {}",
                self.store.ivf_lists,
                self.store.ivf_probes
            );
        }

        if self.events.topic.trim().is_empty() {
            bail!("events.topic must not be empty");
        }
        match self.events.transport {
            Transport::Kafka if self.events.bootstrap_servers.trim().is_empty() => {
                bail!("events.bootstrap_servers must not be empty with the kafka transport")
            }
            Transport::File if self.events.file.is_none() => {
                bail!("events.file (EVENTS_FILE) is required with the file transport")
            }
            _ => {}
        }

        Ok(())
    }

    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        self.bind
            .parse()
            .with_context(|| format!("bind address '{}' is invalid", self.bind))
    }

    pub fn store_path(&self) -> PathBuf {
        self.store
            .path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("vectors.bin"))
    }

    pub fn model_cache_dir(&self) -> PathBuf {
        self.embedding
            .cache_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("models"))
    }
}
