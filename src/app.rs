//! Process wiring: builds the shared embedder and store from config and runs
//! each CLI command on top of them.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::{
    cli::Command,
    config::{Config, StoreBackend, Transport},
    consumer::{Consumer, ConsumerStats},
    events::{EventSource, JsonlSource},
    query::QueryService,
    semantic::Embedder,
    store::{ContentId, LocalVectorStore, PgVectorStore, VectorStore},
    web::{self, SharedState},
};

/// The long-lived dependencies shared by the consumer and the query service.
#[derive(Clone)]
pub struct Services {
    pub embedder: Arc<Embedder>,
    pub store: Arc<dyn VectorStore>,
}

impl Services {
    pub fn from_config(config: &Config) -> Self {
        let embedder = Arc::new(Embedder::fastembed(
            &config.embedding.model,
            config.model_cache_dir(),
            config.embedding.dimensions,
        ));

        let store: Arc<dyn VectorStore> = match config.store.backend {
            StoreBackend::Postgres => Arc::new(PgVectorStore::new(
                config.store.postgres.params(),
                config.embedding.dimensions,
                config.store.ivf_lists,
                config.store.ivf_probes,
            )),
            StoreBackend::Local => Arc::new(LocalVectorStore::open(
                config.store_path(),
                &config.embedding.model,
                config.embedding.dimensions,
                config.store.ivf(),
            )),
        };

        Self { embedder, store }
    }

    /// Ensure the store schema and load the model. Either failure is fatal.
    pub async fn bootstrap(&self) -> Result<()> {
        if self.store.dimensions() != self.embedder.dimensions() {
            anyhow::bail!(
                "{} store holds {}-dimension vectors but model '{}' produces {}",
                self.store.backend_name(),
                self.store.dimensions(),
                self.embedder.model_name(),
                self.embedder.dimensions()
            );
        }

        self.store
            .init()
            .await
            .with_context(|| format!("initializing {} store", self.store.backend_name()))?;

        let embedder = self.embedder.clone();
        tokio::task::block_in_place(move || embedder.warm_up())
            .with_context(|| format!("loading embedding model '{}'", self.embedder.model_name()))?;

        log::info!(
            "Ready: {} store, model '{}' ({} dimensions)",
            self.store.backend_name(),
            self.embedder.model_name(),
            self.embedder.dimensions()
        );
        Ok(())
    }

    pub fn consumer(&self) -> Consumer {
        Consumer::new(self.embedder.clone(), self.store.clone())
    }

    pub fn query(&self) -> QueryService {
        QueryService::new(self.embedder.clone(), self.store.clone())
    }
}

/// Open the configured event transport.
pub async fn open_source(config: &Config) -> Result<Box<dyn EventSource>> {
    match config.events.transport {
        Transport::Kafka => kafka_source(config),
        Transport::File => {
            let path = config
                .events
                .file
                .as_deref()
                .context("events.file is required with the file transport")?;
            let source = JsonlSource::open(path)
                .await
                .with_context(|| format!("opening event file {}", path.display()))?;
            Ok(Box::new(source))
        }
        Transport::Stdin => Ok(Box::new(JsonlSource::stdin())),
    }
}

#[cfg(feature = "kafka")]
fn kafka_source(config: &Config) -> Result<Box<dyn EventSource>> {
    use crate::events::{KafkaParams, KafkaSource};

    let params = KafkaParams {
        bootstrap_servers: config.events.bootstrap_servers.clone(),
        topic: config.events.topic.clone(),
        group_id: config.events.group_id.clone(),
    };
    Ok(Box::new(KafkaSource::connect(&params)?))
}

#[cfg(not(feature = "kafka"))]
fn kafka_source(_config: &Config) -> Result<Box<dyn EventSource>> {
    anyhow::bail!("built without kafka support; rebuild with `--features kafka` or set EVENT_TRANSPORT to file or stdin")
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Consumer and HTTP server in one process until Ctrl-C or SIGTERM.
async fn serve(config: &Config, services: Services) -> Result<()> {
    let bind = config.bind_addr()?;
    let source = open_source(config).await?;
    let consumer = services.consumer().spawn(source);

    let state = SharedState {
        query: services.query(),
        consumer: Some(consumer.status()),
    };
    let served = web::serve(bind, web::router(state), web::shutdown_signal()).await;

    let stats = consumer.stop().await;
    log::info!("consumer finished with {:?}", stats);
    served
}

async fn consume(config: &Config, services: Services) -> Result<()> {
    let source = open_source(config).await?;
    let mut consumer = services.consumer().spawn(source);

    tokio::select! {
        _ = web::shutdown_signal() => {}
        _ = consumer.wait() => {}
    }

    let stats = consumer.stop().await;
    log::info!("consumer finished with {:?}", stats);
    Ok(())
}

async fn replay(services: Services, file: &Path) -> Result<ConsumerStats> {
    let source = JsonlSource::open_path_or_stdin(file)
        .await
        .with_context(|| format!("opening {}", file.display()))?;
    Ok(services.consumer().spawn(source).join().await)
}

pub async fn run(command: Command, config: Config) -> Result<()> {
    let services = Services::from_config(&config);

    match command {
        Command::Serve => {
            services.bootstrap().await?;
            serve(&config, services).await
        }
        Command::Consume => {
            services.bootstrap().await?;
            consume(&config, services).await
        }
        Command::Replay { file } => {
            services.bootstrap().await?;
            let stats = replay(services, &file).await?;
            print_json(&stats)
        }
        Command::Search { query, limit } => {
            services.bootstrap().await?;
            let response = services.query().search(&query, limit).await?;
            print_json(&response)
        }
        Command::Related { post_id, limit } => {
            services.store.init().await?;
            let response = services.query().related(post_id, limit).await?;
            print_json(&response)
        }
        Command::Show { post_id } => {
            services.store.init().await?;
            match services.store.get_record(ContentId::new(post_id)).await? {
                Some(record) => print_json(&record),
                None => anyhow::bail!("post {} is not indexed", post_id),
            }
        }
        Command::Init => {
            services.bootstrap().await?;
            println!(
                "{} store ready with {} records",
                services.store.backend_name(),
                services.store.count().await?
            );
            Ok(())
        }
        Command::Reindex => {
            services.store.init().await?;
            services.store.reindex().await?;
            println!("reindexed {} records", services.store.count().await?);
            Ok(())
        }
    }
}
