//! Engine dependencies.
//!
//! Everything the periodic loops and the control surface need is constructed
//! once in the binary and threaded down through this container. External
//! services hide behind traits so tests can substitute them.

use std::sync::Arc;

use sqlx::PgPool;

use crate::common::error::CoreResult;
use crate::config::CoreConfig;
use crate::kernel::generator::{CaptionGenerator, CaptionRequest, OpenAiGenerator, PassthroughGenerator};
use crate::kernel::governor::RateGovernor;
use crate::kernel::publisher::{ChirpPublisher, Publisher, UnconfiguredPublisher};
use crate::kernel::tasks::store::TaskStore;

/// Dependency container for the engine.
#[derive(Clone)]
pub struct EngineDeps {
    pub pool: PgPool,
    pub store: TaskStore,
    pub generator: Arc<dyn CaptionGenerator>,
    pub publisher: Arc<dyn Publisher>,
    pub governor: Arc<RateGovernor>,
    pub config: CoreConfig,
}

impl EngineDeps {
    pub fn new(
        pool: PgPool,
        generator: Arc<dyn CaptionGenerator>,
        publisher: Arc<dyn Publisher>,
        governor: Arc<RateGovernor>,
        config: CoreConfig,
    ) -> Self {
        let store = TaskStore::from_config(pool.clone(), &config.workers);
        Self {
            pool,
            store,
            generator,
            publisher,
            governor,
            config,
        }
    }

    /// Build production adapters from configuration, resolving credentials
    /// from the environment references.
    pub fn from_config(pool: PgPool, config: CoreConfig) -> CoreResult<Self> {
        let generator: Arc<dyn CaptionGenerator> = if config.generator.enabled {
            let api_key = config.resolve_credential(&config.generator.credentials_ref)?;
            Arc::new(OpenAiGenerator::new(&config.generator, api_key))
        } else {
            Arc::new(PassthroughGenerator)
        };

        let bearer_token = config.resolve_credential(&config.publisher.credentials_ref)?;
        let client = chirp::ChirpClient::new(chirp::ChirpOptions {
            api_base: config.publisher.api_base.clone(),
            upload_base: config.publisher.upload_base.clone(),
            bearer_token,
        });
        let publisher: Arc<dyn Publisher> = Arc::new(ChirpPublisher::new(client));

        let governor = Arc::new(RateGovernor::new(&config.rate));
        Ok(Self::new(pool, generator, publisher, governor, config))
    }

    /// Deps for invocations that never touch external APIs (scan, status,
    /// maintenance); no credentials are resolved.
    pub fn without_egress(pool: PgPool, config: CoreConfig) -> Self {
        let governor = Arc::new(RateGovernor::new(&config.rate));
        Self::new(
            pool,
            Arc::new(PassthroughGenerator),
            Arc::new(UnconfiguredPublisher),
            governor,
            config,
        )
    }

    /// Assemble the generator inputs for one task's metadata snapshot.
    pub fn caption_request(&self, content_data: &serde_json::Value) -> CaptionRequest {
        CaptionRequest {
            content_data: content_data.clone(),
            language: self.config.generator.language.clone(),
            style_hints: self.config.generator.style_hints.clone(),
            char_limit: self.config.publisher.char_limit,
        }
    }
}
