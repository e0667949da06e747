use crate::config::{ModelConfig, ProviderKind};
use crate::context::CallContext;
use crate::envelope::Envelope;
use crate::error::DispatchError;
use crate::rotation::KeyRotator;
use crate::usage::{SharedUsage, Usage};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::Stream;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

pub mod openai_compatible;

/// Outbound frames, each one complete `data: ...\n\n` unit.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Bytes, DispatchError>> + Send>>;

pub const DONE_FRAME: &[u8] = b"data: [DONE]\n\n";

/// A finished non-streaming call.
#[derive(Debug, Clone)]
pub struct Completion {
    pub body: Bytes,
    pub usage: Usage,
}

/// A live streaming call. `usage` fills in as frames are read.
pub struct UpstreamStream {
    pub frames: FrameStream,
    pub usage: SharedUsage,
}

/// One backend dialect.
#[async_trait]
pub trait Provider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    async fn invoke(
        &self,
        ctx: &CallContext,
        request: Envelope,
        model: &ModelConfig,
    ) -> Result<Completion, DispatchError>;

    async fn invoke_streaming(
        &self,
        ctx: &CallContext,
        request: Envelope,
        model: &ModelConfig,
    ) -> Result<UpstreamStream, DispatchError>;

    /// Releases whatever the provider holds for this call.
    async fn close(&self) -> Result<(), DispatchError> {
        Ok(())
    }
}

/// Shared services handed to provider factories.
#[derive(Clone)]
pub struct ProviderDeps {
    pub keys: KeyRotator,
}

pub type ProviderFactory =
    fn(&ProviderDeps, &ModelConfig) -> Result<Box<dyn Provider>, DispatchError>;

fn builtin_factory(kind: ProviderKind) -> ProviderFactory {
    match kind {
        ProviderKind::OpenaiCompatible => openai_compatible::build,
    }
}

/// Builds a fresh provider for every candidate attempt.
#[derive(Clone)]
pub struct ProviderRegistry {
    factories: Arc<HashMap<ProviderKind, ProviderFactory>>,
    deps: ProviderDeps,
}

impl ProviderRegistry {
    pub fn new(keys: KeyRotator) -> Self {
        let factories: HashMap<ProviderKind, ProviderFactory> = ProviderKind::ALL
            .iter()
            .map(|kind| (*kind, builtin_factory(*kind)))
            .collect();
        Self {
            factories: Arc::new(factories),
            deps: ProviderDeps { keys },
        }
    }

    /// Replaces the factory for `kind`.
    pub fn with_factory(mut self, kind: ProviderKind, factory: ProviderFactory) -> Self {
        Arc::make_mut(&mut self.factories).insert(kind, factory);
        self
    }

    pub fn instantiate(&self, model: &ModelConfig) -> Result<Box<dyn Provider>, DispatchError> {
        let factory = self
            .factories
            .get(&model.provider)
            .ok_or_else(|| DispatchError::ProviderUnavailable(model.provider.as_str().to_string()))?;
        factory(&self.deps, model)
    }
}
