//! Operation kind to provider routing.
//!
//! Each kind maps to an ordered chain. The first provider is the primary
//! route; the rest are tried in order, under the same credit receipt, when
//! an earlier one rejects the submission or stays unavailable.

use std::collections::HashMap;

use mvstudio_core::credits::OperationKind;
use mvstudio_core::error::CoreError;
use mvstudio_core::task::Provider;

/// Which providers serve each generation kind, in preference order.
///
/// Kinds without a route (the analysis kinds) are billable but cannot be
/// requested as generations.
#[derive(Debug, Clone)]
pub struct RoutingTable {
    routes: HashMap<OperationKind, Vec<Provider>>,
}

impl RoutingTable {
    pub fn empty() -> Self {
        Self {
            routes: HashMap::new(),
        }
    }

    /// Route `kind` to `provider` alone, replacing any existing chain.
    pub fn with_route(mut self, kind: OperationKind, provider: Provider) -> Self {
        self.routes.insert(kind, vec![provider]);
        self
    }

    /// Append a fallback to the end of `kind`'s chain.
    pub fn with_fallback(mut self, kind: OperationKind, provider: Provider) -> Self {
        let chain = self.routes.entry(kind).or_default();
        if !chain.contains(&provider) {
            chain.push(provider);
        }
        self
    }

    /// The primary provider for `kind`.
    pub fn route(&self, kind: OperationKind) -> Result<Provider, CoreError> {
        Ok(self.chain(kind)?[0])
    }

    /// Every provider for `kind`, primary first. Never empty.
    pub fn chain(&self, kind: OperationKind) -> Result<&[Provider], CoreError> {
        self.routes
            .get(&kind)
            .filter(|chain| !chain.is_empty())
            .map(Vec::as_slice)
            .ok_or_else(|| CoreError::UnroutableOperation(kind.to_string()))
    }
}

impl Default for RoutingTable {
    fn default() -> Self {
        use OperationKind::*;

        let mut table = Self::empty();
        for kind in [Storyboard, RemixVideo] {
            table = table.with_route(kind, Provider::Kling);
        }
        // fal hosts the same Kling models on a separate network path.
        for kind in [VideoFast720, VideoFast1080, VideoStd720, VideoStd1080] {
            table = table
                .with_route(kind, Provider::Kling)
                .with_fallback(kind, Provider::Fal);
        }
        for kind in [ImageGeneration, Avatar, Sticker] {
            table = table.with_route(kind, Provider::Comet);
        }
        table
            .with_route(ThreeDConversion, Provider::Fal)
            .with_route(Music, Provider::Suno)
    }
}
