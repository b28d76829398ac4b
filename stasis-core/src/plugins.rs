// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Plugin registry.
//!
//! Behavior that varies by workload type is resolved at call time from a
//! table keyed by `(feature name, type tag)`. Each [`Feature`] carries the
//! type of the value it resolves to, so a lookup hands back a typed value
//! or a not-available error.

use std::any::Any;
use std::marker::PhantomData;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use nix::sys::signal::Signal;

use crate::api::{
    Details, DumpRequest, DumpResponse, RestoreRequest, RestoreResponse, RunRequest, RunResponse,
};
use crate::error::{PluginError, StasisResult};
use crate::pipeline::{Adapter, BoxFuture, Handler, Middleware};

/// Typed feature name.
pub struct Feature<T> {
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Feature<T> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _marker: PhantomData,
        }
    }

    pub const fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> Clone for Feature<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Feature<T> {}

/// Type-specific cleanup run after a managed job exits.
pub type CleanupFn = Arc<dyn Fn(Details) -> BoxFuture<'static, StasisResult<()>> + Send + Sync>;

pub const DUMP_MIDDLEWARE: Feature<Middleware<DumpRequest, DumpResponse>> =
    Feature::new("DumpMiddleware");
pub const DUMP_HANDLER: Feature<Handler<DumpRequest, DumpResponse>> = Feature::new("DumpHandler");
pub const RESTORE_MIDDLEWARE: Feature<Middleware<RestoreRequest, RestoreResponse>> =
    Feature::new("RestoreMiddleware");
pub const RESTORE_HANDLER: Feature<Handler<RestoreRequest, RestoreResponse>> =
    Feature::new("RestoreHandler");
pub const RUN_MIDDLEWARE: Feature<Middleware<RunRequest, RunResponse>> =
    Feature::new("RunMiddleware");
pub const RUN_HANDLER: Feature<Handler<RunRequest, RunResponse>> = Feature::new("RunHandler");
pub const FREEZE_HANDLER: Feature<Handler<DumpRequest, DumpResponse>> =
    Feature::new("FreezeHandler");
pub const UNFREEZE_HANDLER: Feature<Handler<DumpRequest, DumpResponse>> =
    Feature::new("UnfreezeHandler");
pub const KILL_SIGNAL: Feature<Signal> = Feature::new("KillSignal");
pub const CLEANUP: Feature<CleanupFn> = Feature::new("Cleanup");
pub const GPU_INTERCEPTION: Feature<Adapter<RunRequest, RunResponse>> =
    Feature::new("GPUInterception");

/// An installed plugin.
#[derive(Debug, Clone, Default)]
pub struct Plugin {
    pub name: String,
    pub version: String,
    pub binaries: Vec<PathBuf>,
    pub libraries: Vec<PathBuf>,
}

impl Plugin {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// Installed plugins and the features they export.
pub struct PluginRegistry {
    installed: DashMap<String, Plugin>,
    features: DashMap<(&'static str, String), Arc<dyn Any + Send + Sync>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self {
            installed: DashMap::new(),
            features: DashMap::new(),
        }
    }

    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn install(&self, plugin: Plugin) {
        tracing::debug!(plugin = %plugin.name, "Plugin installed");
        self.installed.insert(plugin.name.clone(), plugin);
    }

    pub fn get(&self, name: &str) -> Option<Plugin> {
        self.installed.get(name).map(|p| p.clone())
    }

    pub fn is_installed(&self, name: &str) -> bool {
        self.installed.contains_key(name)
    }

    /// Export `value` as `feature` for workloads of `type_tag`.
    /// Installs a bare plugin entry for the type if none exists yet.
    pub fn register<T>(&self, feature: &Feature<T>, type_tag: impl Into<String>, value: T)
    where
        T: Clone + Send + Sync + 'static,
    {
        let type_tag = type_tag.into();
        if !self.is_installed(&type_tag) {
            self.install(Plugin::named(type_tag.clone()));
        }
        self.features
            .insert((feature.name(), type_tag), Arc::new(value));
    }

    pub fn lookup<T>(&self, feature: &Feature<T>, type_tag: &str) -> Result<T, PluginError>
    where
        T: Clone + Send + Sync + 'static,
    {
        let Some(entry) = self
            .features
            .get(&(feature.name(), type_tag.to_string()))
        else {
            if !self.is_installed(type_tag) {
                return Err(PluginError::NotInstalled {
                    name: type_tag.to_string(),
                });
            }
            return Err(PluginError::FeatureNotAvailable {
                feature: feature.name(),
                plugin: type_tag.to_string(),
            });
        };

        entry
            .value()
            .downcast_ref::<T>()
            .cloned()
            .ok_or(PluginError::TypeMismatch {
                feature: feature.name(),
            })
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_lookup() {
        let registry = PluginRegistry::new();
        registry.register(&KILL_SIGNAL, "runc", Signal::SIGTERM);

        assert_eq!(registry.lookup(&KILL_SIGNAL, "runc").unwrap(), Signal::SIGTERM);
        assert!(registry.is_installed("runc"));
    }

    #[test]
    fn test_not_installed_vs_not_exported() {
        let registry = PluginRegistry::new();
        registry.install(Plugin::named("containerd"));

        assert!(matches!(
            registry.lookup(&KILL_SIGNAL, "podman"),
            Err(PluginError::NotInstalled { .. })
        ));
        assert!(matches!(
            registry.lookup(&KILL_SIGNAL, "containerd"),
            Err(PluginError::FeatureNotAvailable { .. })
        ));
    }

    #[test]
    fn test_type_mismatch() {
        let registry = PluginRegistry::new();
        let wrong: Feature<u32> = Feature::new("KillSignal");
        registry.register(&wrong, "runc", 9u32);

        assert!(matches!(
            registry.lookup(&KILL_SIGNAL, "runc"),
            Err(PluginError::TypeMismatch { .. })
        ));
    }
}
