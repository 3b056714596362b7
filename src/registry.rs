use std::collections::BTreeSet;
use std::panic::{AssertUnwindSafe, catch_unwind};

use anyhow::anyhow;

use crate::addon::{Addon, AddonFactory, AddonSettings};
use crate::config::Config;
use crate::core::{ArcStr, Phase};
use crate::error::ConfigurationError;
use crate::utils::panic_message;

pub(crate) struct Registered {
    pub(crate) name: ArcStr,
    pub(crate) capabilities: BTreeSet<Phase>,
    pub(crate) addon: Box<dyn Addon>,
}

/// An addon left out of the run because it couldn't be constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Excluded {
    pub name: String,
    pub reason: String,
}

/// Constructed addons with their capability sets, in registration order.
#[derive(Default)]
pub struct AddonRegistry {
    addons: Vec<Registered>,
    excluded: Vec<Excluded>,
}

impl AddonRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Constructs every enabled addon.
    ///
    /// An addon whose construction fails is logged and excluded, unless the
    /// config is strict, in which case the failure is returned.
    pub fn load(
        factories: impl IntoIterator<Item = AddonFactory>,
        config: &Config,
    ) -> Result<Self, ConfigurationError> {
        let mut registry = Self::new();

        for factory in factories {
            let name = factory.name().to_string();

            if config.is_disabled(&name) {
                tracing::info!(addon = %name, "addon disabled");
                continue;
            }

            let settings = AddonSettings::new(&name, config.addons.get(&name));
            let result = catch_unwind(AssertUnwindSafe(|| factory.build(&settings)))
                .unwrap_or_else(|panic| Err(anyhow!(panic_message(panic.as_ref()))));

            match result {
                Ok(addon) => registry.register(addon)?,
                Err(source) if config.strict => {
                    return Err(ConfigurationError::Addon { name, source });
                }
                Err(source) => {
                    tracing::warn!(addon = %name, "excluding addon: {source:#}");
                    registry.excluded.push(Excluded {
                        name,
                        reason: format!("{source:#}"),
                    });
                }
            }
        }

        Ok(registry)
    }

    /// Adds a constructed addon, names must be unique and non-empty.
    pub fn register(&mut self, addon: Box<dyn Addon>) -> Result<(), ConfigurationError> {
        let name = addon.name();

        if name.is_empty() {
            return Err(ConfigurationError::EmptyAddonName);
        }

        if self.addons.iter().any(|item| &*item.name == name) {
            return Err(ConfigurationError::DuplicateAddon(name.to_string()));
        }

        let capabilities = addon.capabilities();
        tracing::debug!(
            addon = name,
            phases = ?capabilities.iter().map(ToString::to_string).collect::<Vec<_>>(),
            "registered addon"
        );

        self.addons.push(Registered {
            name: name.into(),
            capabilities,
            addon,
        });

        Ok(())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.addons.iter().map(|item| &*item.name)
    }

    pub fn capabilities(&self, addon: &str) -> Option<&BTreeSet<Phase>> {
        self.addons
            .iter()
            .find(|item| &*item.name == addon)
            .map(|item| &item.capabilities)
    }

    pub fn excluded(&self) -> &[Excluded] {
        &self.excluded
    }

    pub fn len(&self) -> usize {
        self.addons.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addons.is_empty()
    }

    /// Addons implementing a phase, in registration order.
    pub(crate) fn implementing(&self, phase: Phase) -> impl Iterator<Item = &Registered> {
        self.addons
            .iter()
            .filter(move |item| item.capabilities.contains(&phase))
    }
}
