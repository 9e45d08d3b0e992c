//! Process-local table of the component types a simulation can instantiate.

use std::{collections::BTreeMap, fmt};

use crate::{
    checkpoint::{self, CheckpointError},
    config::{BuildError, Params, GHOST_COMPONENT},
    pattern::GhostPattern,
    simulation::{Component, Kernel, Restored},
};

pub type BuildFn = fn(&Params, &mut dyn Kernel) -> Result<Box<dyn Component>, BuildError>;
pub type RestoreFn = fn(&[u8], &mut dyn Kernel) -> Result<Restored, CheckpointError>;

/// How to create a component type, either fresh or out of a checkpoint.
#[derive(Clone, Copy)]
pub struct ComponentFactory {
    pub build: BuildFn,
    pub restore: RestoreFn,
}

impl fmt::Debug for ComponentFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentFactory").finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ComponentRegistry {
    factories: BTreeMap<String, ComponentFactory>,
}

impl ComponentRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding every component type shipped with this crate.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(
            GHOST_COMPONENT,
            ComponentFactory {
                build: build_ghost,
                restore: checkpoint::restore,
            },
        );
        registry
    }

    /// Adds a component type, returning the factory it replaced.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        factory: ComponentFactory,
    ) -> Option<ComponentFactory> {
        self.factories.insert(name.into(), factory)
    }

    pub fn get(&self, name: &str) -> Result<&ComponentFactory, BuildError> {
        self.factories
            .get(name)
            .ok_or_else(|| BuildError::UnknownComponent(name.to_owned()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }
}

fn build_ghost(params: &Params, kernel: &mut dyn Kernel) -> Result<Box<dyn Component>, BuildError> {
    Ok(Box::new(GhostPattern::from_params(params, kernel)?))
}
