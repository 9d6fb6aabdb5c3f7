use crate::effects::{builtin_effects, EffectDescriptor};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    DuplicateName(String),
    NotFound(String),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateName(name) => write!(f, "effect already registered: {name}"),
            Self::NotFound(name) => write!(f, "no such effect: {name}"),
        }
    }
}

impl std::error::Error for RegistryError {}

/// Name-keyed catalog of effect descriptors. Registration order is
/// preserved so `names` and random selection are deterministic given a
/// seeded RNG.
pub struct EffectRegistry {
    entries: Vec<EffectDescriptor>,
}

impl EffectRegistry {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Registry preloaded with every built-in effect.
    pub fn with_builtins() -> Self {
        let mut reg = Self::new();
        for desc in builtin_effects() {
            // Built-in names are unique by construction.
            let _ = reg.register(desc);
        }
        reg
    }

    pub fn register(&mut self, desc: EffectDescriptor) -> Result<(), RegistryError> {
        if self.entries.iter().any(|e| e.name == desc.name) {
            return Err(RegistryError::DuplicateName(desc.name.to_string()));
        }
        self.entries.push(desc);
        Ok(())
    }

    pub fn unregister(&mut self, name: &str) -> Result<(), RegistryError> {
        let pos = self
            .entries
            .iter()
            .position(|e| e.name == name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        self.entries.remove(pos);
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Result<&EffectDescriptor, RegistryError> {
        self.entries
            .iter()
            .find(|e| e.name == name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.entries.iter().map(|e| e.name).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Uniform pick over every entry except `current`. Returns None when no
    /// other entry exists, so a single-effect registry never transitions to
    /// itself.
    pub fn random_excluding(
        &self,
        rng: &mut fastrand::Rng,
        current: Option<&str>,
    ) -> Option<&EffectDescriptor> {
        let candidates: Vec<&EffectDescriptor> = self
            .entries
            .iter()
            .filter(|e| Some(e.name) != current)
            .collect();
        if candidates.is_empty() {
            return None;
        }
        Some(candidates[rng.usize(..candidates.len())])
    }
}

impl Default for EffectRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}
