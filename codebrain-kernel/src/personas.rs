//! Persona storage
//!
//! Personas live in memory, seeded with one default; exactly one may be
//! active. The active persona's prompt text is handed to the agent loop
//! as a labeled input field.

use dashmap::DashMap;
use parking_lot::RwLock;
use uuid::Uuid;

use codebrain_core::{CoreError, Persona, Result};

/// In-memory persona registry
pub struct PersonaStore {
    personas: DashMap<String, Persona>,
    active: RwLock<Option<String>>,
}

impl PersonaStore {
    /// Create with the built-in default persona, active
    #[must_use]
    pub fn new() -> Self {
        let store = Self {
            personas: DashMap::new(),
            active: RwLock::new(None),
        };
        let default = Persona {
            id: "default".to_string(),
            name: "Assistant".to_string(),
            color: "#8b5cf6".to_string(),
            language: "en".to_string(),
            persona: "A precise, code-grounded assistant. Answers cite files and \
                      symbols from the knowledge graph."
                .to_string(),
            description: "Built-in default persona".to_string(),
            is_default: true,
        };
        store.personas.insert(default.id.clone(), default);
        *store.active.write() = Some("default".to_string());
        store
    }

    /// All personas, sorted by name
    #[must_use]
    pub fn list(&self) -> Vec<Persona> {
        let mut personas: Vec<Persona> =
            self.personas.iter().map(|e| e.value().clone()).collect();
        personas.sort_by(|a, b| a.name.cmp(&b.name));
        personas
    }

    /// The active persona, falling back to the default
    #[must_use]
    pub fn active(&self) -> Option<Persona> {
        let active_id = self.active.read().clone();
        active_id
            .and_then(|id| self.personas.get(&id).map(|e| e.value().clone()))
            .or_else(|| {
                self.personas
                    .iter()
                    .find(|e| e.value().is_default)
                    .map(|e| e.value().clone())
            })
    }

    /// Activate a persona by id or name
    ///
    /// # Errors
    ///
    /// `InvalidInput` when nothing matches.
    pub fn set_active(&self, identifier: &str) -> Result<Persona> {
        let persona = self
            .resolve(identifier)
            .ok_or_else(|| CoreError::InvalidInput(format!("unknown persona {identifier}")))?;
        *self.active.write() = Some(persona.id.clone());
        Ok(persona)
    }

    /// Create a persona
    ///
    /// # Errors
    ///
    /// `InvalidInput` when the name collides with an existing persona.
    pub fn create(
        &self,
        name: &str,
        color: &str,
        language: &str,
        description: &str,
    ) -> Result<Persona> {
        if self.resolve(name).is_some() {
            return Err(CoreError::InvalidInput(format!(
                "persona {name} already exists"
            )));
        }
        let persona = Persona {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            color: color.to_string(),
            language: language.to_string(),
            persona: description.to_string(),
            description: description.to_string(),
            is_default: false,
        };
        self.personas.insert(persona.id.clone(), persona.clone());
        Ok(persona)
    }

    /// Delete a persona by id or name; the default cannot be deleted
    ///
    /// # Errors
    ///
    /// `InvalidInput` for unknown names or the default persona.
    pub fn delete(&self, identifier: &str) -> Result<()> {
        let persona = self
            .resolve(identifier)
            .ok_or_else(|| CoreError::InvalidInput(format!("unknown persona {identifier}")))?;
        if persona.is_default {
            return Err(CoreError::InvalidInput(
                "the default persona cannot be deleted".to_string(),
            ));
        }
        self.personas.remove(&persona.id);

        let mut active = self.active.write();
        if active.as_deref() == Some(persona.id.as_str()) {
            *active = Some("default".to_string());
        }
        Ok(())
    }

    fn resolve(&self, identifier: &str) -> Option<Persona> {
        if let Some(by_id) = self.personas.get(identifier) {
            return Some(by_id.value().clone());
        }
        self.personas
            .iter()
            .find(|e| e.value().name.eq_ignore_ascii_case(identifier))
            .map(|e| e.value().clone())
    }
}

impl Default for PersonaStore {
    fn default() -> Self {
        Self::new()
    }
}
