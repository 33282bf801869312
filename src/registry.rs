//! Capability registry: maps capability identifiers to spawn descriptors.
//!
//! The registry is built once per listener at startup and is read-only
//! afterwards, so sessions share it through an `Arc` without locking.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::config::AdapterEntry;
use crate::{AppError, Result};

/// Registry key of the descriptor used when a capability is unknown.
pub const DEFAULT_CAPABILITY: &str = "default";

/// Everything needed to launch one adapter process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterDescriptor {
    /// Registry key this descriptor was loaded under.
    pub capability_id: String,
    /// Executable path or name.
    pub command: String,
    /// Ordered argument list.
    pub args: Vec<String>,
}

/// Outcome of a registry lookup.
#[derive(Debug, Clone, Copy)]
pub struct Resolution<'a> {
    /// Descriptor to spawn.
    pub descriptor: &'a AdapterDescriptor,
    /// `true` when the requested identifier was absent and the default was used.
    pub fallback: bool,
}

/// Immutable capability → descriptor table with a mandatory default entry.
#[derive(Debug, Clone)]
pub struct AdapterRegistry {
    adapters: HashMap<String, AdapterDescriptor>,
    default: AdapterDescriptor,
}

impl AdapterRegistry {
    /// Build a registry from a listener's `[adapters]` table.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the table lacks a
    /// [`DEFAULT_CAPABILITY`] entry.
    pub fn from_entries(entries: &HashMap<String, AdapterEntry>) -> Result<Self> {
        let adapters: HashMap<String, AdapterDescriptor> = entries
            .iter()
            .map(|(id, entry)| {
                let descriptor = AdapterDescriptor {
                    capability_id: id.clone(),
                    command: entry.command.clone(),
                    args: entry.args.clone(),
                };
                (id.clone(), descriptor)
            })
            .collect();

        let default = adapters.get(DEFAULT_CAPABILITY).cloned().ok_or_else(|| {
            AppError::Config(format!(
                "adapter registry requires a '{DEFAULT_CAPABILITY}' entry"
            ))
        })?;

        Ok(Self { adapters, default })
    }

    /// Resolve `capability` to a descriptor, falling back to the default.
    ///
    /// A miss is not an error; it is logged at `WARN` so the fallback stays
    /// observable.
    #[must_use]
    pub fn resolve(&self, capability: Option<&str>) -> Resolution<'_> {
        if let Some(descriptor) = capability.and_then(|id| self.adapters.get(id)) {
            debug!(
                capability = %descriptor.capability_id,
                command = %descriptor.command,
                "capability resolved"
            );
            return Resolution {
                descriptor,
                fallback: false,
            };
        }

        warn!(
            requested = capability.unwrap_or("<none>"),
            command = %self.default.command,
            "unknown capability; using default adapter"
        );
        Resolution {
            descriptor: &self.default,
            fallback: true,
        }
    }

    /// Number of registered capabilities, including the default.
    #[must_use]
    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    /// Whether no capabilities are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

/// Read the capability identifier at `pointer` (RFC 6901) from a client message.
///
/// An empty pointer or a non-string value yields `None`.
#[must_use]
pub fn extract_capability(message: &serde_json::Value, pointer: &str) -> Option<String> {
    if pointer.is_empty() {
        return None;
    }
    message
        .pointer(pointer)
        .and_then(serde_json::Value::as_str)
        .map(str::to_owned)
}
