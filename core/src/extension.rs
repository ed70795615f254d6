//! Extension bindings.
//!
//! An extension is a long-lived, stateful integration (persistence pool, cache
//! client, login manager, ...). Each extension object carries a [`Binding`]
//! that records the one instance it belongs to; [`ExtensionMap`] is the
//! per-instance, type-keyed set of bound extensions.

use crate::error::ExtensionBindingFault;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};
use uuid::Uuid;

/// Identity of one application instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceId(Uuid);

impl InstanceId {
    /// Generate a fresh instance id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Ownership record carried by every extension object.
///
/// Set once; never cleared.
#[derive(Debug, Default)]
pub struct Binding {
    owner: OnceLock<InstanceId>,
}

impl Binding {
    /// Create an unbound record.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            owner: OnceLock::new(),
        }
    }

    /// Claim the extension for `instance`.
    ///
    /// # Errors
    ///
    /// - [`ExtensionBindingFault::AlreadyBound`] if already claimed by `instance`
    /// - [`ExtensionBindingFault::BoundElsewhere`] if claimed by another instance
    pub fn claim(
        &self,
        extension: &'static str,
        instance: InstanceId,
    ) -> Result<(), ExtensionBindingFault> {
        if self.owner.set(instance).is_ok() {
            return Ok(());
        }
        match self.owner.get().copied() {
            Some(owner) if owner != instance => {
                Err(ExtensionBindingFault::BoundElsewhere { extension, owner })
            }
            _ => Err(ExtensionBindingFault::AlreadyBound { extension }),
        }
    }

    /// Instance the extension is bound to, if any.
    #[must_use]
    pub fn owner(&self) -> Option<InstanceId> {
        self.owner.get().copied()
    }
}

/// A stateful integration bound to one application instance.
pub trait Extension: Send + Sync + 'static {
    /// Stable name used in logs and binding errors.
    const NAME: &'static str;

    /// The extension's ownership record.
    fn binding(&self) -> &Binding;
}

struct Entry {
    name: &'static str,
    value: Arc<dyn Any + Send + Sync>,
}

/// Type-keyed set of extensions bound to one instance.
#[derive(Default)]
pub struct ExtensionMap {
    owner: Option<InstanceId>,
    entries: HashMap<TypeId, Entry>,
}

impl ExtensionMap {
    /// Create an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `extension` to `instance` and store it.
    ///
    /// Nothing is modified when binding fails.
    ///
    /// # Errors
    ///
    /// - [`ExtensionBindingFault::AlreadyBound`] if an extension of this type is present
    /// - [`ExtensionBindingFault::BoundElsewhere`] if the object or the map belongs to another instance
    pub fn bind<E: Extension>(
        &mut self,
        instance: InstanceId,
        extension: Arc<E>,
    ) -> Result<(), ExtensionBindingFault> {
        self.check_bindable::<E>(instance)?;
        extension.binding().claim(E::NAME, instance)?;

        self.owner = Some(instance);
        self.entries.insert(
            TypeId::of::<E>(),
            Entry {
                name: E::NAME,
                value: extension,
            },
        );
        tracing::debug!(extension = E::NAME, instance = %instance, "Extension bound");
        Ok(())
    }

    /// Check that an extension of type `E` could be bound for `instance`.
    ///
    /// # Errors
    ///
    /// Same conditions as [`ExtensionMap::bind`], except the object check.
    pub fn check_bindable<E: Extension>(
        &self,
        instance: InstanceId,
    ) -> Result<(), ExtensionBindingFault> {
        if let Some(owner) = self.owner {
            if owner != instance {
                return Err(ExtensionBindingFault::BoundElsewhere {
                    extension: E::NAME,
                    owner,
                });
            }
        }
        if self.entries.contains_key(&TypeId::of::<E>()) {
            return Err(ExtensionBindingFault::AlreadyBound { extension: E::NAME });
        }
        Ok(())
    }

    /// Look up a bound extension by type.
    #[must_use]
    pub fn get<E: Extension>(&self) -> Option<Arc<E>> {
        self.entries
            .get(&TypeId::of::<E>())
            .and_then(|entry| Arc::clone(&entry.value).downcast::<E>().ok())
    }

    /// Whether an extension of type `E` is bound.
    #[must_use]
    pub fn contains<E: Extension>(&self) -> bool {
        self.entries.contains_key(&TypeId::of::<E>())
    }

    /// Names of all bound extensions, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.entries.values().map(|e| e.name).collect();
        names.sort_unstable();
        names
    }

    /// Instance the map belongs to, once anything is bound.
    #[must_use]
    pub const fn owner(&self) -> Option<InstanceId> {
        self.owner
    }

    /// Number of bound extensions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is bound.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for ExtensionMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtensionMap")
            .field("owner", &self.owner)
            .field("extensions", &self.names())
            .finish()
    }
}
