use std::any::{TypeId, type_name};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Stable runtime identifier of a pooled type.
///
/// The pool, the event bus and the relay select their per-type buckets by this key. The
/// type name is carried along purely for diagnostics and error messages; identity is
/// determined by the [`TypeId`] alone.
///
/// # Example
///
/// ```
/// use chain_relay::TypeKey;
///
/// struct Login;
///
/// let key = TypeKey::of::<Login>();
/// assert_eq!(key, TypeKey::of::<Login>());
/// assert_ne!(key, TypeKey::of::<u32>());
/// assert!(key.name().ends_with("Login"));
/// ```
#[derive(Clone, Copy, Debug)]
pub struct TypeKey {
    id: TypeId,
    name: &'static str,
}

impl TypeKey {
    /// Returns the key of type `T`.
    #[must_use]
    pub fn of<T: 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: type_name::<T>(),
        }
    }

    /// The name of the type, as reported by [`std::any::type_name`].
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub(crate) fn id(&self) -> TypeId {
        self.id
    }
}

impl PartialEq for TypeKey {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TypeKey {}

impl Hash for TypeKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}
