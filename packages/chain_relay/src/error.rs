use thiserror::Error;

use crate::InstanceId;

/// Errors that indicate misuse of the object pool or of the components built on top of it.
///
/// These are programmer errors: they signal a wiring bug rather than a runtime condition and
/// are never retried or swallowed by this crate. A step reporting failure is not an error and
/// never surfaces through this type.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The type has not been registered with the object pool, so the pool does not know how to
    /// construct or reset instances of it.
    #[error("type {type_name} is not registered with the object pool")]
    InvalidType {
        /// Name of the type that was requested.
        type_name: &'static str,
    },

    /// An operation that requires a pooled instance was given none.
    #[error("no instance was provided for pooled type {type_name}")]
    NullInstance {
        /// Name of the type the caller declared for the missing instance.
        type_name: &'static str,
    },

    /// The instance provided is not of the type the caller declared.
    #[error("instance of type {actual} was provided where type {expected} was declared")]
    MismatchedType {
        /// Name of the type the caller declared.
        expected: &'static str,

        /// Name of the type the instance actually has.
        actual: &'static str,
    },

    /// The handle refers to an allocation that has already been returned to the pool.
    #[error("instance {instance} of type {type_name} is not checked out of the object pool")]
    StaleInstance {
        /// Name of the type of the instance.
        type_name: &'static str,

        /// Identity of the instance the stale handle refers to.
        instance: InstanceId,
    },

    /// A model registry operation that requires a model was given none.
    #[error("no model was provided for model type {type_name}")]
    NullModel {
        /// Name of the model type the caller declared.
        type_name: &'static str,
    },
}

/// A specialized `Result` type for pool, bus and relay operations, returning the crate's
/// [`Error`] type as the error value.
pub(crate) type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::fmt::Debug;

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(Error: Send, Sync, Debug);

    #[test]
    fn messages_name_the_types_involved() {
        let error = Error::MismatchedType {
            expected: "Login",
            actual: "Logout",
        };

        let message = error.to_string();
        assert!(message.contains("Login"));
        assert!(message.contains("Logout"));
    }

    #[test]
    fn invalid_type_is_error() {
        let error = Error::InvalidType {
            type_name: "NotRegistered",
        };

        let result: Result<()> = Err(error);
        assert!(matches!(result, Err(Error::InvalidType { .. })));
    }
}
