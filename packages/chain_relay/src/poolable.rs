/// A value that can be recycled by an [`ObjectPool`][crate::ObjectPool].
///
/// The pool calls [`reset()`][Poolable::reset] every time it hands out an instance, whether
/// the instance is freshly constructed or reused, so callers always receive a blank value.
///
/// # Example
///
/// ```
/// use chain_relay::Poolable;
///
/// #[derive(Default)]
/// struct Login {
///     username: String,
///     attempts: u32,
/// }
///
/// impl Poolable for Login {
///     fn reset(&mut self) {
///         // Keep the string capacity for the next user of this instance.
///         self.username.clear();
///         self.attempts = 0;
///     }
/// }
/// ```
pub trait Poolable: 'static {
    /// Restores the value to its blank, reusable state.
    fn reset(&mut self);
}
