//! Named continuations.
//!
//! An [`ActionInfo`] describes "what to do next" without the component that
//! runs it knowing anything about the caller's domain logic. The callback
//! closes over its own data; the input `T` is supplied by whoever resolves the
//! continuation (for the retry orchestrator that is the updated
//! [`CommandInfo`](crate::command::CommandInfo)).

use std::borrow::Cow;
use std::fmt;

type Callback<T> = Box<dyn FnOnce(T) -> bool + Send + 'static>;

/// A named, single-use continuation with an optional follow-up.
///
/// The follow-up only runs when the callback reports success.
pub struct ActionInfo<T = ()> {
    name: Cow<'static, str>,
    callback: Callback<T>,
    next: Option<Box<ActionInfo>>,
}

impl<T> ActionInfo<T> {
    /// Creates a continuation from a callback.
    pub fn new<F>(name: impl Into<Cow<'static, str>>, callback: F) -> Self
    where
        F: FnOnce(T) -> bool + Send + 'static,
    {
        Self {
            name: name.into(),
            callback: Box::new(callback),
            next: None,
        }
    }

    /// A continuation that does nothing and reports success.
    pub fn noop(name: impl Into<Cow<'static, str>>) -> Self {
        Self::new(name, |_| true)
    }

    /// Appends `next` to the end of this continuation's chain.
    #[must_use]
    pub fn then(mut self, next: ActionInfo) -> Self {
        self.next = Some(match self.next.take() {
            Some(existing) => Box::new((*existing).then(next)),
            None => Box::new(next),
        });
        self
    }

    /// The continuation's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runs the callback and, if it succeeded, the rest of the chain.
    ///
    /// Returns `true` only if every continuation that ran reported success.
    pub fn run(self, input: T) -> bool {
        if !(self.callback)(input) {
            return false;
        }
        self.next.map_or(true, |next| (*next).run(()))
    }
}

impl<T> fmt::Debug for ActionInfo<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionInfo")
            .field("name", &self.name)
            .field("callback", &"<callback>")
            .field("next", &self.next)
            .finish()
    }
}
