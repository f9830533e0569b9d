//! Scope guards that run code when a scope ends.

#![warn(missing_docs)]

/// Runs a closure when dropped, unless dismissed.
///
/// The closure also runs when a panic unwinds through the scope.
#[must_use = "The closure runs immediately if the guard is not bound"]
pub struct ScopeExit<F>
    where F: FnOnce()
{
    f: Option<F>,
}

impl<F> ScopeExit<F>
    where F: FnOnce()
{
    /// Create a guard that runs `f` when dropped.
    pub fn new(f: F) -> Self
    {
        Self{f: Some(f)}
    }

    /// Drop the guard without running the closure.
    pub fn dismiss(mut self)
    {
        self.f = None;
    }
}

impl<F> Drop for ScopeExit<F>
    where F: FnOnce()
{
    fn drop(&mut self)
    {
        if let Some(f) = self.f.take() {
            f();
        }
    }
}

/// Create a guard that runs `f` when dropped.
///
/// # Examples
///
/// ```
/// use std::cell::Cell;
/// let x = Cell::new(0);
/// {
///     let _guard = scope_exit::guard(|| x.set(1));
///     x.set(2);
/// }
/// assert_eq!(x.get(), 1);
/// ```
pub fn guard<F>(f: F) -> ScopeExit<F>
    where F: FnOnce()
{
    ScopeExit::new(f)
}

/// Run code at the end of the enclosing scope.
///
/// # Examples
///
/// ```
/// # use scope_exit::scope_exit;
/// use std::cell::Cell;
/// let x = Cell::new(0);
/// {
///     scope_exit! { x.set(1); }
///     x.set(2);
/// }
/// assert_eq!(x.get(), 1);
/// ```
#[macro_export]
macro_rules! scope_exit
{
    { $($tt:tt)* } => {
        let __scope_exit = $crate::guard(|| { $($tt)* });
    };
}

#[cfg(test)]
mod tests
{
    use {super::*, std::cell::Cell};

    #[test]
    fn dismissed_guard_does_not_run()
    {
        let x = Cell::new(0);
        guard(|| x.set(1)).dismiss();
        assert_eq!(x.get(), 0);
    }

    #[test]
    fn guard_runs_during_unwinding()
    {
        let x = Cell::new(0);
        let result = std::panic::catch_unwind(
            std::panic::AssertUnwindSafe(|| {
                scope_exit! { x.set(1); }
                panic!("unwind");
            }),
        );
        assert!(result.is_err());
        assert_eq!(x.get(), 1);
    }
}
