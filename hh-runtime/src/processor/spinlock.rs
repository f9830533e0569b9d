use std::{
    cell::UnsafeCell,
    hint,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, AtomicUsize, Ordering::*},
};

/// Holder recorded while the lock is free.
const NO_HOLDER: usize = usize::MAX;

/// Busy-waiting lock that records which processor holds it.
///
/// Critical sections guarded by this lock are a handful of loads and stores,
/// and must be usable from code that runs in place of a signal handler,
/// so waiting never deschedules the thread.
pub struct SpinLock<T>
{
    locked: AtomicBool,
    holder: AtomicUsize,
    value: UnsafeCell<T>,
}

// SAFETY: The lock provides exclusive access to the value.
unsafe impl<T> Send for SpinLock<T> where T: Send { }
unsafe impl<T> Sync for SpinLock<T> where T: Send { }

/// Exclusive access to the value of a [`SpinLock`].
pub struct SpinLockGuard<'a, T>
{
    lock: &'a SpinLock<T>,
}

impl<T> SpinLock<T>
{
    /// Create an unlocked lock.
    pub const fn new(value: T) -> Self
    {
        Self{
            locked: AtomicBool::new(false),
            holder: AtomicUsize::new(NO_HOLDER),
            value: UnsafeCell::new(value),
        }
    }

    /// Acquire the lock on behalf of processor `holder`.
    pub fn lock(&self, holder: usize) -> SpinLockGuard<'_, T>
    {
        loop {
            if let Some(guard) = self.try_lock(holder) {
                return guard;
            }
            while self.locked.load(Relaxed) {
                hint::spin_loop();
            }
        }
    }

    /// Acquire the lock if it is free.
    pub fn try_lock(&self, holder: usize) -> Option<SpinLockGuard<'_, T>>
    {
        self.locked.compare_exchange(false, true, Acquire, Relaxed).ok()?;
        self.holder.store(holder, Relaxed);
        Some(SpinLockGuard{lock: self})
    }

    /// The processor holding the lock, if any.
    ///
    /// Only useful for diagnostics; the answer may be stale.
    pub fn holder(&self) -> Option<usize>
    {
        match self.holder.load(Relaxed) {
            NO_HOLDER => None,
            holder => Some(holder),
        }
    }

    /// Access the value through a unique reference to the lock.
    pub fn get_mut(&mut self) -> &mut T
    {
        self.value.get_mut()
    }
}

impl<'a, T> Deref for SpinLockGuard<'a, T>
{
    type Target = T;

    fn deref(&self) -> &Self::Target
    {
        // SAFETY: The guard holds the lock.
        unsafe { &*self.lock.value.get() }
    }
}

impl<'a, T> DerefMut for SpinLockGuard<'a, T>
{
    fn deref_mut(&mut self) -> &mut Self::Target
    {
        // SAFETY: The guard holds the lock.
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<'a, T> Drop for SpinLockGuard<'a, T>
{
    fn drop(&mut self)
    {
        self.lock.holder.store(NO_HOLDER, Relaxed);
        self.lock.locked.store(false, Release);
    }
}
