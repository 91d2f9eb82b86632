/// `RefCounter<T>` is a thin wrapper over [`triomphe::Arc`]: a non-weak atomic
/// reference count whose current value is observable, which the table layer
/// relies on for file garbage collection.
#[derive(Debug)]
#[repr(transparent)]
pub struct RefCounter<T: ?Sized> {
    ptr: triomphe::Arc<T>,
}

impl<T> Clone for RefCounter<T> {
    fn clone(&self) -> Self {
        Self {
            ptr: self.ptr.clone(),
        }
    }
}

impl<T: ?Sized> core::ops::Deref for RefCounter<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.ptr
    }
}

impl<T: ?Sized> AsRef<T> for RefCounter<T> {
    fn as_ref(&self) -> &T {
        &self.ptr
    }
}

impl<T> RefCounter<T> {
    #[inline]
    pub fn new(val: T) -> Self {
        Self {
            ptr: triomphe::Arc::new(val),
        }
    }

    /// The number of live references, including this one.
    #[inline]
    pub fn count(ptr: &Self) -> usize {
        triomphe::Arc::count(&ptr.ptr)
    }
}

impl<T> From<T> for RefCounter<T> {
    fn from(val: T) -> Self {
        Self::new(val)
    }
}
