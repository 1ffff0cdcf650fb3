//! Recycling pools for hot-path buffers.
//!
//! A [`Pool`] hands out previously released buffers before allocating new ones. Buffers are
//! either returned explicitly with [`Pool::put`] or held in a [`Pooled`] guard that releases
//! them when dropped, so early returns and `?` never leak a buffer.

use std::ops::{Deref, DerefMut};
use std::sync::Mutex;

/// Something that can be cleared and handed out again.
pub trait Recyclable: Default + Send {
    fn reset(&mut self);
}

impl<T: Send> Recyclable for Vec<T> {
    fn reset(&mut self) {
        self.clear();
    }
}

#[derive(Debug)]
pub struct Pool<T: Recyclable> {
    free: Mutex<Vec<T>>,
    max_idle: usize,
}

impl<T: Recyclable> Pool<T> {
    pub fn new(max_idle: usize) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            max_idle,
        }
    }

    /// Takes a cleared item from the pool, or a fresh one.
    pub fn get(&self) -> T {
        match self.free.lock() {
            Ok(mut free) => free.pop().unwrap_or_default(),
            Err(_) => T::default(),
        }
    }

    /// Returns an item. Items beyond the idle limit are dropped.
    pub fn put(&self, mut item: T) {
        item.reset();
        if let Ok(mut free) = self.free.lock() {
            if free.len() < self.max_idle {
                free.push(item);
            }
        }
    }

    /// Takes an item wrapped in a guard that puts it back on drop.
    pub fn scoped(&self) -> Pooled<'_, T> {
        Pooled {
            pool: self,
            item: Some(self.get()),
        }
    }

    pub fn idle(&self) -> usize {
        self.free.lock().map(|f| f.len()).unwrap_or(0)
    }
}

pub struct Pooled<'a, T: Recyclable> {
    pool: &'a Pool<T>,
    item: Option<T>,
}

impl<T: Recyclable> Pooled<'_, T> {
    /// Detaches the item from the guard; it will not be returned to the pool.
    pub fn take(mut self) -> T {
        self.item.take().unwrap_or_default()
    }
}

impl<T: Recyclable> Deref for Pooled<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // `item` is only `None` after `take`, which consumes the guard.
        match &self.item {
            Some(item) => item,
            None => unreachable!("pooled item accessed after take"),
        }
    }
}

impl<T: Recyclable> DerefMut for Pooled<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        match &mut self.item {
            Some(item) => item,
            None => unreachable!("pooled item accessed after take"),
        }
    }
}

impl<T: Recyclable> Drop for Pooled<'_, T> {
    fn drop(&mut self) {
        if let Some(item) = self.item.take() {
            self.pool.put(item);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scoped_guard_returns_cleared_buffer() {
        let pool: Pool<Vec<u8>> = Pool::new(4);
        {
            let mut b = pool.scoped();
            b.extend_from_slice(b"abc");
            assert_eq!(pool.idle(), 0);
        }
        assert_eq!(pool.idle(), 1);
        let b = pool.get();
        assert!(b.is_empty());
        assert!(b.capacity() >= 3);
    }

    #[test]
    fn guard_releases_on_error_path() {
        let pool: Pool<Vec<u64>> = Pool::new(4);
        let res: Result<(), &str> = (|| {
            let mut b = pool.scoped();
            b.push(1);
            if b.len() == 1 {
                return Err("boom");
            }
            Ok(())
        })();
        assert!(res.is_err());
        assert_eq!(pool.idle(), 1);
    }

    #[test]
    fn idle_limit_is_respected() {
        let pool: Pool<Vec<u8>> = Pool::new(1);
        pool.put(Vec::new());
        pool.put(Vec::new());
        assert_eq!(pool.idle(), 1);
        let taken = pool.scoped().take();
        assert!(taken.is_empty());
        assert_eq!(pool.idle(), 0);
    }
}
