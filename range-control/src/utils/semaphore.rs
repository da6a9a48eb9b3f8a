use std::sync::{Arc, Condvar, Mutex};

/// Counted-permit semaphore used to bound I/O-heavy work (image builds).
/// Permits are released on drop so no failure path can leak one.
#[derive(Clone)]
pub struct Semaphore {
    inner: Arc<SemaphoreInner>,
}

struct SemaphoreInner {
    available: Mutex<usize>,
    condvar: Condvar,
}

pub struct Permit {
    inner: Arc<SemaphoreInner>,
}

impl Semaphore {
    pub fn new(permits: usize) -> Self {
        Self {
            inner: Arc::new(SemaphoreInner {
                available: Mutex::new(permits),
                condvar: Condvar::new(),
            }),
        }
    }

    /// Blocks until a permit is available.
    pub fn acquire(&self) -> Permit {
        let mut available = self
            .inner
            .available
            .lock()
            .expect("semaphore lock should not be poisoned");
        while *available == 0 {
            available = self
                .inner
                .condvar
                .wait(available)
                .expect("semaphore lock should not be poisoned");
        }
        *available -= 1;
        Permit {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        let mut available = self
            .inner
            .available
            .lock()
            .expect("semaphore lock should not be poisoned");
        *available += 1;
        self.inner.condvar.notify_one();
    }
}
