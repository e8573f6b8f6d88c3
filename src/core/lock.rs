//! Poison-tolerant lock acquisition. Poisoned guards are recovered and the
//! acquiring context is logged.

use std::sync::{
    Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, TryLockError,
};
use std::time::{Duration, Instant};

const RETRY_DELAY: Duration = Duration::from_micros(250);

fn recover<G>(kind: &str, context: &str, poisoned: PoisonError<G>) -> G {
    log::error!("{} poisoned in {}, recovering guard", kind, context);
    poisoned.into_inner()
}

pub fn lock_mutex<'a, T>(mutex: &'a Mutex<T>, context: &str) -> MutexGuard<'a, T> {
    mutex
        .lock()
        .unwrap_or_else(|poisoned| recover("Mutex", context, poisoned))
}

/// Spins on `try_lock` until `timeout` elapses, `None` on timeout.
pub fn lock_mutex_with_timeout<'a, T>(
    mutex: &'a Mutex<T>,
    context: &str,
    timeout: Duration,
) -> Option<MutexGuard<'a, T>> {
    let deadline = Instant::now() + timeout;
    loop {
        match mutex.try_lock() {
            Ok(guard) => return Some(guard),
            Err(TryLockError::Poisoned(poisoned)) => {
                return Some(recover("Mutex", context, poisoned));
            }
            Err(TryLockError::WouldBlock) if Instant::now() >= deadline => {
                log::trace!("Mutex wait timed out in {}", context);
                return None;
            }
            Err(TryLockError::WouldBlock) => std::thread::sleep(RETRY_DELAY),
        }
    }
}

pub fn lock_read<'a, T>(lock: &'a RwLock<T>, context: &str) -> RwLockReadGuard<'a, T> {
    lock.read()
        .unwrap_or_else(|poisoned| recover("RwLock(read)", context, poisoned))
}

pub fn lock_write<'a, T>(lock: &'a RwLock<T>, context: &str) -> RwLockWriteGuard<'a, T> {
    lock.write()
        .unwrap_or_else(|poisoned| recover("RwLock(write)", context, poisoned))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_timeout_returns_none_while_held() {
        let mutex = Mutex::new(0u32);
        let _held = lock_mutex(&mutex, "test");
        let started = Instant::now();
        assert!(lock_mutex_with_timeout(&mutex, "test", Duration::from_millis(20)).is_none());
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_timeout_acquires_free_mutex() {
        let mutex = Mutex::new(7u32);
        let guard = lock_mutex_with_timeout(&mutex, "test", Duration::from_millis(5));
        assert_eq!(guard.map(|g| *g), Some(7));
    }

    #[test]
    fn test_poisoned_mutex_is_recovered() {
        let mutex = Arc::new(Mutex::new(1u32));
        let poisoner = mutex.clone();
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.lock().unwrap();
            panic!("poison the lock");
        })
        .join();

        assert!(mutex.is_poisoned());
        assert_eq!(*lock_mutex(&mutex, "test"), 1);
    }

    #[test]
    fn test_poisoned_rwlock_is_recovered() {
        let lock = Arc::new(RwLock::new(vec![1u8]));
        let poisoner = lock.clone();
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.write().unwrap();
            panic!("poison the lock");
        })
        .join();

        lock_write(&lock, "test").push(2);
        assert_eq!(*lock_read(&lock, "test"), vec![1, 2]);
    }
}
