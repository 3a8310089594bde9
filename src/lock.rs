//! Digest-keyed TTL lock.
//!
//! The uniqueness strategies serialize same-digest executions through this
//! capability. The TTL is a crash-safety bound, not a cooperative cancel
//! signal: a holder that dies simply lets the lock lapse.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::error::Result;

/// Callback invoked with the acquisition outcome. The lock is released when
/// the callback returns (or when the TTL expires, whichever comes first).
pub type LockCallback<'a> = Box<dyn FnOnce(bool) -> Result<()> + 'a>;

/// Distributed-lock capability. Not reentrant: a holder attempting to
/// re-acquire its own key observes a miss.
pub trait Locker: Send + Sync {
    fn lock(&self, key: &str, ttl_ms: u64, callback: LockCallback<'_>) -> Result<()>;
}

/// Single-process lock table. Suitable when all workers share one process,
/// and for tests; multi-process deployments plug in a distributed backend.
#[derive(Debug, Default)]
pub struct InProcessLocker {
    held: Mutex<HashMap<String, LockEntry>>,
    generation: AtomicU64,
}

/// The token identifies which acquisition wrote the entry, so release only
/// deletes the entry it created: a holder whose TTL lapsed mid-callback
/// must not evict the successor that took over the key.
#[derive(Debug)]
struct LockEntry {
    expires_at: Instant,
    token: u64,
}

impl InProcessLocker {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Locker for InProcessLocker {
    fn lock(&self, key: &str, ttl_ms: u64, callback: LockCallback<'_>) -> Result<()> {
        let token = {
            let mut held = self.held.lock().expect("lock table poisoned");
            let now = Instant::now();
            match held.get(key) {
                Some(entry) if entry.expires_at > now => None,
                _ => {
                    let token = self.generation.fetch_add(1, Ordering::Relaxed);
                    held.insert(
                        key.to_string(),
                        LockEntry {
                            expires_at: now + Duration::from_millis(ttl_ms),
                            token,
                        },
                    );
                    Some(token)
                }
            }
        };

        // The guard releases on every exit, a panicking callback included;
        // the payload error or panic still propagates to the caller.
        let _release = token.map(|token| ReleaseGuard {
            locker: self,
            key,
            token,
        });
        callback(token.is_some())
    }
}

struct ReleaseGuard<'a> {
    locker: &'a InProcessLocker,
    key: &'a str,
    token: u64,
}

impl Drop for ReleaseGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut held) = self.locker.held.lock() {
            if held.get(self.key).is_some_and(|entry| entry.token == self.token) {
                held.remove(self.key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, PayloadError};

    #[test]
    fn acquires_free_key_and_releases_on_return() {
        let locker = InProcessLocker::new();

        locker
            .lock("digest-a", 60_000, Box::new(|locked| {
                assert!(locked);
                Ok(())
            }))
            .unwrap();

        // Released: can be taken again.
        locker
            .lock("digest-a", 60_000, Box::new(|locked| {
                assert!(locked);
                Ok(())
            }))
            .unwrap();
    }

    #[test]
    fn held_key_misses_and_is_not_reentrant() {
        let locker = InProcessLocker::new();

        locker
            .lock("digest-a", 60_000, Box::new(|outer| {
                assert!(outer);
                locker.lock("digest-a", 60_000, Box::new(|inner| {
                    assert!(!inner);
                    Ok(())
                }))
            }))
            .unwrap();
    }

    #[test]
    fn other_keys_are_unaffected() {
        let locker = InProcessLocker::new();

        locker
            .lock("digest-a", 60_000, Box::new(|_| {
                locker.lock("digest-b", 60_000, Box::new(|locked| {
                    assert!(locked);
                    Ok(())
                }))
            }))
            .unwrap();
    }

    #[test]
    fn expired_ttl_allows_reacquisition() {
        let locker = InProcessLocker::new();

        // TTL of zero expires immediately.
        {
            let mut held = locker.held.lock().unwrap();
            held.insert(
                "digest-a".into(),
                LockEntry {
                    expires_at: Instant::now(),
                    token: u64::MAX,
                },
            );
        }

        locker
            .lock("digest-a", 60_000, Box::new(|locked| {
                assert!(locked);
                Ok(())
            }))
            .unwrap();
    }

    #[test]
    fn stale_holder_return_does_not_release_a_successor() {
        use std::sync::mpsc;

        let locker = std::sync::Arc::new(InProcessLocker::new());
        let (a_entered_tx, a_entered_rx) = mpsc::channel::<()>();
        let (b_to_a_tx, b_to_a_rx) = mpsc::channel::<()>();
        let (b_to_main_tx, b_to_main_rx) = mpsc::channel::<()>();
        let (finish_b_tx, finish_b_rx) = mpsc::channel::<()>();

        // A: short TTL, callback outlives it.
        let a = {
            let locker = std::sync::Arc::clone(&locker);
            std::thread::spawn(move || {
                locker.lock("digest-a", 10, Box::new(|locked| {
                    assert!(locked);
                    a_entered_tx.send(()).unwrap();
                    // Stay in the callback until B has taken over the key.
                    b_to_a_rx.recv().unwrap();
                    Ok(())
                }))
            })
        };

        // B: takes over once A's TTL lapses, then holds across A's return.
        let b = {
            let locker = std::sync::Arc::clone(&locker);
            std::thread::spawn(move || {
                a_entered_rx.recv().unwrap();
                loop {
                    let mut acquired = false;
                    locker
                        .lock("digest-a", 60_000, Box::new(|locked| {
                            if locked {
                                acquired = true;
                                b_to_a_tx.send(()).unwrap();
                                b_to_main_tx.send(()).unwrap();
                                finish_b_rx.recv().unwrap();
                            }
                            Ok(())
                        }))
                        .unwrap();
                    if acquired {
                        break;
                    }
                    std::thread::yield_now();
                }
            })
        };

        b_to_main_rx.recv().unwrap();
        a.join().unwrap().unwrap();

        // A has returned while B still holds; the key must stay taken.
        locker
            .lock("digest-a", 60_000, Box::new(|locked| {
                assert!(!locked);
                Ok(())
            }))
            .unwrap();

        finish_b_tx.send(()).unwrap();
        b.join().unwrap();
    }

    #[test]
    fn releases_after_a_panicking_callback() {
        use std::panic::{AssertUnwindSafe, catch_unwind};

        let locker = InProcessLocker::new();

        let panicked = catch_unwind(AssertUnwindSafe(|| {
            let _ = locker.lock("digest-a", 60_000, Box::new(|_| panic!("payload blew up")));
        }));
        assert!(panicked.is_err());

        locker
            .lock("digest-a", 60_000, Box::new(|locked| {
                assert!(locked);
                Ok(())
            }))
            .unwrap();
    }

    #[test]
    fn releases_after_callback_error() {
        let locker = InProcessLocker::new();

        let err = locker.lock(
            "digest-a",
            60_000,
            Box::new(|_| Err(Error::Payload(PayloadError::new("Boom", "bang")))),
        );
        assert!(err.is_err());

        locker
            .lock("digest-a", 60_000, Box::new(|locked| {
                assert!(locked);
                Ok(())
            }))
            .unwrap();
    }
}
