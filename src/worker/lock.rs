use std::sync::Mutex;

/// Process-wide leadership lock for the polling worker. Guards against
/// duplicate timers from overlapping component lifecycles, not against
/// multi-process deployment. Injectable so tests can stand up two workers
/// against one registry and assert the second is refused.
#[derive(Debug, Default)]
pub struct WorkerLockRegistry {
    holder: Mutex<Option<String>>,
}

impl WorkerLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when the token now holds the lock. Re-acquiring with the same
    /// token is a no-op success.
    pub fn acquire(&self, token: &str) -> bool {
        let Ok(mut holder) = self.holder.lock() else {
            return false;
        };
        match holder.as_deref() {
            None => {
                *holder = Some(token.to_string());
                true
            }
            Some(current) => current == token,
        }
    }

    /// Releases only a lock this token owns; never someone else's.
    pub fn release(&self, token: &str) -> bool {
        let Ok(mut holder) = self.holder.lock() else {
            return false;
        };
        if holder.as_deref() == Some(token) {
            *holder = None;
            true
        } else {
            false
        }
    }

    pub fn holder(&self) -> Option<String> {
        self.holder.lock().ok()?.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::WorkerLockRegistry;

    #[test]
    fn second_token_is_refused_until_release() {
        let registry = WorkerLockRegistry::new();
        assert!(registry.acquire("instance-a"));
        assert!(!registry.acquire("instance-b"));
        assert_eq!(registry.holder().as_deref(), Some("instance-a"));

        assert!(registry.release("instance-a"));
        assert!(registry.acquire("instance-b"));
    }

    #[test]
    fn release_requires_ownership() {
        let registry = WorkerLockRegistry::new();
        assert!(registry.acquire("instance-a"));
        assert!(!registry.release("instance-b"));
        assert_eq!(registry.holder().as_deref(), Some("instance-a"));
    }

    #[test]
    fn reacquiring_with_the_same_token_is_idempotent() {
        let registry = WorkerLockRegistry::new();
        assert!(registry.acquire("instance-a"));
        assert!(registry.acquire("instance-a"));
    }
}
