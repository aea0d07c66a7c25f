//! Type-safe cache key builders

use std::fmt;

pub const VERSION: &str = "v1";

pub mod session {
    use super::*;
    use uuid::Uuid;

    pub const NAMESPACE: &str = "payment_session";

    /// Cached projection of one payment session
    #[derive(Debug, Clone)]
    pub struct SessionKey {
        pub session_id: Uuid,
    }

    impl SessionKey {
        pub fn new(session_id: Uuid) -> Self {
            Self { session_id }
        }
    }

    impl fmt::Display for SessionKey {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}:{}:{}", VERSION, NAMESPACE, self.session_id)
        }
    }
}

pub mod lock {
    use super::*;

    pub const NAMESPACE: &str = "lock";

    /// Cross-replica lock for a periodic job
    #[derive(Debug, Clone)]
    pub struct JobLockKey {
        pub job: String,
    }

    impl JobLockKey {
        pub fn new(job: impl Into<String>) -> Self {
            Self { job: job.into() }
        }
    }

    impl fmt::Display for JobLockKey {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}:{}:{}", VERSION, NAMESPACE, self.job)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_session_key_format() {
        let id = Uuid::nil();
        assert_eq!(
            session::SessionKey::new(id).to_string(),
            "v1:payment_session:00000000-0000-0000-0000-000000000000"
        );
    }

    #[test]
    fn test_job_lock_key_format() {
        assert_eq!(
            lock::JobLockKey::new("reconciliation").to_string(),
            "v1:lock:reconciliation"
        );
    }
}
