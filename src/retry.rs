use crate::{error::RevisionError, store::RowStore};

/// How often a lookup is re-run after a transient store failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub reconnect_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            reconnect_attempts: 1,
        }
    }
}

impl RetryPolicy {
    pub fn never() -> Self {
        Self {
            reconnect_attempts: 0,
        }
    }

    /// Runs `operation`, reconnecting `store` and re-running it from the start whenever it
    /// fails with a retryable error, until the attempts are used up.
    pub fn run<S, T, F>(&self, store: &S, mut operation: F) -> Result<T, RevisionError>
    where
        S: RowStore + ?Sized,
        F: FnMut(&S) -> Result<T, RevisionError>,
    {
        let mut attempt = 0;
        loop {
            match operation(store) {
                Err(err) if err.is_retryable() && attempt < self.reconnect_attempts => {
                    attempt += 1;
                    tracing::warn!(
                        message = "Transient store failure, reconnecting",
                        attempt,
                        error = %err
                    );
                    store.reconnect()?;
                }
                result => return result,
            }
        }
    }
}
