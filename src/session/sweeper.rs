//! Background TTL eviction of idle sessions.

use crate::session::store::SessionStore;
use crossbeam_channel::{RecvTimeoutError, Sender, bounded};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

enum SweepCommand {
    SweepNow,
    Stop,
}

/// Handle to the sweeper thread. Dropping it stops the thread.
pub struct SessionSweeper {
    tx: Sender<SweepCommand>,
    handle: Option<JoinHandle<()>>,
}

impl SessionSweeper {
    /// Evict sessions idle for `ttl`, checking every `interval`.
    pub fn spawn(
        store: Arc<dyn SessionStore>,
        ttl: Duration,
        interval: Duration,
    ) -> std::io::Result<Self> {
        let (tx, rx) = bounded::<SweepCommand>(4);
        let handle = std::thread::Builder::new()
            .name("session-sweeper".into())
            .spawn(move || {
                tracing::debug!(ttl_secs = ttl.as_secs(), interval_secs = interval.as_secs(), "sweeper started");
                loop {
                    match rx.recv_timeout(interval) {
                        Ok(SweepCommand::SweepNow) | Err(RecvTimeoutError::Timeout) => {
                            let evicted = store.evict_idle(ttl);
                            if evicted > 0 {
                                tracing::info!(evicted, remaining = store.len(), "session_sweep");
                            }
                        }
                        Ok(SweepCommand::Stop) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                tracing::debug!("sweeper stopped");
            })?;
        Ok(Self {
            tx,
            handle: Some(handle),
        })
    }

    /// Run a sweep without waiting for the next tick.
    pub fn sweep_now(&self) {
        let _ = self.tx.try_send(SweepCommand::SweepNow);
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let _ = self.tx.send(SweepCommand::Stop);
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            tracing::warn!("sweeper thread panicked");
        }
    }
}

impl Drop for SessionSweeper {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::types::{Facets, ResultItems, ResultKind, ResultSet};
    use crate::session::store::{InMemorySessionStore, SessionKey};
    use std::time::Instant;

    #[test]
    fn sweep_now_evicts_idle_sessions() {
        let store: Arc<dyn SessionStore> = Arc::new(InMemorySessionStore::new(8));
        store.set(
            SessionKey::user(1),
            ResultSet::new(ResultItems::empty(ResultKind::Books), Facets::default(), ""),
            20,
        );
        let sweeper =
            SessionSweeper::spawn(Arc::clone(&store), Duration::ZERO, Duration::from_secs(3600))
                .unwrap();
        sweeper.sweep_now();

        let deadline = Instant::now() + Duration::from_secs(5);
        while !store.is_empty() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(store.is_empty());
        sweeper.stop();
    }

    #[test]
    fn long_ttl_keeps_sessions() {
        let store: Arc<dyn SessionStore> = Arc::new(InMemorySessionStore::new(8));
        store.set(
            SessionKey::user(1),
            ResultSet::new(ResultItems::empty(ResultKind::Books), Facets::default(), ""),
            20,
        );
        let sweeper = SessionSweeper::spawn(
            Arc::clone(&store),
            Duration::from_secs(3600),
            Duration::from_millis(1),
        )
        .unwrap();
        std::thread::sleep(Duration::from_millis(20));
        drop(sweeper);
        assert_eq!(store.len(), 1);
    }
}
