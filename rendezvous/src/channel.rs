use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::protocol::{MountOutcome, MountRequest, OUTCOME_FILE, REQUEST_FILE};

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("failed to encode mount request: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("no mount outcome within {0:?}")]
    Timeout(Duration),
}

/// Opaque handle returned by [`MountChannel::submit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket(u64);

/// Typed view of the rendezvous: one in-flight request, one eventual outcome.
///
/// Production traffic flows through [`FileChannel`]; tests use
/// [`MemoryChannel`] to script agent behavior without a filesystem.
pub trait MountChannel {
    fn submit(&self, request: &MountRequest) -> Result<Ticket, ChannelError>;

    fn await_outcome(&self, ticket: Ticket, timeout: Duration)
        -> Result<MountOutcome, ChannelError>;
}

/// File-backed channel over a single work directory.
///
/// `submit` removes any stale `ready.json` before writing `request.json`, so
/// the agent stays the sole writer of the outcome file and a retry can never
/// observe the previous answer.
pub struct FileChannel {
    dir: PathBuf,
    next_ticket: AtomicU64,
}

impl FileChannel {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        FileChannel {
            dir: dir.into(),
            next_ticket: AtomicU64::new(0),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn outcome_path(&self) -> PathBuf {
        self.dir.join(OUTCOME_FILE)
    }

    fn write_mode_0644(path: &Path, data: &[u8]) -> io::Result<()> {
        std::fs::write(path, data)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o644))?;
        }
        Ok(())
    }
}

impl MountChannel for FileChannel {
    fn submit(&self, request: &MountRequest) -> Result<Ticket, ChannelError> {
        let outcome = self.outcome_path();
        match std::fs::remove_file(&outcome) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(ChannelError::Write {
                    path: outcome,
                    source,
                })
            }
        }

        let data = serde_json::to_vec(request).map_err(ChannelError::Encode)?;
        let path = self.dir.join(REQUEST_FILE);
        Self::write_mode_0644(&path, &data)
            .map_err(|source| ChannelError::Write { path, source })?;

        Ok(Ticket(self.next_ticket.fetch_add(1, Ordering::Relaxed)))
    }

    fn await_outcome(
        &self,
        _ticket: Ticket,
        timeout: Duration,
    ) -> Result<MountOutcome, ChannelError> {
        let start = Instant::now();
        let mut polls: u32 = 0;
        loop {
            if let Ok(data) = std::fs::read(self.outcome_path()) {
                if let Ok(outcome) = serde_json::from_slice::<MountOutcome>(&data) {
                    return Ok(outcome);
                }
            }
            if start.elapsed() >= timeout {
                return Err(ChannelError::Timeout(timeout));
            }
            // Fast polling for the first couple of seconds, then back off.
            let pause = if polls < 20 {
                Duration::from_millis(100)
            } else {
                Duration::from_millis(500)
            };
            polls += 1;
            std::thread::sleep(pause);
        }
    }
}

/// In-memory channel for tests: records submissions, replays scripted
/// outcomes in order.
#[derive(Default)]
pub struct MemoryChannel {
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    submitted: Vec<MountRequest>,
    outcomes: VecDeque<MountOutcome>,
    next_ticket: u64,
}

impl MemoryChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues the outcome the next `await_outcome` call will observe.
    pub fn push_outcome(&self, outcome: MountOutcome) {
        self.inner.lock().unwrap().outcomes.push_back(outcome);
    }

    pub fn submitted(&self) -> Vec<MountRequest> {
        self.inner.lock().unwrap().submitted.clone()
    }
}

impl MountChannel for MemoryChannel {
    fn submit(&self, request: &MountRequest) -> Result<Ticket, ChannelError> {
        let mut inner = self.inner.lock().unwrap();
        inner.submitted.push(request.clone());
        let ticket = Ticket(inner.next_ticket);
        inner.next_ticket += 1;
        Ok(ticket)
    }

    fn await_outcome(
        &self,
        _ticket: Ticket,
        timeout: Duration,
    ) -> Result<MountOutcome, ChannelError> {
        match self.inner.lock().unwrap().outcomes.pop_front() {
            Some(outcome) => Ok(outcome),
            None => Err(ChannelError::Timeout(timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> MountRequest {
        MountRequest {
            pod_uid: "1234-abcd".to_string(),
            namespace: "default".to_string(),
            name: "demo-provider".to_string(),
        }
    }

    #[test]
    fn file_channel_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let channel = FileChannel::new(dir.path());

        let ticket = channel.submit(&request()).unwrap();
        let written = std::fs::read(dir.path().join(REQUEST_FILE)).unwrap();
        let decoded: MountRequest = serde_json::from_slice(&written).unwrap();
        assert_eq!(decoded, request());

        // Play the agent: answer and remove the request.
        std::fs::write(
            dir.path().join(OUTCOME_FILE),
            serde_json::to_vec(&MountOutcome::Ready).unwrap(),
        )
        .unwrap();
        let outcome = channel
            .await_outcome(ticket, Duration::from_secs(1))
            .unwrap();
        assert!(outcome.is_ready());
    }

    #[test]
    fn file_channel_submit_clears_stale_outcome() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(OUTCOME_FILE),
            serde_json::to_vec(&MountOutcome::error("stale")).unwrap(),
        )
        .unwrap();

        let channel = FileChannel::new(dir.path());
        let ticket = channel.submit(&request()).unwrap();
        assert!(!dir.path().join(OUTCOME_FILE).exists());

        let err = channel
            .await_outcome(ticket, Duration::from_millis(50))
            .unwrap_err();
        assert!(matches!(err, ChannelError::Timeout(_)));
    }

    #[test]
    fn file_channel_times_out_without_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let channel = FileChannel::new(dir.path());
        let ticket = channel.submit(&request()).unwrap();
        let err = channel
            .await_outcome(ticket, Duration::from_millis(10))
            .unwrap_err();
        assert!(matches!(err, ChannelError::Timeout(_)));
    }

    #[test]
    fn memory_channel_replays_outcomes_in_order() {
        let channel = MemoryChannel::new();
        channel.push_outcome(MountOutcome::error("first try fails"));
        channel.push_outcome(MountOutcome::Ready);

        let t1 = channel.submit(&request()).unwrap();
        assert!(!channel
            .await_outcome(t1, Duration::from_secs(1))
            .unwrap()
            .is_ready());

        let t2 = channel.submit(&request()).unwrap();
        assert!(channel
            .await_outcome(t2, Duration::from_secs(1))
            .unwrap()
            .is_ready());

        assert_eq!(channel.submitted().len(), 2);
    }
}
