//! Software sync fences with merge semantics.
//!
//! A fence stands in for a kernel sync primitive signalled by the GPU or a
//! DMA engine. The queue never inspects payloads, it only needs three
//! things from a fence: wait with a deadline, query the signal timestamp,
//! and merge two fences such that the merged fence signals when both
//! inputs have ([`SyncFence::merge`]).

use std::sync::Arc;
use std::time::{ Duration, Instant };

use parking_lot::{ Condvar, Mutex };

/// Shared-ownership fence value object.
///
/// Cloning is cheap and shares the signal state; an [invalid](Self::invalid)
/// fence is the "already done" sentinel used for dropped frames and
/// freshly allocated buffers.
#[derive(Clone)]
pub struct SyncFence {
    inner: Arc<FenceInner>,
}

struct FenceInner {
    name: String,
    kind: FenceKind,
}

enum FenceKind {
    /// Sentinel: behaves as permanently signalled with no timestamp
    Invalid,
    /// A fence some producer-side engine will signal
    Source {
        signalled_at: Mutex<Option<i64>>,
        cond: Condvar,
    },
    /// Signals once both children have
    Merged {
        left: SyncFence,
        right: SyncFence,
    },
}

impl SyncFence {
    /// Create an unsignalled fence
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(FenceInner {
                name: name.into(),
                kind: FenceKind::Source {
                    signalled_at: Mutex::new(None),
                    cond: Condvar::new(),
                },
            }),
        }
    }

    /// The invalid-fence sentinel: valid to wait on, signals immediately
    pub fn invalid() -> Self {
        Self {
            inner: Arc::new(FenceInner {
                name: "invalid".into(),
                kind: FenceKind::Invalid,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_valid(&self) -> bool {
        !matches!(self.inner.kind, FenceKind::Invalid)
    }

    /// Signal the fence with an explicit timestamp (nanoseconds).
    ///
    /// Signalling twice keeps the first timestamp. Merged and invalid
    /// fences ignore the call.
    pub fn signal_at(&self, timestamp: i64) {
        if let FenceKind::Source { signalled_at, cond } = &self.inner.kind {
            let mut state = signalled_at.lock();
            if state.is_none() {
                *state = Some(timestamp);
                cond.notify_all();
            }
        }
    }

    /// Signal with the current monotonic time
    pub fn signal(&self) {
        self.signal_at(monotonic_nanos());
    }

    /// Whether the fence (and, for merges, every child) has signalled
    pub fn is_signalled(&self) -> bool {
        match &self.inner.kind {
            FenceKind::Invalid => true,
            FenceKind::Source { signalled_at, .. } => signalled_at.lock().is_some(),
            FenceKind::Merged { left, right } => left.is_signalled() && right.is_signalled(),
        }
    }

    /// Signal timestamp: the max over all valid children, `None` while any
    /// valid child is pending (or when no valid child exists at all)
    pub fn signalled_time(&self) -> Option<i64> {
        match &self.inner.kind {
            FenceKind::Invalid => None,
            FenceKind::Source { signalled_at, .. } => *signalled_at.lock(),
            FenceKind::Merged { left, right } => {
                match (left.is_valid(), right.is_valid()) {
                    (true, true) => Some(left.signalled_time()?.max(right.signalled_time()?)),
                    (true, false) => left.signalled_time(),
                    (false, true) => right.signalled_time(),
                    (false, false) => None,
                }
            }
        }
    }

    /// Block until signalled. `timeout_ms < 0` waits forever. Returns
    /// `false` on timeout.
    pub fn wait(&self, timeout_ms: i32) -> bool {
        match &self.inner.kind {
            FenceKind::Invalid => true,
            FenceKind::Source { signalled_at, cond } => {
                let mut state = signalled_at.lock();
                if timeout_ms < 0 {
                    cond.wait_while(&mut state, |s| s.is_none());
                    true
                } else {
                    !cond
                        .wait_while_for(&mut state, |s| s.is_none(), Duration::from_millis(timeout_ms as u64))
                        .timed_out()
                }
            }
            FenceKind::Merged { left, right } => {
                if timeout_ms < 0 {
                    return left.wait(-1) && right.wait(-1);
                }
                let deadline = Instant::now() + Duration::from_millis(timeout_ms as u64);
                for child in [left, right] {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if !child.wait(remaining.as_millis() as i32) {
                        return false;
                    }
                }
                true
            }
        }
    }

    /// Merge two fences. An invalid input is the identity; otherwise the
    /// result signals once both inputs have, at the later of the two
    /// timestamps.
    pub fn merge(name: impl Into<String>, a: &SyncFence, b: &SyncFence) -> SyncFence {
        if !a.is_valid() {
            return b.clone();
        }
        if !b.is_valid() {
            return a.clone();
        }
        Self {
            inner: Arc::new(FenceInner {
                name: name.into(),
                kind: FenceKind::Merged {
                    left: a.clone(),
                    right: b.clone(),
                },
            }),
        }
    }
}

impl std::fmt::Debug for SyncFence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncFence")
            .field("name", &self.inner.name)
            .field("valid", &self.is_valid())
            .field("signalled", &self.is_signalled())
            .finish()
    }
}

/// Current monotonic time in nanoseconds, used for fence and flush stamps
pub fn monotonic_nanos() -> i64 {
    use std::sync::OnceLock;
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_nanos() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_invalid_is_identity_for_merge() {
        let f = SyncFence::new("gpu");
        f.signal_at(77);

        let merged = SyncFence::merge("m", &SyncFence::invalid(), &f);
        assert_eq!(merged.signalled_time(), Some(77));

        let merged = SyncFence::merge("m", &f, &SyncFence::invalid());
        assert_eq!(merged.signalled_time(), Some(77));
    }

    #[test]
    fn test_merge_signals_at_max() {
        let a = SyncFence::new("a");
        let b = SyncFence::new("b");
        let merged = SyncFence::merge("m", &a, &b);

        a.signal_at(100);
        assert!(!merged.is_signalled());
        assert_eq!(merged.signalled_time(), None);

        b.signal_at(250);
        assert!(merged.is_signalled());
        assert_eq!(merged.signalled_time(), Some(250));
    }

    #[test]
    fn test_wait_timeout_and_signal() {
        let f = SyncFence::new("slow");
        assert!(!f.wait(10));

        let waiter = f.clone();
        let handle = thread::spawn(move || waiter.wait(1000));
        thread::sleep(Duration::from_millis(20));
        f.signal();
        assert!(handle.join().unwrap());
    }

    #[test]
    fn test_double_signal_keeps_first_timestamp() {
        let f = SyncFence::new("once");
        f.signal_at(5);
        f.signal_at(9);
        assert_eq!(f.signalled_time(), Some(5));
    }

    #[test]
    fn test_invalid_wait_never_blocks() {
        assert!(SyncFence::invalid().wait(0));
        assert!(SyncFence::invalid().wait(-1));
    }
}
