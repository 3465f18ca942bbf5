//! Connection liveness.
//!
//! [`spawn_monitor`] runs one background task per connection that sends a
//! `Ping` after a quiet period and declares the connection dead when the
//! acknowledgement does not arrive in time:
//!
//! ```text
//!            quiet for `time`            no ack within `timeout`
//!   Idle ─────────────────────▶ ProbeSent ─────────────────────▶ Dead
//!    ▲                              │
//!    └──── inbound traffic / ack ───┘
//! ```
//!
//! The task is bound to the connection's `CancellationToken` and exits as soon
//! as the connection closes. [`PingEnforcer`] is the accepting side's guard
//! against peers that probe too often.

use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use crate::types::{EnforcementPolicy, KeepaliveConfig};

/// Keepalive state machine position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeState {
    Idle,
    ProbeSent,
    Dead,
}

/// What the monitor needs from the connection it watches.
pub(crate) trait Monitored: Send + Sync + 'static {
    fn open_streams(&self) -> usize;

    /// Queue a ping. Returns false once the connection can no longer write.
    fn send_probe(&self) -> bool;

    fn declare_dead(&self, reason: &str);
}

/// Activity bookkeeping shared between the connection's reader and the monitor.
#[derive(Debug)]
pub struct KeepaliveState {
    last_activity: Mutex<Instant>,
    probe: Mutex<ProbeState>,
    pulse: Notify,
    stream_opened: Notify,
}

impl KeepaliveState {
    pub fn new() -> Self {
        Self {
            last_activity: Mutex::new(Instant::now()),
            probe: Mutex::new(ProbeState::Idle),
            pulse: Notify::new(),
            stream_opened: Notify::new(),
        }
    }

    /// Record inbound traffic (any frame, including ping acknowledgements).
    pub fn record_activity(&self) {
        *self.last_activity.lock() = Instant::now();
        self.pulse.notify_waiters();
    }

    /// Wake a monitor suspended for lack of open streams.
    pub fn notify_stream_opened(&self) {
        self.stream_opened.notify_waiters();
    }

    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock()
    }

    pub fn probe_state(&self) -> ProbeState {
        *self.probe.lock()
    }

    fn set_probe_state(&self, state: ProbeState) {
        *self.probe.lock() = state;
    }
}

impl Default for KeepaliveState {
    fn default() -> Self {
        Self::new()
    }
}

/// Start the keepalive task for one connection.
pub(crate) fn spawn_monitor<L: Monitored>(
    config: KeepaliveConfig,
    state: Arc<KeepaliveState>,
    target: Weak<L>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        run_monitor(config, state, target, cancel).await;
        tracing::trace!("keepalive_monitor_stopped");
    })
}

async fn run_monitor<L: Monitored>(
    config: KeepaliveConfig,
    state: Arc<KeepaliveState>,
    target: Weak<L>,
    cancel: CancellationToken,
) {
    let mut period_start = Instant::now();

    loop {
        if !config.permit_without_stream {
            let opened = state.stream_opened.notified();
            tokio::pin!(opened);
            opened.as_mut().enable();

            let idle = match target.upgrade() {
                Some(t) => t.open_streams() == 0,
                None => return,
            };
            if idle {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = &mut opened => {
                        period_start = Instant::now();
                        continue;
                    }
                }
            }
        }

        let quiet_since = state.last_activity().max(period_start);
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = sleep_until(quiet_since + config.time) => {}
        }
        if state.last_activity() + config.time > Instant::now() {
            continue;
        }

        let ack = state.pulse.notified();
        tokio::pin!(ack);
        ack.as_mut().enable();

        {
            let Some(t) = target.upgrade() else { return };
            if !config.permit_without_stream && t.open_streams() == 0 {
                continue;
            }
            if !t.send_probe() {
                return;
            }
        }
        state.set_probe_state(ProbeState::ProbeSent);
        tracing::trace!("keepalive_probe_sent");

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = &mut ack => {
                state.set_probe_state(ProbeState::Idle);
                period_start = Instant::now();
            }
            _ = sleep(config.timeout) => {
                state.set_probe_state(ProbeState::Dead);
                tracing::warn!(
                    "keepalive_timeout: no acknowledgement within {:?}",
                    config.timeout
                );
                if let Some(t) = target.upgrade() {
                    t.declare_dead("keepalive timeout");
                }
                return;
            }
        }
    }
}

/// Reason a peer's ping was refused.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PingViolation {
    #[error("too_many_pings: {interval:?} since previous ping, minimum is {minimum:?}")]
    TooFrequent { interval: Duration, minimum: Duration },

    #[error("too_many_pings: ping without active streams")]
    NoActiveStreams,
}

/// Accepting-side ping policy. A violation terminates the connection.
#[derive(Debug)]
pub struct PingEnforcer {
    policy: EnforcementPolicy,
    last_ping: Option<Instant>,
}

impl PingEnforcer {
    pub fn new(policy: EnforcementPolicy) -> Self {
        Self {
            policy,
            last_ping: None,
        }
    }

    /// Check an inbound ping and record it if allowed.
    pub fn on_ping(&mut self, now: Instant, open_streams: usize) -> Result<(), PingViolation> {
        if open_streams == 0 && !self.policy.permit_without_stream {
            return Err(PingViolation::NoActiveStreams);
        }
        if let Some(previous) = self.last_ping {
            let interval = now.saturating_duration_since(previous);
            if interval < self.policy.min_ping_interval {
                return Err(PingViolation::TooFrequent {
                    interval,
                    minimum: self.policy.min_ping_interval,
                });
            }
        }
        self.last_ping = Some(now);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeConnection {
        streams: AtomicUsize,
        probes: AtomicUsize,
        dead: AtomicBool,
    }

    impl Monitored for FakeConnection {
        fn open_streams(&self) -> usize {
            self.streams.load(Ordering::SeqCst)
        }

        fn send_probe(&self) -> bool {
            self.probes.fetch_add(1, Ordering::SeqCst);
            true
        }

        fn declare_dead(&self, _reason: &str) {
            self.dead.store(true, Ordering::SeqCst);
        }
    }

    fn config(permit_without_stream: bool) -> KeepaliveConfig {
        KeepaliveConfig {
            time: Duration::from_secs(10),
            timeout: Duration::from_secs(3),
            permit_without_stream,
        }
    }

    fn start(
        permit_without_stream: bool,
    ) -> (
        Arc<FakeConnection>,
        Arc<KeepaliveState>,
        CancellationToken,
        tokio::task::JoinHandle<()>,
    ) {
        let conn = Arc::new(FakeConnection::default());
        let state = Arc::new(KeepaliveState::new());
        let cancel = CancellationToken::new();
        let handle = spawn_monitor(
            config(permit_without_stream),
            state.clone(),
            Arc::downgrade(&conn),
            cancel.clone(),
        );
        (conn, state, cancel, handle)
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_connection_probes_once_then_dies() {
        let (conn, state, _cancel, handle) = start(true);

        sleep(Duration::from_secs(9)).await;
        assert_eq!(conn.probes.load(Ordering::SeqCst), 0);

        sleep(Duration::from_secs(2)).await;
        assert_eq!(conn.probes.load(Ordering::SeqCst), 1);
        assert_eq!(state.probe_state(), ProbeState::ProbeSent);

        sleep(Duration::from_secs(3)).await;
        assert!(conn.dead.load(Ordering::SeqCst));
        assert_eq!(state.probe_state(), ProbeState::Dead);
        assert_eq!(conn.probes.load(Ordering::SeqCst), 1);
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_returns_to_idle() {
        let (conn, state, cancel, _handle) = start(true);

        sleep(Duration::from_secs(11)).await;
        assert_eq!(state.probe_state(), ProbeState::ProbeSent);
        state.record_activity();
        tokio::task::yield_now().await;

        sleep(Duration::from_secs(3)).await;
        assert_eq!(state.probe_state(), ProbeState::Idle);
        assert!(!conn.dead.load(Ordering::SeqCst));

        // Next probe one full period after the acknowledgement.
        sleep(Duration::from_secs(6)).await;
        assert_eq!(conn.probes.load(Ordering::SeqCst), 1);
        sleep(Duration::from_secs(2)).await;
        assert_eq!(conn.probes.load(Ordering::SeqCst), 2);
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_traffic_defers_probe() {
        let (conn, state, cancel, _handle) = start(true);

        sleep(Duration::from_secs(5)).await;
        state.record_activity();

        sleep(Duration::from_secs(7)).await;
        assert_eq!(conn.probes.load(Ordering::SeqCst), 0);

        sleep(Duration::from_secs(4)).await;
        assert_eq!(conn.probes.load(Ordering::SeqCst), 1);
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_suspended_without_streams() {
        let (conn, state, cancel, _handle) = start(false);

        sleep(Duration::from_secs(30)).await;
        assert_eq!(conn.probes.load(Ordering::SeqCst), 0);

        conn.streams.store(1, Ordering::SeqCst);
        state.notify_stream_opened();
        tokio::task::yield_now().await;

        sleep(Duration::from_secs(9)).await;
        assert_eq!(conn.probes.load(Ordering::SeqCst), 0);
        sleep(Duration::from_secs(2)).await;
        assert_eq!(conn.probes.load(Ordering::SeqCst), 1);
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_monitor() {
        let (conn, _state, cancel, handle) = start(true);
        cancel.cancel();
        handle.await.unwrap();

        sleep(Duration::from_secs(60)).await;
        assert_eq!(conn.probes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_connection_stops_monitor() {
        let (conn, _state, _cancel, handle) = start(true);
        drop(conn);
        sleep(Duration::from_secs(11)).await;
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_enforcer_rejects_frequent_pings() {
        let mut enforcer = PingEnforcer::new(EnforcementPolicy::default());
        let start = Instant::now();

        assert!(enforcer.on_ping(start, 1).is_ok());
        assert!(enforcer.on_ping(start + Duration::from_secs(5), 1).is_ok());
        let err = enforcer
            .on_ping(start + Duration::from_secs(7), 1)
            .unwrap_err();
        assert!(matches!(err, PingViolation::TooFrequent { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_enforcer_without_streams() {
        let policy = EnforcementPolicy {
            permit_without_stream: false,
            ..EnforcementPolicy::default()
        };
        let mut enforcer = PingEnforcer::new(policy);
        assert_eq!(
            enforcer.on_ping(Instant::now(), 0),
            Err(PingViolation::NoActiveStreams)
        );
        assert!(enforcer.on_ping(Instant::now(), 2).is_ok());

        let mut lenient = PingEnforcer::new(EnforcementPolicy::default());
        assert!(lenient.on_ping(Instant::now(), 0).is_ok());
    }
}
