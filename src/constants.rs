//! 🎛️ HUB CONSTANTS: tunables for the coordination hub.
//! DECISION ARCHAEOLOGY: each constant below carries the reasoning behind
//! its specific value, not just the value itself.
//! AUDIT: revisit these if deployment scale or agent fleet size changes.
//!
//! Values here are defaults; most are overridable via [`crate::config::Config`]
//! and environment variables — see `config/mod.rs`.

use std::time::Duration;

// ⏱️ TASK QUEUE TIMING

/// 🔁 RECLAIM SWEEP INTERVAL: how often the Task Queue scans for overdue
/// `ASSIGNED` tasks (§4.E.3).
/// Why: 30s bounds how long a crashed/hung agent can squat on a task
/// without making the sweep itself a meaningful CPU cost at hub scale.
/// Alternative: 5s (rejected: scans the whole active table every pass for
/// no real latency win at typical task durations), 5min (rejected: an
/// agent that died mid-task would block that task for too long).
pub const RECLAIM_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// 💓 PRESENCE REAP INTERVAL: cadence of the heartbeat-timeout sweep (§4.C).
/// Why: independent of the heartbeat timeout itself (which is configurable)
/// — this only needs to be frequent enough that a lapsed agent is evicted
/// within roughly one timeout window, not instantly.
pub const PRESENCE_REAP_INTERVAL: Duration = Duration::from_secs(30);

/// 🧭 SCHEDULER TICK: re-evaluation cadence when no event wakes it first
/// (§4.F), also configurable via `scheduler_tick_ms`.
/// Why: 1s is fast enough that a newly-idle agent doesn't sit unmatched for
/// long, slow enough that an idle hub isn't burning cycles on empty passes.
pub const DEFAULT_SCHEDULER_TICK_MS: u64 = 1_000;

/// ⏳ ACCEPTANCE TIMEOUT: armed on `IDLE -> ASSIGNED` (§4.D).
/// Why: 60s gives a slow agent time to `task_accepted` over a congested
/// connection without letting a silently-dead one hold a task indefinitely.
/// Alternative: 10s (rejected: false reclaims under ordinary network jitter).
pub const DEFAULT_ACCEPTANCE_TIMEOUT_MS: u64 = 60_000;

/// 💔 HEARTBEAT TIMEOUT: presence cutoff before an agent is evicted
/// (§4.C / §6.4).
/// Why: 90s is 3x the default heartbeat period, the usual "miss three in a
/// row" rule of thumb — tolerates one dropped heartbeat without flapping.
pub const DEFAULT_HEARTBEAT_TIMEOUT_MS: u64 = 90_000;

/// 📅 DEFAULT TASK DEADLINE: applied by the Scheduler when a task carries
/// no `complete_by` (§4.F).
/// Why: 30 minutes is generous for the coding-agent workloads this hub
/// targets; a task that legitimately needs longer should set its own
/// deadline rather than rely on the fallback.
pub const DEFAULT_DEADLINE_MS: u64 = 30 * 60 * 1_000;

/// 📚 HISTORY CAP: per-task audit trail retention (§3.1, §4.E.6).
/// Why: 50 entries covers the full lifecycle of a retried task (submit,
/// several assign/fail cycles, dead-letter) without the record growing
/// unboundedly across an agent that keeps failing and retrying.
pub const DEFAULT_HISTORY_CAP: usize = 50;

/// 🔂 DEFAULT MAX RETRIES: retry ceiling for a task that doesn't specify
/// its own (§3.1).
/// Why: 3 retries tolerates transient agent/infra failures without letting
/// a systematically broken task loop through the fleet indefinitely before
/// landing in `DEAD_LETTER`.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

// 🛡️ ABUSE CONTROL

/// 🚫 VALIDATION FAILURE THRESHOLD: failures tolerated on one connection
/// within the abuse window before it is closed (§4.G.4).
/// Why: 10 absorbs a legitimate agent's buggy retry loop while still
/// cutting off a connection that's clearly sending malformed/malicious
/// frames on purpose.
pub const DEFAULT_VALIDATION_FAILURE_THRESHOLD: u32 = 10;

/// 🪟 ABUSE WINDOW: rolling window over which validation failures are
/// counted (§4.G.4).
/// Why: 60s is long enough to catch a sustained pattern, short enough that
/// an agent that fixes itself isn't punished for an old burst forever.
pub const ABUSE_WINDOW: Duration = Duration::from_secs(60);

/// 📈 ABUSE COOLDOWNS: escalating reconnect cooldowns per repeated offense
/// (§4.G.4).
/// Why: 30s/60s/300s escalation makes a one-off offender barely notice
/// while making a repeat offender's reconnect loop increasingly expensive.
/// Alternative: a flat cooldown (rejected: doesn't distinguish a fluke from
/// a misbehaving client that keeps tripping the same limit).
pub const ABUSE_COOLDOWNS_SECS: [u64; 3] = [30, 60, 300];

// 🌐 CONNECTION / TRANSPORT

/// 📬 CONNECTION OUTBOX CAPACITY: per-connection outbound frame queue bound
/// (§5 Backpressure).
/// Why: 256 frames absorbs a burst of progress/assign traffic without
/// buffering unboundedly against a slow or stalled agent; past this, the
/// connection is already too far behind for the backlog to be useful.
pub const CONNECTION_OUTBOX_CAPACITY: usize = 256;

/// 📮 EVENT BUS SUBSCRIBER CAPACITY: per-(topic, subscriber) mailbox bound
/// (§4.H).
/// Why: 1024 tolerates a subscriber falling behind during a burst of task
/// events without the bus itself ever blocking a publisher (§5).
pub const EVENT_BUS_SUBSCRIBER_CAPACITY: usize = 1024;

/// 🔌 CONNECTION READ TIMEOUT: idle cutoff before the hub treats a
/// WebSocket connection as dead and forces a reconnect (§5).
/// Why: 30s catches a connection whose TCP state lied about being alive
/// (a common failure mode behind NAT/load-balancer timeouts) well before
/// the heartbeat timeout would otherwise notice.
pub const CONNECTION_READ_TIMEOUT: Duration = Duration::from_secs(30);

// 🆔 IDENTIFIERS

/// 🔑 TASK ID HEX LENGTH: length, in hex characters, of the random suffix
/// of a task id (`task-<16 hex>`).
/// Why: 16 hex chars (64 bits of randomness) makes collision a non-issue
/// at any task volume this hub will ever see, while staying short enough
/// to read in logs.
pub const TASK_ID_HEX_LEN: usize = 16;

/// 🔐 AUTH TOKEN BYTES: length, in bytes, of a freshly issued agent auth
/// token before hex-encoding.
/// Why: 32 bytes (256 bits) is standard practice for a bearer token meant
/// to resist brute force for the life of the deployment.
pub const AUTH_TOKEN_BYTES: usize = 32;
