#![forbid(unsafe_code)]
//! Checkpoint manager.
//!
//! Maintains one *current* checkpoint that every in-flight operation
//! enters through a scoped guard. Triggering a flush atomically swaps
//! in a successor checkpoint, waits for the old one's entry count to
//! drain, fans `cp_flush` out to every registered consumer, and then,
//! on the dedicated blocking worker, persists the new durable frontier
//! in the `"CPSuperBlock"` meta-block before resolving the checkpoint's
//! shared completion.
//!
//! The current-CP pointer is an [`arc_swap::ArcSwap`]: readers load
//! with acquire semantics and writers publish with store-release. The
//! reader-side grace period is replaced by an enter/verify/back-out
//! loop — a reader that catches the pointer mid-switchover exits the
//! stale checkpoint through the normal barrier path and retries, so the
//! entry count still drains exactly once.

use arc_swap::ArcSwap;
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::sync::Weak;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use strata_error::Result;
use strata_meta::MetaService;
use strata_types::{put_le_u16, put_le_u32, put_le_u64, read_le_u16, read_le_u32, read_le_u64, CpId};
use tracing::{debug, error, info, warn};

pub const CP_SB_NAME: &str = "CPSuperBlock";
const CP_SB_MAGIC: u32 = u32::from_le_bytes(*b"SCPB");
const CP_SB_VERSION: u16 = 1;
const CP_SB_SIZE: usize = 14;

/// Hard ceiling: after this many watchdog intervals with no progress,
/// the process asserts.
const WATCHDOG_MAX_MULTIPLIER: u32 = 12;

// ---------------------------------------------------------------------------
// Shared completion
// ---------------------------------------------------------------------------

/// A one-shot shared completion carrying a `bool`, cloneable to any
/// number of waiters. The first `set` wins; waiters may be dropped
/// without side effects.
#[derive(Clone)]
pub struct CpAwait {
    inner: Arc<(Mutex<Option<bool>>, Condvar)>,
}

impl CpAwait {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new((Mutex::new(None), Condvar::new())),
        }
    }

    /// A completion that is already resolved.
    #[must_use]
    pub fn ready(value: bool) -> Self {
        Self {
            inner: Arc::new((Mutex::new(Some(value)), Condvar::new())),
        }
    }

    pub fn set(&self, value: bool) {
        let (slot, cv) = &*self.inner;
        let mut guard = slot.lock();
        if guard.is_none() {
            *guard = Some(value);
            cv.notify_all();
        }
    }

    /// Suspend until resolved.
    #[must_use]
    pub fn wait(&self) -> bool {
        let (slot, cv) = &*self.inner;
        let mut guard = slot.lock();
        while guard.is_none() {
            cv.wait(&mut guard);
        }
        guard.unwrap_or(false)
    }

    #[must_use]
    pub fn try_get(&self) -> Option<bool> {
        *self.inner.0.lock()
    }

    /// Whether two handles share the same underlying completion.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Default for CpAwait {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CpAwait {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("CpAwait").field(&self.try_get()).finish()
    }
}

// ---------------------------------------------------------------------------
// Checkpoint
// ---------------------------------------------------------------------------

/// Checkpoint lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CpStatus {
    IoReady = 0,
    Trigger = 1,
    FlushPrepare = 2,
    Flushing = 3,
    FlushDone = 4,
    Cleaning = 5,
    Done = 6,
}

impl CpStatus {
    fn from_wire(v: u8) -> Self {
        match v {
            0 => Self::IoReady,
            1 => Self::Trigger,
            2 => Self::FlushPrepare,
            3 => Self::Flushing,
            4 => Self::FlushDone,
            5 => Self::Cleaning,
            _ => Self::Done,
        }
    }
}

/// Registered consumer slots, fanned out to in a fixed order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum CpConsumerKind {
    LogStore = 0,
    BlockData = 1,
    Index = 2,
    Replication = 3,
}

pub const NUM_CP_CONSUMERS: usize = 4;

/// Opaque per-consumer state attached to a checkpoint at switchover.
pub type CpContext = Arc<dyn Any + Send + Sync>;

/// One checkpoint: a barrier epoch with an entry count and per-consumer
/// contexts.
pub struct Cp {
    id: CpId,
    status: AtomicU8,
    enter_count: AtomicU64,
    contexts: [Mutex<Option<CpContext>>; NUM_CP_CONSUMERS],
    completion: Mutex<CpAwait>,
    /// A forced trigger arrived while a flush was in progress; this CP
    /// flushes back-to-back as soon as the current flush completes.
    waiting_to_trigger: AtomicBool,
}

impl Cp {
    fn new(id: CpId) -> Self {
        Self {
            id,
            status: AtomicU8::new(CpStatus::IoReady as u8),
            enter_count: AtomicU64::new(0),
            contexts: std::array::from_fn(|_| Mutex::new(None)),
            completion: Mutex::new(CpAwait::new()),
            waiting_to_trigger: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn id(&self) -> CpId {
        self.id
    }

    #[must_use]
    pub fn status(&self) -> CpStatus {
        CpStatus::from_wire(self.status.load(Ordering::Acquire))
    }

    fn set_status(&self, status: CpStatus) {
        debug!(
            target: "strata::cp",
            cp_id = self.id.0,
            status = ?status,
            "cp_status_change"
        );
        self.status.store(status as u8, Ordering::Release);
    }

    fn transition(&self, from: CpStatus, to: CpStatus) -> bool {
        let ok = self
            .status
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if ok {
            debug!(
                target: "strata::cp",
                cp_id = self.id.0,
                from = ?from,
                to = ?to,
                "cp_status_change"
            );
        }
        ok
    }

    /// In-flight operations currently inside this checkpoint.
    #[must_use]
    pub fn entry_count(&self) -> u64 {
        self.enter_count.load(Ordering::Acquire)
    }

    /// Attach a consumer's opaque context for this checkpoint.
    pub fn set_context(&self, kind: CpConsumerKind, ctx: Option<CpContext>) {
        *self.contexts[kind as usize].lock() = ctx;
    }

    /// The consumer's context, if it attached one at switchover.
    #[must_use]
    pub fn context(&self, kind: CpConsumerKind) -> Option<CpContext> {
        self.contexts[kind as usize].lock().clone()
    }
}

impl std::fmt::Debug for Cp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cp")
            .field("id", &self.id.0)
            .field("status", &self.status())
            .field("enter_count", &self.entry_count())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Consumer callbacks
// ---------------------------------------------------------------------------

/// Contract every checkpoint consumer implements.
///
/// `cp_flush` must not report partial success: the engine treats any
/// flush failure as fatal, because local I/O loss is a process-level
/// failure.
pub trait CpCallbacks: Send + Sync {
    /// A new checkpoint is becoming current; return the consumer's
    /// context for it. `cur_cp` is `None` only for the very first
    /// checkpoint after boot.
    fn on_switchover_cp(&self, cur_cp: Option<&Cp>, new_cp: &Cp) -> Option<CpContext>;

    /// Flush everything the given checkpoint references; resolve the
    /// returned completion with `true` when durable.
    fn cp_flush(&self, cp: &Arc<Cp>) -> CpAwait;

    /// Release resources tied to the flushed checkpoint.
    fn cp_cleanup(&self, cp: &Cp);

    /// Progress of the current flush in percent (100 when idle).
    fn cp_progress_percent(&self) -> u32;

    /// Asked once by the watchdog when this consumer's flush stalls.
    fn repair_slow_cp(&self) {}
}

// ---------------------------------------------------------------------------
// Guard
// ---------------------------------------------------------------------------

/// Scoped reference to the current checkpoint.
///
/// Acquire increments the checkpoint's entry count; drop decrements it
/// and, when the last reference leaves a checkpoint in `FlushPrepare`,
/// starts the flush. Cloning a guard reuses the same checkpoint, which
/// is how nested sections share the outer checkpoint without re-reading
/// the current pointer.
pub struct CpGuard {
    cp: Arc<Cp>,
    mgr: Arc<CpManager>,
}

impl CpGuard {
    #[must_use]
    pub fn cp(&self) -> &Arc<Cp> {
        &self.cp
    }

    #[must_use]
    pub fn id(&self) -> CpId {
        self.cp.id
    }

    #[must_use]
    pub fn context(&self, kind: CpConsumerKind) -> Option<CpContext> {
        self.cp.context(kind)
    }
}

impl Clone for CpGuard {
    fn clone(&self) -> Self {
        self.cp.enter_count.fetch_add(1, Ordering::AcqRel);
        Self {
            cp: Arc::clone(&self.cp),
            mgr: Arc::clone(&self.mgr),
        }
    }
}

impl std::ops::Deref for CpGuard {
    type Target = Cp;

    fn deref(&self) -> &Cp {
        &self.cp
    }
}

impl Drop for CpGuard {
    fn drop(&mut self) {
        self.mgr.cp_io_exit(&self.cp);
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

struct CpSuperBlock {
    last_flushed_cp: u64,
}

impl CpSuperBlock {
    fn serialize(&self) -> Vec<u8> {
        let mut buf = vec![0_u8; CP_SB_SIZE];
        put_le_u32(&mut buf, 0, CP_SB_MAGIC);
        put_le_u16(&mut buf, 4, CP_SB_VERSION);
        put_le_u64(&mut buf, 6, self.last_flushed_cp);
        buf
    }

    fn deserialize(blob: &[u8]) -> Option<Self> {
        let magic = read_le_u32(blob, 0).ok()?;
        let version = read_le_u16(blob, 4).ok()?;
        if magic != CP_SB_MAGIC || version != CP_SB_VERSION {
            return None;
        }
        Some(Self {
            last_flushed_cp: read_le_u64(blob, 6).ok()?,
        })
    }
}

type BlockingJob = Box<dyn FnOnce() + Send>;

/// Checkpoint manager configuration.
#[derive(Debug, Clone)]
pub struct CpConfig {
    /// Period between automatic checkpoint triggers.
    pub cp_timer: Duration,
    /// Watchdog sample period.
    pub watchdog_timer: Duration,
}

pub struct CpManager {
    meta: Arc<MetaService>,
    config: CpConfig,
    consumers: Mutex<[Option<Arc<dyn CpCallbacks>>; NUM_CP_CONSUMERS]>,
    cur_cp: ArcSwap<Cp>,
    in_flush: AtomicBool,
    /// Serializes trigger bookkeeping (promise swap, switchover fanout).
    trigger_mtx: Mutex<()>,
    sb: Mutex<CpSuperBlock>,
    replayed_last_flushed: AtomicU64,
    shutdown_initiated: AtomicBool,
    stop: Arc<AtomicBool>,
    blocking_tx: Mutex<Option<mpsc::Sender<BlockingJob>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    watchdog: Mutex<WatchdogState>,
}

struct WatchdogState {
    cp: Option<Arc<Cp>>,
    progress_pct: u32,
    last_change: Instant,
}

impl CpManager {
    /// Build the manager and register the `"CPSuperBlock"` meta handler.
    /// Must run before the meta service replays.
    pub fn new(meta: Arc<MetaService>, config: CpConfig) -> Arc<Self> {
        let mgr = Arc::new(Self {
            meta,
            config,
            consumers: Mutex::new(std::array::from_fn(|_| None)),
            cur_cp: ArcSwap::from_pointee(Cp::new(CpId(0))),
            in_flush: AtomicBool::new(false),
            trigger_mtx: Mutex::new(()),
            sb: Mutex::new(CpSuperBlock { last_flushed_cp: 0 }),
            replayed_last_flushed: AtomicU64::new(0),
            shutdown_initiated: AtomicBool::new(false),
            stop: Arc::new(AtomicBool::new(false)),
            blocking_tx: Mutex::new(None),
            threads: Mutex::new(Vec::new()),
            watchdog: Mutex::new(WatchdogState {
                cp: None,
                progress_pct: 0,
                last_change: Instant::now(),
            }),
        });

        let replay_mgr = Arc::downgrade(&mgr);
        mgr.meta.register_handler(
            CP_SB_NAME,
            Box::new(move |blob| {
                let Some(mgr) = replay_mgr.upgrade() else {
                    return;
                };
                match CpSuperBlock::deserialize(blob) {
                    Some(sb) => {
                        info!(
                            target: "strata::cp",
                            last_flushed_cp = sb.last_flushed_cp,
                            "cp_super_block_replayed"
                        );
                        mgr.replayed_last_flushed
                            .store(sb.last_flushed_cp, Ordering::Release);
                    }
                    None => {
                        error!(target: "strata::cp", "cp_super_block_corrupt");
                        panic!("invalid checkpoint meta-block: magic or version mismatch");
                    }
                }
            }),
        );
        mgr
    }

    /// Create the first checkpoint and start the trigger timer, the
    /// watchdog, and the blocking persist worker.
    pub fn start(self: &Arc<Self>, first_time_boot: bool) -> Result<()> {
        let last_flushed = if first_time_boot {
            let sb = self.sb.lock();
            self.meta.write_meta_blk(CP_SB_NAME, sb.serialize())?;
            0
        } else {
            self.replayed_last_flushed.load(Ordering::Acquire)
        };
        self.sb.lock().last_flushed_cp = last_flushed;

        let first = Arc::new(Cp::new(CpId(last_flushed + 1)));
        first.set_status(CpStatus::IoReady);
        self.cur_cp.store(first);
        info!(
            target: "strata::cp",
            first_cp = last_flushed + 1,
            cp_timer_ms = self.config.cp_timer.as_millis() as u64,
            watchdog_timer_ms = self.config.watchdog_timer.as_millis() as u64,
            "cp_manager_started"
        );

        // Blocking persist worker: the only thread that writes the CP
        // super-block and runs consumer cleanup.
        let (tx, rx) = mpsc::channel::<BlockingJob>();
        *self.blocking_tx.lock() = Some(tx);
        let persist_handle = std::thread::Builder::new()
            .name("strata-cp-persist".to_owned())
            .spawn(move || {
                while let Ok(job) = rx.recv() {
                    job();
                }
            })
            .unwrap_or_else(|e| panic!("failed to spawn cp persist thread: {e}"));

        // Periodic trigger timer. Sleeps in short slices so shutdown
        // never waits out a whole period.
        let timer_handle = Self::spawn_periodic(
            "strata-cp-timer",
            Arc::downgrade(self),
            Arc::clone(&self.stop),
            self.config.cp_timer,
            |mgr| {
                let _ = mgr.trigger_cp_flush(false);
            },
        );

        // Watchdog.
        let wd_handle = Self::spawn_periodic(
            "strata-cp-watchdog",
            Arc::downgrade(self),
            Arc::clone(&self.stop),
            self.config.watchdog_timer,
            |mgr| mgr.watchdog_tick(),
        );

        self.threads
            .lock()
            .extend([persist_handle, timer_handle, wd_handle]);
        Ok(())
    }

    fn spawn_periodic(
        name: &str,
        mgr: Weak<Self>,
        stop: Arc<AtomicBool>,
        period: Duration,
        tick: impl Fn(&Arc<Self>) + Send + 'static,
    ) -> JoinHandle<()> {
        std::thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || {
                let slice = period.min(Duration::from_millis(50));
                let mut elapsed = Duration::ZERO;
                loop {
                    std::thread::sleep(slice);
                    if stop.load(Ordering::Acquire) {
                        return;
                    }
                    elapsed += slice;
                    if elapsed < period {
                        continue;
                    }
                    elapsed = Duration::ZERO;
                    match mgr.upgrade() {
                        Some(mgr) => tick(&mgr),
                        None => return,
                    }
                }
            })
            .unwrap_or_else(|e| panic!("failed to spawn {name} thread: {e}"))
    }

    /// Register a consumer and attach its context to the current
    /// checkpoint. Runs after `start`, before the first trigger.
    pub fn register_consumer(&self, kind: CpConsumerKind, callbacks: Arc<dyn CpCallbacks>) {
        let cur = self.cur_cp.load_full();
        let ctx = callbacks.on_switchover_cp(None, &cur);
        cur.set_context(kind, ctx);
        self.consumers.lock()[kind as usize] = Some(callbacks);
        debug!(target: "strata::cp", kind = ?kind, "cp_consumer_registered");
    }

    #[must_use]
    pub fn last_flushed_cp(&self) -> CpId {
        CpId(self.sb.lock().last_flushed_cp)
    }

    #[must_use]
    pub fn cur_cp_id(&self) -> CpId {
        self.cur_cp.load().id
    }

    /// Enter the current checkpoint.
    pub fn cp_guard(self: &Arc<Self>) -> CpGuard {
        let cp = self.cp_io_enter();
        CpGuard {
            cp,
            mgr: Arc::clone(self),
        }
    }

    fn cp_io_enter(self: &Arc<Self>) -> Arc<Cp> {
        loop {
            let cp = self.cur_cp.load_full();
            cp.enter_count.fetch_add(1, Ordering::AcqRel);
            // The pointer may have been swapped between the load and
            // the increment. Entering a checkpoint that is already past
            // Trigger would miss the barrier, so back out through the
            // normal exit path (which keeps the drain accounting exact)
            // and retry on the new current.
            if self.cur_cp.load().id == cp.id {
                return cp;
            }
            self.cp_io_exit(&cp);
        }
    }

    fn cp_io_exit(self: &Arc<Self>, cp: &Arc<Cp>) {
        let prev = cp.enter_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "cp entry count underflow");
        if prev == 1 && cp.status() == CpStatus::FlushPrepare {
            self.cp_start_flush(Arc::clone(cp));
        }
    }

    /// Trigger a checkpoint flush.
    ///
    /// Returns a completion resolved when the checkpoint is durable.
    /// When a flush is already in progress: `force == false` resolves
    /// immediately with `false`; `force == true` returns the single
    /// shared completion of the back-to-back checkpoint that will run
    /// next — every concurrent forcer gets the same one.
    pub fn trigger_cp_flush(self: &Arc<Self>, force: bool) -> CpAwait {
        if self
            .in_flush
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            if !force {
                return CpAwait::ready(false);
            }
            let _lk = self.trigger_mtx.lock();
            let cur = self.cp_guard();
            debug_assert_ne!(cur.status(), CpStatus::FlushPrepare);
            if !cur.cp.waiting_to_trigger.swap(true, Ordering::AcqRel) {
                // First forcer of the back-to-back CP installs a fresh
                // shared completion; later forcers reuse it.
                *cur.cp.completion.lock() = CpAwait::new();
            }
            let shared = cur.cp.completion.lock().clone();
            debug!(
                target: "strata::cp",
                cp_id = cur.id().0,
                "back_to_back_cp_requested"
            );
            return shared;
        }

        let ret;
        {
            let cur = self.cp_guard();
            cur.cp.set_status(CpStatus::Trigger);
            info!(
                target: "strata::cp",
                cp_id = cur.id().0,
                entry_count = cur.entry_count(),
                "cp_flush_triggered"
            );

            let new_cp = Arc::new(Cp::new(CpId(cur.id().0 + 1)));
            {
                let _lk = self.trigger_mtx.lock();
                let consumers = self.consumers.lock();
                for (idx, consumer) in consumers.iter().enumerate() {
                    if let Some(consumer) = consumer {
                        let ctx = consumer.on_switchover_cp(Some(&cur.cp), &new_cp);
                        new_cp.contexts[idx].lock().clone_from(&ctx);
                    }
                }
                drop(consumers);

                if cur.cp.waiting_to_trigger.load(Ordering::Acquire) {
                    // This trigger runs a back-to-back CP: the waiting
                    // forcers keep the completion already installed on
                    // this checkpoint; hand the caller a resolved one.
                    ret = CpAwait::ready(true);
                } else {
                    let fresh = CpAwait::new();
                    *cur.cp.completion.lock() = fresh.clone();
                    ret = fresh;
                }

                cur.cp.set_status(CpStatus::FlushPrepare);
                new_cp.set_status(CpStatus::IoReady);
                self.watchdog_set(Arc::clone(&cur.cp));
                self.cur_cp.store(new_cp);
            }
            // Dropping `cur` releases this trigger's entry; in-flight
            // operations that entered earlier keep the flush parked
            // until the last of them exits.
        }
        ret
    }

    fn cp_start_flush(self: &Arc<Self>, cp: Arc<Cp>) {
        // Only the true last exiter flushes; a loser of this exchange
        // raced a backed-out reader.
        if !cp.transition(CpStatus::FlushPrepare, CpStatus::Flushing) {
            return;
        }
        info!(target: "strata::cp", cp_id = cp.id().0, "cp_flush_start");

        let mgr = Arc::clone(self);
        self.submit_blocking(Box::new(move || {
            let consumers: Vec<Arc<dyn CpCallbacks>> =
                mgr.consumers.lock().iter().flatten().cloned().collect();
            let completions: Vec<CpAwait> =
                consumers.iter().map(|c| c.cp_flush(&cp)).collect();
            for completion in completions {
                let ok = completion.wait();
                assert!(ok, "checkpoint consumer reported flush failure; local I/O loss is unrecoverable");
            }
            mgr.on_cp_flush_done(&cp, &consumers);
        }));
    }

    fn on_cp_flush_done(self: &Arc<Self>, cp: &Arc<Cp>, consumers: &[Arc<dyn CpCallbacks>]) {
        debug_assert_eq!(cp.status(), CpStatus::Flushing);
        cp.set_status(CpStatus::FlushDone);
        cp.set_status(CpStatus::Cleaning);

        // Persist the frontier before anyone observes the CP complete.
        let blob = {
            let mut sb = self.sb.lock();
            sb.last_flushed_cp = cp.id().0;
            sb.serialize()
        };
        if let Err(e) = self.meta.write_meta_blk(CP_SB_NAME, blob) {
            error!(
                target: "strata::cp",
                cp_id = cp.id().0,
                error = %e,
                "cp_super_block_persist_failed"
            );
            panic!("checkpoint super-block persist failed: {e}");
        }

        for consumer in consumers {
            consumer.cp_cleanup(cp);
        }

        self.watchdog_reset();
        cp.set_status(CpStatus::Done);
        info!(
            target: "strata::cp",
            cp_id = cp.id().0,
            "cp_flush_done"
        );

        let completion = cp.completion.lock().clone();
        let shutdown = self.shutdown_initiated.load(Ordering::Acquire);
        self.in_flush.store(false, Ordering::Release);
        completion.set(true);

        if shutdown {
            return;
        }
        // Re-arm for a back-to-back CP requested while we flushed.
        let cur = self.cp_guard();
        if cur.cp.waiting_to_trigger.load(Ordering::Acquire) {
            info!(target: "strata::cp", cp_id = cur.id().0, "back_to_back_cp_firing");
            drop(cur);
            let _ = self.trigger_cp_flush(false);
        }
    }

    fn submit_blocking(&self, job: BlockingJob) {
        let send_failed = {
            let tx = self.blocking_tx.lock();
            match tx.as_ref() {
                Some(tx) => tx.send(job).err().map(|e| e.0),
                None => Some(job),
            }
        };
        if let Some(job) = send_failed {
            // Worker gone (shutdown tail); run inline.
            warn!(target: "strata::cp", "blocking_worker_unavailable_running_inline");
            job();
        }
    }

    /// Final forced checkpoint, then stop every background thread.
    pub fn shutdown(self: &Arc<Self>) {
        info!(target: "strata::cp", "cp_manager_shutdown");
        self.shutdown_initiated.store(true, Ordering::Release);
        let ok = self.trigger_cp_flush(true).wait();
        assert!(ok, "final checkpoint flush failed during shutdown");

        self.stop.store(true, Ordering::Release);
        self.blocking_tx.lock().take();
        for handle in self.threads.lock().drain(..) {
            let _ = handle.join();
        }
    }

    // -- watchdog -----------------------------------------------------------

    fn watchdog_set(&self, cp: Arc<Cp>) {
        let mut wd = self.watchdog.lock();
        wd.cp = Some(cp);
        wd.progress_pct = 0;
        wd.last_change = Instant::now();
    }

    fn watchdog_reset(&self) {
        let mut wd = self.watchdog.lock();
        wd.cp = None;
        wd.progress_pct = 0;
    }

    fn watchdog_tick(&self) {
        let mut wd = self.watchdog.lock();
        let Some(cp) = wd.cp.clone() else {
            return;
        };
        let status = cp.status();
        if status != CpStatus::FlushPrepare && status != CpStatus::Flushing {
            return;
        }

        let consumers: Vec<Arc<dyn CpCallbacks>> =
            self.consumers.lock().iter().flatten().cloned().collect();
        if consumers.is_empty() {
            return;
        }
        let cum: u32 = consumers.iter().map(|c| c.cp_progress_percent()).sum();
        let avg = cum / consumers.len() as u32;
        if avg > wd.progress_pct {
            wd.progress_pct = avg;
            wd.last_change = Instant::now();
            return;
        }

        let elapsed = wd.last_change.elapsed();
        if elapsed >= self.config.watchdog_timer {
            warn!(
                target: "strata::cp",
                cp_id = cp.id().0,
                progress_pct = wd.progress_pct,
                elapsed_ms = elapsed.as_millis() as u64,
                status = ?status,
                "cp_progress_stalled"
            );
        }

        if elapsed < self.config.watchdog_timer * WATCHDOG_MAX_MULTIPLIER {
            let mut repair_attempted = 0_u32;
            for consumer in &consumers {
                if consumer.cp_progress_percent() < 100 {
                    consumer.repair_slow_cp();
                    repair_attempted += 1;
                }
            }
            if repair_attempted > 0 {
                debug!(
                    target: "strata::cp",
                    cp_id = cp.id().0,
                    repair_attempted,
                    "cp_repair_requested"
                );
            }
        } else {
            error!(
                target: "strata::cp",
                cp_id = cp.id().0,
                elapsed_ms = elapsed.as_millis() as u64,
                "cp_stuck"
            );
            panic!(
                "checkpoint stuck: cp_id={} made no progress for {}ms",
                cp.id().0,
                elapsed.as_millis()
            );
        }
    }
}

impl std::fmt::Debug for CpManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpManager")
            .field("cur_cp", &self.cur_cp.load())
            .field("in_flush", &self.in_flush.load(Ordering::Relaxed))
            .field("last_flushed_cp", &self.sb.lock().last_flushed_cp)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use strata_device::superblock::{FirstBlock, SuperBlkLayout, CURRENT_VERSION, PRODUCT_NAME};
    use strata_device::PhysicalDev;
    use strata_types::{EngineConfig, IoFlag, PdevId};
    use tempfile::TempDir;

    fn make_pdev(dir: &TempDir) -> Arc<PhysicalDev> {
        let config = EngineConfig::default();
        let layout = SuperBlkLayout::new(
            config.max_vdevs,
            config.max_chunks,
            config.atomic_phys_page_size,
        );
        let fb = FirstBlock {
            version: CURRENT_VERSION,
            gen_number: 1,
            product_name: PRODUCT_NAME.to_owned(),
            system_uuid: [3; 16],
            num_pdevs: 1,
            max_vdevs: config.max_vdevs,
            max_chunks: config.max_chunks,
            pdev_id: PdevId(0),
            data_offset: layout.total_size,
            data_size: 4 << 20,
            align_size: 512,
            atomic_page_size: config.atomic_phys_page_size,
            mirror_super_block: false,
        };
        Arc::new(
            PhysicalDev::open(&dir.path().join("cp.dat"), IoFlag::Buffered, fb, &config, 1)
                .unwrap(),
        )
    }

    fn quiet_config() -> CpConfig {
        CpConfig {
            cp_timer: Duration::from_secs(600),
            watchdog_timer: Duration::from_secs(600),
        }
    }

    #[derive(Default)]
    struct MockConsumer {
        switchovers: AtomicU64,
        flushes: AtomicU64,
        cleanups: AtomicU64,
        repairs: AtomicU64,
        progress: AtomicU32,
        flush_delay: Option<Duration>,
        /// When set, flushes stay pending until `repair_slow_cp` fires.
        stall_until_repair: bool,
        pending: Mutex<Option<CpAwait>>,
    }

    impl MockConsumer {
        fn slow(delay: Duration) -> Self {
            Self {
                flush_delay: Some(delay),
                progress: AtomicU32::new(100),
                ..Self::default()
            }
        }

        fn healthy() -> Self {
            Self {
                progress: AtomicU32::new(100),
                ..Self::default()
            }
        }

        fn stalled() -> Self {
            Self {
                stall_until_repair: true,
                progress: AtomicU32::new(50),
                ..Self::default()
            }
        }
    }

    impl CpCallbacks for MockConsumer {
        fn on_switchover_cp(&self, _cur_cp: Option<&Cp>, new_cp: &Cp) -> Option<CpContext> {
            self.switchovers.fetch_add(1, Ordering::SeqCst);
            Some(Arc::new(new_cp.id()))
        }

        fn cp_flush(&self, _cp: &Arc<Cp>) -> CpAwait {
            self.flushes.fetch_add(1, Ordering::SeqCst);
            if self.stall_until_repair {
                let pending = CpAwait::new();
                *self.pending.lock() = Some(pending.clone());
                return pending;
            }
            if let Some(delay) = self.flush_delay {
                let done = CpAwait::new();
                let resolver = done.clone();
                std::thread::spawn(move || {
                    std::thread::sleep(delay);
                    resolver.set(true);
                });
                return done;
            }
            CpAwait::ready(true)
        }

        fn cp_cleanup(&self, _cp: &Cp) {
            self.cleanups.fetch_add(1, Ordering::SeqCst);
        }

        fn cp_progress_percent(&self) -> u32 {
            self.progress.load(Ordering::SeqCst)
        }

        fn repair_slow_cp(&self) {
            self.repairs.fetch_add(1, Ordering::SeqCst);
            if let Some(pending) = self.pending.lock().take() {
                pending.set(true);
            }
        }
    }

    #[test]
    fn cp_await_shared_resolution() {
        let p = CpAwait::new();
        let q = p.clone();
        assert!(p.ptr_eq(&q));
        assert_eq!(p.try_get(), None);
        p.set(true);
        p.set(false); // first set wins
        assert!(q.wait());
        assert!(CpAwait::ready(false).ptr_eq(&CpAwait::ready(false)) == false);
    }

    #[test]
    fn first_boot_flush_persists_frontier_across_restart() {
        let dir = TempDir::new().unwrap();
        let pdev = make_pdev(&dir);

        let meta = Arc::new(strata_meta::MetaService::new(Arc::clone(&pdev)));
        let mgr = CpManager::new(Arc::clone(&meta), quiet_config());
        meta.format().unwrap();
        mgr.start(true).unwrap();
        assert_eq!(mgr.cur_cp_id(), CpId(1));

        let consumer = Arc::new(MockConsumer::healthy());
        mgr.register_consumer(CpConsumerKind::LogStore, Arc::clone(&consumer) as _);

        assert!(mgr.trigger_cp_flush(false).wait());
        assert_eq!(mgr.last_flushed_cp(), CpId(1));
        assert_eq!(mgr.cur_cp_id(), CpId(2));
        assert_eq!(consumer.flushes.load(Ordering::SeqCst), 1);
        assert_eq!(consumer.cleanups.load(Ordering::SeqCst), 1);
        // Registration + one switchover.
        assert_eq!(consumer.switchovers.load(Ordering::SeqCst), 2);

        // Shutdown runs one more forced checkpoint.
        mgr.shutdown();
        assert_eq!(mgr.last_flushed_cp(), CpId(2));
        drop(mgr);

        let meta = Arc::new(strata_meta::MetaService::new(pdev));
        let mgr = CpManager::new(Arc::clone(&meta), quiet_config());
        meta.replay().unwrap();
        mgr.start(false).unwrap();
        assert_eq!(mgr.last_flushed_cp(), CpId(2));
        assert_eq!(mgr.cur_cp_id(), CpId(3));
        mgr.shutdown();
    }

    #[test]
    fn unforced_trigger_during_flush_resolves_false() {
        let dir = TempDir::new().unwrap();
        let meta = Arc::new(strata_meta::MetaService::new(make_pdev(&dir)));
        let mgr = CpManager::new(Arc::clone(&meta), quiet_config());
        meta.format().unwrap();
        mgr.start(true).unwrap();
        let consumer = Arc::new(MockConsumer::slow(Duration::from_millis(100)));
        mgr.register_consumer(CpConsumerKind::LogStore, Arc::clone(&consumer) as _);

        let first = mgr.trigger_cp_flush(false);
        let second = mgr.trigger_cp_flush(false);
        assert_eq!(second.wait(), false, "unforced trigger during a flush declines");
        assert!(first.wait());
        mgr.shutdown();
    }

    #[test]
    fn forced_triggers_share_one_back_to_back_completion() {
        let dir = TempDir::new().unwrap();
        let meta = Arc::new(strata_meta::MetaService::new(make_pdev(&dir)));
        let mgr = CpManager::new(Arc::clone(&meta), quiet_config());
        meta.format().unwrap();
        mgr.start(true).unwrap();
        let consumer = Arc::new(MockConsumer::slow(Duration::from_millis(80)));
        mgr.register_consumer(CpConsumerKind::LogStore, Arc::clone(&consumer) as _);

        let first = mgr.trigger_cp_flush(true);
        let second = mgr.trigger_cp_flush(true);
        let third = mgr.trigger_cp_flush(true);
        assert!(
            second.ptr_eq(&third),
            "all forcers share the back-to-back CP's completion"
        );
        assert!(!first.ptr_eq(&second));

        assert!(first.wait(), "the pre-existing CP resolves its own completion");
        assert!(second.wait(), "the shared completion resolves when the b2b CP lands");
        // CP 1 and the back-to-back CP 2 both flushed.
        assert_eq!(mgr.last_flushed_cp(), CpId(2));
        assert_eq!(consumer.flushes.load(Ordering::SeqCst), 2);
        mgr.shutdown();
    }

    #[test]
    fn guard_holds_flush_until_last_exit() {
        let dir = TempDir::new().unwrap();
        let meta = Arc::new(strata_meta::MetaService::new(make_pdev(&dir)));
        let mgr = CpManager::new(Arc::clone(&meta), quiet_config());
        meta.format().unwrap();
        mgr.start(true).unwrap();
        let consumer = Arc::new(MockConsumer::healthy());
        mgr.register_consumer(CpConsumerKind::LogStore, Arc::clone(&consumer) as _);

        let op_guard = mgr.cp_guard();
        let old_cp = Arc::clone(op_guard.cp());
        let completion = mgr.trigger_cp_flush(false);

        // The in-flight operation parks the flush in FlushPrepare.
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(old_cp.status(), CpStatus::FlushPrepare);
        assert_eq!(consumer.flushes.load(Ordering::SeqCst), 0);
        assert_eq!(completion.try_get(), None);

        // New work enters the successor checkpoint.
        let new_guard = mgr.cp_guard();
        assert_eq!(new_guard.id(), CpId(old_cp.id().0 + 1));
        drop(new_guard);

        drop(op_guard);
        assert!(completion.wait());
        assert_eq!(consumer.flushes.load(Ordering::SeqCst), 1);
        mgr.shutdown();
    }

    #[test]
    fn cloned_guard_reuses_the_same_checkpoint() {
        let dir = TempDir::new().unwrap();
        let meta = Arc::new(strata_meta::MetaService::new(make_pdev(&dir)));
        let mgr = CpManager::new(Arc::clone(&meta), quiet_config());
        meta.format().unwrap();
        mgr.start(true).unwrap();

        let outer = mgr.cp_guard();
        let inner = outer.clone();
        assert_eq!(outer.id(), inner.id());
        assert_eq!(outer.cp().entry_count(), 2);
        drop(inner);
        assert_eq!(outer.cp().entry_count(), 1);
        drop(outer);
        mgr.shutdown();
    }

    #[test]
    fn consumer_context_attached_on_switchover() {
        let dir = TempDir::new().unwrap();
        let meta = Arc::new(strata_meta::MetaService::new(make_pdev(&dir)));
        let mgr = CpManager::new(Arc::clone(&meta), quiet_config());
        meta.format().unwrap();
        mgr.start(true).unwrap();
        let consumer = Arc::new(MockConsumer::healthy());
        mgr.register_consumer(CpConsumerKind::BlockData, Arc::clone(&consumer) as _);

        let guard = mgr.cp_guard();
        let ctx = guard
            .context(CpConsumerKind::BlockData)
            .expect("context attached at registration");
        let cp_id = ctx.downcast_ref::<CpId>().copied().unwrap();
        assert_eq!(cp_id, guard.id());
        assert!(guard.context(CpConsumerKind::Index).is_none());
        drop(guard);
        mgr.shutdown();
    }

    #[test]
    fn watchdog_repairs_stalled_consumer() {
        let dir = TempDir::new().unwrap();
        let meta = Arc::new(strata_meta::MetaService::new(make_pdev(&dir)));
        let mgr = CpManager::new(
            Arc::clone(&meta),
            CpConfig {
                cp_timer: Duration::from_secs(600),
                watchdog_timer: Duration::from_millis(30),
            },
        );
        meta.format().unwrap();
        mgr.start(true).unwrap();
        let consumer = Arc::new(MockConsumer::stalled());
        mgr.register_consumer(CpConsumerKind::Replication, Arc::clone(&consumer) as _);

        // The flush parks until the watchdog notices the stall and asks
        // the consumer to repair, which resolves the pending completion.
        assert!(mgr.trigger_cp_flush(false).wait());
        assert!(consumer.repairs.load(Ordering::SeqCst) >= 1);
        mgr.shutdown();
    }
}
