//! Crash recovery: find the checkpoint, scan the redo log from it, replay
//! page records through the buffer pool and decide whether the database is
//! consistent.
//!
//! [`recover`] is the entry point. It drives a [`RecoverySystem`], which
//! owns the per-run state (the page redo store, scan evidence, statistics
//! and accumulated page failures) so several recoveries can run in one
//! process.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

/// Parallel replay of stored records.
pub mod apply;
/// Pending records grouped by page.
pub mod store;

pub use apply::{ApplyStats, BatchReport, PageFailure, PageFailureKind, RecoveryApplier};
pub use store::{AddResult, PageRedoStore, RecoveryState};

use crate::buffer::BufferPool;
use crate::checkpoint::{find_checkpoint, validate_checkpoint, Checkpoint, ScanEvidence};
use crate::log::{FileOp, LogFile, LogOptions, LogRecord, LogScanner, ParsedMtr, RedoLog, ScanStep};
use crate::storage::TablespaceDirectory;
use crate::types::{Lsn, PageId, RedoError, Result};

/// Recovery tuning.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryOptions {
    /// Worker threads replaying pages.
    pub threads: usize,
    /// Bytes of parsed records held before a partial apply is forced.
    pub log_buffer_budget: usize,
    /// How many times the scan may rewind to the same mini-transaction
    /// after running out of record memory.
    pub oom_retry_limit: u32,
    /// Log bytes read per I/O during the scan.
    pub read_chunk: usize,
    /// Replay into the pool only; never write pages, log or checkpoints.
    pub read_only: bool,
}

impl Default for RecoveryOptions {
    fn default() -> Self {
        Self {
            threads: 4,
            log_buffer_budget: 64 << 20,
            oom_retry_limit: 8,
            read_chunk: 64 << 10,
            read_only: false,
        }
    }
}

/// Collaborators a recovery run works against.
#[derive(Clone)]
pub struct RecoveryEnv {
    /// The redo log file.
    pub log: Arc<LogFile>,
    /// Pool pages are replayed into; its storage holds the tablespaces.
    pub pool: Arc<BufferPool>,
    /// Tablespace directory the log's file operations are executed on.
    pub dir: Arc<dyn TablespaceDirectory>,
}

/// What the scan does with the records it parses.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ScanMode {
    /// Execute file operations and keep page records for replay.
    Apply,
    /// Collect page records only; tablespaces are left alone.
    Dump,
}

/// Why the scan stopped.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub enum ScanEnd {
    /// No further valid mini-transaction.
    EndOfLog {
        /// What the scanner found instead.
        reason: &'static str,
    },
    /// A mini-transaction with a valid checksum failed to parse.
    Corrupt {
        /// Position of the bad record.
        lsn: Lsn,
        /// What was wrong.
        reason: &'static str,
    },
}

/// Everything a recovery run learned, for logging and the CLI.
#[derive(Clone, Debug, Serialize)]
pub struct RecoveryReport {
    /// Checkpoint the scan started from.
    pub checkpoint: Checkpoint,
    /// End of the last complete mini-transaction.
    pub scanned_lsn: Lsn,
    /// End of the log file when the scan started.
    pub log_end_lsn: Lsn,
    /// The file held bytes past `scanned_lsn` (a torn tail or stale log).
    pub log_truncated: bool,
    /// Why the scan stopped.
    pub scan_end: Option<ScanEnd>,
    /// Mini-transactions parsed.
    pub mtrs_scanned: u64,
    /// File operations executed.
    pub file_ops: u64,
    /// Times the scan rewound after running out of record memory.
    pub oom_rewinds: u32,
    /// Replay totals.
    pub apply: ApplyStats,
    /// Pages that were skipped.
    pub failures: Vec<PageFailure>,
    /// Why the database is not consistent, if it is not.
    pub inconsistency: Option<String>,
    /// Checkpoint written after a successful replay.
    pub new_checkpoint: Option<Checkpoint>,
}

/// Terminal result of [`recover`].
#[derive(Clone, Debug, Serialize)]
pub enum RecoveryOutcome {
    /// The log was replayed up to a validated point.
    Consistent(RecoveryReport),
    /// The database cannot be called consistent; see
    /// [`RecoveryReport::inconsistency`].
    Inconsistent(RecoveryReport),
    /// Recovery could not proceed.
    Fatal {
        /// The error that stopped it.
        error: String,
        /// Progress up to the failure, when a checkpoint was found.
        report: Option<Box<RecoveryReport>>,
    },
}

impl RecoveryOutcome {
    /// Process exit status: 0 consistent, 2 inconsistent, 1 fatal.
    pub fn exit_code(&self) -> i32 {
        match self {
            RecoveryOutcome::Consistent(_) => 0,
            RecoveryOutcome::Inconsistent(_) => 2,
            RecoveryOutcome::Fatal { .. } => 1,
        }
    }

    /// Report of the run, absent when it failed before finding a
    /// checkpoint.
    pub fn report(&self) -> Option<&RecoveryReport> {
        match self {
            RecoveryOutcome::Consistent(r) | RecoveryOutcome::Inconsistent(r) => Some(r),
            RecoveryOutcome::Fatal { report, .. } => report.as_deref(),
        }
    }

    /// One-line description for operators.
    pub fn summary(&self) -> String {
        match self {
            RecoveryOutcome::Consistent(r) if r.failures.is_empty() => format!(
                "consistent: replayed {} records on {} pages up to LSN {}",
                r.apply.records_applied, r.apply.pages_recovered, r.scanned_lsn
            ),
            RecoveryOutcome::Consistent(r) => format!(
                "consistent up to LSN {}, but {} pages could not be recovered",
                r.scanned_lsn,
                r.failures.len()
            ),
            RecoveryOutcome::Inconsistent(r) => format!(
                "inconsistent: {} (log scanned to LSN {})",
                r.inconsistency.as_deref().unwrap_or("unknown reason"),
                r.scanned_lsn
            ),
            RecoveryOutcome::Fatal { error, .. } => format!("fatal: {error}"),
        }
    }
}

/// Pending record count of one page.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct PendingPage {
    /// The page.
    pub page: PageId,
    /// Records waiting for it.
    pub records: usize,
}

/// Result of [`scan_pending`].
#[derive(Clone, Debug, Serialize)]
pub struct PendingReport {
    /// Checkpoint the scan started from.
    pub checkpoint: Checkpoint,
    /// End of the last complete mini-transaction.
    pub scanned_lsn: Lsn,
    /// Why the scan stopped.
    pub scan_end: Option<ScanEnd>,
    /// Pages with pending records, in page order.
    pub pages: Vec<PendingPage>,
    /// Sum of all pending records.
    pub total_records: usize,
}

/// State of one recovery run.
pub struct RecoverySystem {
    options: RecoveryOptions,
    checkpoint: Checkpoint,
    store: PageRedoStore,
    applier: RecoveryApplier,
    evidence: ScanEvidence,
    scan_end: Option<ScanEnd>,
    log_end_lsn: Lsn,
    mtrs_scanned: u64,
    file_ops: u64,
    oom_rewinds: u32,
    stats: ApplyStats,
    failures: Vec<PageFailure>,
}

impl RecoverySystem {
    /// Reads the checkpoint of `log` and prepares an empty run.
    pub fn create(log: &LogFile, options: RecoveryOptions) -> Result<Self> {
        let checkpoint = find_checkpoint(log)?;
        Ok(Self {
            store: PageRedoStore::new(options.log_buffer_budget),
            applier: RecoveryApplier::new(options.threads),
            evidence: ScanEvidence {
                scanned_lsn: checkpoint.lsn,
                ..ScanEvidence::default()
            },
            checkpoint,
            scan_end: None,
            log_end_lsn: checkpoint.lsn,
            mtrs_scanned: 0,
            file_ops: 0,
            oom_rewinds: 0,
            stats: ApplyStats::default(),
            failures: Vec::new(),
            options,
        })
    }

    /// The checkpoint this run starts from.
    pub fn checkpoint(&self) -> Checkpoint {
        self.checkpoint
    }

    /// Records parsed but not yet applied.
    pub fn store(&self) -> &PageRedoStore {
        &self.store
    }

    /// Evidence gathered by the scan so far.
    pub fn evidence(&self) -> ScanEvidence {
        self.evidence
    }

    /// Why the scan stopped, once it has.
    pub fn scan_end(&self) -> Option<&ScanEnd> {
        self.scan_end.as_ref()
    }

    /// Page failures accumulated by all batches.
    pub fn failures(&self) -> &[PageFailure] {
        &self.failures
    }

    /// Scans the log from the checkpoint to its end.
    ///
    /// When the record store runs out of memory the records of the current
    /// mini-transaction are taken back out, everything stored so far is
    /// applied, and the scan resumes at that mini-transaction.
    pub fn scan(&mut self, env: &RecoveryEnv, mode: ScanMode) -> Result<()> {
        let log = &env.log;
        self.log_end_lsn = log.end_lsn()?;
        info!(
            checkpoint_no = self.checkpoint.checkpoint_no,
            lsn = self.checkpoint.lsn.0,
            log_end = self.log_end_lsn.0,
            "recv.scan.start"
        );
        let mut scanner = LogScanner::new(self.checkpoint.lsn, log.seq_bit());
        let mut rewinds_at: Option<(Lsn, u32)> = None;
        let mut eof = false;
        let chunk = self.options.read_chunk.max(1);
        loop {
            let step = if eof {
                scanner.finish()
            } else {
                scanner.next_mtr()
            };
            match step {
                ScanStep::Mtr(mtr) => {
                    if self.store_mtr(env, mode, &mtr)? {
                        self.mtrs_scanned += 1;
                        self.evidence.scanned_lsn = mtr.end_lsn;
                        continue;
                    }
                    let count = match rewinds_at {
                        Some((lsn, n)) if lsn == mtr.start_lsn => n + 1,
                        _ => 1,
                    };
                    rewinds_at = Some((mtr.start_lsn, count));
                    self.rewind_mtr(&mtr);
                    // pages are only touched once the checkpoint marker vouches for the log
                    if self.evidence.marker_end.is_none() {
                        error!(lsn = mtr.start_lsn.0, "recv.scan.log_buffer_exhausted_before_marker");
                        return Err(RedoError::LogBufferExhausted(mtr.start_lsn));
                    }
                    if self.store.is_empty() || count > self.options.oom_retry_limit {
                        error!(lsn = mtr.start_lsn.0, rewinds = count, "recv.scan.log_buffer_exhausted");
                        return Err(RedoError::LogBufferExhausted(mtr.start_lsn));
                    }
                    self.oom_rewinds += 1;
                    debug!(lsn = mtr.start_lsn.0, pending = self.store.len(), "recv.scan.oom_rewind");
                    self.apply(&env.pool, false)?;
                    scanner.rewind(mtr.start_lsn);
                    eof = false;
                }
                ScanStep::NeedMore => {
                    let bytes = log.read_stream(scanner.next_read_lsn(), chunk)?;
                    if bytes.is_empty() {
                        eof = true;
                    } else {
                        scanner.feed(&bytes);
                    }
                }
                ScanStep::EndOfLog(reason) => {
                    self.scan_end = Some(ScanEnd::EndOfLog { reason });
                    break;
                }
                ScanStep::Corrupt { lsn, reason } => {
                    warn!(lsn = lsn.0, reason, "recv.scan.corrupt_log");
                    self.evidence.found_corrupt_log = true;
                    self.scan_end = Some(ScanEnd::Corrupt { lsn, reason });
                    break;
                }
            }
        }
        info!(
            scanned_lsn = self.evidence.scanned_lsn.0,
            mtrs = self.mtrs_scanned,
            pages = self.store.len(),
            "recv.scan.end"
        );
        Ok(())
    }

    /// Stores the records of one mini-transaction. Returns false, with
    /// nothing of it left stored, when the store is full.
    /// Stores the page records of `mtr`, then performs its file records.
    /// Returns false when the store ran out of memory; no file record has
    /// run yet in that case, so the rewound mini-transaction replays them
    /// exactly once.
    fn store_mtr(&mut self, env: &RecoveryEnv, mode: ScanMode, mtr: &ParsedMtr) -> Result<bool> {
        for rec in &mtr.records {
            if let LogRecord::Page { page, op } = rec {
                let added = self.store.add(*page, mtr.start_lsn, mtr.end_lsn, op.clone())?;
                if added == AddResult::OutOfMemory {
                    return Ok(false);
                }
            }
        }
        for rec in &mtr.records {
            if let LogRecord::File(op) = rec {
                self.file_op(env, mode, mtr, op)?;
            }
        }
        Ok(true)
    }

    fn rewind_mtr(&self, mtr: &ParsedMtr) {
        for page in mtr.records.iter().filter_map(LogRecord::page) {
            self.store.trim(page, mtr.start_lsn);
        }
    }

    fn file_op(&mut self, env: &RecoveryEnv, mode: ScanMode, mtr: &ParsedMtr, op: &FileOp) -> Result<()> {
        if let FileOp::Checkpoint(lsn) = op {
            if *lsn == self.checkpoint.lsn && self.evidence.marker_end.is_none() {
                debug!(lsn = lsn.0, end_lsn = mtr.end_lsn.0, "recv.scan.checkpoint_marker");
                self.evidence.marker_end = Some(mtr.end_lsn);
            }
            return Ok(());
        }
        if let FileOp::Delete { space, .. } = op {
            let dropped = self.store.discard_space(*space);
            debug!(space, dropped, "recv.scan.discard_space");
        }
        if mode == ScanMode::Dump || self.options.read_only {
            return Ok(());
        }
        match op {
            FileOp::Create { space, name } => env.dir.create(*space, name)?,
            FileOp::Delete { space, .. } => env.dir.delete(*space)?,
            FileOp::Rename { space, to, .. } => env.dir.rename(*space, to)?,
            FileOp::Modify { space, name } => {
                if env.dir.resolve(*space).is_none() {
                    warn!(space, name = %name, "recv.scan.unknown_space");
                }
                return Ok(());
            }
            FileOp::Checkpoint(_) => return Ok(()),
        }
        self.file_ops += 1;
        debug!(lsn = mtr.start_lsn.0, op = ?op, "recv.scan.file_op");
        Ok(())
    }

    /// Replays everything in the store. A `last_batch` leaves nothing
    /// pending.
    pub fn apply(&mut self, pool: &BufferPool, last_batch: bool) -> Result<()> {
        let mut batch = self.applier.apply_batch(
            &self.store,
            pool,
            self.evidence.scanned_lsn,
            self.options.read_only,
            last_batch,
        )?;
        self.stats.absorb(&batch);
        self.failures.append(&mut batch.failures);
        if last_batch && !self.store.pending_ids().is_empty() {
            return Err(RedoError::Invalid("records left pending after the last batch"));
        }
        Ok(())
    }

    /// Checks the scan reached the point the checkpoint requires.
    pub fn validate(&self) -> std::result::Result<(), &'static str> {
        validate_checkpoint(&self.checkpoint, &self.evidence)
    }

    /// True when the log is corrupt at a point recovery must reach to be
    /// consistent.
    fn corrupt_before_consistent_point(&self) -> bool {
        match &self.scan_end {
            Some(ScanEnd::Corrupt { lsn, .. }) => {
                self.evidence.marker_end.is_none() || *lsn < self.checkpoint.end_lsn
            }
            _ => false,
        }
    }

    /// Snapshot of the run so far.
    pub fn report(&self) -> RecoveryReport {
        RecoveryReport {
            checkpoint: self.checkpoint,
            scanned_lsn: self.evidence.scanned_lsn,
            log_end_lsn: self.log_end_lsn,
            log_truncated: self.evidence.scanned_lsn < self.log_end_lsn,
            scan_end: self.scan_end.clone(),
            mtrs_scanned: self.mtrs_scanned,
            file_ops: self.file_ops,
            oom_rewinds: self.oom_rewinds,
            apply: self.stats.clone(),
            failures: self.failures.clone(),
            inconsistency: None,
            new_checkpoint: None,
        }
    }

    /// Releases every remaining record.
    pub fn close(self) {
        self.store.clear();
    }

    /// Makes the replayed state durable and starts a fresh checkpoint at
    /// the end of the scanned log, so the next start replays nothing.
    fn finish(&self, env: &RecoveryEnv) -> Result<Checkpoint> {
        let pool = &env.pool;
        pool.retry_failed_flushes();
        pool.flush_all()?;
        if let Some((page, reason)) = pool.failed_flushes().into_iter().next() {
            return Err(RedoError::FlushFailed { page, reason });
        }
        pool.storage().sync()?;
        let scanned = self.evidence.scanned_lsn;
        env.log.truncate_after(scanned)?;
        env.log.sync()?;
        let redo = RedoLog::open(
            Arc::clone(&env.log),
            scanned,
            self.checkpoint,
            LogOptions::default(),
        )?;
        let cp = redo.checkpoint(&**pool)?;
        info!(checkpoint_no = cp.checkpoint_no, lsn = cp.lsn.0, "recv.finish");
        Ok(cp)
    }
}

fn fatal(err: RedoError, report: Option<RecoveryReport>) -> RecoveryOutcome {
    error!(error = %err, "recv.fatal");
    RecoveryOutcome::Fatal {
        error: err.to_string(),
        report: report.map(Box::new),
    }
}

/// Runs crash recovery end to end.
///
/// The log is consistent when the scan saw the checkpoint's marker and
/// reached its end without hitting a corrupt mini-transaction. A corrupt
/// mini-transaction before that point, a missing checkpoint, or an I/O
/// failure is fatal. A log that stops short of the marker is inconsistent
/// and nothing is replayed; corruption after the marker replays the valid
/// prefix and reports inconsistent. Pages that cannot be recovered are
/// listed in the report; when there are any, nothing is written back so
/// the log can be replayed again.
pub fn recover(env: &RecoveryEnv, options: RecoveryOptions) -> RecoveryOutcome {
    if options.read_only {
        env.pool.set_read_only(true);
    }
    let mut sys = match RecoverySystem::create(&env.log, options) {
        Ok(sys) => sys,
        Err(err) => return fatal(err, None),
    };
    if let Err(err) = sys.scan(env, ScanMode::Apply) {
        return fatal(err, Some(sys.report()));
    }
    if sys.corrupt_before_consistent_point() {
        let err = match sys.scan_end.clone() {
            Some(ScanEnd::Corrupt { lsn, reason }) => RedoError::CorruptLogRecord { lsn, reason },
            _ => RedoError::Corruption("corrupt redo log"),
        };
        let report = sys.report();
        sys.close();
        return fatal(err, Some(report));
    }

    if let Err(reason) = sys.validate() {
        warn!(reason, scanned_lsn = sys.evidence.scanned_lsn.0, "recv.validate.failed");
        if sys.evidence.found_corrupt_log {
            if let Err(err) = sys.apply(&env.pool, true) {
                return fatal(err, Some(sys.report()));
            }
        } else {
            sys.store.clear();
        }
        let mut report = sys.report();
        report.inconsistency = Some(reason.to_string());
        sys.close();
        return RecoveryOutcome::Inconsistent(report);
    }

    if let Err(err) = sys.apply(&env.pool, true) {
        return fatal(err, Some(sys.report()));
    }
    let mut report = sys.report();
    if sys.options.read_only || !sys.failures.is_empty() {
        if !sys.failures.is_empty() {
            warn!(failed = sys.failures.len(), "recv.pages_skipped");
        }
        sys.close();
        return RecoveryOutcome::Consistent(report);
    }
    match sys.finish(env) {
        Ok(cp) => report.new_checkpoint = Some(cp),
        Err(err) => return fatal(err, Some(report)),
    }
    sys.close();
    info!(
        pages = report.apply.pages_recovered,
        records = report.apply.records_applied,
        "recv.consistent"
    );
    RecoveryOutcome::Consistent(report)
}

/// Scans the log without applying anything and reports how many records
/// wait for each page.
pub fn scan_pending(env: &RecoveryEnv, options: RecoveryOptions) -> Result<PendingReport> {
    let mut sys = RecoverySystem::create(
        &env.log,
        RecoveryOptions {
            log_buffer_budget: usize::MAX,
            ..options
        },
    )?;
    sys.scan(env, ScanMode::Dump)?;
    let pages: Vec<PendingPage> = sys
        .store
        .pending_counts()
        .into_iter()
        .map(|(page, records)| PendingPage { page, records })
        .collect();
    let total_records = pages.iter().map(|p| p.records).sum();
    let report = PendingReport {
        checkpoint: sys.checkpoint,
        scanned_lsn: sys.evidence.scanned_lsn,
        scan_end: sys.scan_end.clone(),
        pages,
        total_records,
    };
    sys.close();
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferPoolOptions;
    use crate::log::{Mtr, DEFAULT_START_LSN};
    use crate::primitives::io::MemFileIo;
    use crate::storage::{MemStorage, PageStorage};
    use crate::types::page;

    const PS: usize = 1024;

    struct Setup {
        storage: Arc<MemStorage>,
        log: Arc<LogFile>,
    }

    impl Setup {
        fn new() -> Result<Self> {
            let storage = Arc::new(MemStorage::new(PS)?);
            storage.create(1, "one.ibd")?;
            storage.extend(1, 16)?;
            let log = Arc::new(LogFile::create(Arc::new(MemFileIo::new()), DEFAULT_START_LSN)?);
            Ok(Self { storage, log })
        }

        fn pool(&self) -> Result<Arc<BufferPool>> {
            Ok(Arc::new(BufferPool::new(
                self.storage.clone(),
                None,
                BufferPoolOptions {
                    pool_pages: 16,
                    free_wait_attempts: 5,
                    free_wait_timeout_ms: 1,
                    ..BufferPoolOptions::default()
                },
            )?))
        }

        fn env(&self) -> Result<RecoveryEnv> {
            Ok(RecoveryEnv {
                log: self.log.clone(),
                pool: self.pool()?,
                dir: self.storage.clone(),
            })
        }
    }

    /// Commits mini-transactions against a throwaway pool; the pages never
    /// reach storage.
    fn run_engine(setup: &Setup, mtrs: Vec<Mtr>) -> Result<()> {
        let redo = RedoLog::create(setup.log.clone(), LogOptions::default())?;
        let pool = setup.pool()?;
        for mtr in mtrs {
            mtr.commit(&redo, &pool)?;
        }
        redo.flush_up_to(redo.current_lsn())
    }

    #[test]
    fn clean_log_is_consistent_with_nothing_to_do() -> Result<()> {
        let setup = Setup::new()?;
        run_engine(&setup, Vec::new())?;
        let outcome = recover(&setup.env()?, RecoveryOptions::default());
        assert_eq!(outcome.exit_code(), 0);
        let report = outcome.report().expect("report");
        assert_eq!(report.apply.records_applied, 0);
        assert!(report.new_checkpoint.is_some());
        Ok(())
    }

    #[test]
    fn committed_writes_are_replayed() -> Result<()> {
        let setup = Setup::new()?;
        let id = PageId::new(1, 5);
        let mut mtr = Mtr::new();
        mtr.write(id, 100, &[0xAB; 8]);
        run_engine(&setup, vec![mtr])?;

        let outcome = recover(&setup.env()?, RecoveryOptions::default());
        assert!(matches!(outcome, RecoveryOutcome::Consistent(_)), "{}", outcome.summary());
        let image = setup.storage.page_image(id).expect("page");
        assert_eq!(&image[100..108], &[0xAB; 8]);
        assert!(page::page_lsn(&image) > DEFAULT_START_LSN);

        // the fresh checkpoint leaves nothing to replay
        let again = recover(&setup.env()?, RecoveryOptions::default());
        assert_eq!(again.report().map(|r| r.apply.records_applied), Some(0));
        Ok(())
    }

    #[test]
    fn tiny_budget_forces_partial_applies() -> Result<()> {
        let setup = Setup::new()?;
        let mut mtrs = Vec::new();
        for no in 1..9u32 {
            let mut mtr = Mtr::new();
            mtr.write(PageId::new(1, no), 64, &[no as u8; 16]);
            mtrs.push(mtr);
        }
        run_engine(&setup, mtrs)?;
        let outcome = recover(
            &setup.env()?,
            RecoveryOptions {
                log_buffer_budget: 3 * 100,
                ..RecoveryOptions::default()
            },
        );
        let report = outcome.report().expect("report");
        assert_eq!(outcome.exit_code(), 0, "{}", outcome.summary());
        assert!(report.oom_rewinds > 0);
        assert_eq!(report.apply.records_applied, 8);
        for no in 1..9u32 {
            let image = setup.storage.page_image(PageId::new(1, no)).expect("page");
            assert_eq!(image[64], no as u8);
        }
        Ok(())
    }

    #[test]
    fn file_records_survive_a_rewind_once() -> Result<()> {
        let setup = Setup::new()?;
        let mut mtrs = Vec::new();
        for no in 1..9u32 {
            let mut mtr = Mtr::new();
            mtr.file_create(10 + no, &format!("s{no}.ibd"))
                .write(PageId::new(1, no), 64, &[no as u8; 16]);
            mtrs.push(mtr);
        }
        run_engine(&setup, mtrs)?;
        let outcome = recover(
            &setup.env()?,
            RecoveryOptions {
                log_buffer_budget: 3 * 100,
                ..RecoveryOptions::default()
            },
        );
        let report = outcome.report().expect("report");
        assert_eq!(outcome.exit_code(), 0, "{}", outcome.summary());
        assert!(report.oom_rewinds > 0);
        assert_eq!(report.file_ops, 8);
        for no in 1..9u32 {
            assert_eq!(
                setup.storage.resolve(10 + no).map(|s| s.name),
                Some(format!("s{no}.ibd"))
            );
        }
        Ok(())
    }

    #[test]
    fn exhaustion_before_the_marker_applies_nothing() -> Result<()> {
        let setup = Setup::new()?;
        let redo = RedoLog::create(setup.log.clone(), LogOptions::default())?;
        let pool = setup.pool()?;
        for no in 1..9u32 {
            let mut mtr = Mtr::new();
            mtr.write(PageId::new(1, no), 64, &[no as u8; 16]);
            mtr.commit(&redo, &pool)?;
        }
        // every page is still dirty, so the marker lands after all eight writes
        let cp = redo.checkpoint(&*pool)?;
        assert!(cp.lsn < cp.end_lsn);
        redo.flush_up_to(redo.current_lsn())?;

        let outcome = recover(
            &setup.env()?,
            RecoveryOptions {
                log_buffer_budget: 3 * 100,
                ..RecoveryOptions::default()
            },
        );
        assert_eq!(outcome.exit_code(), 1, "{}", outcome.summary());
        assert_eq!(setup.storage.stats().writes, 0);

        let outcome = recover(&setup.env()?, RecoveryOptions::default());
        assert_eq!(outcome.exit_code(), 0, "{}", outcome.summary());
        assert_eq!(outcome.report().map(|r| r.apply.records_applied), Some(8));
        Ok(())
    }

    #[test]
    fn record_larger_than_the_budget_is_exhaustion() -> Result<()> {
        let setup = Setup::new()?;
        let mut mtr = Mtr::new();
        mtr.write(PageId::new(1, 2), 64, &[1; 512]);
        run_engine(&setup, vec![mtr])?;
        let outcome = recover(
            &setup.env()?,
            RecoveryOptions {
                log_buffer_budget: 128,
                ..RecoveryOptions::default()
            },
        );
        assert_eq!(outcome.exit_code(), 1);
        assert!(outcome.summary().contains("exhausted"));
        Ok(())
    }

    #[test]
    fn pending_dump_counts_records_per_page() -> Result<()> {
        let setup = Setup::new()?;
        let mut a = Mtr::new();
        a.write(PageId::new(1, 1), 50, &[1]).write(PageId::new(1, 2), 50, &[2]);
        let mut b = Mtr::new();
        b.write(PageId::new(1, 1), 60, &[3]);
        run_engine(&setup, vec![a, b])?;
        let report = scan_pending(&setup.env()?, RecoveryOptions::default())?;
        assert_eq!(
            report.pages,
            vec![
                PendingPage {
                    page: PageId::new(1, 1),
                    records: 2
                },
                PendingPage {
                    page: PageId::new(1, 2),
                    records: 1
                },
            ]
        );
        assert_eq!(report.total_records, 3);
        Ok(())
    }
}
