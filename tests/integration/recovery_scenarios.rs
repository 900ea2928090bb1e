#![allow(missing_docs)]

use std::sync::Arc;

use redoline::buffer::{BufferPool, BufferPoolOptions};
use redoline::log::{LogFile, LogOptions, Mtr, MtrLsns, RedoLog, DEFAULT_START_LSN};
use redoline::primitives::io::MemFileIo;
use redoline::recovery::{
    recover, RecoveryEnv, RecoveryOptions, RecoveryOutcome, RecoverySystem, RecoveryState,
    ScanEnd, ScanMode,
};
use redoline::storage::{
    Doublewrite, DoublewriteBuffer, MemStorage, PageStorage, TablespaceDirectory,
};
use redoline::types::page::{self, undo};
use redoline::types::{Lsn, PageId, Result};

const PAGE_SIZE: usize = 1024;

/// A crashed engine: tablespaces in memory, a log in memory, and whatever
/// the engine's pool held is gone.
struct Crashed {
    storage: Arc<MemStorage>,
    log_io: Arc<MemFileIo>,
    log: Arc<LogFile>,
}

struct Engine {
    storage: Arc<MemStorage>,
    log_io: Arc<MemFileIo>,
    log: Arc<LogFile>,
    redo: Arc<RedoLog>,
    pool: Arc<BufferPool>,
}

impl Engine {
    fn start(space_pages: u32, pool_pages: usize) -> Result<Self> {
        Self::start_with(space_pages, pool_pages, None)
    }

    fn start_with(
        space_pages: u32,
        pool_pages: usize,
        doublewrite: Option<Arc<dyn DoublewriteBuffer>>,
    ) -> Result<Self> {
        let storage = Arc::new(MemStorage::new(PAGE_SIZE)?);
        storage.create(1, "one.ibd")?;
        storage.extend(1, space_pages)?;
        let log_io = Arc::new(MemFileIo::new());
        let log = Arc::new(LogFile::create(log_io.clone(), DEFAULT_START_LSN)?);
        let redo = Arc::new(RedoLog::create(log.clone(), LogOptions::default())?);
        let pool = Arc::new(BufferPool::new(
            storage.clone(),
            doublewrite,
            BufferPoolOptions {
                pool_pages,
                ..BufferPoolOptions::default()
            },
        )?);
        pool.set_redo_log(redo.clone());
        Ok(Self {
            storage,
            log_io,
            log,
            redo,
            pool,
        })
    }

    fn commit(&self, mtr: Mtr) -> Result<MtrLsns> {
        mtr.commit(&self.redo, &self.pool)
    }

    /// Logs a mini-transaction of file records; the directory change itself
    /// is lost in the crash.
    fn commit_file_only(&self, mtr: Mtr) -> Result<()> {
        let bytes = mtr.encode(self.redo.seq_bit())?;
        self.redo.append(&bytes)?;
        Ok(())
    }

    /// Writes every dirty page back and checkpoints at the end of the log.
    fn clean_shutdown(&self) -> Result<()> {
        self.pool.flush_all()?;
        self.redo.checkpoint(&*self.pool)?;
        Ok(())
    }

    /// Makes the log durable and drops the pool without writing pages.
    fn crash(self) -> Result<Crashed> {
        self.redo.flush_up_to(self.redo.current_lsn())?;
        Ok(Crashed {
            storage: self.storage,
            log_io: self.log_io,
            log: self.log,
        })
    }
}

impl Crashed {
    fn env(&self, pool_pages: usize) -> Result<RecoveryEnv> {
        self.env_with(pool_pages, None)
    }

    fn env_with(
        &self,
        pool_pages: usize,
        doublewrite: Option<Arc<dyn DoublewriteBuffer>>,
    ) -> Result<RecoveryEnv> {
        let pool = BufferPool::new(
            self.storage.clone(),
            doublewrite,
            BufferPoolOptions {
                pool_pages,
                free_wait_attempts: 1000,
                free_wait_timeout_ms: 1,
                ..BufferPoolOptions::default()
            },
        )?;
        Ok(RecoveryEnv {
            log: self.log.clone(),
            pool: Arc::new(pool),
            dir: self.storage.clone(),
        })
    }

    fn page(&self, id: PageId) -> Vec<u8> {
        self.storage.page_image(id).expect("page exists")
    }
}

#[test]
fn empty_log_recovers_nothing() -> Result<()> {
    let engine = Engine::start(8, 16)?;
    let crashed = engine.crash()?;

    let outcome = recover(&crashed.env(16)?, RecoveryOptions::default());
    let RecoveryOutcome::Consistent(report) = &outcome else {
        panic!("unexpected outcome: {}", outcome.summary());
    };
    assert_eq!(report.apply.pages_recovered, 0);
    assert_eq!(report.apply.records_applied, 0);
    assert!(report.failures.is_empty());
    assert!(!report.log_truncated);
    assert_eq!(crashed.storage.stats().writes, 0);
    Ok(())
}

#[test]
fn single_write_is_replayed_and_its_entry_erased() -> Result<()> {
    let engine = Engine::start(8, 16)?;
    let id = PageId::new(1, 5);
    let mut mtr = Mtr::new();
    mtr.write(id, 100, &[0xDE, 0xAD, 0xBE, 0xEF]);
    let lsns = engine.commit(mtr)?;
    let crashed = engine.crash()?;

    let env = crashed.env(16)?;
    let mut sys = RecoverySystem::create(&env.log, RecoveryOptions::default())?;
    sys.scan(&env, ScanMode::Apply)?;
    assert_eq!(sys.store().state(id), Some(RecoveryState::NotProcessed));
    assert_eq!(sys.store().record_lsns(id), vec![lsns.end]);
    sys.validate().expect("checkpoint validates");
    sys.apply(&env.pool, true)?;
    assert_eq!(sys.store().state(id), None);
    assert!(sys.store().is_empty());
    assert!(env.pool.is_dirty(id));
    sys.close();

    // the full entry point also writes the page back
    let outcome = recover(&crashed.env(16)?, RecoveryOptions::default());
    assert_eq!(outcome.exit_code(), 0, "{}", outcome.summary());
    let image = crashed.page(id);
    assert_eq!(&image[100..104], &[0xDE, 0xAD, 0xBE, 0xEF]);
    assert_eq!(page::page_lsn(&image), lsns.end);
    Ok(())
}

#[test]
fn two_mtrs_on_one_page_apply_in_log_order() -> Result<()> {
    let engine = Engine::start(8, 16)?;
    let id = PageId::new(1, 3);
    let mut first = Mtr::new();
    first.write(id, 200, &[1, 2]);
    let mut second = Mtr::new();
    second.write(id, 201, &[3]);
    let a = engine.commit(first)?;
    let b = engine.commit(second)?;
    assert!(a.end <= b.start);
    let crashed = engine.crash()?;

    let outcome = recover(&crashed.env(16)?, RecoveryOptions::default());
    let report = outcome.report().expect("report");
    assert_eq!(outcome.exit_code(), 0, "{}", outcome.summary());
    assert_eq!(report.apply.records_applied, 2);
    assert_eq!(report.apply.pages_recovered, 1);

    let image = crashed.page(id);
    assert_eq!(&image[200..202], &[1, 3]);
    assert_eq!(page::page_lsn(&image), b.end);
    Ok(())
}

#[test]
fn torn_tail_uses_the_scanned_prefix() -> Result<()> {
    let engine = Engine::start(8, 16)?;
    let kept = PageId::new(1, 1);
    let torn = PageId::new(1, 2);
    let mut first = Mtr::new();
    first.write(kept, 64, &[7; 16]);
    let mut second = Mtr::new();
    second.write(torn, 64, &[9; 64]);
    let a = engine.commit(first)?;
    let b = engine.commit(second)?;
    let crashed = engine.crash()?;

    // cut the second mini-transaction in half
    let cut = crashed.log.lsn_to_offset(Lsn(b.start.0 + (b.end.0 - b.start.0) / 2))?;
    crashed.log_io.with_bytes_mut(|bytes| bytes.truncate(cut as usize));

    let outcome = recover(&crashed.env(16)?, RecoveryOptions::default());
    let RecoveryOutcome::Consistent(report) = &outcome else {
        panic!("unexpected outcome: {}", outcome.summary());
    };
    assert_eq!(report.scanned_lsn, a.end);
    assert!(report.log_truncated);
    assert!(matches!(report.scan_end, Some(ScanEnd::EndOfLog { .. })));
    assert_eq!(report.apply.records_applied, 1);
    assert_eq!(crashed.page(kept)[64], 7);
    assert_eq!(crashed.page(torn)[64], 0);

    // the torn bytes are gone and the next run starts clean
    assert!(crashed.log.end_lsn()? > a.end);
    let again = recover(&crashed.env(16)?, RecoveryOptions::default());
    let report = again.report().expect("report");
    assert_eq!(again.exit_code(), 0);
    assert!(!report.log_truncated);
    assert_eq!(report.apply.records_applied, 0);
    Ok(())
}

#[test]
fn damaged_sole_checkpoint_is_fatal_before_any_page_io() -> Result<()> {
    let engine = Engine::start(8, 16)?;
    let mut mtr = Mtr::new();
    mtr.write(PageId::new(1, 4), 80, &[5; 4]);
    engine.commit(mtr)?;
    let crashed = engine.crash()?;

    // checkpoint number 1 sits in the second slot; the first was never written
    assert!(crashed.log.read_checkpoint(0)?.is_none());
    assert!(crashed.log.read_checkpoint(1)?.is_some());
    crashed.log_io.with_bytes_mut(|bytes| bytes[1536 + 9] ^= 0xFF);

    let reads_before = crashed.storage.stats().reads;
    let outcome = recover(&crashed.env(16)?, RecoveryOptions::default());
    assert_eq!(outcome.exit_code(), 1);
    let RecoveryOutcome::Fatal { error, report } = &outcome else {
        panic!("unexpected outcome: {}", outcome.summary());
    };
    assert!(error.contains("checkpoint"), "{error}");
    assert!(report.is_none());
    assert_eq!(crashed.storage.stats().reads, reads_before);
    assert_eq!(crashed.storage.stats().writes, 0);
    Ok(())
}

#[test]
fn ten_thousand_pages_replay_exactly_once_through_a_small_pool() -> Result<()> {
    const PAGES: u32 = 10_000;
    const FRAMES: usize = 100;

    let engine = Engine::start(PAGES + 1, PAGES as usize + 64)?;
    for no in 1..=PAGES {
        let id = PageId::new(1, no);
        let mut mtr = Mtr::new();
        mtr.init_page(id).undo_init(id);
        engine.commit(mtr)?;
    }
    engine.clean_shutdown()?;
    for no in 1..=PAGES {
        let mut mtr = Mtr::new();
        mtr.undo_append(PageId::new(1, no), &no.to_be_bytes());
        engine.commit(mtr)?;
    }
    let crashed = engine.crash()?;

    let outcome = recover(&crashed.env(FRAMES)?, RecoveryOptions::default());
    let RecoveryOutcome::Consistent(report) = &outcome else {
        panic!("unexpected outcome: {}", outcome.summary());
    };
    assert!(report.failures.is_empty());
    assert_eq!(report.apply.pages_recovered, PAGES as usize);
    assert_eq!(report.apply.records_applied, PAGES as usize);
    assert!(report.apply.max_in_flight >= 1);
    assert!(report.apply.max_in_flight <= FRAMES);

    // one undo record per page: the free offset moved exactly once
    let expected_free = (undo::FIRST_RECORD + 2 + 4) as u16;
    for no in 1..=PAGES {
        let image = crashed.page(PageId::new(1, no));
        let free = u16::from_be_bytes([image[undo::PAGE_FREE.start], image[undo::PAGE_FREE.start + 1]]);
        assert_eq!(free, expected_free, "page {no}");
        let body = &image[undo::FIRST_RECORD + 2..undo::FIRST_RECORD + 6];
        assert_eq!(body, &no.to_be_bytes());
    }
    Ok(())
}

#[test]
fn replaying_twice_changes_nothing() -> Result<()> {
    let engine = Engine::start(8, 16)?;
    let id = PageId::new(1, 6);
    let mut mtr = Mtr::new();
    mtr.init_page(id).undo_init(id).undo_append(id, b"row");
    engine.commit(mtr)?;
    let crashed = engine.crash()?;
    let log_copy = crashed.log_io.snapshot();

    let first = recover(&crashed.env(16)?, RecoveryOptions::default());
    assert_eq!(first.exit_code(), 0, "{}", first.summary());
    let once = crashed.page(id);

    // put the pre-recovery log back and replay onto the recovered page
    crashed.log_io.with_bytes_mut(|bytes| *bytes = log_copy);
    let log = Arc::new(LogFile::open(crashed.log_io.clone())?);
    let replay = Crashed {
        storage: crashed.storage.clone(),
        log_io: crashed.log_io.clone(),
        log,
    };
    let second = recover(&replay.env(16)?, RecoveryOptions::default());
    let report = second.report().expect("report");
    assert_eq!(second.exit_code(), 0, "{}", second.summary());
    assert_eq!(report.apply.records_applied + report.apply.records_skipped, 3);
    assert_eq!(replay.page(id), once);
    Ok(())
}

#[test]
fn read_only_recovery_writes_nothing() -> Result<()> {
    let engine = Engine::start(8, 16)?;
    let mut mtr = Mtr::new();
    mtr.write(PageId::new(1, 2), 90, &[4; 4]);
    engine.commit(mtr)?;
    let crashed = engine.crash()?;
    let log_before = crashed.log_io.snapshot();

    let outcome = recover(
        &crashed.env(16)?,
        RecoveryOptions {
            read_only: true,
            ..RecoveryOptions::default()
        },
    );
    let report = outcome.report().expect("report");
    assert_eq!(outcome.exit_code(), 0, "{}", outcome.summary());
    assert_eq!(report.apply.records_applied, 1);
    assert!(report.new_checkpoint.is_none());
    assert_eq!(crashed.storage.stats().writes, 0);
    assert_eq!(crashed.log_io.snapshot(), log_before);
    Ok(())
}

#[test]
fn read_only_replay_larger_than_the_pool_is_fatal_without_writes() -> Result<()> {
    const PAGES: u32 = 40;
    let engine = Engine::start(PAGES + 1, 64)?;
    for no in 1..=PAGES {
        let mut mtr = Mtr::new();
        mtr.write(PageId::new(1, no), 90, &no.to_le_bytes());
        engine.commit(mtr)?;
    }
    let crashed = engine.crash()?;
    let log_before = crashed.log_io.snapshot();
    let read_only = RecoveryOptions {
        read_only: true,
        ..RecoveryOptions::default()
    };

    let outcome = recover(&crashed.env(8)?, read_only.clone());
    assert_eq!(outcome.exit_code(), 1, "{}", outcome.summary());
    let RecoveryOutcome::Fatal { error, .. } = &outcome else {
        panic!("unexpected outcome: {}", outcome.summary());
    };
    assert!(error.contains("read-only"), "{error}");
    assert_eq!(crashed.storage.stats().writes, 0);
    assert_eq!(crashed.log_io.snapshot(), log_before);

    // a pool that holds every page replays the same log read-only
    let outcome = recover(&crashed.env(64)?, read_only);
    assert_eq!(outcome.exit_code(), 0, "{}", outcome.summary());
    assert_eq!(outcome.report().expect("report").apply.pages_recovered, PAGES as usize);
    assert_eq!(crashed.storage.stats().writes, 0);
    assert_eq!(crashed.log_io.snapshot(), log_before);
    Ok(())
}

#[test]
fn torn_page_is_restored_from_the_doublewrite_copy() -> Result<()> {
    let dw_io = Arc::new(MemFileIo::new());
    let dw: Arc<dyn DoublewriteBuffer> = Arc::new(Doublewrite::new(dw_io.clone(), PAGE_SIZE, 8)?);
    let engine = Engine::start_with(8, 16, Some(dw))?;
    let id = PageId::new(1, 3);
    let mut mtr = Mtr::new();
    mtr.init_page(id).write(id, 100, b"AAAA");
    let first = engine.commit(mtr)?;
    // the flush stages the image in the doublewrite area before writing it
    // in place; the checkpoint keeps the page init out of the replay
    engine.clean_shutdown()?;
    let mut mtr = Mtr::new();
    mtr.write(id, 200, b"BBBB");
    engine.commit(mtr)?;
    let crashed = engine.crash()?;

    let mut torn = crashed.page(id);
    torn[300] ^= 0x5A;
    crashed.storage.put_raw(id, &torn)?;

    let dw: Arc<dyn DoublewriteBuffer> = Arc::new(Doublewrite::new(dw_io, PAGE_SIZE, 8)?);
    let outcome = recover(&crashed.env_with(16, Some(dw))?, RecoveryOptions::default());
    let report = outcome.report().expect("report");
    assert_eq!(outcome.exit_code(), 0, "{}", outcome.summary());
    assert!(report.failures.is_empty());
    assert_eq!(report.apply.doublewrite_restores, 1);
    assert_eq!(report.apply.records_applied, 1);

    let image = crashed.page(id);
    assert_eq!(page::validate(&image, id), page::PageCheck::Valid);
    assert_eq!(&image[100..104], b"AAAA");
    assert_eq!(&image[200..204], b"BBBB");
    assert!(page::page_lsn(&image) > first.end);
    Ok(())
}

#[test]
fn torn_page_without_a_doublewrite_copy_is_reported() -> Result<()> {
    let engine = Engine::start(8, 16)?;
    let id = PageId::new(1, 3);
    let mut mtr = Mtr::new();
    mtr.init_page(id).write(id, 100, b"AAAA");
    engine.commit(mtr)?;
    engine.clean_shutdown()?;
    let mut mtr = Mtr::new();
    mtr.write(id, 200, b"BBBB");
    engine.commit(mtr)?;
    let crashed = engine.crash()?;

    let mut torn = crashed.page(id);
    torn[300] ^= 0x5A;
    crashed.storage.put_raw(id, &torn)?;

    let outcome = recover(&crashed.env(16)?, RecoveryOptions::default());
    let report = outcome.report().expect("report");
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].page, id);
    assert_eq!(report.apply.doublewrite_restores, 0);
    Ok(())
}

#[test]
fn file_operations_replay_into_the_directory() -> Result<()> {
    let engine = Engine::start(8, 16)?;
    let mut mtr = Mtr::new();
    mtr.file_create(7, "seven.ibd");
    engine.commit_file_only(mtr)?;
    let mut mtr = Mtr::new();
    mtr.file_rename(1, "one.ibd", "uno.ibd");
    engine.commit_file_only(mtr)?;
    let crashed = engine.crash()?;

    let outcome = recover(&crashed.env(16)?, RecoveryOptions::default());
    let report = outcome.report().expect("report");
    assert_eq!(outcome.exit_code(), 0, "{}", outcome.summary());
    assert_eq!(report.file_ops, 2);
    assert_eq!(crashed.storage.resolve(7).map(|s| s.name), Some("seven.ibd".to_string()));
    assert_eq!(crashed.storage.resolve(1).map(|s| s.name), Some("uno.ibd".to_string()));
    assert!(crashed.storage.space_size(7).is_ok());
    Ok(())
}
