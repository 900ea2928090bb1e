#![allow(missing_docs)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use redoline::buffer::{BufferPool, BufferPoolOptions, FlushOptions, PageCleaner};
use redoline::checkpoint::{find_checkpoint, DirtyPages};
use redoline::log::{LogFile, LogOptions, Mtr, RedoLog, DEFAULT_START_LSN};
use redoline::primitives::io::MemFileIo;
use redoline::storage::{MemStorage, PageStorage, TablespaceDirectory};
use redoline::types::page;
use redoline::types::{PageId, RedoError, Result, SpaceId};

const PAGE_SIZE: usize = 1024;

/// Page storage whose writes can be made to fail.
struct FlakyStorage {
    inner: MemStorage,
    fail_writes: AtomicBool,
}

impl PageStorage for FlakyStorage {
    fn page_size(&self) -> usize {
        self.inner.page_size()
    }

    fn read_page(&self, id: PageId, dst: &mut [u8]) -> Result<()> {
        self.inner.read_page(id, dst)
    }

    fn write_page(&self, id: PageId, src: &[u8]) -> Result<()> {
        if self.fail_writes.load(Ordering::Acquire) {
            return Err(RedoError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "injected write failure",
            )));
        }
        self.inner.write_page(id, src)
    }

    fn space_size(&self, space: SpaceId) -> Result<u32> {
        self.inner.space_size(space)
    }

    fn extend(&self, space: SpaceId, size_pages: u32) -> Result<()> {
        self.inner.extend(space, size_pages)
    }

    fn sync(&self) -> Result<()> {
        self.inner.sync()
    }
}

struct Engine<S> {
    storage: Arc<S>,
    redo: Arc<RedoLog>,
    pool: Arc<BufferPool>,
}

fn mem_storage(pages: u32) -> Result<MemStorage> {
    let storage = MemStorage::new(PAGE_SIZE)?;
    storage.create(1, "one.ibd")?;
    storage.extend(1, pages)?;
    Ok(storage)
}

impl<S: PageStorage + 'static> Engine<S> {
    fn new(storage: S, frames: usize, log: LogOptions) -> Result<Self> {
        let storage = Arc::new(storage);
        let file = Arc::new(LogFile::create(Arc::new(MemFileIo::new()), DEFAULT_START_LSN)?);
        let redo = Arc::new(RedoLog::create(file, log)?);
        let pool = Arc::new(BufferPool::new(
            storage.clone(),
            None,
            BufferPoolOptions {
                pool_pages: frames,
                free_wait_attempts: 1000,
                free_wait_timeout_ms: 1,
                ..BufferPoolOptions::default()
            },
        )?);
        pool.set_redo_log(redo.clone());
        Ok(Self {
            storage,
            redo,
            pool,
        })
    }

    /// Initializes `id` and writes `data` at offset 100.
    fn write_new(&self, id: PageId, data: &[u8]) -> Result<redoline::log::MtrLsns> {
        let mut mtr = Mtr::new();
        mtr.init_page(id).write(id, 100, data);
        mtr.commit(&self.redo, &self.pool)
    }
}

#[test]
fn list_flush_goes_oldest_first_and_checkpoint_follows() -> Result<()> {
    let engine = Engine::new(mem_storage(16)?, 16, LogOptions::default())?;
    let a = engine.write_new(PageId::new(1, 3), &[1])?;
    let b = engine.write_new(PageId::new(1, 1), &[2])?;
    let c = engine.write_new(PageId::new(1, 2), &[3])?;
    assert_eq!(engine.pool.oldest_modification(), Some(a.start));

    let outcome = engine.pool.flush_list(2, c.end)?;
    assert!(outcome.started);
    assert_eq!(outcome.flushed, 2);
    assert!(!engine.pool.is_dirty(PageId::new(1, 3)));
    assert!(!engine.pool.is_dirty(PageId::new(1, 1)));
    assert!(engine.pool.is_dirty(PageId::new(1, 2)));
    assert_eq!(engine.pool.oldest_modification(), Some(c.start));
    assert!(b.end <= c.start);

    let cp = engine.redo.checkpoint(&*engine.pool)?;
    assert_eq!(cp.lsn, c.start);
    assert_eq!(find_checkpoint(engine.redo.file())?, cp);

    // a clean pool checkpoints at the end of the log
    engine.pool.flush_all()?;
    let later = engine.redo.checkpoint(&*engine.pool)?;
    assert!(later.lsn > cp.lsn);
    assert_eq!(later.checkpoint_no, cp.checkpoint_no + 1);
    assert_ne!(later.slot(), cp.slot());
    Ok(())
}

#[test]
fn page_writes_wait_for_the_log() -> Result<()> {
    let engine = Engine::new(mem_storage(8)?, 8, LogOptions::default())?;
    let id = PageId::new(1, 4);
    let lsns = engine.write_new(id, &[0xAA; 8])?;
    assert!(engine.redo.flushed_lsn() < lsns.end);

    engine.pool.flush_all()?;
    assert!(engine.redo.flushed_lsn() >= lsns.end);
    let image = engine.storage.page_image(id).expect("page written");
    assert_eq!(page::page_lsn(&image), lsns.end);
    assert_eq!(page::validate(&image, id), page::PageCheck::Valid);
    Ok(())
}

#[test]
fn failed_write_keeps_the_page_dirty_until_retried() -> Result<()> {
    let storage = FlakyStorage {
        inner: mem_storage(8)?,
        fail_writes: AtomicBool::new(true),
    };
    let engine = Engine::new(storage, 8, LogOptions::default())?;
    let id = PageId::new(1, 2);
    let lsns = engine.write_new(id, &[9])?;

    let err = engine.pool.flush_all().expect_err("write must fail");
    assert!(matches!(err, RedoError::FlushFailed { page, .. } if page == id));
    assert!(engine.pool.is_dirty(id));
    let failed = engine.pool.failed_flushes();
    assert_eq!(failed.len(), 1);
    assert!(failed[0].1.contains("injected"));
    // the failed page still holds the checkpoint back
    assert_eq!(engine.pool.oldest_modification(), Some(lsns.start));
    assert!(engine.redo.checkpoint(&*engine.pool)?.lsn <= lsns.start);

    engine.storage.fail_writes.store(false, Ordering::Release);
    assert_eq!(engine.pool.retry_failed_flushes(), 1);
    engine.pool.flush_all()?;
    assert!(!engine.pool.is_dirty(id));
    assert!(engine.pool.failed_flushes().is_empty());
    assert_eq!(engine.pool.oldest_modification(), None);
    Ok(())
}

#[test]
fn free_check_keeps_the_checkpoint_within_the_log() -> Result<()> {
    let log = LogOptions {
        capacity_bytes: 8 << 10,
        ..LogOptions::default()
    };
    let engine = Engine::new(mem_storage(64)?, 64, log)?;
    let capacity = engine.redo.capacity();
    for round in 0..20u8 {
        for no in 1..=48u32 {
            engine.redo.free_check(&engine.pool)?;
            let age = engine.redo.current_lsn().0 - engine.redo.last_checkpoint().lsn.0;
            assert!(
                age <= capacity.max_checkpoint_age,
                "checkpoint age {age} over {}",
                capacity.max_checkpoint_age
            );
            let id = PageId::new(1, no);
            let mut mtr = Mtr::new();
            if round == 0 {
                mtr.init_page(id);
            }
            mtr.write(id, 200, &[round; 32]);
            mtr.commit(&engine.redo, &engine.pool)?;
        }
    }
    assert!(engine.redo.stats().checkpoints > 0);
    assert!(engine.pool.stats().pages_flushed > 0);
    Ok(())
}

#[test]
fn page_cleaner_drains_a_dirty_pool() -> Result<()> {
    let engine = Engine::new(mem_storage(32)?, 32, LogOptions::default())?;
    for no in 1..=12u32 {
        engine.write_new(PageId::new(1, no), &[no as u8])?;
    }
    assert_eq!(engine.pool.dirty_len(), 12);

    let cleaner = PageCleaner::start(
        engine.pool.clone(),
        FlushOptions {
            interval_ms: 5,
            max_dirty_pages_pct: 10.0,
            ..FlushOptions::default()
        },
    )?;
    let deadline = Instant::now() + Duration::from_secs(10);
    while engine.pool.dirty_len() > 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    cleaner.shutdown();
    assert_eq!(engine.pool.dirty_len(), 0);
    for no in 1..=12u32 {
        let image = engine.storage.page_image(PageId::new(1, no)).expect("page");
        assert_eq!(image[100], no as u8);
    }
    Ok(())
}

#[test]
fn flush_ahead_is_served_by_the_cleaner() -> Result<()> {
    let engine = Engine::new(mem_storage(32)?, 32, LogOptions::default())?;
    let mut ends = Vec::new();
    for no in 1..=6u32 {
        ends.push(engine.write_new(PageId::new(1, no), &[no as u8])?);
    }
    let cleaner = PageCleaner::start(
        engine.pool.clone(),
        FlushOptions {
            interval_ms: 5,
            max_dirty_pages_pct: 100.0,
            adaptive_flushing_lwm: 100.0,
            ..FlushOptions::default()
        },
    )?;
    // flush everything older than the fourth mini-transaction
    engine.pool.ahead(ends[3].start, false);
    let deadline = Instant::now() + Duration::from_secs(10);
    while engine.pool.oldest_modification() < Some(ends[3].start) && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    cleaner.shutdown();
    assert_eq!(engine.pool.oldest_modification(), Some(ends[3].start));
    assert!(!engine.pool.is_dirty(PageId::new(1, 1)));
    assert!(engine.pool.is_dirty(PageId::new(1, 6)));
    Ok(())
}

#[test]
fn concurrent_writers_through_a_small_pool() -> Result<()> {
    const THREADS: u32 = 4;
    const PAGES_PER_THREAD: u32 = 48;
    const ROUNDS: u8 = 4;

    let engine = Engine::new(mem_storage(THREADS * PAGES_PER_THREAD + 1)?, 24, LogOptions::default())?;
    thread::scope(|scope| -> Result<()> {
        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let engine = &engine;
                scope.spawn(move || -> Result<()> {
                    for round in 0..ROUNDS {
                        for i in 0..PAGES_PER_THREAD {
                            let id = PageId::new(1, 1 + t * PAGES_PER_THREAD + i);
                            engine.redo.free_check(&engine.pool)?;
                            let mut mtr = Mtr::new();
                            if round == 0 {
                                mtr.init_page(id);
                            }
                            mtr.write(id, 100, &[t as u8, round]);
                            mtr.commit(&engine.redo, &engine.pool)?;
                        }
                    }
                    Ok(())
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("writer panicked")?;
        }
        Ok(())
    })?;

    engine.pool.flush_all()?;
    assert_eq!(engine.pool.dirty_len(), 0);
    assert!(engine.pool.stats().evictions > 0);
    for t in 0..THREADS {
        for i in 0..PAGES_PER_THREAD {
            let id = PageId::new(1, 1 + t * PAGES_PER_THREAD + i);
            let image = engine.storage.page_image(id).expect("page");
            assert_eq!(&image[100..102], &[t as u8, ROUNDS - 1]);
            assert_eq!(page::validate(&image, id), page::PageCheck::Valid);
        }
    }
    Ok(())
}
