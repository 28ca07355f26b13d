// src/store/shm.rs

use crate::channel::{Channel, RUN_ABANDONED, RUN_ACTIVE, RUN_STOPPED};
use crate::config::Backend;
use crate::error::{Result, TelemetryError};
use crate::record::{Delivery, Frame, Label, Value, END_KEY, LABEL_CAPACITY, START_KEY};
use libc::{sem_destroy, sem_init, sem_post, sem_t, sem_wait};
use shared_memory::{Shmem, ShmemConf};
use std::io::Error;
use std::mem::{align_of, size_of};
use std::sync::atomic::{AtomicU64, Ordering};

/// 共享内存头部：四个控制字加上格式元数据
#[repr(C, align(128))] // 保持高对齐以避免 false sharing
struct StoreHeader {
    magic: AtomicU64,
    version: AtomicU64,
    capacity: AtomicU64,
    key_size: AtomicU64,
    // 单个 cell 占用的字节数
    stride: AtomicU64,
    running: AtomicU64,
    write_idx: AtomicU64,
    read_idx: AtomicU64,
}

/// 三把进程间共享的锁，紧跟在头部之后
#[repr(C)]
struct LockHeader {
    write_lock: sem_t,
    read_lock: sem_t,
    running_lock: sem_t,
}

/// cell 的定长部分，后面紧跟 key_size 字节的 key
#[repr(C)]
struct CellHeader {
    key_len: u32,
    tag: u32,
    bits: u64,
}

const STORE_MAGIC: u64 = 0x54454C45_52494E47; // "TELERING" in hex
const STORE_VERSION: u64 = 1;

const TAG_INT: u32 = 0;
const TAG_FLOAT: u32 = 1;
const TAG_TEXT: u32 = 2;

fn align_up(offset: usize, align: usize) -> Option<usize> {
    Some(offset.checked_add(align - 1)? & !(align - 1))
}

/// Byte offsets of the three regions inside the segment.
#[derive(Debug, Clone, Copy)]
struct Layout {
    locks: usize,
    cells: usize,
    stride: usize,
    total: usize,
}

impl Layout {
    /// Fails when the segment size does not fit in `usize`.
    fn new(capacity: u64, key_size: usize) -> Result<Self> {
        Self::compute(capacity, key_size).ok_or_else(|| {
            TelemetryError::config(format!(
                "store of {} cells with key_size {} is too large to map",
                capacity, key_size
            ))
        })
    }

    fn compute(capacity: u64, key_size: usize) -> Option<Self> {
        let locks = align_up(size_of::<StoreHeader>(), align_of::<LockHeader>())?;
        let cells = align_up(locks + size_of::<LockHeader>(), align_of::<CellHeader>())?;
        let stride = align_up(
            size_of::<CellHeader>().checked_add(key_size)?,
            align_of::<CellHeader>(),
        )?;
        let slots = usize::try_from(capacity).ok()?;
        let total = stride.checked_mul(slots)?.checked_add(cells)?;
        Some(Self {
            locks,
            cells,
            stride,
            total,
        })
    }
}

fn encode(value: Value) -> (u32, u64) {
    match value {
        Value::Int(v) => (TAG_INT, v as u64),
        Value::Float(v) => (TAG_FLOAT, v.to_bits()),
        Value::Text(label) => {
            let (bytes, len) = label.raw();
            (TAG_TEXT | ((len as u32) << 8), u64::from_le_bytes(bytes))
        }
    }
}

fn decode(tag: u32, bits: u64) -> Value {
    match tag & 0xff {
        TAG_FLOAT => Value::Float(f64::from_bits(bits)),
        TAG_TEXT => {
            let len = ((tag >> 8) & 0xff) as usize;
            Value::Text(Label::from_raw(bits.to_le_bytes(), len.min(LABEL_CAPACITY)))
        }
        _ => Value::Int(bits as i64),
    }
}

/// A POSIX semaphore with initial value 1, shared between processes.
struct SemLock {
    sem: *mut sem_t,
}

struct SemGuard<'a> {
    lock: &'a SemLock,
    held: bool,
}

impl SemLock {
    /// # Safety
    /// `sem` must point into mapped memory that outlives the lock.
    unsafe fn init(sem: *mut sem_t) -> std::io::Result<Self> {
        if sem_init(sem, 1, 1) != 0 {
            return Err(Error::last_os_error());
        }
        Ok(Self { sem })
    }

    fn lock(&self) -> SemGuard<'_> {
        loop {
            if unsafe { sem_wait(self.sem) } == 0 {
                return SemGuard {
                    lock: self,
                    held: true,
                };
            }
            let err = Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                // 锁已被销毁或损坏，不持锁继续，避免调用方永久阻塞
                log::error!("sem_wait failed: {}", err);
                return SemGuard {
                    lock: self,
                    held: false,
                };
            }
        }
    }

    fn destroy(&self) {
        unsafe {
            sem_destroy(self.sem);
        }
    }
}

impl Drop for SemGuard<'_> {
    fn drop(&mut self) {
        if self.held {
            unsafe {
                sem_post(self.lock.sem);
            }
        }
    }
}

/// Slot store living in one shared-memory segment.
///
/// Everything the consumer needs (control words, locks, cells) sits inside
/// the mapping, so a child created with `fork` after construction operates on
/// the very same store.
pub struct SharedSlotStore {
    shmem: Shmem,
    header: *mut StoreHeader,
    cells: *mut u8,
    write_lock: SemLock,
    read_lock: SemLock,
    running_lock: SemLock,
    capacity: u64,
    key_size: usize,
    stride: usize,
    is_creator: bool,
}

// 实现 Send 和 Sync 特性，允许在线程间安全传递
// 控制字由三把锁保护，cell 由单生产者/单消费者协议保护
unsafe impl Send for SharedSlotStore {}
unsafe impl Sync for SharedSlotStore {}

impl SharedSlotStore {
    /// 创建新的共享存储，所有 cell 在此一次性分配
    pub fn create(capacity: u64, key_size: usize) -> Result<Self> {
        if capacity == 0 || key_size == 0 {
            return Err(TelemetryError::config(
                "capacity and key_size must be positive",
            ));
        }
        let layout = Layout::new(capacity, key_size)?;

        let shmem = ShmemConf::new()
            .size(layout.total)
            .create()
            .map_err(|e| TelemetryError::shared_memory(format!("创建共享内存失败: {}", e)))?;

        let base = shmem.as_ptr();
        let header = base as *mut StoreHeader;

        unsafe {
            header.write(StoreHeader {
                magic: AtomicU64::new(0),
                version: AtomicU64::new(STORE_VERSION),
                capacity: AtomicU64::new(capacity),
                key_size: AtomicU64::new(key_size as u64),
                stride: AtomicU64::new(layout.stride as u64),
                running: AtomicU64::new(0),
                write_idx: AtomicU64::new(0),
                read_idx: AtomicU64::new(0),
            });
            std::ptr::write_bytes(base.add(layout.cells), 0, layout.total - layout.cells);
        }

        let locks = unsafe { base.add(layout.locks) } as *mut LockHeader;
        let (write_lock, read_lock, running_lock) = unsafe {
            let write_lock = SemLock::init(&mut (*locks).write_lock)?;
            let read_lock = match SemLock::init(&mut (*locks).read_lock) {
                Ok(lock) => lock,
                Err(e) => {
                    write_lock.destroy();
                    return Err(e.into());
                }
            };
            let running_lock = match SemLock::init(&mut (*locks).running_lock) {
                Ok(lock) => lock,
                Err(e) => {
                    write_lock.destroy();
                    read_lock.destroy();
                    return Err(e.into());
                }
            };
            (write_lock, read_lock, running_lock)
        };

        // 魔数最后写入，打开方看到魔数即代表初始化完成
        unsafe {
            (*header).magic.store(STORE_MAGIC, Ordering::Release);
        }

        log::info!(
            "Created shared slot store {} ({} cells, key_size {}, {} bytes)",
            shmem.get_os_id(),
            capacity,
            key_size,
            layout.total
        );

        Ok(Self {
            cells: unsafe { base.add(layout.cells) },
            shmem,
            header,
            write_lock,
            read_lock,
            running_lock,
            capacity,
            key_size,
            stride: layout.stride,
            is_creator: true,
        })
    }

    /// 打开另一个进程创建的共享存储，用于不经 fork 的独立消费者
    pub fn open(os_id: &str) -> Result<Self> {
        let shmem = ShmemConf::new()
            .os_id(os_id)
            .open()
            .map_err(|e| TelemetryError::shared_memory(format!("打开共享内存失败: {}", e)))?;

        let base = shmem.as_ptr();
        let header = base as *mut StoreHeader;
        if shmem.len() < size_of::<StoreHeader>() {
            return Err(TelemetryError::shared_memory(format!(
                "共享内存过小: {} 字节",
                shmem.len()
            )));
        }
        Self::check_header(header)?;

        let (capacity, key_size, stride) = unsafe {
            (
                (*header).capacity.load(Ordering::Acquire),
                (*header).key_size.load(Ordering::Acquire) as usize,
                (*header).stride.load(Ordering::Acquire) as usize,
            )
        };
        let layout = Layout::new(capacity, key_size)?;
        if layout.stride != stride || shmem.len() < layout.total {
            return Err(TelemetryError::shared_memory(format!(
                "布局不一致: 段大小 {}, 期望 {}",
                shmem.len(),
                layout.total
            )));
        }

        let locks = unsafe { base.add(layout.locks) } as *mut LockHeader;
        let (write_lock, read_lock, running_lock) = unsafe {
            (
                SemLock {
                    sem: &mut (*locks).write_lock,
                },
                SemLock {
                    sem: &mut (*locks).read_lock,
                },
                SemLock {
                    sem: &mut (*locks).running_lock,
                },
            )
        };

        Ok(Self {
            cells: unsafe { base.add(layout.cells) },
            shmem,
            header,
            write_lock,
            read_lock,
            running_lock,
            capacity,
            key_size,
            stride,
            is_creator: false,
        })
    }

    fn check_header(header: *const StoreHeader) -> Result<()> {
        unsafe {
            let magic = (*header).magic.load(Ordering::Acquire);
            if magic != STORE_MAGIC {
                return Err(TelemetryError::shared_memory(format!(
                    "无效的魔数: 0x{:X}, 期望: 0x{:X}",
                    magic, STORE_MAGIC
                )));
            }

            let version = (*header).version.load(Ordering::Acquire);
            if version != STORE_VERSION {
                return Err(TelemetryError::shared_memory(format!(
                    "不兼容的版本: {}, 期望: {}",
                    version, STORE_VERSION
                )));
            }
        }
        Ok(())
    }

    /// Verifies magic and version, e.g. from a freshly forked consumer.
    pub fn validate_header(&self) -> Result<()> {
        Self::check_header(self.header)
    }

    /// Name other processes pass to [`SharedSlotStore::open`].
    pub fn os_id(&self) -> &str {
        self.shmem.get_os_id()
    }

    pub fn segment_len(&self) -> usize {
        self.shmem.len()
    }

    fn cell_ptr(&self, counter: u64) -> *mut u8 {
        let slot = (counter % self.capacity) as usize;
        unsafe { self.cells.add(slot * self.stride) }
    }

    /// Writes one cell. Keys longer than `key_size` are cut to fit; callers
    /// validate before reaching this point.
    fn write_cell(&self, counter: u64, key: &str, value: Value) {
        let ptr = self.cell_ptr(counter);
        let key_len = key.len().min(self.key_size);
        let (tag, bits) = encode(value);
        unsafe {
            (ptr as *mut CellHeader).write(CellHeader {
                key_len: key_len as u32,
                tag,
                bits,
            });
            std::ptr::copy_nonoverlapping(
                key.as_ptr(),
                ptr.add(size_of::<CellHeader>()),
                key_len,
            );
        }
    }

    fn read_cell(&self, counter: u64) -> (String, Value) {
        let ptr = self.cell_ptr(counter);
        unsafe {
            let cell = (ptr as *const CellHeader).read();
            let key_len = (cell.key_len as usize).min(self.key_size);
            let key_bytes = std::slice::from_raw_parts(ptr.add(size_of::<CellHeader>()), key_len);
            (
                String::from_utf8_lossy(key_bytes).into_owned(),
                decode(cell.tag, cell.bits),
            )
        }
    }
}

impl Channel for SharedSlotStore {
    fn backend(&self) -> Backend {
        Backend::Shared
    }

    fn capacity(&self) -> u64 {
        self.capacity
    }

    fn key_size(&self) -> usize {
        self.key_size
    }

    fn is_running(&self) -> bool {
        let _guard = self.running_lock.lock();
        unsafe { (*self.header).running.load(Ordering::Acquire) == RUN_ACTIVE }
    }

    fn set_running(&self, running: bool) {
        let word = if running { RUN_ACTIVE } else { RUN_STOPPED };
        let _guard = self.running_lock.lock();
        unsafe {
            (*self.header).running.store(word, Ordering::Release);
        }
    }

    fn mark_ready(&self) -> bool {
        let _guard = self.running_lock.lock();
        let running = unsafe { &(*self.header).running };
        if running.load(Ordering::Acquire) == RUN_ABANDONED {
            return false;
        }
        running.store(RUN_ACTIVE, Ordering::Release);
        true
    }

    fn abandon(&self) {
        let _guard = self.running_lock.lock();
        unsafe {
            (*self.header).running.store(RUN_ABANDONED, Ordering::Release);
        }
    }

    fn write_index(&self) -> u64 {
        let _guard = self.write_lock.lock();
        unsafe { (*self.header).write_idx.load(Ordering::Acquire) }
    }

    fn read_index(&self) -> u64 {
        let _guard = self.read_lock.lock();
        unsafe { (*self.header).read_idx.load(Ordering::Acquire) }
    }

    fn cost(&self, frame: &Frame<'_>) -> u64 {
        match frame {
            Frame::Cell { .. } => 1,
            Frame::Object(fields) => fields.len() as u64 + 2,
        }
    }

    fn write(&self, start: u64, frame: &Frame<'_>) -> Result<u64> {
        match *frame {
            Frame::Cell { key, value } => {
                self.write_cell(start, key, value);
                Ok(1)
            }
            Frame::Object(fields) => {
                let count = Value::Int(fields.len() as i64);
                let mut counter = start;
                self.write_cell(counter, START_KEY, count);
                counter += 1;
                for &(key, value) in fields {
                    self.write_cell(counter, key, value);
                    counter += 1;
                }
                self.write_cell(counter, END_KEY, count);
                counter += 1;
                Ok(counter - start)
            }
        }
    }

    fn commit_write(&self, cells: u64) {
        let _guard = self.write_lock.lock();
        unsafe {
            (*self.header).write_idx.fetch_add(cells, Ordering::AcqRel);
        }
    }

    fn read(&self, counter: u64) -> Result<Delivery> {
        let (key, value) = self.read_cell(counter);
        Ok(Delivery::Cell { key, value })
    }

    fn commit_read(&self, cells: u64) {
        let _guard = self.read_lock.lock();
        unsafe {
            (*self.header).read_idx.fetch_add(cells, Ordering::AcqRel);
        }
    }
}

impl Drop for SharedSlotStore {
    fn drop(&mut self) {
        if self.is_creator {
            self.write_lock.destroy();
            self.read_lock.destroy();
            self.running_lock.destroy();
            log::debug!("Released shared slot store {}", self.shmem.get_os_id());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(store: &SharedSlotStore, from: u64, to: u64) -> Vec<(String, Value)> {
        (from..to)
            .map(|c| match store.read(c).unwrap() {
                Delivery::Cell { key, value } => (key, value),
                other => panic!("unexpected delivery {:?}", other),
            })
            .collect()
    }

    #[test]
    fn test_layout_alignment() {
        let layout = Layout::new(10, 5).unwrap();
        assert_eq!(layout.cells % align_of::<CellHeader>(), 0);
        assert_eq!(layout.stride % align_of::<CellHeader>(), 0);
        assert!(layout.stride >= size_of::<CellHeader>() + 5);
        assert_eq!(layout.total, layout.cells + layout.stride * 10);
    }

    #[test]
    fn test_value_encoding() {
        for value in [
            Value::Int(-42),
            Value::Int(i64::MAX),
            Value::Float(1.25),
            Value::text("batch").unwrap(),
            Value::text("").unwrap(),
        ] {
            let (tag, bits) = encode(value);
            assert_eq!(decode(tag, bits), value);
        }
    }

    #[test]
    fn test_cell_write_then_publish() {
        let store = SharedSlotStore::create(4, 8).unwrap();
        let r = store.reserve(1).unwrap();
        store
            .write(
                r.start,
                &Frame::Cell {
                    key: "x",
                    value: Value::Int(1),
                },
            )
            .unwrap();
        // 写入但未发布
        assert_eq!(store.write_index(), 0);
        store.commit_write(r.cells);
        assert_eq!(store.write_index(), 1);
        assert_eq!(pairs(&store, 0, 1), vec![("x".to_string(), Value::Int(1))]);
    }

    #[test]
    fn test_object_is_framed() {
        let store = SharedSlotStore::create(8, 8).unwrap();
        let fields = [("a", Value::Int(1)), ("b", Value::Float(2.0))];
        let frame = Frame::Object(&fields);
        assert_eq!(store.cost(&frame), 4);

        let r = store.reserve(store.cost(&frame)).unwrap();
        assert_eq!(store.write(r.start, &frame).unwrap(), 4);
        store.commit_write(r.cells);

        let cells = pairs(&store, 0, 4);
        assert_eq!(cells[0], (START_KEY.to_string(), Value::Int(2)));
        assert_eq!(cells[1], ("a".to_string(), Value::Int(1)));
        assert_eq!(cells[2], ("b".to_string(), Value::Float(2.0)));
        assert_eq!(cells[3], (END_KEY.to_string(), Value::Int(2)));
    }

    #[test]
    fn test_reserve_failure_leaves_indices() {
        let store = SharedSlotStore::create(4, 8).unwrap();
        let fields = [("a", Value::Int(1))];
        let frame = Frame::Object(&fields);
        let r = store.reserve(3).unwrap();
        store.write(r.start, &frame).unwrap();
        store.commit_write(3);

        let before = store.indices();
        let err = store.reserve(3).unwrap_err();
        assert!(matches!(
            err,
            TelemetryError::Backpressure {
                requested: 3,
                free: 1
            }
        ));
        assert_eq!(store.indices(), before);
    }

    #[test]
    fn test_wraparound_uses_modulo() {
        let store = SharedSlotStore::create(2, 8).unwrap();
        for i in 0..5u64 {
            let r = store.reserve(1).unwrap();
            assert_eq!(r.start, i);
            store
                .write(
                    r.start,
                    &Frame::Cell {
                        key: "k",
                        value: Value::Int(i as i64),
                    },
                )
                .unwrap();
            store.commit_write(1);
            assert_eq!(pairs(&store, i, i + 1)[0].1, Value::Int(i as i64));
            store.commit_read(1);
        }
        assert_eq!(store.indices(), crate::channel::Indices { read: 5, write: 5 });
    }

    #[test]
    fn test_oversized_key_is_cut_to_storage() {
        let store = SharedSlotStore::create(2, 4).unwrap();
        store.write_cell(0, "abcdefgh", Value::Int(0));
        store.commit_write(1);
        assert_eq!(pairs(&store, 0, 1)[0].0, "abcd");
    }

    #[test]
    fn test_running_flag() {
        let store = SharedSlotStore::create(2, 4).unwrap();
        assert!(!store.is_running());
        store.set_running(true);
        assert!(store.is_running());
        store.set_running(false);
        assert!(!store.is_running());
    }

    #[test]
    fn test_abandoned_store_refuses_ready() {
        let store = SharedSlotStore::create(2, 4).unwrap();
        assert!(store.mark_ready());
        assert!(store.is_running());

        store.abandon();
        assert!(!store.is_running());
        assert!(!store.mark_ready());
        assert!(!store.is_running());
    }

    #[test]
    fn test_open_by_os_id() {
        let store = SharedSlotStore::create(4, 8).unwrap();
        store.write_cell(0, "k", Value::Int(7));
        store.commit_write(1);

        let other = SharedSlotStore::open(store.os_id()).unwrap();
        other.validate_header().unwrap();
        assert_eq!(other.capacity(), 4);
        assert_eq!(other.key_size(), 8);
        assert_eq!(other.write_index(), 1);
        assert_eq!(pairs(&other, 0, 1)[0], ("k".to_string(), Value::Int(7)));

        other.commit_read(1);
        assert_eq!(store.read_index(), 1);
    }

    #[test]
    fn test_oversized_layout_is_an_error() {
        assert!(matches!(
            Layout::new(u64::MAX / 4, 64),
            Err(TelemetryError::Config { .. })
        ));
        assert!(Layout::new(4, usize::MAX).is_err());
        assert!(matches!(
            SharedSlotStore::create(u64::MAX / 4, 64),
            Err(TelemetryError::Config { .. })
        ));
    }

    #[test]
    fn test_rejects_zero_capacity() {
        assert!(matches!(
            SharedSlotStore::create(0, 8),
            Err(TelemetryError::Config { .. })
        ));
    }
}
