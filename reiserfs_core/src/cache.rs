//! Buffer cache (spec.md §4.1): the only path to block data. Every reader
//! and mutator of the tree goes through [`BufferCache::open`]/`read`, never
//! straight to [`crate::block::BlockDevice`].
//!
//! Re-architected per spec.md §9 ("Buffer cache hash collisions and LRU"):
//! an intrusive doubly-linked cycle in the original becomes a `HashMap` keyed
//! by `(dev, block)` plus an explicit LRU `VecDeque` of keys. A buffer is
//! only eligible for reuse when its pin count has dropped to zero.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use crate::block::BlockDevice;
use crate::error::CoreResult;

/// How many dirty buffers of the target device `BufferCache` will
/// opportunistically flush before giving up and growing the pool further.
const OPPORTUNISTIC_FLUSH_LIMIT: usize = 32;

/// Soft cap on live buffers before the cache starts reusing clean ones
/// instead of growing. Chosen generously; this is a user-space tool, not a
/// kernel page cache, so the budget exists mainly to bound memory on huge
/// volumes during repair.
const DEFAULT_SOFT_LIMIT: usize = 16384;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufKey {
    pub dev: u32,
    pub block: u32,
}

pub struct BufferInner {
    pub key: BufKey,
    pub data: Vec<u8>,
    pub dirty: bool,
    pub uptodate: bool,
    /// Pinned against writeback (used by the rollback log while it still
    /// needs the pre-image).
    pub no_flush: bool,
    pin: u32,
}

impl BufferInner {
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        self.dirty = true;
        &mut self.data
    }
}

/// Reference-counted handle to a cached block. Cloning increments the pin
/// count; dropping the last clone does not itself evict the buffer (use
/// [`BufferCache::close`] to make intent explicit and keep the pin/lru
/// bookkeeping in one place, matching spec.md's "releasing early... is a
/// programming error" rule for path buffers).
pub struct Buffer(Rc<RefCell<BufferInner>>);

impl Buffer {
    pub fn key(&self) -> BufKey {
        self.0.borrow().key
    }

    pub fn borrow(&self) -> std::cell::Ref<'_, BufferInner> {
        self.0.borrow()
    }

    pub fn borrow_mut(&self) -> std::cell::RefMut<'_, BufferInner> {
        self.0.borrow_mut()
    }

    pub fn pin_count(&self) -> u32 {
        self.0.borrow().pin
    }
}

impl Clone for Buffer {
    fn clone(&self) -> Self {
        self.0.borrow_mut().pin += 1;
        Buffer(self.0.clone())
    }
}

struct Slot {
    buf: Rc<RefCell<BufferInner>>,
}

pub struct BufferCache {
    devices: HashMap<u32, Rc<BlockDevice>>,
    slots: HashMap<BufKey, Slot>,
    /// Most-recently-used key at the back.
    lru: VecDeque<BufKey>,
    soft_limit: usize,
}

impl BufferCache {
    pub fn new() -> Self {
        BufferCache {
            devices: HashMap::new(),
            slots: HashMap::new(),
            lru: VecDeque::new(),
            soft_limit: DEFAULT_SOFT_LIMIT,
        }
    }

    pub fn register_device(&mut self, dev: u32, device: Rc<BlockDevice>) {
        self.devices.insert(dev, device);
    }

    fn touch_lru(&mut self, key: BufKey) {
        self.lru.retain(|k| *k != key);
        self.lru.push_back(key);
    }

    /// Look up a buffer without allocating or reading (spec.md: `find`).
    pub fn find(&mut self, dev: u32, block: u32) -> Option<Buffer> {
        let key = BufKey { dev, block };
        let rc = self.slots.get(&key)?.buf.clone();
        rc.borrow_mut().pin += 1;
        self.touch_lru(key);
        Some(Buffer(rc))
    }

    /// Open a buffer for `(dev, block)`, allocating a zero-filled one if
    /// none is cached yet. Pin count is incremented; release with `close`.
    pub fn open(&mut self, dev: u32, block: u32, size: usize) -> CoreResult<Buffer> {
        let key = BufKey { dev, block };
        if let Some(slot) = self.slots.get(&key) {
            slot.buf.borrow_mut().pin += 1;
            self.touch_lru(key);
            return Ok(Buffer(slot.buf.clone()));
        }

        self.make_room()?;

        let inner = BufferInner {
            key,
            data: vec![0u8; size],
            dirty: false,
            uptodate: false,
            no_flush: false,
            pin: 1,
        };
        let rc = Rc::new(RefCell::new(inner));
        self.slots.insert(key, Slot { buf: rc.clone() });
        self.lru.push_back(key);
        Ok(Buffer(rc))
    }

    /// Open and read from disk, marking `uptodate` on success.
    pub fn read(&mut self, dev: u32, block: u32, size: usize) -> CoreResult<Buffer> {
        let buf = self.open(dev, block, size)?;
        if !buf.borrow().uptodate {
            let device = self
                .devices
                .get(&dev)
                .expect("read: device not registered")
                .clone();
            let mut inner = buf.borrow_mut();
            device.read_block(block, &mut inner.data)?;
            inner.uptodate = true;
            inner.dirty = false;
        }
        Ok(buf)
    }

    /// Decrement the pin count; the buffer stays cached (clean or dirty)
    /// until reused or explicitly flushed.
    pub fn close(&mut self, buf: Buffer) {
        let mut inner = buf.0.borrow_mut();
        debug_assert!(inner.pin > 0, "close on unpinned buffer");
        inner.pin -= 1;
    }

    /// Write a buffer back if dirty, uptodate, and not pinned against
    /// flush. Clears the dirty flag on success.
    pub fn write(&mut self, buf: &Buffer) -> CoreResult<()> {
        let dev = buf.key().dev;
        let mut inner = buf.borrow_mut();
        if !(inner.dirty && inner.uptodate && !inner.no_flush) {
            return Ok(());
        }
        let device = self
            .devices
            .get(&dev)
            .expect("write: device not registered")
            .clone();
        device.write_block(inner.key.block, &inner.data)?;
        inner.dirty = false;
        Ok(())
    }

    /// Mark clean and detach, for deallocating a tree node whose block is
    /// about to be freed back to the bitmap.
    pub fn forget(&mut self, buf: Buffer) {
        let key = buf.key();
        {
            let mut inner = buf.borrow_mut();
            inner.dirty = false;
            inner.uptodate = false;
        }
        drop(buf);
        self.slots.remove(&key);
        self.lru.retain(|k| *k != key);
    }

    /// Drop all buffers of a device; warn (do not panic) on dirty ones,
    /// since invalidation is used during recovery where losing unflushed
    /// data may be intentional.
    pub fn invalidate_all(&mut self, dev: u32) {
        let keys: Vec<BufKey> = self
            .slots
            .keys()
            .copied()
            .filter(|k| k.dev == dev)
            .collect();
        for key in keys {
            if let Some(slot) = self.slots.get(&key) {
                if slot.buf.borrow().dirty {
                    log::warn!(
                        "invalidate_all: dropping dirty buffer dev={} block={}",
                        key.dev,
                        key.block
                    );
                }
            }
            self.slots.remove(&key);
        }
        self.lru.retain(|k| k.dev != dev);
    }

    /// Flush up to `OPPORTUNISTIC_FLUSH_LIMIT` dirty, unpinned buffers of
    /// `dev`, then reuse the first unpinned, clean slot found. Panics only
    /// when nothing at all is reusable (memory exhaustion with no
    /// reusable buffer, per spec.md).
    fn make_room(&mut self) -> CoreResult<()> {
        if self.slots.len() < self.soft_limit {
            return Ok(());
        }

        let mut flushed = 0;
        let candidates: Vec<BufKey> = self.lru.iter().copied().collect();
        for key in &candidates {
            if flushed >= OPPORTUNISTIC_FLUSH_LIMIT {
                break;
            }
            if let Some(slot) = self.slots.get(key) {
                let pinned_or_clean = {
                    let inner = slot.buf.borrow();
                    inner.pin > 0 || !inner.dirty
                };
                if pinned_or_clean {
                    continue;
                }
                let buf = Buffer(slot.buf.clone());
                self.write(&buf)?;
                flushed += 1;
            }
        }

        for key in &candidates {
            let reusable = self
                .slots
                .get(key)
                .map(|s| {
                    let inner = s.buf.borrow();
                    inner.pin == 0 && !inner.dirty
                })
                .unwrap_or(false);
            if reusable {
                self.slots.remove(key);
                self.lru.retain(|k| k != key);
                return Ok(());
            }
        }

        panic!("buffer cache exhausted: no reusable buffer under soft limit {}", self.soft_limit);
    }
}

impl Default for BufferCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    fn setup() -> (BufferCache, std::path::PathBuf, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("img");
        let dev = BlockDevice::create(&path, 512, 64).unwrap();
        let mut cache = BufferCache::new();
        cache.register_device(0, Rc::new(dev));
        (cache, path, dir)
    }

    #[test]
    fn open_close_reuse() {
        let (mut cache, _path, _dir) = setup();
        let b1 = cache.open(0, 5, 512).unwrap();
        assert_eq!(b1.pin_count(), 1);
        cache.close(b1);
        let b2 = cache.find(0, 5).unwrap();
        assert_eq!(b2.pin_count(), 1);
    }

    #[test]
    fn write_clears_dirty_only_when_uptodate() {
        let (mut cache, _path, _dir) = setup();
        let buf = cache.open(0, 2, 512).unwrap();
        buf.borrow_mut().data_mut()[0] = 7;
        assert!(buf.borrow().dirty);
        // Not uptodate (never read): write() must not write or clear dirty.
        cache.write(&buf).unwrap();
        assert!(buf.borrow().dirty);
    }

    #[test]
    fn forget_detaches_buffer() {
        let (mut cache, _path, _dir) = setup();
        let buf = cache.open(0, 9, 512).unwrap();
        cache.forget(buf);
        assert!(cache.find(0, 9).is_none());
    }
}
