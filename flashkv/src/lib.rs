#![cfg_attr(not(test), no_std)]

//! A log-structured key/value store over raw flash, grounded on
//! `ports/kvstore/flash_kvstore.c`.
//!
//! A partition is split into a meta region and a data region. Writing a key
//! appends a 16-byte [`MetaEntry`] (murmur + djb2 hash pair, data offset,
//! data length) to the first free meta slot and the value bytes to the next
//! free, alignment-rounded spot in the data region — nothing is ever
//! overwritten in place, so a torn write during a power loss can only ever
//! leave a half-written *new* entry behind, never corrupt an existing one.
//! Looking a key up scans the meta region and keeps the *last* matching
//! entry, since a newer write for the same key is simply appended after the
//! old one. Erasing a key writes a zero-length entry for it (or, with
//! `OVERWRITE` set, zeroes its hash pair directly) so it drops out of future
//! scans.
//!
//! Meta entries never shrink, so the meta region eventually fills up even
//! for one key rewritten repeatedly. [`FlashKvStore::reclaim`] (invoked
//! automatically by `write` on [`FlashKvError::NoSpace`]) copies every
//! live, deduplicated key into a scratch partition and back, the same
//! "rewrite through a spare partition" compaction `move_partition` performs
//! in the original.

use common::hash::key_hashes;

/// Meta entries are written and read in one fixed-size chunk. The original
/// additionally pads `struct meta_entry` out to `FLASH_LINE_ALIGN_BYTES` when
/// that exceeds 16; every layout this crate targets uses the 16-byte
/// default, so the padding branch doesn't apply here.
pub const ENTRY_SIZE: usize = 16;

/// A byte pattern never written by this store used as-is, so it can double
/// as the free-slot sentinel — erased NOR flash reads back as all-ones.
const FREE_MARK: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashKvError<E> {
    Flash(E),
    NotFound,
    NoSpace,
    /// `reclaim` was asked for but no scratch partition was configured.
    NotSupported,
    InvalidParam,
}

/// The storage driver this crate is built against. Offsets are relative to
/// the start of whatever backing store implements it; [`FlashKvStore`]
/// tracks partition boundaries on top.
pub trait FlashApi {
    type Error: core::fmt::Debug;

    fn erase(&mut self, offset: usize, size: usize) -> Result<(), Self::Error>;
    fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), Self::Error>;
    fn read(&mut self, offset: usize, buf: &mut [u8]) -> Result<(), Self::Error>;
    fn size(&self) -> usize;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MetaEntry {
    hash_murmur: u32,
    hash_djb2: u32,
    offset: u32,
    len: u32,
}

impl MetaEntry {
    const FREE: MetaEntry = MetaEntry {
        hash_murmur: FREE_MARK,
        hash_djb2: FREE_MARK,
        offset: 0,
        len: 0,
    };

    fn is_free(&self) -> bool {
        self.hash_murmur == FREE_MARK && self.hash_djb2 == FREE_MARK
    }

    fn to_bytes(self) -> [u8; ENTRY_SIZE] {
        let mut buf = [0u8; ENTRY_SIZE];
        buf[0..4].copy_from_slice(&self.hash_murmur.to_le_bytes());
        buf[4..8].copy_from_slice(&self.hash_djb2.to_le_bytes());
        buf[8..12].copy_from_slice(&self.offset.to_le_bytes());
        buf[12..16].copy_from_slice(&self.len.to_le_bytes());
        buf
    }

    fn from_bytes(buf: &[u8; ENTRY_SIZE]) -> Self {
        Self {
            hash_murmur: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            hash_djb2: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            offset: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            len: u32::from_le_bytes(buf[12..16].try_into().unwrap()),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Meta {
    entry: MetaEntry,
    /// Absolute offset of the meta entry itself, not the value it describes.
    offset: usize,
}

/// A region of flash split into a meta slice and a data slice. Meta takes
/// roughly 6% of the partition, matching `flash_kvstore_new`'s `size >> 4`.
#[derive(Debug, Clone, Copy)]
struct Partition {
    base: usize,
    meta_size: usize,
    data_size: usize,
}

impl Partition {
    fn covering(base: usize, size: usize) -> Self {
        let meta_size = size >> 4;
        Self {
            base,
            meta_size,
            data_size: size - meta_size,
        }
    }

    fn meta_start(&self) -> usize {
        self.base
    }

    fn meta_end(&self) -> usize {
        self.base + self.meta_size
    }

    fn data_start(&self) -> usize {
        self.base + self.meta_size
    }
}

fn align_up(value: u32, align: u32) -> u32 {
    (value + align - 1) / align * align
}

fn read_entry<F: FlashApi>(flash: &mut F, offset: usize) -> Result<MetaEntry, FlashKvError<F::Error>> {
    let mut buf = [0u8; ENTRY_SIZE];
    flash.read(offset, &mut buf).map_err(FlashKvError::Flash)?;
    Ok(MetaEntry::from_bytes(&buf))
}

fn find_key<F: FlashApi>(flash: &mut F, part: &Partition, key: &[u8]) -> Result<Meta, FlashKvError<F::Error>> {
    let (hash_murmur, hash_djb2) = key_hashes(key);
    let mut found: Option<Meta> = None;
    let mut keycnt = 0u32;

    let mut offset = part.meta_start();
    while offset < part.meta_end() {
        let entry = read_entry(flash, offset)?;
        if entry.hash_murmur == hash_murmur && entry.hash_djb2 == hash_djb2 {
            found = Some(Meta { entry, offset });
            keycnt += 1;
        }
        offset += ENTRY_SIZE;
    }

    match found {
        Some(meta) if keycnt > 0 && meta.entry.len > 0 => Ok(meta),
        _ => Err(FlashKvError::NotFound),
    }
}

/// Finds the last meta entry in `part` sharing `meta`'s hash pair, updating
/// `meta` in place. Used by `move_partition` both to resolve duplicate raw
/// entries for the same key down to the canonical (most recent) one, and to
/// check whether a key has already been copied into the destination
/// partition.
fn find_meta<F: FlashApi>(flash: &mut F, part: &Partition, meta: &mut Meta) -> Result<(), FlashKvError<F::Error>> {
    let mut keycnt = 0u32;
    let mut offset = part.meta_start();
    while offset < part.meta_end() {
        let entry = read_entry(flash, offset)?;
        if entry.hash_murmur == meta.entry.hash_murmur && entry.hash_djb2 == meta.entry.hash_djb2 {
            meta.entry = entry;
            meta.offset = offset;
            keycnt += 1;
        }
        offset += ENTRY_SIZE;
    }

    if keycnt > 0 {
        Ok(())
    } else {
        Err(FlashKvError::NotFound)
    }
}

fn alloc_entry<F: FlashApi>(flash: &mut F, part: &Partition, size: usize) -> Result<Meta, FlashKvError<F::Error>> {
    let mut slot: Option<usize> = None;
    let mut new_data_offset: u32 = 0;

    let mut offset = part.meta_start();
    while offset < part.meta_end() {
        let entry = read_entry(flash, offset)?;
        if entry.is_free() {
            if slot.is_none() {
                slot = Some(offset);
            }
        } else {
            let t = align_up(entry.offset + entry.len, ENTRY_SIZE as u32);
            if t > new_data_offset && (t as usize) < part.data_size {
                new_data_offset = t;
            }
        }
        offset += ENTRY_SIZE;
    }

    let slot = slot.ok_or(FlashKvError::NoSpace)?;
    if (new_data_offset as usize) + size >= part.data_size {
        return Err(FlashKvError::NoSpace);
    }

    Ok(Meta {
        entry: MetaEntry {
            offset: new_data_offset,
            len: size as u32,
            ..MetaEntry::FREE
        },
        offset: slot,
    })
}

fn write_meta<F: FlashApi>(flash: &mut F, meta: &Meta) -> Result<(), FlashKvError<F::Error>> {
    flash.write(meta.offset, &meta.entry.to_bytes()).map_err(FlashKvError::Flash)
}

fn delete_meta<F: FlashApi>(flash: &mut F, meta: &mut Meta) -> Result<(), FlashKvError<F::Error>> {
    meta.entry.hash_murmur = 0;
    meta.entry.hash_djb2 = 0;
    write_meta(flash, meta)
}

fn write_value<F: FlashApi>(
    flash: &mut F,
    part: &Partition,
    data: Option<&[u8]>,
    meta: &Meta,
) -> Result<(), FlashKvError<F::Error>> {
    let Some(data) = data else { return Ok(()) };
    if meta.entry.len == 0 {
        return Ok(());
    }
    flash
        .write(part.data_start() + meta.entry.offset as usize, data)
        .map_err(FlashKvError::Flash)
}

fn move_partition<F: FlashApi>(
    from_flash: &mut F,
    from: &Partition,
    to_flash: &mut F,
    to: &Partition,
) -> Result<(), FlashKvError<F::Error>> {
    to_flash.erase(to.base, to.meta_size + to.data_size).map_err(FlashKvError::Flash)?;

    let mut offset = from.meta_start();
    while offset < from.meta_end() {
        let entry = read_entry(from_flash, offset)?;
        offset += ENTRY_SIZE;

        if entry.is_free() {
            continue;
        }

        let mut meta = Meta { entry, offset: offset - ENTRY_SIZE };
        if find_meta(from_flash, from, &mut meta).is_err() {
            continue;
        }
        if meta.entry.len == 0 || meta.entry.offset as usize > from.data_size {
            continue;
        }
        if find_meta(to_flash, to, &mut meta.clone()).is_ok() {
            continue;
        }

        let alloc = alloc_entry(to_flash, to, meta.entry.len as usize)?;
        let new_meta = Meta {
            entry: MetaEntry {
                hash_murmur: meta.entry.hash_murmur,
                hash_djb2: meta.entry.hash_djb2,
                ..alloc.entry
            },
            ..alloc
        };
        write_meta(to_flash, &new_meta)?;

        let mut copied = 0u32;
        while copied < new_meta.entry.len {
            let chunk = core::cmp::min(ENTRY_SIZE as u32, new_meta.entry.len - copied) as usize;
            let mut buf = [0u8; ENTRY_SIZE];
            from_flash
                .read(from.data_start() + meta.entry.offset as usize + copied as usize, &mut buf[..chunk])
                .map_err(FlashKvError::Flash)?;
            to_flash
                .write(to.data_start() + new_meta.entry.offset as usize + copied as usize, &buf[..chunk])
                .map_err(FlashKvError::Flash)?;
            copied += chunk as u32;
        }
    }

    Ok(())
}

/// A key/value store carved out of one or two [`FlashApi`] regions: the main
/// partition, plus an optional scratch partition used to compact it.
/// `OVERWRITE` selects how deletion (and rewriting a key with a brand-new
/// value) reclaims the old entry: `true` zeroes its hash pair in place right
/// away; `false` (the default, matching the original's non-`FLASH_OVERWRITE`
/// build) just lets it age out the next time `reclaim` runs, trading a
/// slightly larger meta footprint for never rewriting a flash line that
/// might still be mid-program.
pub struct FlashKvStore<F: FlashApi, const OVERWRITE: bool = false> {
    flash: F,
    storage: Partition,
    scratch: Option<(F, Partition)>,
}

impl<F: FlashApi, const OVERWRITE: bool> FlashKvStore<F, OVERWRITE> {
    pub fn new(flash: F, scratch: Option<F>) -> Self {
        let storage = Partition::covering(0, flash.size());
        let scratch = scratch.map(|s| {
            let part = Partition::covering(0, s.size());
            (s, part)
        });
        Self { flash, storage, scratch }
    }

    fn reclaim(&mut self) -> Result<(), FlashKvError<F::Error>> {
        let Some((scratch_flash, scratch_part)) = self.scratch.as_mut() else {
            return Err(FlashKvError::NotSupported);
        };

        move_partition(&mut self.flash, &self.storage, scratch_flash, scratch_part)?;

        // Bail out if reclaiming didn't free enough room even for one more entry.
        alloc_entry(scratch_flash, scratch_part, ENTRY_SIZE).map_err(|_| FlashKvError::NoSpace)?;

        move_partition(scratch_flash, scratch_part, &mut self.flash, &self.storage)
    }

    fn do_write(&mut self, key: &[u8], value: Option<&[u8]>, size: usize) -> Result<(), FlashKvError<F::Error>> {
        let mut new_meta = match alloc_entry(&mut self.flash, &self.storage, size) {
            Ok(meta) => meta,
            Err(FlashKvError::NoSpace) => {
                self.reclaim()?;
                alloc_entry(&mut self.flash, &self.storage, size)?
            }
            Err(e) => return Err(e),
        };

        if OVERWRITE {
            if let Ok(mut old) = find_key(&mut self.flash, &self.storage, key) {
                delete_meta(&mut self.flash, &mut old)?;
            }
        }

        let (hash_murmur, hash_djb2) = key_hashes(key);
        new_meta.entry.hash_murmur = hash_murmur;
        new_meta.entry.hash_djb2 = hash_djb2;

        write_meta(&mut self.flash, &new_meta)?;
        write_value(&mut self.flash, &self.storage, value, &new_meta)?;
        Ok(())
    }

    pub fn write(&mut self, key: &[u8], value: &[u8]) -> Result<(), FlashKvError<F::Error>> {
        if key.is_empty() {
            return Err(FlashKvError::InvalidParam);
        }
        self.do_write(key, Some(value), value.len())
    }

    pub fn read(&mut self, key: &[u8], buf: &mut [u8]) -> Result<usize, FlashKvError<F::Error>> {
        let meta = find_key(&mut self.flash, &self.storage, key)?;
        let len = core::cmp::min(buf.len(), meta.entry.len as usize);
        self.flash
            .read(self.storage.data_start() + meta.entry.offset as usize, &mut buf[..len])
            .map_err(FlashKvError::Flash)?;
        Ok(len)
    }

    pub fn erase(&mut self, key: &[u8]) -> Result<(), FlashKvError<F::Error>> {
        if OVERWRITE {
            let mut meta = find_key(&mut self.flash, &self.storage, key)?;
            delete_meta(&mut self.flash, &mut meta)
        } else {
            find_key(&mut self.flash, &self.storage, key)?;
            self.do_write(key, None, 0)
        }
    }
}
