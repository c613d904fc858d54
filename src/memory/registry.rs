use std::collections::BTreeMap;

use serde::Serialize;

use crate::error::{Error, Result};

/// Default alignment of every entry in a registry arena
pub const DEFAULT_ALIGNMENT: usize = 64;

/// Placement of one booked key inside the arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RegistryEntry {
    pub offset: usize,
    pub size: usize,
}

/// Arena accumulator turning keyed size requests into byte offsets
///
/// Entries are laid out back to back in booking order, each starting at an
/// offset aligned to `alignment`. Once planning is done the registry is only
/// read, so it can be shared between execution contexts that each resolve
/// offsets against their own base pointer through a [`Grantor`].
#[derive(Debug, Clone)]
pub struct Registry {
    alignment: usize,
    entries: BTreeMap<usize, RegistryEntry>,
    size: usize,
}

impl Default for Registry {
    fn default() -> Self {
        Self {
            alignment: DEFAULT_ALIGNMENT,
            entries: BTreeMap::new(),
            size: 0,
        }
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry whose entries are aligned to `alignment` bytes
    pub fn with_alignment(alignment: usize) -> Result<Self> {
        if !alignment.is_power_of_two() {
            return Err(Error::InvalidConfig(format!(
                "Registry alignment must be a power of two, got {}",
                alignment
            )));
        }
        Ok(Self {
            alignment,
            ..Self::default()
        })
    }

    /// Reserve `size` bytes under `key`
    ///
    /// Zero sizes are ignored. Booking an existing key again may only grow it
    /// while it is still the last entry of the arena.
    pub fn book(&mut self, key: usize, size: usize) -> Result<()> {
        if size == 0 {
            return Ok(());
        }

        let arena_end = self.size;
        if let Some(entry) = self.entries.get_mut(&key) {
            if entry.size >= size {
                return Ok(());
            }
            if entry.offset + entry.size != arena_end {
                return Err(Error::InvalidArgument(format!(
                    "Cannot grow registry key {} from {} to {} bytes: entry is not last",
                    key, entry.size, size
                )));
            }
            entry.size = size;
            self.size = entry.offset + size;
            return Ok(());
        }

        let overflow = || {
            Error::InvalidArgument(format!(
                "Integer overflow booking {} bytes for key {} at arena size {}",
                size, key, self.size
            ))
        };
        let offset = self
            .size
            .checked_add(self.alignment - 1)
            .map(|end| end & !(self.alignment - 1))
            .ok_or_else(overflow)?;
        let end = offset.checked_add(size).ok_or_else(overflow)?;

        self.entries.insert(key, RegistryEntry { offset, size });
        self.size = end;
        Ok(())
    }

    pub fn get(&self, key: usize) -> Option<RegistryEntry> {
        self.entries.get(&key).copied()
    }

    /// Byte offset of `key` relative to the arena base
    pub fn offset(&self, key: usize) -> Option<usize> {
        self.entries.get(&key).map(|entry| entry.offset)
    }

    /// Total footprint in bytes the caller must allocate
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn alignment(&self) -> usize {
        self.alignment
    }

    /// Number of booked keys
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Booked entries in key order
    pub fn entries(&self) -> impl Iterator<Item = (usize, RegistryEntry)> + '_ {
        self.entries.iter().map(|(&key, &entry)| (key, entry))
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.size = 0;
    }

    /// Accessor resolving keys against `base_ptr`
    pub fn grantor(&self, base_ptr: *mut u8) -> Grantor<'_> {
        Grantor {
            registry: self,
            base_ptr,
        }
    }
}

/// Resolves registry keys to addresses inside one concrete arena
///
/// The grantor never dereferences the base pointer; it only offsets it.
#[derive(Debug, Clone, Copy)]
pub struct Grantor<'a> {
    registry: &'a Registry,
    base_ptr: *mut u8,
}

impl<'a> Grantor<'a> {
    /// Address of `key`, `None` if the key was never booked
    pub fn get(&self, key: usize) -> Option<*mut u8> {
        self.registry
            .offset(key)
            .map(|offset| self.base_ptr.wrapping_add(offset))
    }

    pub fn offset(&self, key: usize) -> Option<usize> {
        self.registry.offset(key)
    }

    pub fn base_ptr(&self) -> *mut u8 {
        self.base_ptr
    }

    pub fn registry(&self) -> &'a Registry {
        self.registry
    }
}
