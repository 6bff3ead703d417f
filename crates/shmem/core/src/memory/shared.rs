// Shmem
// Copyright (C) 2025 Shmem contributors

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.

// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

use std::any::Any;
use std::fs::OpenOptions;
use std::mem::size_of;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use memmap2::{MmapMut, MmapOptions};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::fatal;
use crate::memory::error::{MemoryError, MemoryResult};
use crate::memory::layout::{calculate_aligned_size, max_alignment};
use crate::memory::proxy::MemoryResourceProxy;
use crate::memory::registry::{MemoryResourceRegistry, NULL_RESOURCE_ID};
use crate::memory::resource::{ManagedMemoryResource, MemoryResource};

/// Bookkeeping placed at the start of every shared region.
///
/// `#[repr(C)]` and free of process-local state, so every process mapping the
/// region reads the same layout. The allocation cursor counts bytes from the
/// region base and starts past this block's own (alignment-padded) space.
#[repr(C)]
pub(crate) struct ControlBlock {
    pub(crate) already_allocated_bytes: AtomicUsize,
    pub(crate) proxy: MemoryResourceProxy,
}

/// Space reserved for the control block, padded so user data starts at
/// worst-case alignment.
pub(crate) fn management_space() -> usize {
    calculate_aligned_size(size_of::<ControlBlock>(), max_alignment())
}

/// One bump-allocation step over `[start, end)`: rounds `start` up to
/// `alignment` and places `bytes` there. Returns the allocation address and
/// the total bytes consumed (padding included), or `None` when the request
/// does not fit.
pub(crate) fn bump_allocation(start: usize, end: usize, bytes: usize, alignment: usize) -> Option<(usize, usize)> {
    debug_assert!(alignment.is_power_of_two());
    let aligned = start.checked_add(alignment - 1)? & !(alignment - 1);
    let allocation_end = aligned.checked_add(bytes)?;
    (allocation_end <= end).then(|| (aligned, allocation_end - start))
}

/// Monotonic allocator over a file-backed shared memory region.
///
/// Allocation only moves a cursor forward; deallocation is bookkeeping and
/// returns nothing to the region. This keeps the allocator state a single
/// counter that is meaningful to every process mapping the region.
///
/// Allocation is serialized against other threads of this process. Writers in
/// other processes require external synchronization; the region itself
/// carries no interprocess lock.
pub struct SharedMemoryResource {
    _map: MmapMut, // Keeps the mapping alive; base and length point into it
    base: NonNull<u8>,
    region_len: usize,
    memory_identifier: u64,
    path: Option<PathBuf>,
    deallocated_bytes: AtomicUsize, // Diagnostic only, never reclaimed
    allocation_lock: Mutex<()>,
}

// The raw base pointer refers to the mapping owned by this struct.
unsafe impl Send for SharedMemoryResource {}
unsafe impl Sync for SharedMemoryResource {}

impl SharedMemoryResource {
    /// Creates a new region backed by a new file at `path` with room for
    /// `user_space_bytes` of user data, and registers it under the hash of
    /// the path. Fails if the file already exists.
    pub fn create(path: impl AsRef<Path>, user_space_bytes: usize) -> MemoryResult<Arc<Self>> {
        let path = path.as_ref();
        let total = management_space()
            .checked_add(user_space_bytes)
            .ok_or_else(|| MemoryError::CreationFailed(format!("requested user space of {user_space_bytes} bytes overflows")))?;
        let file = OpenOptions::new().read(true).write(true).create_new(true).open(path).map_err(|source| MemoryError::Io {
            path: path.display().to_string(),
            source,
        })?;
        file.set_len(total as u64).map_err(|source| MemoryError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let map = unsafe { MmapOptions::new().len(total).map_mut(&file) }.map_err(|error| MemoryError::MappingError(error.to_string()))?;
        debug!(path = %path.display(), total, "Created shared memory region");
        Self::from_mapping(map, hash_path(path), Some(path.to_path_buf()), true)
    }

    /// Opens an existing region created by a peer (or an earlier incarnation
    /// of this process). The control block is taken as found; its cursor
    /// already reflects the peer's allocations.
    pub fn open(path: impl AsRef<Path>) -> MemoryResult<Arc<Self>> {
        let path = path.as_ref();
        let file = OpenOptions::new().read(true).write(true).open(path).map_err(|source| MemoryError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let total = file
            .metadata()
            .map_err(|source| MemoryError::Io {
                path: path.display().to_string(),
                source,
            })?
            .len() as usize;
        if total < management_space() {
            return Err(MemoryError::RegionTooSmall {
                path: path.display().to_string(),
                actual: total,
                needed: management_space(),
            });
        }
        let map = unsafe { MmapOptions::new().len(total).map_mut(&file) }.map_err(|error| MemoryError::MappingError(error.to_string()))?;
        debug!(path = %path.display(), total, "Opened shared memory region");
        Self::from_mapping(map, hash_path(path), Some(path.to_path_buf()), false)
    }

    /// Creates the region, or opens it when the backing file already exists.
    pub fn create_or_open(path: impl AsRef<Path>, user_space_bytes: usize) -> MemoryResult<Arc<Self>> {
        let path = path.as_ref();
        match Self::create(path, user_space_bytes) {
            Err(MemoryError::Io { source, .. }) if source.kind() == std::io::ErrorKind::AlreadyExists => Self::open(path),
            result => result,
        }
    }

    /// Creates a region with no filesystem entry, registered under the given
    /// identifier. The identifier must be non-zero and agreed upon out of
    /// band.
    pub fn create_anonymous(memory_identifier: u64, user_space_bytes: usize) -> MemoryResult<Arc<Self>> {
        if memory_identifier == NULL_RESOURCE_ID {
            fatal!("Anonymous shared memory region requires a non-null identifier");
        }
        let total = management_space()
            .checked_add(user_space_bytes)
            .ok_or_else(|| MemoryError::CreationFailed(format!("requested user space of {user_space_bytes} bytes overflows")))?;
        let map = MmapOptions::new().len(total).map_anon().map_err(|error| MemoryError::MappingError(error.to_string()))?;
        Self::from_mapping(map, memory_identifier, None, true)
    }

    fn from_mapping(mut map: MmapMut, memory_identifier: u64, path: Option<PathBuf>, initialize: bool) -> MemoryResult<Arc<Self>> {
        let region_len = map.len();
        let Some(base) = NonNull::new(map.as_mut_ptr()) else {
            return Err(MemoryError::MappingError("mapping produced a null base address".into()));
        };
        if initialize {
            let control_block = ControlBlock {
                already_allocated_bytes: AtomicUsize::new(management_space()),
                proxy: MemoryResourceProxy::new(memory_identifier),
            };
            unsafe { base.as_ptr().cast::<ControlBlock>().write(control_block) };
        } else {
            // A found control block is only trusted after a sanity check:
            // the cursor of an initialized region always lies between its
            // own management space and the region end. Anything else is a
            // zeroed or corrupt file, not a peer's region.
            let found = unsafe { &*base.as_ptr().cast::<ControlBlock>() };
            let cursor = found.already_allocated_bytes.load(Ordering::Relaxed);
            if cursor < management_space() || cursor > region_len {
                return Err(MemoryError::OpeningFailed(format!(
                    "control block cursor {cursor} is outside {}..{region_len}, region was never initialized or is corrupt",
                    management_space()
                )));
            }
        }
        let resource = Arc::new(Self {
            _map: map,
            base,
            region_len,
            memory_identifier,
            path,
            deallocated_bytes: AtomicUsize::new(0),
            allocation_lock: Mutex::new(()),
        });
        if !initialize && resource.control_block().proxy.id() != memory_identifier {
            warn!(
                found = resource.control_block().proxy.id(),
                expected = memory_identifier,
                "Control block proxy does not match the opened path; region was created under a different name"
            );
        }
        let managed: Arc<dyn ManagedMemoryResource> = resource.clone();
        if !MemoryResourceRegistry::global().insert(memory_identifier, &managed) {
            fatal!("{} cannot be registered: identifier {memory_identifier} is already in use in this process", resource.identification());
        }
        Ok(resource)
    }

    pub fn memory_identifier(&self) -> u64 {
        self.memory_identifier
    }

    /// Total deallocated bytes reported to this resource. Nothing is ever
    /// reclaimed; the counter exists for leak diagnostics.
    pub fn deallocated_bytes(&self) -> usize {
        self.deallocated_bytes.load(Ordering::Relaxed)
    }

    /// Removes the backing file from the filesystem. The mapping stays valid
    /// until every process unmaps it. No-op for anonymous regions.
    pub fn unlink_filesystem_entry(&self) -> MemoryResult<()> {
        match &self.path {
            Some(path) => std::fs::remove_file(path).map_err(|source| MemoryError::Io {
                path: path.display().to_string(),
                source,
            }),
            None => Ok(()),
        }
    }

    fn control_block(&self) -> &ControlBlock {
        // Written in from_mapping (or by the creating peer) before any use.
        unsafe { &*self.base.as_ptr().cast::<ControlBlock>() }
    }

    fn identification(&self) -> String {
        match &self.path {
            Some(path) => format!("shared memory region {}", path.display()),
            None => format!("anonymous shared memory region {}", self.memory_identifier),
        }
    }
}

impl MemoryResource for SharedMemoryResource {
    fn do_allocate(&self, bytes: usize, alignment: usize) -> NonNull<u8> {
        let _guard = self.allocation_lock.lock();
        let control_block = self.control_block();
        let cursor = control_block.already_allocated_bytes.load(Ordering::Relaxed);
        let base = self.base.as_ptr() as usize;
        match bump_allocation(base + cursor, base + self.region_len, bytes, alignment) {
            Some((address, consumed)) => {
                control_block.already_allocated_bytes.store(cursor + consumed, Ordering::Relaxed);
                // Lies strictly inside the mapping, hence non-null.
                unsafe { NonNull::new_unchecked(address as *mut u8) }
            }
            None => {
                let free = self.region_len.saturating_sub(cursor);
                fatal!(
                    "{} exhausted: requested {bytes} bytes aligned to {alignment}, {free} of {} usable bytes free",
                    self.identification(),
                    self.region_len - management_space()
                );
            }
        }
    }

    fn do_deallocate(&self, _pointer: NonNull<u8>, bytes: usize, _alignment: usize) {
        // Monotonic resource: the space is not reusable.
        self.deallocated_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    fn is_equal(&self, other: &dyn MemoryResource) -> bool {
        other.as_any().downcast_ref::<Self>().is_some_and(|other| other.base == self.base)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl ManagedMemoryResource for SharedMemoryResource {
    fn proxy(&self) -> &MemoryResourceProxy {
        // The proxy lives inside the region so peers can point at it.
        &self.control_block().proxy
    }

    fn base_address(&self) -> NonNull<u8> {
        self.base
    }

    fn usable_base_address(&self) -> NonNull<u8> {
        // Management space is in range and non-zero-based, hence non-null.
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(management_space())) }
    }

    fn end_address(&self) -> NonNull<u8> {
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(self.region_len)) }
    }

    fn user_allocated_bytes(&self) -> usize {
        self.control_block().already_allocated_bytes.load(Ordering::Relaxed) - management_space()
    }
}

impl Drop for SharedMemoryResource {
    fn drop(&mut self) {
        MemoryResourceRegistry::global().remove(self.memory_identifier);
    }
}

/// FNV-1a over the path bytes. Stable across processes, so every peer opening
/// the same path derives the same resource identifier.
fn hash_path(path: &Path) -> u64 {
    const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = FNV_OFFSET_BASIS;
    for byte in path.as_os_str().as_encoded_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    if hash == NULL_RESOURCE_ID {
        fatal!("Path {} hashes to the null resource identifier", path.display());
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::resource::ManagedMemoryResourceExt;
    use crate::memory::testing::next_test_id;
    use tempfile::TempDir;

    fn region_path(dir: &TempDir, name: &str) -> PathBuf {
        dir.path().join(name)
    }

    #[test]
    fn test_create_allocates_aligned_and_monotonic() {
        let dir = TempDir::new().unwrap();
        let resource = SharedMemoryResource::create(region_path(&dir, "region"), 4096).unwrap();
        let first = resource.allocate(10, 8);
        let second = resource.allocate(8, 8);
        assert_eq!(first.as_ptr() as usize % 8, 0);
        assert_eq!(second.as_ptr() as usize % 8, 0);
        assert!((second.as_ptr() as usize) > first.as_ptr() as usize);
        // 10 bytes, then 6 padding to realign, then 8 bytes.
        assert_eq!(resource.user_allocated_bytes(), 24);
    }

    #[test]
    fn test_deallocate_reclaims_nothing() {
        let dir = TempDir::new().unwrap();
        let resource = SharedMemoryResource::create(region_path(&dir, "region"), 4096).unwrap();
        let allocation = resource.allocate(64, 8);
        resource.deallocate(allocation, 64, 8);
        assert_eq!(resource.user_allocated_bytes(), 64);
        assert_eq!(resource.deallocated_bytes(), 64);
        let next = resource.allocate(8, 8);
        assert!((next.as_ptr() as usize) >= allocation.as_ptr() as usize + 64);
    }

    #[test]
    #[should_panic(expected = "exhausted")]
    fn test_exhaustion_terminates() {
        let dir = TempDir::new().unwrap();
        let resource = SharedMemoryResource::create(region_path(&dir, "region"), 64).unwrap();
        let _ = resource.allocate(128, 8);
    }

    #[test]
    fn test_open_sees_peer_data() {
        let dir = TempDir::new().unwrap();
        let path = region_path(&dir, "region");
        {
            let creator = SharedMemoryResource::create(&path, 4096).unwrap();
            let value = creator.construct(0xDEAD_BEEFu64);
            assert_eq!(value.as_ptr() as usize, creator.usable_base_address().as_ptr() as usize);
        }
        let opened = SharedMemoryResource::open(&path).unwrap();
        // The cursor persisted through the file.
        assert_eq!(opened.user_allocated_bytes(), 8);
        let value = opened.usable_base_address().as_ptr().cast::<u64>();
        assert_eq!(unsafe { *value }, 0xDEAD_BEEF);
    }

    #[test]
    fn test_create_or_open_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = region_path(&dir, "region");
        {
            let first = SharedMemoryResource::create_or_open(&path, 4096).unwrap();
            let _ = first.allocate(16, 8);
        }
        let second = SharedMemoryResource::create_or_open(&path, 4096).unwrap();
        assert_eq!(second.user_allocated_bytes(), 16);
    }

    #[test]
    fn test_create_fails_on_existing_file() {
        let dir = TempDir::new().unwrap();
        let path = region_path(&dir, "region");
        let _first = SharedMemoryResource::create(&path, 128).unwrap();
        let second = SharedMemoryResource::create(&path, 128);
        assert!(matches!(second, Err(MemoryError::Io { .. })));
    }

    #[test]
    fn test_open_rejects_truncated_region() {
        let dir = TempDir::new().unwrap();
        let path = region_path(&dir, "region");
        std::fs::write(&path, [0u8; 4]).unwrap();
        let result = SharedMemoryResource::open(&path);
        assert!(matches!(result, Err(MemoryError::RegionTooSmall { .. })));
    }

    #[test]
    fn test_open_rejects_uninitialized_region() {
        // Correct size, but nobody ever wrote a control block.
        let dir = TempDir::new().unwrap();
        let path = region_path(&dir, "region");
        std::fs::write(&path, vec![0u8; 4096]).unwrap();
        let result = SharedMemoryResource::open(&path);
        assert!(matches!(result, Err(MemoryError::OpeningFailed(_))));
    }

    #[test]
    fn test_open_rejects_cursor_beyond_region() {
        let dir = TempDir::new().unwrap();
        let path = region_path(&dir, "region");
        let mut bytes = vec![0u8; 4096];
        bytes[..std::mem::size_of::<usize>()].copy_from_slice(&usize::MAX.to_ne_bytes());
        std::fs::write(&path, &bytes).unwrap();
        let result = SharedMemoryResource::open(&path);
        assert!(matches!(result, Err(MemoryError::OpeningFailed(_))));
    }

    #[test]
    fn test_anonymous_region() {
        let resource = SharedMemoryResource::create_anonymous(next_test_id(), 1024).unwrap();
        let allocation = resource.allocate(32, 16);
        assert_eq!(allocation.as_ptr() as usize % 16, 0);
        assert!(resource.unlink_filesystem_entry().is_ok());
    }

    #[test]
    fn test_unlink_removes_backing_file() {
        let dir = TempDir::new().unwrap();
        let path = region_path(&dir, "region");
        let resource = SharedMemoryResource::create(&path, 128).unwrap();
        resource.unlink_filesystem_entry().unwrap();
        assert!(!path.exists());
        // The mapping stays usable.
        let _ = resource.allocate(16, 8);
    }

    #[test]
    fn test_distinct_paths_coexist() {
        let dir = TempDir::new().unwrap();
        let first = SharedMemoryResource::create(region_path(&dir, "one"), 128).unwrap();
        let second = SharedMemoryResource::create(region_path(&dir, "two"), 128).unwrap();
        assert_ne!(first.memory_identifier(), second.memory_identifier());
        assert!(first.is_equal(first.as_ref()));
        assert!(!first.is_equal(second.as_ref()));
    }

    #[test]
    fn test_registry_lookup_through_proxy_id() {
        let dir = TempDir::new().unwrap();
        let resource = SharedMemoryResource::create(region_path(&dir, "region"), 1024).unwrap();
        let id = resource.proxy().id();
        assert_eq!(id, resource.memory_identifier());
        let found = MemoryResourceRegistry::global().find(id).expect("factory registers the resource");
        assert!(found.is_equal(resource.as_ref()));
    }

    #[test]
    fn test_control_block_mirror() {
        // The sequence helper and the live cursor must agree on placement.
        let dir = TempDir::new().unwrap();
        let resource = SharedMemoryResource::create(region_path(&dir, "region"), 1024).unwrap();
        let base = resource.base_address().as_ptr() as usize;
        let usable = resource.usable_base_address().as_ptr() as usize;
        assert_eq!(usable - base, management_space());
        assert_eq!(resource.user_allocated_bytes(), 0);
    }
}
