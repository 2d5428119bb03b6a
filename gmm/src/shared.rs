// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Book-keeping for page sharing: the content index of shared pages and
//! the shared modules VMs registered.
//!
//! Neither structure is authoritative. Hashes collide, and page ids stored
//! here may be stale by the time they are looked at, so every hit gets
//! validated against the chunk and compared byte for byte.

use alloc::string::String;
use alloc::vec::Vec;
use core::hash::{BuildHasher, Hash, Hasher};

use arrayvec::ArrayVec;
use hashbrown::hash_map::DefaultHashBuilder;
use hashbrown::HashMap;
use log::{debug, info};

use gmm_abi::req::SharedRegionDesc;
use gmm_abi::{
    GuestOsFamily, PageId, VmId, GMM_GCPHYS_LAST, GMM_SHARED_MODULE_MAX_NAME_STRING,
    GMM_SHARED_MODULE_MAX_REGIONS, GMM_SHARED_MODULE_MAX_VERSION_STRING, GUEST_PAGE_OFFSET_MASK,
    NIL_GMM_PAGEID,
};

use crate::error::{GmmError, GmmResult};
use crate::memory::utils::bytes_to_pages;

/// Max. number of modules a single VM may register.
pub const GMM_MAX_SHARED_PER_VM_MODULES: usize = 2048;
/// Max. number of distinct modules across all VMs.
pub const GMM_MAX_SHARED_GLOBAL_MODULES: usize = 16834;
/// Max. size of a module and of the sum of its regions.
pub const GMM_SHARED_MODULE_MAX_SIZE: u64 = 1024 * 1024 * 1024;

/// CRC-32 (IEEE 802.3, reflected) of `data`.
pub fn crc32(data: &[u8]) -> u32 {
    let mut crc = !0u32;
    for byte in data {
        crc ^= *byte as u32;
        for _bit in 0..8 {
            let mask = (crc & 1).wrapping_neg();
            crc = (crc >> 1) ^ (0xEDB8_8320 & mask);
        }
    }
    !crc
}

/// Content hash -> shared pages with that content.
pub struct SharedPageIndex {
    hasher: DefaultHashBuilder,
    buckets: HashMap<u64, Vec<(PageId, VmId)>>,
    hash_of: HashMap<PageId, u64>,
}

impl SharedPageIndex {
    pub fn new() -> SharedPageIndex {
        SharedPageIndex {
            hasher: DefaultHashBuilder::default(),
            buckets: HashMap::new(),
            hash_of: HashMap::new(),
        }
    }

    pub fn content_hash(&self, data: &[u8]) -> u64 {
        let mut h = self.hasher.build_hasher();
        h.write(data);
        h.finish()
    }

    /// Remember `page` (first shared by `vm`) under `hash`.
    pub fn index_page(&mut self, hash: u64, page: PageId, vm: VmId) -> GmmResult<()> {
        self.remove_page(page);
        self.hash_of.try_reserve(1)?;
        self.buckets.entry(hash).or_default().push((page, vm));
        self.hash_of.insert(page, hash);
        Ok(())
    }

    /// Pages that may have the content hashing to `hash`.
    pub fn find_candidates(&self, hash: u64) -> impl Iterator<Item = PageId> + '_ {
        self.buckets
            .get(&hash)
            .into_iter()
            .flat_map(|b| b.iter().map(|(page, _vm)| *page))
    }

    pub fn remove_page(&mut self, page: PageId) -> bool {
        let hash = match self.hash_of.remove(&page) {
            Some(hash) => hash,
            None => return false,
        };
        if let Some(bucket) = self.buckets.get_mut(&hash) {
            bucket.retain(|(p, _vm)| *p != page);
            if bucket.is_empty() {
                self.buckets.remove(&hash);
            }
        }
        true
    }

    pub fn contains(&self, page: PageId) -> bool {
        self.hash_of.contains_key(&page)
    }

    /// Number of indexed pages.
    pub fn len(&self) -> usize {
        self.hash_of.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hash_of.is_empty()
    }
}

impl Default for SharedPageIndex {
    fn default() -> Self {
        SharedPageIndex::new()
    }
}

/// A region of a shared module as the allocator keeps it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedRegion {
    /// Offset of the region inside its first page.
    pub off: u32,
    /// `off + size` rounded up to whole pages.
    pub size: u32,
    /// The canonical shared page for every page of the region.
    pub pages: Vec<PageId>,
}

impl SharedRegion {
    fn from_desc(desc: &SharedRegionDesc) -> SharedRegion {
        let off = (desc.gc_phys & GUEST_PAGE_OFFSET_MASK) as u32;
        let pages = bytes_to_pages(desc.size as u64 + off as u64);
        SharedRegion {
            off,
            size: (pages as u32) << gmm_abi::GUEST_PAGE_SHIFT,
            pages: Vec::new(),
        }
    }

    pub fn num_pages(&self) -> usize {
        (self.size >> gmm_abi::GUEST_PAGE_SHIFT) as usize
    }

    /// Canonical page of page `idx`, NIL if there is none yet.
    pub fn canonical(&self, idx: usize) -> PageId {
        self.pages.get(idx).copied().unwrap_or(NIL_GMM_PAGEID)
    }

    pub fn set_canonical(&mut self, idx: usize, page: PageId) {
        if self.pages.len() < self.num_pages() {
            self.pages.resize(self.num_pages(), NIL_GMM_PAGEID);
        }
        if let Some(slot) = self.pages.get_mut(idx) {
            *slot = page;
        }
    }
}

/// A module (e.g. an OS library) that is identical across VMs.
#[derive(Debug, Clone)]
pub struct SharedModule {
    pub key: u64,
    pub name: String,
    pub version: String,
    pub size: u32,
    pub guest_os: GuestOsFamily,
    pub regions: ArrayVec<SharedRegion, GMM_SHARED_MODULE_MAX_REGIONS>,
    /// Number of VMs that registered the module.
    pub users: u32,
}

impl SharedModule {
    pub fn matches(
        &self,
        name: &str,
        version: &str,
        size: u32,
        guest_os: GuestOsFamily,
        regions: &[SharedRegionDesc],
    ) -> bool {
        self.size == size
            && self.guest_os == guest_os
            && self.regions.len() == regions.len()
            && self.name == name
            && self.version == version
            && self
                .regions
                .iter()
                .zip(regions)
                .all(|(ours, theirs)| {
                    let theirs = SharedRegion::from_desc(theirs);
                    ours.off == theirs.off && ours.size == theirs.size
                })
    }
}

/// Handle of a module in the `ModuleRegistry`.
pub type ModuleId = usize;

/// Check the limits on a module registration request.
pub fn validate_module(
    name: &str,
    version: &str,
    size: u32,
    regions: &[SharedRegionDesc],
) -> GmmResult<()> {
    if regions.len() > GMM_SHARED_MODULE_MAX_REGIONS {
        return Err(GmmError::TooManyRegions);
    }
    if name.is_empty() {
        return Err(GmmError::InvalidParameter);
    }
    if name.len() >= GMM_SHARED_MODULE_MAX_NAME_STRING
        || version.len() >= GMM_SHARED_MODULE_MAX_VERSION_STRING
    {
        return Err(GmmError::ModuleNameTooLong);
    }
    if size == 0 || size as u64 > GMM_SHARED_MODULE_MAX_SIZE {
        return Err(GmmError::BadModuleSize);
    }

    let mut total = 0u64;
    for region in regions {
        if region.size == 0 || region.size as u64 > GMM_SHARED_MODULE_MAX_SIZE {
            return Err(GmmError::BadModuleSize);
        }
        if region.gc_phys.saturating_add(region.size as u64) > GMM_GCPHYS_LAST {
            return Err(GmmError::InvalidParameter);
        }
        total += region.size as u64;
    }
    if total > GMM_SHARED_MODULE_MAX_SIZE {
        return Err(GmmError::BadModuleSize);
    }

    Ok(())
}

/// All modules registered by at least one VM.
pub struct ModuleRegistry {
    hasher: DefaultHashBuilder,
    modules: Vec<Option<SharedModule>>,
    free: Vec<ModuleId>,
    by_key: HashMap<u64, Vec<ModuleId>>,
    live: usize,
}

impl ModuleRegistry {
    pub fn new() -> ModuleRegistry {
        ModuleRegistry {
            hasher: DefaultHashBuilder::default(),
            modules: Vec::new(),
            free: Vec::new(),
            by_key: HashMap::new(),
            live: 0,
        }
    }

    pub fn module_key(&self, name: &str, version: &str) -> u64 {
        let mut h = self.hasher.build_hasher();
        name.hash(&mut h);
        version.hash(&mut h);
        h.finish()
    }

    /// Look for an existing module with the exact same layout.
    pub fn find(
        &self,
        name: &str,
        version: &str,
        size: u32,
        guest_os: GuestOsFamily,
        regions: &[SharedRegionDesc],
    ) -> Option<ModuleId> {
        let key = self.module_key(name, version);
        self.by_key.get(&key)?.iter().copied().find(|id| {
            self.get(*id)
                .map_or(false, |m| m.matches(name, version, size, guest_os, regions))
        })
    }

    /// Register a new module with one user.
    pub fn create(
        &mut self,
        name: &str,
        version: &str,
        size: u32,
        guest_os: GuestOsFamily,
        regions: &[SharedRegionDesc],
    ) -> GmmResult<ModuleId> {
        if self.live >= GMM_MAX_SHARED_GLOBAL_MODULES {
            return Err(GmmError::TooManyModules);
        }
        self.by_key.try_reserve(1)?;

        let key = self.module_key(name, version);
        let module = SharedModule {
            key,
            name: String::from(name),
            version: String::from(version),
            size,
            guest_os,
            regions: regions.iter().map(SharedRegion::from_desc).collect(),
            users: 1,
        };

        let id = match self.free.pop() {
            Some(id) => {
                self.modules[id] = Some(module);
                id
            }
            None => {
                self.modules.push(Some(module));
                self.modules.len() - 1
            }
        };
        self.by_key.entry(key).or_default().push(id);
        self.live += 1;
        info!("new shared module {} {} ({} bytes) as #{}", name, version, size, id);
        Ok(id)
    }

    /// Another VM registered module `id`.
    pub fn retain(&mut self, id: ModuleId) -> Option<u32> {
        let module = self.get_mut(id)?;
        module.users += 1;
        Some(module.users)
    }

    /// A VM let go of module `id`. Returns true if that was the last user
    /// and the module is gone.
    pub fn release(&mut self, id: ModuleId) -> bool {
        let users = match self.get_mut(id) {
            Some(module) => {
                module.users = module.users.saturating_sub(1);
                module.users
            }
            None => return false,
        };
        if users > 0 {
            return false;
        }

        if let Some(module) = self.modules[id].take() {
            if let Some(ids) = self.by_key.get_mut(&module.key) {
                ids.retain(|m| *m != id);
                if ids.is_empty() {
                    self.by_key.remove(&module.key);
                }
            }
            debug!("shared module {} {} destroyed", module.name, module.version);
        }
        self.free.push(id);
        self.live -= 1;
        true
    }

    pub fn get(&self, id: ModuleId) -> Option<&SharedModule> {
        self.modules.get(id)?.as_ref()
    }

    pub fn get_mut(&mut self, id: ModuleId) -> Option<&mut SharedModule> {
        self.modules.get_mut(id)?.as_mut()
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (ModuleId, &SharedModule)> {
        self.modules
            .iter()
            .enumerate()
            .filter_map(|(id, m)| m.as_ref().map(|m| (id, m)))
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        ModuleRegistry::new()
    }
}
