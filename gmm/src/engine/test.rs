// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Test the allocator using unit-tests and proptest.

use alloc::collections::BTreeSet;
use alloc::sync::Arc;
use alloc::vec::Vec;

use hashbrown::HashMap;
use proptest::prelude::*;

use gmm_abi::{
    Account, BalloonAction, GmmFreePageDesc, GmmPageDesc, OcPolicy, PageId, Priority, VmId,
    GMM_CHUNK_NUM_PAGES,
};

use super::Gmm;
use crate::account::AccountPages;
use crate::config::GmmConfig;
use crate::error::{GmmError, GmmResult};
use crate::memory::host::HostMemory;
use crate::registry::ChunkRegistry;

/// Base pages every VM in the model reserves.
const MODEL_BASE_PAGES: u64 = 64;

/// Number of VMs the model juggles.
const MODEL_VMS: VmId = 2;

fn reserve(gmm: &Gmm<HostMemory>, vm: VmId, base: u64) {
    gmm.init_vm(vm).expect("init vm");
    gmm.initial_reservation(
        vm,
        AccountPages::new(base, 4, 4),
        OcPolicy::NoOverCommit,
        Priority::Normal,
    )
    .expect("reserve");
}

fn allocate(gmm: &Gmm<HostMemory>, vm: VmId, n: usize) -> GmmResult<Vec<PageId>> {
    let mut pages = alloc::vec![GmmPageDesc::nil(); n];
    gmm.allocate_pages(vm, Account::Base, &mut pages, false)?;
    Ok(pages.iter().map(|d| d.id_page).collect())
}

fn free(gmm: &Gmm<HostMemory>, vm: VmId, pages: &[PageId]) -> GmmResult<()> {
    let descs: Vec<GmmFreePageDesc> = pages.iter().map(|p| GmmFreePageDesc::from(*p)).collect();
    gmm.free_pages(vm, Account::Base, &descs)
}

#[test]
fn reservation_is_a_hard_limit() {
    let _r = env_logger::try_init();
    let gmm = Gmm::new(Default::default());
    reserve(&gmm, 1, 100);

    allocate(&gmm, 1, 100).expect("the whole reservation");
    assert_eq!(
        allocate(&gmm, 1, 1),
        Err(GmmError::QuotaExceeded {
            needed: 1,
            available: 0
        })
    );
    let (stats, vm) = gmm.query_statistics(Some(1)).expect("stats");
    assert_eq!(stats.allocated_pages, 100);
    assert_eq!(vm.expect("vm").allocated.base_pages, 100);
    assert_eq!(gmm.sanity_check(), 0);
}

#[test]
fn one_chunk_per_512_pages() {
    let _r = env_logger::try_init();
    let gmm = Gmm::new(Default::default());
    reserve(&gmm, 1, 1024);

    allocate(&gmm, 1, GMM_CHUNK_NUM_PAGES).expect("a full chunk");
    let (stats, _vm) = gmm.query_statistics(None).expect("stats");
    assert_eq!(stats.chunks, 1);

    allocate(&gmm, 1, 1).expect("one more page");
    let (stats, _vm) = gmm.query_statistics(None).expect("stats");
    assert_eq!(stats.chunks, 2);
    assert_eq!(gmm.with_host(|h| h.chunks_in_use()), 2);
}

#[test]
fn foreign_free_changes_nothing() {
    let _r = env_logger::try_init();
    let gmm = Gmm::new(Default::default());
    reserve(&gmm, 1, 32);
    reserve(&gmm, 2, 32);
    let mine = allocate(&gmm, 1, 4).expect("allocate");
    let theirs = allocate(&gmm, 2, 1).expect("allocate");
    let before = gmm.query_statistics(Some(1)).expect("stats");

    let mut mixed = mine.clone();
    mixed.push(theirs[0]);
    assert_eq!(
        free(&gmm, 1, &mixed),
        Err(GmmError::NotOwner { page: theirs[0] })
    );
    assert_eq!(gmm.query_statistics(Some(1)).expect("stats"), before);
    for page in mine.iter() {
        gmm.with_page(*page, |_data| ()).expect("still allocated");
    }
}

#[test]
fn allocate_free_round_trip() {
    let _r = env_logger::try_init();
    let gmm = Gmm::new(Default::default());
    reserve(&gmm, 1, 2000);
    let (empty, _vm) = gmm.query_statistics(None).expect("stats");

    let pages = allocate(&gmm, 1, 1500).expect("allocate");
    assert_eq!(pages.iter().collect::<BTreeSet<_>>().len(), 1500);
    free(&gmm, 1, &pages).expect("free");

    let (stats, _vm) = gmm.query_statistics(None).expect("stats");
    assert_eq!(stats.allocated_pages, empty.allocated_pages);
    assert_eq!(stats.chunks, 0);
    assert_eq!(gmm.with_host(|h| h.chunks_in_use()), 0);
}

#[test]
fn second_free_is_rejected() {
    let _r = env_logger::try_init();
    let gmm = Gmm::new(Default::default());
    reserve(&gmm, 1, 32);
    let pages = allocate(&gmm, 1, 2).expect("allocate");

    free(&gmm, 1, &pages[..1]).expect("free");
    let before = gmm.query_statistics(Some(1)).expect("stats");
    assert_eq!(
        free(&gmm, 1, &pages[..1]),
        Err(GmmError::DoubleFree { page: pages[0] })
    );
    assert_eq!(gmm.query_statistics(Some(1)).expect("stats"), before);
}

#[test]
fn failed_batch_is_rolled_back() {
    let _r = env_logger::try_init();
    let gmm = Gmm::with_allocator(Default::default(), HostMemory::with_chunk_limit(1));
    reserve(&gmm, 1, 2000);

    assert_eq!(
        allocate(&gmm, 1, GMM_CHUNK_NUM_PAGES + 1),
        Err(GmmError::OutOfHostMemory)
    );
    let (stats, _vm) = gmm.query_statistics(None).expect("stats");
    assert_eq!(stats.allocated_pages, 0);
    assert_eq!(stats.chunks, 0);
    assert_eq!(gmm.with_host(|h| h.chunks_in_use()), 0);
    assert_eq!(gmm.sanity_check(), 0);

    allocate(&gmm, 1, GMM_CHUNK_NUM_PAGES).expect("fits in one chunk");
}

#[test]
fn chunk_ids_run_out() {
    let _r = env_logger::try_init();
    let gmm = Gmm::with_registry(
        Default::default(),
        HostMemory::new(),
        ChunkRegistry::with_id_limit(2),
    );
    reserve(&gmm, 1, 2000);

    let pages = allocate(&gmm, 1, 2 * GMM_CHUNK_NUM_PAGES).expect("two chunks");
    assert_eq!(allocate(&gmm, 1, 1), Err(GmmError::OutOfIds));
    assert_eq!(gmm.with_host(|h| h.chunks_in_use()), 2);

    free(&gmm, 1, &pages[..GMM_CHUNK_NUM_PAGES]).expect("free a chunk");
    allocate(&gmm, 1, 1).expect("id was recycled");
}

#[test]
fn concurrent_vms() {
    let _r = env_logger::try_init();
    let gmm = Arc::new(Gmm::new(GmmConfig {
        sanity: true,
        ..Default::default()
    }));
    for vm in 1..=4 {
        reserve(&gmm, vm, 600);
    }

    let threads: Vec<_> = (1..=4)
        .map(|vm| {
            let gmm = gmm.clone();
            std::thread::spawn(move || {
                for round in 0..20 {
                    let pages = allocate(&gmm, vm, 1 + round * 7).expect("allocate");
                    free(&gmm, vm, &pages).expect("free");
                }
                allocate(&gmm, vm, 10).expect("allocate");
            })
        })
        .collect();
    for t in threads {
        t.join().expect("worker");
    }

    let (stats, _vm) = gmm.query_statistics(None).expect("stats");
    assert_eq!(stats.allocated_pages, 40);
    assert_eq!(gmm.sanity_check(), 0);
}

/// What a VM holds according to the model.
#[derive(Default, Debug)]
struct ModelVm {
    private: BTreeSet<PageId>,
    ballooned: BTreeSet<PageId>,
}

/// The simplest possible bookkeeping of private pages and balloons.
///
/// Page ids are taken from the allocator under test, the model only decides
/// whether an operation succeeds and which pages it affects.
#[derive(Debug)]
struct ModelGmm {
    vms: HashMap<VmId, ModelVm>,
}

impl Default for ModelGmm {
    fn default() -> Self {
        let mut vms = HashMap::new();
        for vm in 1..=MODEL_VMS {
            vms.insert(vm, ModelVm::default());
        }
        ModelGmm { vms }
    }
}

impl ModelGmm {
    fn vm(&mut self, vm: VmId) -> &mut ModelVm {
        self.vms.entry(vm).or_default()
    }

    /// Pages charged to `vm`, ballooned ones included.
    fn charged(&self, vm: VmId) -> u64 {
        self.vms
            .get(&vm)
            .map_or(0, |v| (v.private.len() + v.ballooned.len()) as u64)
    }

    fn allocate(&self, vm: VmId, n: usize) -> GmmResult<()> {
        let available = MODEL_BASE_PAGES - self.charged(vm);
        if n as u64 > available {
            return Err(GmmError::QuotaExceeded {
                needed: n as u64,
                available,
            });
        }
        Ok(())
    }

    fn allocated(&mut self, vm: VmId, pages: &[PageId]) {
        self.vm(vm).private.extend(pages.iter().copied());
    }

    /// Pick a page of `vm` to free, private pages first.
    fn pick(&self, vm: VmId, idx: usize) -> Option<PageId> {
        let v = self.vms.get(&vm)?;
        if !v.private.is_empty() {
            v.private.iter().nth(idx % v.private.len()).copied()
        } else if !v.ballooned.is_empty() {
            v.ballooned.iter().nth(idx % v.ballooned.len()).copied()
        } else {
            None
        }
    }

    fn free(&mut self, vm: VmId, page: PageId) -> GmmResult<()> {
        let v = self.vm(vm);
        if v.ballooned.contains(&page) {
            return Err(GmmError::InvalidPageState { page });
        }
        v.private.remove(&page);
        Ok(())
    }

    /// Balloons take the highest page ids.
    fn inflate(&mut self, vm: VmId, n: usize) -> GmmResult<()> {
        let v = self.vm(vm);
        let room = MODEL_BASE_PAGES - v.ballooned.len() as u64;
        if n as u64 > room {
            return Err(GmmError::InsufficientPages { available: room });
        }
        if n > v.private.len() {
            return Err(GmmError::InsufficientPages {
                available: v.private.len() as u64,
            });
        }
        let victims: Vec<PageId> = v.private.iter().rev().take(n).copied().collect();
        for page in victims {
            v.private.remove(&page);
            v.ballooned.insert(page);
        }
        Ok(())
    }

    /// Deflating returns the lowest page ids.
    fn deflate(&mut self, vm: VmId, n: usize) -> GmmResult<()> {
        let v = self.vm(vm);
        if n > v.ballooned.len() {
            return Err(GmmError::InsufficientPages {
                available: v.ballooned.len() as u64,
            });
        }
        let returning: Vec<PageId> = v.ballooned.iter().take(n).copied().collect();
        for page in returning {
            v.ballooned.remove(&page);
            v.private.insert(page);
        }
        Ok(())
    }

    fn cleanup(&mut self, vm: VmId) {
        self.vms.insert(vm, ModelVm::default());
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
enum TestAction {
    Allocate(VmId, usize),
    Free(VmId, usize),
    Inflate(VmId, usize),
    Deflate(VmId, usize),
    Cleanup(VmId),
}

prop_compose! {
    fn vm_gen()(vm in 1..=MODEL_VMS) -> VmId { vm }
}

prop_compose! {
    fn count_gen(max: usize)(count in 1..max) -> usize { count }
}

fn action() -> impl Strategy<Value = TestAction> {
    prop_oneof![
        4 => (vm_gen(), count_gen(24)).prop_map(|(a, b)| TestAction::Allocate(a, b)),
        4 => (vm_gen(), any::<usize>()).prop_map(|(a, b)| TestAction::Free(a, b)),
        2 => (vm_gen(), count_gen(16)).prop_map(|(a, b)| TestAction::Inflate(a, b)),
        2 => (vm_gen(), count_gen(16)).prop_map(|(a, b)| TestAction::Deflate(a, b)),
        1 => vm_gen().prop_map(TestAction::Cleanup),
    ]
}

fn actions() -> impl Strategy<Value = Vec<TestAction>> {
    prop::collection::vec(action(), 0..256)
}

fn model_gmm() -> Gmm<HostMemory> {
    let gmm = Gmm::new(GmmConfig {
        sanity: true,
        ..Default::default()
    });
    for vm in 1..=MODEL_VMS {
        reserve(&gmm, vm, MODEL_BASE_PAGES);
    }
    gmm
}

proptest! {
    // Verify that the allocator keeps the same books as `ModelGmm`.
    #[test]
    fn model_equivalence(ops in actions()) {
        let _r = env_logger::try_init();
        let mut model: ModelGmm = Default::default();
        let totest = model_gmm();

        use TestAction::*;
        for action in ops {
            match action {
                Allocate(vm, n) => {
                    let rmodel = model.allocate(vm, n);
                    let rtotest = allocate(&totest, vm, n);
                    match rtotest {
                        Ok(pages) => {
                            prop_assert_eq!(rmodel, Ok(()));
                            model.allocated(vm, &pages);
                        }
                        Err(e) => prop_assert_eq!(rmodel, Err(e)),
                    }
                }
                Free(vm, idx) => {
                    if let Some(page) = model.pick(vm, idx) {
                        let rmodel = model.free(vm, page);
                        let rtotest = free(&totest, vm, &[page]);
                        prop_assert_eq!(rmodel, rtotest);
                    }
                }
                Inflate(vm, n) => {
                    let rmodel = model.inflate(vm, n);
                    let rtotest = totest.ballooned_pages(vm, BalloonAction::Inflate, n as u64);
                    prop_assert_eq!(rmodel, rtotest);
                }
                Deflate(vm, n) => {
                    let rmodel = model.deflate(vm, n);
                    let rtotest = totest.ballooned_pages(vm, BalloonAction::Deflate, n as u64);
                    prop_assert_eq!(rmodel, rtotest);
                }
                Cleanup(vm) => {
                    model.cleanup(vm);
                    totest.cleanup_vm(vm).expect("cleanup");
                    reserve(&totest, vm, MODEL_BASE_PAGES);
                }
            }

            prop_assert_eq!(totest.sanity_check(), 0);
            let mut total = 0;
            for vm in 1..=MODEL_VMS {
                let (_stats, vm_stats) = totest.query_statistics(Some(vm)).expect("stats");
                let vm_stats = vm_stats.expect("vm stats");
                let expected = model.vms.get(&vm).expect("model vm");
                prop_assert_eq!(vm_stats.allocated.base_pages, model.charged(vm));
                prop_assert_eq!(vm_stats.ballooned_pages, expected.ballooned.len() as u64);
                prop_assert!(vm_stats.allocated.base_pages <= MODEL_BASE_PAGES);
                total += model.charged(vm);
            }
            let (stats, _vm) = totest.query_statistics(None).expect("stats");
            prop_assert_eq!(stats.allocated_pages, total);
            prop_assert!(stats.allocated_pages <= stats.reserved_pages);
        }
    }
}
