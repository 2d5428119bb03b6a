// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Reservations: how many pages a VM may allocate per account.

use log::{debug, info};

use gmm_abi::{Account, OcPolicy, Priority, VmId};

use crate::account::AccountPages;
use crate::error::{GmmError, GmmResult};
use crate::memory::backends::PageAllocator;

use super::{Gmm, GmmState};

impl<A: PageAllocator> Gmm<A> {
    /// Make the first reservation of `vm`.
    pub fn initial_reservation(
        &self,
        vm: VmId,
        pages: AccountPages,
        oc_policy: OcPolicy,
        priority: Priority,
    ) -> GmmResult<()> {
        self.write(|st| st.initial_reservation(vm, pages, oc_policy, priority))
    }

    /// Change the reservation of `vm`.
    pub fn update_reservation(&self, vm: VmId, pages: AccountPages) -> GmmResult<()> {
        self.write(|st| st.update_reservation(vm, pages))
    }
}

impl<A: PageAllocator> GmmState<A> {
    fn initial_reservation(
        &mut self,
        vm: VmId,
        pages: AccountPages,
        oc_policy: OcPolicy,
        priority: Priority,
    ) -> GmmResult<()> {
        if !oc_policy.is_valid() {
            return Err(GmmError::InvalidPolicy);
        }
        if !priority.is_valid() {
            return Err(GmmError::InvalidPriority);
        }
        if pages.base == 0 || pages.shadow == 0 || pages.fixed == 0 {
            return Err(GmmError::InvalidParameter);
        }

        let account = self.vms.get_mut(&vm).ok_or(GmmError::UnknownVm { vm })?;
        if account.is_reserved() {
            return Err(GmmError::AlreadyReserved);
        }

        let total = pages.total().ok_or(GmmError::InvalidParameter)?;
        let available = match oc_policy {
            OcPolicy::NoOverCommit => {
                self.ledger.max_pages.saturating_sub(self.ledger.reserved_pages)
            }
            _ => u64::MAX - self.ledger.reserved_pages,
        };
        if total > available {
            return Err(GmmError::ReservationTooLarge {
                requested: total,
                available,
            });
        }

        account.reserved = pages;
        account.oc_policy = oc_policy;
        account.priority = priority;
        account.max_ballooned_pages = pages.base;
        account.may_allocate = true;

        self.ledger.reserved_pages += total;
        self.ledger.update_over_commit();
        info!(
            "vm {} reserved {:?} ({:?}, {:?}), {} reserved in total",
            vm, pages, oc_policy, priority, self.ledger.reserved_pages
        );
        Ok(())
    }

    fn update_reservation(&mut self, vm: VmId, pages: AccountPages) -> GmmResult<()> {
        if pages.base == 0 || pages.shadow == 0 || pages.fixed == 0 {
            return Err(GmmError::InvalidParameter);
        }

        let account = self.vms.get_mut(&vm).ok_or(GmmError::UnknownVm { vm })?;
        if !account.is_reserved() {
            return Err(GmmError::VmNotReserved);
        }

        let old_total = account.reserved.total().ok_or(GmmError::Inconsistent {
            what: "reservation does not fit a u64",
        })?;
        let new_total = pages.total().ok_or(GmmError::InvalidParameter)?;
        let others = self.ledger.reserved_pages.saturating_sub(old_total);
        if account.oc_policy == OcPolicy::NoOverCommit {
            for acct in [Account::Base, Account::Shadow, Account::Fixed] {
                let allocated = account.allocated.get(acct)?;
                if pages.get(acct)? < allocated {
                    return Err(GmmError::BelowCurrentUsage { allocated });
                }
            }

            let available = self.ledger.max_pages.saturating_sub(others);
            if new_total > available {
                return Err(GmmError::ReservationTooLarge {
                    requested: new_total,
                    available,
                });
            }
        }
        let reserved = others
            .checked_add(new_total)
            .ok_or(GmmError::ReservationTooLarge {
                requested: new_total,
                available: u64::MAX - others,
            })?;

        account.reserved = pages;
        account.max_ballooned_pages = pages.base;
        self.ledger.reserved_pages = reserved;
        self.ledger.update_over_commit();
        debug!("vm {} reservation {} -> {} pages", vm, old_total, new_total);
        Ok(())
    }
}
