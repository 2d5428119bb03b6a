// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The global memory manager (GMM).
//!
//! Hands out guest pages to VMs from host memory obtained in 2 MiB chunks,
//! enforces per-VM reservations and a global page budget, shares identical
//! read-only pages between VMs and lets guests balloon pages back.
//!
//! All state lives behind [`Gmm`]; requests decoded from the VM boundary go
//! through [`Gmm::dispatch`], everything else is a direct method call.

extern crate alloc;

pub mod account;
pub mod chunk;
pub mod config;
pub mod engine;
pub mod error;
pub mod free_set;
pub mod ledger;
pub mod memory;
pub mod registry;
pub mod shared;

pub use account::AccountPages;
pub use config::GmmConfig;
pub use engine::{Gmm, ModuleRegistration, SharingReport};
pub use error::{ErrorKind, GmmError, GmmResult};
pub use memory::backends::PageAllocator;
pub use memory::frame::Frame;
pub use memory::host::HostMemory;
