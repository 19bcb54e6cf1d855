// Copyright 2025 The Axvisor Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! AxCell - a static partitioning hypervisor core for ARMv8 platforms.
//!
//! The hypervisor is loaded under a running host OS, takes over all of its
//! CPUs and turns the host into the *root cell*. The root cell's management
//! driver then carves further cells out of it: each cell owns a set of CPUs,
//! physical memory ranges and interrupt lines exclusively, and runs its guest
//! on bare CPUs without scheduling.
//!
//! # Features
//!
//! - Cell lifecycle (create, load, start, destroy, disable) with CPU parking
//! - Stage-2 translation tables backed by a static page pool
//! - GICv2 and GICv3 virtualization with per-cell interrupt isolation
//! - Trap dispatch for MMIO emulation, PSCI and spin-table SMP start-up
//! - Management hypercalls and per-CPU exit statistics
//!
//! The architecture glue (exception vectors, boot, world switch) is provided
//! by the embedder, together with an implementation of [`HvHal`].

#![cfg_attr(not(test), no_std)]

#[macro_use]
extern crate alloc;
#[macro_use]
extern crate log;

mod addr; // Address types
mod cell; // Cells and their resources
mod config; // Configuration descriptors
mod consts; // Compile-time limits
mod control; // Hypervisor context and cell lifecycle
mod exit; // Exit reasons, register file and syndrome decoding
mod hal; // Hardware abstraction layer interfaces
mod hypercall; // Management hypercalls
mod irqchip; // Interrupt controller virtualization
mod logging; // Console logger
mod mm; // Page pool and translation tables
mod mmio; // MMIO access descriptors
mod percpu; // Per-CPU state
mod smp; // PSCI and spin-table emulation
mod stats; // Per-CPU statistics
mod trap; // Exit dispatch


pub use addr::{GuestPhysAddr, HostPhysAddr, HostVirtAddr};
pub use cell::{Cell, CellState, CommRegionHeader, ROOT_CELL_ID};
pub use config::{CellConfig, MemFlags, MemoryRegion, PlatformConfig, SmpKind, SystemConfig};
pub use control::{CellInfo, Hypervisor, LoadImage};
pub use exit::{ExitAction, ExitReason, GuestRegs, TrapInfo};
pub use hal::{HvHal, SysReg};
pub use hypercall::error_code;
pub use irqchip::{GicVersion, IrqChip};
pub use logging::default_level as default_log_level;
pub use mm::Frame;
pub use mmio::AccessWidth;
pub use crate::percpu::{this_cpu_id, CpuMask, CpuState, PerCpu};
pub use stats::CpuStat;
