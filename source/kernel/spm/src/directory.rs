// Copyright 2025 Bastion OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Static per-boot directory of partitions and their RoT services
//! OWNERS: @spm-team
//! PUBLIC API: PartitionDesc, ServiceDesc, VersionPolicy, Directory
//! INVARIANTS: SIDs unique across the platform; service/IRQ signal bits
//!   unique within a partition and inside their assigned ranges; the
//!   directory never changes after boot

use bastion_abi::{PartitionId, Sid, Signals, NSPE_ID};

/// Version negotiation policy of a RoT service.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VersionPolicy {
    /// Client must request exactly the published minor version.
    Strict,
    /// Any requested minor up to the published version is accepted.
    Relaxed,
}

/// Static descriptor of one RoT service.
#[derive(Clone, Debug)]
pub struct ServiceDesc {
    /// Service identifier clients connect to.
    pub sid: Sid,
    /// Dedicated dispatch signal bit on the owning partition.
    pub signal: Signals,
    /// Published minor version.
    pub min_version: u32,
    /// Version negotiation policy.
    pub policy: VersionPolicy,
    /// Whether the non-secure environment may connect.
    pub allow_nspe: bool,
}

/// Static descriptor of one secure partition.
#[derive(Clone, Debug)]
pub struct PartitionDesc {
    /// Partition identifier; must be non-negative (NSPE is the sentinel -1).
    pub id: PartitionId,
    /// Human-readable name used in diagnostics.
    pub name: &'static str,
    /// Services this partition exposes.
    pub services: Vec<ServiceDesc>,
    /// SIDs this partition is allowed to call.
    pub dependencies: Vec<Sid>,
    /// Interrupt signal bits routed to this partition.
    pub irq_signals: Signals,
}

/// Location of a service inside the directory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ServiceRef {
    pub(crate) partition: usize,
    pub(crate) service: usize,
}

/// Why a connection request was turned away.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefuseReason {
    /// No service with the requested SID exists.
    NoSuchService,
    /// The non-secure environment may not reach this service.
    NspeDenied,
    /// The SID is not among the caller's declared dependencies.
    NotAuthorized,
    /// Requested version violates the service's version policy.
    Version,
}

/// Immutable partition/service table built once at boot.
pub struct Directory {
    partitions: Vec<PartitionDesc>,
}

impl Directory {
    /// Builds and validates the directory; contradictions panic because the
    /// tables are build-time configuration, not runtime input.
    pub fn new(partitions: Vec<PartitionDesc>) -> Self {
        let mut sids: Vec<Sid> = Vec::new();
        for part in &partitions {
            assert!(part.id >= 0, "partition {} uses a reserved id", part.name);
            assert!(
                partitions.iter().filter(|p| p.id == part.id).count() == 1,
                "duplicate partition id {}",
                part.id
            );
            assert!(
                Signals::IRQ_MASK.contains(part.irq_signals),
                "partition {} claims non-IRQ bits as interrupts",
                part.name
            );
            let mut used = part.irq_signals | Signals::DOORBELL;
            for svc in &part.services {
                assert!(
                    svc.signal.bits().count_ones() == 1
                        && Signals::SERVICE_MASK.contains(svc.signal),
                    "service {:#x} needs exactly one bit in the service range",
                    svc.sid
                );
                assert!(
                    (used & svc.signal).is_empty(),
                    "signal collision on partition {}",
                    part.name
                );
                used |= svc.signal;
                assert!(!sids.contains(&svc.sid), "duplicate SID {:#x}", svc.sid);
                sids.push(svc.sid);
            }
        }
        Self { partitions }
    }

    /// Number of partitions in the table.
    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    /// Descriptor of the partition at `index`.
    pub fn partition(&self, index: usize) -> &PartitionDesc {
        &self.partitions[index]
    }

    /// Resolves a partition id to its table index.
    pub fn partition_index(&self, id: PartitionId) -> Option<usize> {
        self.partitions.iter().position(|p| p.id == id)
    }

    /// Descriptor of the service at `sref`.
    pub fn service(&self, sref: ServiceRef) -> &ServiceDesc {
        &self.partitions[sref.partition].services[sref.service]
    }

    /// Linear scan for a SID; the tables are small and cold.
    pub fn find_service(&self, sid: Sid) -> Option<ServiceRef> {
        self.partitions.iter().enumerate().find_map(|(pi, part)| {
            part.services
                .iter()
                .position(|svc| svc.sid == sid)
                .map(|si| ServiceRef { partition: pi, service: si })
        })
    }

    /// Checks whether `caller` may connect to `sref` at all (NSPE gate and
    /// dependency gate), ignoring versioning.
    pub fn can_access(&self, caller: PartitionId, sref: ServiceRef) -> Result<(), RefuseReason> {
        let service = self.service(sref);
        if caller == NSPE_ID {
            if !service.allow_nspe {
                return Err(RefuseReason::NspeDenied);
            }
            return Ok(());
        }
        let part = self
            .partition_index(caller)
            .map(|pi| &self.partitions[pi])
            .ok_or(RefuseReason::NotAuthorized)?;
        if part.dependencies.contains(&service.sid) {
            Ok(())
        } else {
            Err(RefuseReason::NotAuthorized)
        }
    }

    /// Full connect-time validation: access gates plus version policy.
    ///
    /// All failures are client-visible refusals surfaced as
    /// `CONNECTION_REFUSED`; the caller is expected to have queried the
    /// version in advance, but a mismatch only costs it the connection.
    pub fn validate_connection(
        &self,
        caller: PartitionId,
        sref: ServiceRef,
        requested_version: u32,
    ) -> Result<(), RefuseReason> {
        self.can_access(caller, sref)?;
        let service = self.service(sref);
        let version_ok = match service.policy {
            VersionPolicy::Strict => requested_version == service.min_version,
            VersionPolicy::Relaxed => requested_version <= service.min_version,
        };
        if version_ok {
            Ok(())
        } else {
            Err(RefuseReason::Version)
        }
    }
}
