//! Determine foundational attributes based on available system memory

use std::cmp;
use sysinfo::System;

use crate::opt::OPT;

lazy_static! {
    static ref SYSTEM: System = {
        let mut sys = System::new_all();
        sys.refresh_all();
        sys
    };
}

/// Size of a record slab in bytes
pub const SLAB_SIZE: usize = 1024 * 1024;

/// Entries held by one collision chain before upsert reports CapacityExhausted
pub const CHAIN_CAPACITY: usize = 8;

/* *****************************************************************************************************************
 *
 * The sizing here is a deployment-time decision, not a runtime-adaptive one. Shard count and
 * index bits are fixed for the life of a dataset: both ingestion and queries derive a page's
 * owning shard and index slot from the same digest bits, and a saved dataset can only be
 * reloaded into the geometry it was built with. Changing either is a re-partition, performed
 * offline.
 *
 *******************************************************************************************************************/

#[derive(Debug, Clone)]
pub struct Foundation {
    worker_count: u32,
    shard_count: u32,
    shard_bits: u32,
    significant_bits: u32,
    chain_capacity: usize,
    slabs_per_shard: u32,
    slab_size: usize,
}

impl Foundation {
    pub fn new() -> Foundation {
        get_foundation_for(
            system_memory(),
            system_cores(),
            OPT.get_shard_count(),
            OPT.get_worker_count(),
            OPT.get_index_bits(),
        )
    }

    pub fn get_worker_count(&self) -> u32 {
        self.worker_count
    }

    pub fn get_shard_count(&self) -> u32 {
        self.shard_count
    }

    /// Low-order digest bits consumed by shard selection
    pub fn get_shard_bits(&self) -> u32 {
        self.shard_bits
    }

    /// Digest bits above the shard bits used for slot selection within a shard
    pub fn get_significant_bits(&self) -> u32 {
        self.significant_bits
    }

    pub fn get_slot_count(&self) -> usize {
        1usize << self.significant_bits
    }

    pub fn get_chain_capacity(&self) -> usize {
        self.chain_capacity
    }

    pub fn get_slabs_per_shard(&self) -> u32 {
        self.slabs_per_shard
    }

    pub fn get_slab_size(&self) -> usize {
        self.slab_size
    }
}

fn get_foundation_for(
    system_memory: u64,
    cores: usize,
    shard_override: Option<u32>,
    worker_override: Option<u32>,
    index_bits: u32,
) -> Foundation {
    if system_memory < 2097152 {
        error!("Minimum memory is 2GB");
        std::process::exit(1);
    }

    // Use cores * 2 to account for hyperthreading that may be enabled on some processor architectures
    // Over-allocating tasks on a non-hyperthreaded processor will not have a meaningful impact
    let raw_workers: u32 = match worker_override {
        Some(count) => count,
        None => (cores * 2) as u32,
    };
    let worker_count = round_down_to_power_of_2(cmp::max(raw_workers, 1));

    // One owning task per shard. Shard count must be an exact power of two so that the
    // low shard_bits of a digest select the owner.
    let raw_shards = match shard_override {
        Some(count) => count,
        None => cores as u32,
    };
    let shard_count = round_down_to_power_of_2(cmp::max(raw_shards, 1));
    let shard_bits = shard_count.trailing_zeros();

    let working_memory = 1024 * 1024; // Allow 1GB for execution and working memory
    let tx_handle_count = cmp::max(8 * worker_count / 1024, 1024); // 8 bytes per handle, with minimum of 1MB
    let message_size = worker_count * 1024; // Average message size of 1k
    let tokio_task_cache = 64 * worker_count / 1024;
    let reserved_memory: u64 =
        (working_memory + tx_handle_count + message_size + tokio_task_cache) as u64;
    let memory_for_slabs = system_memory - reserved_memory;
    let slabs = (memory_for_slabs / (SLAB_SIZE as u64 / 1024)) as u32;
    let slabs_per_shard = round_down_to_power_of_2(cmp::max(slabs / shard_count, 1));

    // Only the lower 32 bits in the digest are significant in identifying shards and slabs.
    // Panic if the shard and slab counts exceed that space; this is an extremely unlikely
    // configuration, so panic rather than propagating an error that will never occur.
    let bounds: u64 = (shard_count as u64) * (slabs_per_shard as u64);
    if bounds > u32::MAX.into() {
        error!("Too many slabs or shards. Use the --memory option to reduce the memory when starting");
        panic!("Too many slabs or shards. Use the --memory option to reduce the memory when starting")
    }

    Foundation {
        worker_count,
        shard_count,
        shard_bits,
        significant_bits: index_bits,
        chain_capacity: CHAIN_CAPACITY,
        slabs_per_shard,
        slab_size: SLAB_SIZE,
    }
}

fn round_down_to_power_of_2(value: u32) -> u32 {
    // Round-down to next power of two
    let mut power: u32 = 1;
    while power <= value {
        power *= 2;
    }

    power / 2
}

fn system_memory() -> u64 {
    match OPT.get_memory() {
        Some(memory) => *memory,
        None => SYSTEM.total_memory() / 1024,
    }
}

fn system_cores() -> usize {
    match OPT.get_cores() {
        Some(cores) => *cores as usize,
        None => SYSTEM.physical_core_count().unwrap(),
    }
}

/* *****************************************************************************************************************
 *
 * Tests
 *
 * *****************************************************************************************************************/

// Module is public, as get_test_foundation is called from test functions in other modules
#[cfg(test)]
pub mod tests {
    use super::*;

    #[test]
    fn test_foundation() {
        let foundation = get_foundation_for(8589934, 8, None, None, 14);
        assert_eq!(foundation.get_worker_count(), 16);
        assert_eq!(foundation.get_shard_count(), 8);
        assert_eq!(foundation.get_shard_bits(), 3);
        assert_eq!(foundation.get_slabs_per_shard(), 512);
        assert_eq!(foundation.get_slot_count(), 16384);
    }

    #[test]
    fn test_foundation_overrides() {
        let foundation = get_foundation_for(8589934, 8, Some(5), Some(6), 8);
        assert_eq!(foundation.get_shard_count(), 4);
        assert_eq!(foundation.get_shard_bits(), 2);
        assert_eq!(foundation.get_worker_count(), 4);
        assert_eq!(foundation.get_slot_count(), 256);
    }

    /* *****************************************************************************************************************
     *
     * Helper functions - Used only by test routines, but need to be public so that they are accessible from other
     * modules
     * *****************************************************************************************************************/

    /// Create a default Foundation struct with a small memory footprint that will not exhaust available memory,
    /// leaving sufficient memory for developer tools to run alongside the tests

    pub fn get_test_foundation() -> Foundation {
        Foundation {
            worker_count: 4,
            shard_count: 4,
            shard_bits: 2,
            significant_bits: 8,
            chain_capacity: 4,
            slabs_per_shard: 4,
            slab_size: 4096,
        }
    }
}
