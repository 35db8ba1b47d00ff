/* ********************************************************************************************************************
 *
 * Hash index
 *
 * A fixed array of 2^significant_bits slots, each a bounded collision chain of PageIdentity
 * entries. Lookup is a linear scan of one chain comparing hash_low; a match is only provisional
 * until the caller has compared the full title in the referenced record, since two distinct
 * titles can share a hash_low.
 *
 * The chain capacity is fixed at shard creation. A full chain is a capacity-planning error and
 * is surfaced as ChainFull, distinct from a lookup miss. Removal shifts later entries down, so
 * slot occupancy is just chain length: there are no tombstones to distinguish from emptiness.
 *
 *********************************************************************************************************************/

use std::fmt;

use crate::slabs::Handle;

/// An index entry: the identity hash of a page and the heap location of its record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageIdentity {
    pub hash_low: u64,
    pub location: Handle,
}

/// The collision chain for this slot is at capacity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainFull;

impl fmt::Display for ChainFull {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "collision chain is full")
    }
}

pub struct HashIndex {
    chains: Vec<Vec<PageIdentity>>,
    chain_capacity: usize,
}

impl HashIndex {
    pub fn new(slot_count: usize, chain_capacity: usize) -> HashIndex {
        let mut chains = Vec::with_capacity(slot_count);
        for _ in 0..slot_count {
            chains.push(Vec::new());
        }
        HashIndex {
            chains,
            chain_capacity,
        }
    }

    /// Every identity in the slot's chain whose hash_low matches. The caller confirms
    /// true ownership by title comparison on the referenced records.
    pub fn matches<'a>(
        &'a self,
        slot: usize,
        hash: u64,
    ) -> impl Iterator<Item = &'a PageIdentity> {
        self.chains[slot]
            .iter()
            .filter(move |identity| identity.hash_low == hash)
    }

    pub fn insert(&mut self, slot: usize, identity: PageIdentity) -> Result<(), ChainFull> {
        let chain = &mut self.chains[slot];
        if chain.len() >= self.chain_capacity {
            return Err(ChainFull);
        }
        chain.push(identity);
        Ok(())
    }

    /// Remove the identity matching hash and location, shifting later chain entries down
    pub fn remove(&mut self, slot: usize, hash: u64, location: Handle) -> bool {
        let chain = &mut self.chains[slot];
        match chain
            .iter()
            .position(|identity| identity.hash_low == hash && identity.location == location)
        {
            Some(position) => {
                chain.remove(position);
                true
            }
            None => false,
        }
    }

    /// Repoint the identity at `old` after heap compaction moved its record
    pub fn relocate(&mut self, slot: usize, hash: u64, old: Handle, new: Handle) {
        for identity in self.chains[slot].iter_mut() {
            if identity.hash_low == hash && identity.location == old {
                identity.location = new;
                return;
            }
        }
    }

    pub fn chain_len(&self, slot: usize) -> usize {
        self.chains[slot].len()
    }

    pub fn entry_count(&self) -> usize {
        self.chains.iter().map(|chain| chain.len()).sum()
    }
}

/* *****************************************************************************************************************
 *
 * Tests
 *
 * *****************************************************************************************************************/
