/* ********************************************************************************************************************
 *
 * Record heap
 *
 * A shard's records live in a sequence of fixed-capacity 1MB slabs. Records are packed with no
 * gaps: a slab is a contiguous prefix of live records followed by free space. Insertion is
 * first-fit across existing slabs; a new slab is allocated only when no existing slab has room,
 * and the slab count is capped by the foundation's slabs-per-shard figure, so exhaustion is a
 * capacity-planning error surfaced to the caller rather than a transient fault.
 *
 * Because records are variable length, deleting one moves every record after it in the same
 * slab. Records are therefore addressed by a (slab, offset) handle, never a raw address, and
 * removal reports a relocation list so the owner can repoint its index entries at the shifted
 * records. The record header carries the identity hash for exactly this purpose: compaction
 * never needs to deserialize a payload.
 *
 *********************************************************************************************************************/

use std::fmt;

use crate::entry;

/// Location of a record within a shard's heap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handle {
    pub slab: u16,
    pub offset: u32,
}

/// A record moved by compaction; index entries holding `old` must be repointed to `new`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relocation {
    pub hash: u64,
    pub old: Handle,
    pub new: Handle,
}

/// No slab has room and the slab cap has been reached
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapFull;

impl fmt::Display for HeapFull {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "record heap is full")
    }
}

struct Slab {
    data: Vec<u8>,
    used: usize,
}

impl Slab {
    fn new(size: usize) -> Slab {
        Slab {
            data: vec![0; size],
            used: 0,
        }
    }
}

pub struct RecordHeap {
    slabs: Vec<Slab>,
    slab_size: usize,
    max_slabs: usize,
}

impl RecordHeap {
    pub fn new(slab_size: usize, max_slabs: u32) -> RecordHeap {
        RecordHeap {
            slabs: Vec::new(),
            slab_size,
            max_slabs: max_slabs as usize,
        }
    }

    /// Place an encoded record, first-fit across existing slabs before growth
    pub fn insert(&mut self, bytes: &[u8]) -> Result<Handle, HeapFull> {
        if bytes.len() > self.slab_size {
            return Err(HeapFull);
        }

        for (slab_id, slab) in self.slabs.iter_mut().enumerate() {
            if self.slab_size - slab.used >= bytes.len() {
                let handle = Handle {
                    slab: slab_id as u16,
                    offset: slab.used as u32,
                };
                slab.data[slab.used..slab.used + bytes.len()].copy_from_slice(bytes);
                slab.used += bytes.len();
                return Ok(handle);
            }
        }

        if self.slabs.len() >= self.max_slabs {
            return Err(HeapFull);
        }

        let mut slab = Slab::new(self.slab_size);
        slab.data[..bytes.len()].copy_from_slice(bytes);
        slab.used = bytes.len();
        self.slabs.push(slab);
        Ok(Handle {
            slab: (self.slabs.len() - 1) as u16,
            offset: 0,
        })
    }

    /// The full encoded record at `handle`, header included
    pub fn read(&self, handle: Handle) -> Option<&[u8]> {
        let slab = self.slabs.get(handle.slab as usize)?;
        let offset = handle.offset as usize;
        if offset + entry::RECORD_HEADER > slab.used {
            return None;
        }
        let len = entry::peek_len(&slab.data[offset..]);
        if offset + len > slab.used {
            return None;
        }
        Some(&slab.data[offset..offset + len])
    }

    /// Overwrite a record in place. Only valid for an encoding of exactly the same length;
    /// any other size must go through remove + insert so the slab stays gap-free.
    pub fn overwrite(&mut self, handle: Handle, bytes: &[u8]) {
        let slab = &mut self.slabs[handle.slab as usize];
        let offset = handle.offset as usize;
        let len = entry::peek_len(&slab.data[offset..]);
        assert_eq!(len, bytes.len(), "in-place overwrite must not change record length");
        slab.data[offset..offset + len].copy_from_slice(bytes);
    }

    /// Remove the record at `handle`, shifting the slab tail down to close the hole.
    /// Returns the relocations of every shifted record.
    pub fn remove(&mut self, handle: Handle) -> Vec<Relocation> {
        let slab_id = handle.slab as usize;
        let offset = handle.offset as usize;
        let len = {
            let slab = &self.slabs[slab_id];
            entry::peek_len(&slab.data[offset..])
        };

        let slab = &mut self.slabs[slab_id];
        slab.data.copy_within(offset + len..slab.used, offset);
        slab.used -= len;

        let mut relocations = Vec::new();
        let mut cursor = offset;
        while cursor < slab.used {
            let record_len = entry::peek_len(&slab.data[cursor..]);
            relocations.push(Relocation {
                hash: entry::peek_hash(&slab.data[cursor..]),
                old: Handle {
                    slab: handle.slab,
                    offset: (cursor + len) as u32,
                },
                new: Handle {
                    slab: handle.slab,
                    offset: cursor as u32,
                },
            });
            cursor += record_len;
        }
        relocations
    }

    /// Walk every live record as (hash_low, handle, encoded bytes)
    pub fn records(&self) -> impl Iterator<Item = (u64, Handle, &[u8])> {
        self.slabs.iter().enumerate().flat_map(|(slab_id, slab)| {
            let mut found = Vec::new();
            let mut cursor = 0usize;
            while cursor < slab.used {
                let len = entry::peek_len(&slab.data[cursor..]);
                found.push((
                    entry::peek_hash(&slab.data[cursor..]),
                    Handle {
                        slab: slab_id as u16,
                        offset: cursor as u32,
                    },
                    &slab.data[cursor..cursor + len],
                ));
                cursor += len;
            }
            found
        })
    }

    pub fn slab_count(&self) -> usize {
        self.slabs.len()
    }

    /// Bytes occupied by the live-record prefix of a slab
    pub fn occupied(&self, slab: usize) -> usize {
        self.slabs[slab].used
    }
}

/* *****************************************************************************************************************
 *
 * Tests
 *
 * *****************************************************************************************************************/
