//! Page identity digests, the shard/slot bit layout, and the record codec

pub(crate) type Digest = [u8; 16];

/// Bytes prepended to every record in a slab: u32 total length + u64 hash_low
pub const RECORD_HEADER: usize = 12;

/* *****************************************************************************************************************
 *
 * Digest[0;8] (little-endian) form hash_low, the 64-bit identity hash of a page title. The full
 * md5 digest is only ever recomputed from the title; hash_low is what is stored, routed on, and
 * compared. Two distinct titles may share a hash_low, so a match on hash_low is always confirmed
 * by comparing the full title held in the referenced record.
 *
 * The low shard_bits of hash_low select the owning shard. If there are fewer than 2^16 shards,
 * the additional bits are ignored when determining the id, but remain significant when matching
 * the overall hash.
 *
 * The next significant_bits above the shard bits select the collision-chain slot within the
 * owning shard's hash index, so shard selection and slot selection never overlap.
 *
 * The endianness of the processor is not significant, providing all conversions are consistent.
 *
 * To determine the owning shard:-
 *     do a boolean AND between hash_low and (shard_count - 1)
 *     the resulting value is the index into the vector of shard command handles
 *
 * To determine the index slot:-
 *     shift hash_low right by shard_bits
 *     do a boolean AND between the result and (slot_count - 1)
 *     the resulting value is the index into the vector of collision chains
 *
 *******************************************************************************************************************/

pub fn get_digest(title: &str) -> Digest {
    md5::compute(title).into()
}

pub fn hash_low(digest: &Digest) -> u64 {
    u64::from_le_bytes(digest[0..8].try_into().unwrap())
}

/// Identity hash of a title: the low 64 bits of its md5 digest
pub fn title_hash(title: &str) -> u64 {
    hash_low(&get_digest(title))
}

/// Collision-chain slot for a hash within its owning shard
pub fn slot_for(hash: u64, shard_bits: u32, significant_bits: u32) -> usize {
    ((hash >> shard_bits) & ((1u64 << significant_bits) - 1)) as usize
}

/// Seconds since the unix epoch
pub fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// ***********************************************************************************************

#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct PageFlags {
    pub is_disambiguation: bool,
    pub is_stub: bool,
    pub is_redirect: bool,
    pub is_weak_hub: bool,
}

/// One stored page: title, outbound link hashes, and metadata.
///
/// A redirect page stores its target in `redirect` rather than in `outbound`, so it carries
/// zero direct outbound edges while still pointing at the target's hash. Records are whole-
/// record replace-or-create; nothing ever updates one in part.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct PageRecord {
    pub title: String,
    pub outbound: Vec<u64>,
    pub redirect: Option<u64>,
    pub flags: PageFlags,
    pub last_loaded: u64,
}

impl PageRecord {
    /// Placeholder for a page that has been referenced but not yet loaded
    pub fn stub(title: &str) -> PageRecord {
        PageRecord {
            title: title.to_string(),
            outbound: Vec::new(),
            redirect: None,
            flags: PageFlags {
                is_stub: true,
                ..PageFlags::default()
            },
            last_loaded: 0,
        }
    }

    pub fn full(title: &str, outbound: Vec<u64>, last_loaded: u64) -> PageRecord {
        PageRecord {
            title: title.to_string(),
            outbound,
            redirect: None,
            flags: PageFlags::default(),
            last_loaded,
        }
    }
}

/* *****************************************************************************************************************
 *
 * Record codec
 *
 * Records are packed into slabs as [u32 total_len][u64 hash_low][bincode payload]. The length
 * prefix covers the header, so a slab can be walked record-to-record without deserializing
 * payloads, and the hash in the header lets compaction repoint index entries without decoding
 * titles.
 *
 * *****************************************************************************************************************/

pub fn encode_record(hash: u64, record: &PageRecord) -> Result<Vec<u8>, bincode::Error> {
    let payload = bincode::serialize(record)?;
    let total = RECORD_HEADER + payload.len();
    let mut bytes = Vec::with_capacity(total);
    bytes.extend_from_slice(&(total as u32).to_le_bytes());
    bytes.extend_from_slice(&hash.to_le_bytes());
    bytes.extend_from_slice(&payload);
    Ok(bytes)
}

/// Total length of the record starting at `bytes`, header included
pub fn peek_len(bytes: &[u8]) -> usize {
    u32::from_le_bytes(bytes[0..4].try_into().unwrap()) as usize
}

pub fn peek_hash(bytes: &[u8]) -> u64 {
    u64::from_le_bytes(bytes[4..12].try_into().unwrap())
}

pub fn decode_record(bytes: &[u8]) -> Result<PageRecord, bincode::Error> {
    bincode::deserialize(&bytes[RECORD_HEADER..peek_len(bytes)])
}

/* *****************************************************************************************************************
 *
 * Tests
 *
 * *****************************************************************************************************************/
