/* ********************************************************************************************************************
 *
 * Shard
 *
 * A shard pairs one hash index partition with one record heap partition, and owns an exact
 * power-of-two fraction of the hash space: the low shard_bits of a page's identity hash name
 * its owner, and the next significant_bits name the collision-chain slot inside that owner.
 * Both ingestion and queries route with the same shard_of(), always; changing the shard count
 * is an offline re-partition, never a live resize.
 *
 * A ShardStore is touched only by its owning task. Nothing here takes a lock: all cross-shard
 * traffic is a ShardCommand carrying its own response channel, and ownership of the message
 * transfers at each handoff. The ShardSet handle applies a timeout and a bounded retry to each
 * request; a shard that stays silent past the cap is reported as unavailable, never retried
 * forever.
 *
 *********************************************************************************************************************/

use std::{fmt, fs, io, path::Path};

use tokio::{sync::mpsc, task::JoinHandle, time};

use crate::entry::{self, PageRecord};
use crate::foundation::Foundation;
use crate::index::{HashIndex, PageIdentity};
use crate::slabs::{Handle, RecordHeap};

/// Give up on a shard response after this long
const SHARD_TIMEOUT: time::Duration = time::Duration::from_secs(5);

/// Attempts per request before the shard is reported unavailable
const SHARD_RETRY_LIMIT: u32 = 3;

/// The owning shard for an identity hash: its low shard_bits
pub fn shard_of(hash: u64, shard_bits: u32) -> usize {
    (hash & ((1u64 << shard_bits) - 1)) as usize
}

// ***********************************************************************************************

#[derive(Debug)]
pub enum StoreError {
    NotFound,
    CapacityExhausted,
    Codec(bincode::Error),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let msg = match self {
            StoreError::NotFound => "page not found".to_string(),
            StoreError::CapacityExhausted => "chain or heap capacity exhausted".to_string(),
            StoreError::Codec(error) => error.to_string(),
        };
        write!(f, "{}", msg)
    }
}

impl From<bincode::Error> for StoreError {
    fn from(error: bincode::Error) -> Self {
        StoreError::Codec(error)
    }
}

// ***********************************************************************************************

/// One page as seen by the weak-link census scan
#[derive(Debug, Clone)]
pub struct CensusEntry {
    pub hash: u64,
    pub outbound: Vec<u64>,
    pub is_weak_hub: bool,
}

/// Logical dump of one shard's records, sufficient to rebuild index and heap with
/// identical lookup behavior
#[derive(Deserialize, Serialize, Debug, Default)]
pub struct SavedShard {
    pub records: Vec<(u64, PageRecord)>,
}

pub struct ShardStore {
    shard_id: usize,
    index: HashIndex,
    heap: RecordHeap,
    shard_bits: u32,
    significant_bits: u32,
}

impl ShardStore {
    pub fn new(shard_id: usize, foundation: &Foundation) -> ShardStore {
        ShardStore {
            shard_id,
            index: HashIndex::new(foundation.get_slot_count(), foundation.get_chain_capacity()),
            heap: RecordHeap::new(foundation.get_slab_size(), foundation.get_slabs_per_shard()),
            shard_bits: foundation.get_shard_bits(),
            significant_bits: foundation.get_significant_bits(),
        }
    }

    fn slot(&self, hash: u64) -> usize {
        entry::slot_for(hash, self.shard_bits, self.significant_bits)
    }

    pub fn lookup_title(&self, title: &str) -> Option<PageRecord> {
        let hash = entry::title_hash(title);
        let slot = self.slot(hash);
        for identity in self.index.matches(slot, hash) {
            let bytes = self.heap.read(identity.location)?;
            if let Ok(record) = entry::decode_record(bytes) {
                if record.title == title {
                    return Some(record);
                }
            }
        }
        None
    }

    /// Hash-only lookup, used by traversal where only link hashes exist. A hash_low match is
    /// accepted without title confirmation here; dangling hashes resolve to None.
    pub fn lookup_hash(&self, hash: u64) -> Option<PageRecord> {
        let slot = self.slot(hash);
        let identity = self.index.matches(slot, hash).next()?;
        let bytes = self.heap.read(identity.location)?;
        entry::decode_record(bytes).ok()
    }

    /// Whole-record replace-or-create under the record's own title hash
    pub fn upsert(&mut self, record: PageRecord) -> Result<(), StoreError> {
        let hash = entry::title_hash(&record.title);
        self.upsert_with_hash(hash, record)
    }

    /// Replace-or-create under an explicit identity hash. The normal path derives the hash
    /// from the title; tests use this to force two titles onto one hash_low.
    pub fn upsert_with_hash(&mut self, hash: u64, record: PageRecord) -> Result<(), StoreError> {
        let slot = self.slot(hash);
        let bytes = entry::encode_record(hash, &record)?;

        // An existing identity matches by hash and then by title, never by hash alone
        let mut existing: Option<(Handle, usize)> = None;
        for identity in self.index.matches(slot, hash) {
            if let Some(stored_bytes) = self.heap.read(identity.location) {
                let stored = entry::decode_record(stored_bytes)?;
                if stored.title == record.title {
                    existing = Some((identity.location, stored_bytes.len()));
                    break;
                }
            }
        }

        match existing {
            Some((old, old_len)) if old_len == bytes.len() => {
                self.heap.overwrite(old, &bytes);
                Ok(())
            }
            Some((old, _)) => {
                // Place the replacement first so a full heap leaves the old record intact
                let mut new_location = self
                    .heap
                    .insert(&bytes)
                    .map_err(|_| StoreError::CapacityExhausted)?;
                for relocation in self.heap.remove(old) {
                    if relocation.old == new_location {
                        new_location = relocation.new;
                    }
                    let relocation_slot = self.slot(relocation.hash);
                    self.index
                        .relocate(relocation_slot, relocation.hash, relocation.old, relocation.new);
                }
                self.index.relocate(slot, hash, old, new_location);
                Ok(())
            }
            None => {
                let location = self
                    .heap
                    .insert(&bytes)
                    .map_err(|_| StoreError::CapacityExhausted)?;
                let identity = PageIdentity {
                    hash_low: hash,
                    location,
                };
                if self.index.insert(slot, identity).is_err() {
                    // A fresh record is the last in its slab, so this removal relocates nothing
                    self.heap.remove(location);
                    return Err(StoreError::CapacityExhausted);
                }
                Ok(())
            }
        }
    }

    /// Remove a page and compact the heap around it. Dangling references held in other pages'
    /// outbound sets are expected and resolve to lookup misses, not errors.
    pub fn delete(&mut self, title: &str) -> Result<(), StoreError> {
        let hash = entry::title_hash(title);
        let slot = self.slot(hash);

        let mut found: Option<Handle> = None;
        for identity in self.index.matches(slot, hash) {
            if let Some(bytes) = self.heap.read(identity.location) {
                if entry::decode_record(bytes)?.title == title {
                    found = Some(identity.location);
                    break;
                }
            }
        }

        let location = found.ok_or(StoreError::NotFound)?;
        self.index.remove(slot, hash, location);
        for relocation in self.heap.remove(location) {
            let relocation_slot = self.slot(relocation.hash);
            self.index
                .relocate(relocation_slot, relocation.hash, relocation.old, relocation.new);
        }
        Ok(())
    }

    /// Flip the weak-hub flag in place. Flag changes never alter the encoded length.
    pub fn set_weak_hub(&mut self, hash: u64, weak: bool) -> bool {
        let slot = self.slot(hash);
        let identity = match self.index.matches(slot, hash).next() {
            Some(identity) => *identity,
            None => return false,
        };
        let bytes = match self.heap.read(identity.location) {
            Some(bytes) => bytes,
            None => return false,
        };
        let mut record = match entry::decode_record(bytes) {
            Ok(record) => record,
            Err(_) => return false,
        };
        if record.flags.is_weak_hub == weak {
            return true;
        }
        record.flags.is_weak_hub = weak;
        match entry::encode_record(hash, &record) {
            Ok(encoded) => {
                self.heap.overwrite(identity.location, &encoded);
                true
            }
            Err(_) => false,
        }
    }

    /// Every stored page's hash and outbound set, for the periodic weak-link scan
    pub fn census(&self) -> Vec<CensusEntry> {
        let mut entries = Vec::new();
        for (hash, _, bytes) in self.heap.records() {
            if let Ok(record) = entry::decode_record(bytes) {
                entries.push(CensusEntry {
                    hash,
                    outbound: record.outbound,
                    is_weak_hub: record.flags.is_weak_hub,
                });
            }
        }
        entries
    }

    pub fn entry_count(&self) -> usize {
        self.index.entry_count()
    }

    pub fn save(&self) -> SavedShard {
        let mut records = Vec::new();
        for (hash, _, bytes) in self.heap.records() {
            if let Ok(record) = entry::decode_record(bytes) {
                records.push((hash, record));
            }
        }
        SavedShard { records }
    }

    pub fn restore(
        shard_id: usize,
        foundation: &Foundation,
        saved: SavedShard,
    ) -> Result<ShardStore, StoreError> {
        let mut store = ShardStore::new(shard_id, foundation);
        for (hash, record) in saved.records {
            store.upsert_with_hash(hash, record)?;
        }
        Ok(store)
    }
}

/* *****************************************************************************************************************
 *
 * Dataset persistence
 *
 * One bincode file holding every shard's logical record dump plus the hash geometry it was
 * built with. Reload into a different geometry would silently re-route identities, so it is
 * refused; re-partitioning is an offline migration.
 *
 * *****************************************************************************************************************/

#[derive(Deserialize, Serialize, Debug)]
pub struct SavedDataset {
    pub shard_bits: u32,
    pub significant_bits: u32,
    pub shards: Vec<SavedShard>,
}

#[derive(Debug)]
pub enum PersistError {
    Io(io::Error),
    Codec(bincode::Error),
    Geometry(String),
}

impl fmt::Display for PersistError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let msg = match self {
            PersistError::Io(error) => error.to_string(),
            PersistError::Codec(error) => error.to_string(),
            PersistError::Geometry(message) => message.to_string(),
        };
        write!(f, "{}", msg)
    }
}

impl From<io::Error> for PersistError {
    fn from(error: io::Error) -> Self {
        PersistError::Io(error)
    }
}

impl From<bincode::Error> for PersistError {
    fn from(error: bincode::Error) -> Self {
        PersistError::Codec(error)
    }
}

pub fn write_dataset(path: &Path, dataset: &SavedDataset) -> Result<(), PersistError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = fs::File::create(path)?;
    let writer = io::BufWriter::new(file);
    bincode::serialize_into(writer, dataset)?;
    Ok(())
}

pub fn read_dataset(path: &Path, foundation: &Foundation) -> Result<SavedDataset, PersistError> {
    let file = fs::File::open(path)?;
    let reader = io::BufReader::new(file);
    let dataset: SavedDataset = bincode::deserialize_from(reader)?;
    if dataset.shard_bits != foundation.get_shard_bits()
        || dataset.significant_bits != foundation.get_significant_bits()
        || dataset.shards.len() != foundation.get_shard_count() as usize
    {
        return Err(PersistError::Geometry(format!(
            "dataset was built with {} shards / {} index bits; re-partition offline to change",
            1u32 << dataset.shard_bits,
            dataset.significant_bits
        )));
    }
    Ok(dataset)
}

/* *****************************************************************************************************************
 *
 * Shard owner task and handles
 *
 * *****************************************************************************************************************/

#[derive(Debug)]
pub enum ShardCommand {
    End,
    LookupTitle {
        title: String,
        response_tx_handle: mpsc::Sender<ShardResponse>,
    },
    LookupHash {
        hash: u64,
        response_tx_handle: mpsc::Sender<ShardResponse>,
    },
    Upsert {
        hash: u64,
        record: PageRecord,
        response_tx_handle: mpsc::Sender<ShardResponse>,
    },
    Delete {
        title: String,
        response_tx_handle: mpsc::Sender<ShardResponse>,
    },
    SetWeakHub {
        hash: u64,
        weak: bool,
        response_tx_handle: mpsc::Sender<ShardResponse>,
    },
    Census {
        response_tx_handle: mpsc::Sender<ShardResponse>,
    },
    Save {
        response_tx_handle: mpsc::Sender<ShardResponse>,
    },
}

#[derive(Debug)]
pub enum ShardResponse {
    Record(Option<PageRecord>),
    Stored,
    NoSpace,
    Deleted(bool),
    Flagged(bool),
    Census(Vec<CensusEntry>),
    Saved(SavedShard),
}

impl fmt::Display for ShardCommand {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let msg = match self {
            ShardCommand::End => "End".to_string(),
            ShardCommand::LookupTitle { title, .. } => format!("LookupTitle:: Title: {}", title),
            ShardCommand::LookupHash { hash, .. } => format!("LookupHash:: Hash: {:x}", hash),
            ShardCommand::Upsert { record, .. } => format!("Upsert:: Title: {}", record.title),
            ShardCommand::Delete { title, .. } => format!("Delete:: Title: {}", title),
            ShardCommand::SetWeakHub { hash, weak, .. } => {
                format!("SetWeakHub:: Hash: {:x} -> {}", hash, weak)
            }
            ShardCommand::Census { .. } => "Census".to_string(),
            ShardCommand::Save { .. } => "Save".to_string(),
        };
        write!(f, "{}", msg)
    }
}

// ***********************************************************************************************

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessError {
    ShardUnavailable,
    CapacityExhausted,
}

impl fmt::Display for AccessError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let msg = match self {
            AccessError::ShardUnavailable => "shard unavailable",
            AccessError::CapacityExhausted => "chain or heap capacity exhausted",
        };
        write!(f, "{}", msg)
    }
}

type TxCommand = mpsc::Sender<ShardCommand>;
type RxCommand = mpsc::Receiver<ShardCommand>;
type TxCommands = Vec<TxCommand>;

/// Routing handle over the full shard set. Cloned freely into workers; every clone routes
/// identically because shard_of is pure and the shard count is fixed.
#[derive(Clone)]
pub struct ShardSet {
    tx_commands: TxCommands,
    shard_bits: u32,
}

/// Create the shard owner tasks with empty stores
pub async fn new(foundation: &Foundation) -> (Vec<JoinHandle<()>>, ShardSet) {
    trace!("shard::new");
    let stores = (0..foundation.get_shard_count() as usize)
        .map(|shard_id| ShardStore::new(shard_id, foundation))
        .collect();
    from_stores(foundation, stores).await
}

/// Create the shard owner tasks around pre-built stores (boot-time dataset load)
pub async fn from_stores(
    foundation: &Foundation,
    stores: Vec<ShardStore>,
) -> (Vec<JoinHandle<()>>, ShardSet) {
    let shard_count = stores.len();
    let mut tx_commands: TxCommands = Vec::with_capacity(shard_count);
    let mut join_handles: Vec<JoinHandle<()>> = Vec::with_capacity(shard_count);

    for store in stores {
        let (tx_command, rx_command) = mpsc::channel(shard_count * 4);
        tx_commands.push(tx_command);
        join_handles.push(tokio::spawn(async move {
            shard_service(store, rx_command).await
        }));
    }

    let shard_set = ShardSet {
        tx_commands,
        shard_bits: foundation.get_shard_bits(),
    };
    (join_handles, shard_set)
}

async fn shard_service(mut store: ShardStore, mut rx_command: RxCommand) {
    trace!("shard::shard_service: Spawned shard_service {}", store.shard_id);
    loop {
        use ShardCommand::*;

        let shard_command = match rx_command.recv().await {
            Some(command) => command,
            None => break,
        };
        debug!("shard {}:: Rx command -> {}", store.shard_id, &shard_command);
        match shard_command {
            End => break,
            LookupTitle {
                title,
                response_tx_handle,
            } => {
                let record = store.lookup_title(&title);
                let _ = response_tx_handle.send(ShardResponse::Record(record)).await;
            }
            LookupHash {
                hash,
                response_tx_handle,
            } => {
                let record = store.lookup_hash(hash);
                let _ = response_tx_handle.send(ShardResponse::Record(record)).await;
            }
            Upsert {
                hash,
                record,
                response_tx_handle,
            } => {
                let response = match store.upsert_with_hash(hash, record) {
                    Ok(()) => ShardResponse::Stored,
                    Err(StoreError::CapacityExhausted) => ShardResponse::NoSpace,
                    Err(error) => {
                        error!("shard {}:: upsert failed: {}", store.shard_id, error);
                        ShardResponse::NoSpace
                    }
                };
                let _ = response_tx_handle.send(response).await;
            }
            Delete {
                title,
                response_tx_handle,
            } => {
                let deleted = store.delete(&title).is_ok();
                let _ = response_tx_handle.send(ShardResponse::Deleted(deleted)).await;
            }
            SetWeakHub {
                hash,
                weak,
                response_tx_handle,
            } => {
                let flagged = store.set_weak_hub(hash, weak);
                let _ = response_tx_handle.send(ShardResponse::Flagged(flagged)).await;
            }
            Census { response_tx_handle } => {
                let _ = response_tx_handle
                    .send(ShardResponse::Census(store.census()))
                    .await;
            }
            Save { response_tx_handle } => {
                let _ = response_tx_handle
                    .send(ShardResponse::Saved(store.save()))
                    .await;
            }
        }
    }
    debug!("Shard {} exiting...", store.shard_id);
}

impl ShardSet {
    pub fn shard_count(&self) -> usize {
        self.tx_commands.len()
    }

    pub fn get_shard_bits(&self) -> u32 {
        self.shard_bits
    }

    pub async fn end(&self) {
        for tx_command in &self.tx_commands {
            let _ = tx_command.send(ShardCommand::End).await;
        }
    }

    /// Send one command to one shard and await its response, within the timeout and retry caps
    async fn call<F>(&self, shard: usize, make_command: F) -> Result<ShardResponse, AccessError>
    where
        F: Fn(mpsc::Sender<ShardResponse>) -> ShardCommand,
    {
        for _ in 0..SHARD_RETRY_LIMIT {
            let (response_tx_handle, mut response_rx) = mpsc::channel(1);
            if self.tx_commands[shard]
                .send(make_command(response_tx_handle))
                .await
                .is_err()
            {
                // Owner task is gone; retrying cannot bring it back
                break;
            }
            match time::timeout(SHARD_TIMEOUT, response_rx.recv()).await {
                Ok(Some(response)) => return Ok(response),
                Ok(None) | Err(_) => continue,
            }
        }
        Err(AccessError::ShardUnavailable)
    }

    pub async fn lookup_title(&self, title: &str) -> Result<Option<PageRecord>, AccessError> {
        let hash = entry::title_hash(title);
        let shard = shard_of(hash, self.shard_bits);
        match self
            .call(shard, |response_tx_handle| ShardCommand::LookupTitle {
                title: title.to_string(),
                response_tx_handle,
            })
            .await?
        {
            ShardResponse::Record(record) => Ok(record),
            _ => Err(AccessError::ShardUnavailable),
        }
    }

    pub async fn lookup_hash(&self, hash: u64) -> Result<Option<PageRecord>, AccessError> {
        let shard = shard_of(hash, self.shard_bits);
        match self
            .call(shard, |response_tx_handle| ShardCommand::LookupHash {
                hash,
                response_tx_handle,
            })
            .await?
        {
            ShardResponse::Record(record) => Ok(record),
            _ => Err(AccessError::ShardUnavailable),
        }
    }

    pub async fn upsert(&self, hash: u64, record: PageRecord) -> Result<(), AccessError> {
        let shard = shard_of(hash, self.shard_bits);
        match self
            .call(shard, |response_tx_handle| ShardCommand::Upsert {
                hash,
                record: record.clone(),
                response_tx_handle,
            })
            .await?
        {
            ShardResponse::Stored => Ok(()),
            ShardResponse::NoSpace => Err(AccessError::CapacityExhausted),
            _ => Err(AccessError::ShardUnavailable),
        }
    }

    pub async fn delete(&self, title: &str) -> Result<bool, AccessError> {
        let hash = entry::title_hash(title);
        let shard = shard_of(hash, self.shard_bits);
        match self
            .call(shard, |response_tx_handle| ShardCommand::Delete {
                title: title.to_string(),
                response_tx_handle,
            })
            .await?
        {
            ShardResponse::Deleted(deleted) => Ok(deleted),
            _ => Err(AccessError::ShardUnavailable),
        }
    }

    pub async fn set_weak_hub(&self, hash: u64, weak: bool) -> Result<bool, AccessError> {
        let shard = shard_of(hash, self.shard_bits);
        match self
            .call(shard, |response_tx_handle| ShardCommand::SetWeakHub {
                hash,
                weak,
                response_tx_handle,
            })
            .await?
        {
            ShardResponse::Flagged(flagged) => Ok(flagged),
            _ => Err(AccessError::ShardUnavailable),
        }
    }

    /// Census of every shard, flattened. Inbound counts are derivable only by scanning all
    /// outbound sets; there is no reverse-edge index to consult.
    pub async fn census(&self) -> Result<Vec<CensusEntry>, AccessError> {
        let mut entries = Vec::new();
        for shard in 0..self.shard_count() {
            match self
                .call(shard, |response_tx_handle| ShardCommand::Census {
                    response_tx_handle,
                })
                .await?
            {
                ShardResponse::Census(shard_entries) => entries.extend(shard_entries),
                _ => return Err(AccessError::ShardUnavailable),
            }
        }
        Ok(entries)
    }

    /// Snapshot every shard in shard order. The caller holds the persistence gate, so no
    /// ingestion runs between the first snapshot and the last.
    pub async fn save(&self) -> Result<Vec<SavedShard>, AccessError> {
        let mut shards = Vec::with_capacity(self.shard_count());
        for shard in 0..self.shard_count() {
            match self
                .call(shard, |response_tx_handle| ShardCommand::Save {
                    response_tx_handle,
                })
                .await?
            {
                ShardResponse::Saved(saved) => shards.push(saved),
                _ => return Err(AccessError::ShardUnavailable),
            }
        }
        Ok(shards)
    }
}

/* *****************************************************************************************************************
 *
 * Tests
 *
 * *****************************************************************************************************************/
