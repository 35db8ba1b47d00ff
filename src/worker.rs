/* ********************************************************************************************************************
 *
 * Worker pool
 *
 * Workers are stateless: each one holds routing handles to the shard owners, an optional handle
 * to the fetch thread, and its own seeded random source for the refresh policy. All graph state
 * lives behind the shard boundary. The api dispatcher fans requests over the pool round-robin;
 * any worker can serve any request.
 *
 * In all cases, a request to a worker includes a moved cloned tx handle that is used for the
 * response.
 *
 * Persistence is the one globally exclusive operation: a save takes the write side of the
 * ingest gate, quiescing every worker's ingestion before the first shard snapshot and until
 * the last. Reads are not blocked.
 *
 *******************************************************************************************************************/

use std::{
    fmt,
    path::PathBuf,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use rand::{rngs::StdRng, SeedableRng};
use tokio::{
    sync::{mpsc, RwLock},
    task::JoinHandle,
};

use crate::entry;
use crate::fetch::FetchHandle;
use crate::foundation::Foundation;
use crate::ingest::{self, IngestOutcome};
use crate::query::{self, PathSet, QueryError, Subgraph};
use crate::shard::{self, AccessError, SavedDataset, ShardSet};

// ***********************************************************************************************

#[derive(Debug)]
pub enum WorkerCommand {
    End,
    UpdatePage {
        title: String,
        links: Vec<String>,
        response_tx_handle: mpsc::Sender<WorkerResponse>,
    },
    GetLinks {
        title: String,
        degrees: u32,
        response_tx_handle: mpsc::Sender<WorkerResponse>,
    },
    PathsBetween {
        source: String,
        target: String,
        response_tx_handle: mpsc::Sender<WorkerResponse>,
    },
    SaveDataset {
        filename: Option<PathBuf>,
        response_tx_handle: mpsc::Sender<WorkerResponse>,
    },
}

#[derive(Debug)]
pub enum WorkerResponse {
    Update(Result<IngestOutcome, AccessError>),
    Links(Result<Subgraph, QueryError>),
    Paths(Result<PathSet, QueryError>),
    Saved(Result<PathBuf, String>),
}

impl fmt::Display for WorkerCommand {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let msg = match self {
            WorkerCommand::End => "End".to_string(),
            WorkerCommand::UpdatePage { title, links, .. } => {
                format!("UpdatePage:: Title: {} ({} links)", title, links.len())
            }
            WorkerCommand::GetLinks { title, degrees, .. } => {
                format!("GetLinks:: Title: {} Degrees: {}", title, degrees)
            }
            WorkerCommand::PathsBetween { source, target, .. } => {
                format!("PathsBetween:: {} -> {}", source, target)
            }
            WorkerCommand::SaveDataset { filename, .. } => {
                format!("SaveDataset:: {:?}", filename)
            }
        };
        write!(f, "{}", msg)
    }
}

pub struct Worker {
    worker_id: usize,
    shards: ShardSet,
    fetch: Option<FetchHandle>,
    foundation: Foundation,
    gate: Arc<RwLock<()>>,
    rng: StdRng,
    save_path: PathBuf,
    rx_command: RxCommand,
}

type TxCommand = mpsc::Sender<WorkerCommand>;
type RxCommand = mpsc::Receiver<WorkerCommand>;
type TxCommands = Vec<TxCommand>;

/// Create worker tasks

pub async fn new(
    foundation: &Foundation,
    shards: ShardSet,
    fetch: Option<FetchHandle>,
    seed: u64,
    save_path: PathBuf,
) -> (Vec<JoinHandle<()>>, Dispatcher) {
    trace!("worker::new");

    let worker_count: usize = foundation.get_worker_count().try_into().unwrap();
    let gate = Arc::new(RwLock::new(()));

    let mut tx_commands: TxCommands = Vec::with_capacity(worker_count);
    let mut join_handles: Vec<JoinHandle<()>> = Vec::with_capacity(worker_count);

    for worker_id in 0..worker_count {
        let (tx_command, rx_command) = mpsc::channel(worker_count);
        tx_commands.push(tx_command);
        let worker = Worker {
            worker_id,
            shards: shards.clone(),
            fetch: fetch.clone(),
            foundation: foundation.clone(),
            gate: gate.clone(),
            // Distinct stream per worker, reproducible for a given seed and worker id
            rng: StdRng::seed_from_u64(seed.wrapping_add(worker_id as u64)),
            save_path: save_path.clone(),
            rx_command,
        };
        join_handles.push(tokio::spawn(async move {
            Worker::worker_service(worker).await
        }));
    }
    (join_handles, Dispatcher::new(tx_commands))
}

pub async fn shut_down(
    join_handles: Vec<JoinHandle<()>>,
) -> Result<(), Box<dyn std::error::Error>> {
    // Join long running tasks
    for join_handle in join_handles {
        tokio::try_join!(join_handle)?;
    }
    Ok(())
}

impl Worker {
    async fn worker_service(mut worker: Worker) {
        trace!("worker::worker_service: Spawned worker_service");
        loop {
            use WorkerCommand::*;

            let worker_command = match worker.rx_command.recv().await {
                Some(command) => command,
                None => break,
            };
            debug!(
                "worker {}:: Rx command -> {}",
                worker.worker_id, &worker_command
            );
            match worker_command {
                End => break,
                UpdatePage {
                    title,
                    links,
                    response_tx_handle,
                } => {
                    let response = worker.update_page(&title, &links).await;
                    let _ = response_tx_handle.send(response).await;
                }
                GetLinks {
                    title,
                    degrees,
                    response_tx_handle,
                } => {
                    let response = worker.get_links(&title, degrees).await;
                    let _ = response_tx_handle.send(response).await;
                }
                PathsBetween {
                    source,
                    target,
                    response_tx_handle,
                } => {
                    let response = worker.paths_between(&source, &target).await;
                    let _ = response_tx_handle.send(response).await;
                }
                SaveDataset {
                    filename,
                    response_tx_handle,
                } => {
                    let response = worker.save_dataset(filename).await;
                    let _ = response_tx_handle.send(response).await;
                }
            }
        }
        debug!("Worker {} exiting...", worker.worker_id);
    }

    async fn update_page(&mut self, title: &str, links: &[String]) -> WorkerResponse {
        // Ingestion yields to a save in progress
        let _shared = self.gate.read().await;
        let outcome = ingest::update_page(
            &self.shards,
            self.fetch.as_ref(),
            title,
            links,
            entry::now_secs(),
        )
        .await;
        WorkerResponse::Update(outcome)
    }

    async fn get_links(&mut self, title: &str, degrees: u32) -> WorkerResponse {
        self.maybe_refresh(title).await;
        WorkerResponse::Links(query::get_links(&self.shards, title, degrees).await)
    }

    async fn paths_between(&mut self, source: &str, target: &str) -> WorkerResponse {
        self.maybe_refresh(source).await;
        self.maybe_refresh(target).await;
        WorkerResponse::Paths(query::paths_between(&self.shards, source, target).await)
    }

    /// The stale-read refresh roll. On a hit the page is re-ingested from the external
    /// source before the query runs; if the source is unavailable the stored record serves.
    async fn maybe_refresh(&mut self, title: &str) {
        let record = match self.shards.lookup_title(title).await {
            Ok(Some(record)) => record,
            _ => return,
        };
        let now = entry::now_secs();
        if !ingest::should_refresh(record.last_loaded, now, &mut self.rng) {
            return;
        }
        let _shared = self.gate.read().await;
        match ingest::refresh_page(&self.shards, self.fetch.as_ref(), title, now).await {
            Ok(true) => info!("worker {}:: refreshed stale page {}", self.worker_id, title),
            Ok(false) => debug!(
                "worker {}:: stale page {} kept; source unavailable",
                self.worker_id, title
            ),
            Err(error) => debug!(
                "worker {}:: refresh of {} failed: {}",
                self.worker_id, title, error
            ),
        }
    }

    async fn save_dataset(&self, filename: Option<PathBuf>) -> WorkerResponse {
        // Globally exclusive: no ingestion between the first shard snapshot and the last
        let _exclusive = self.gate.write().await;
        let path = filename.unwrap_or_else(|| self.save_path.clone());
        info!("worker {}:: saving dataset to {:?}", self.worker_id, path);

        let shards = match self.shards.save().await {
            Ok(shards) => shards,
            Err(error) => return WorkerResponse::Saved(Err(error.to_string())),
        };
        let dataset = SavedDataset {
            shard_bits: self.foundation.get_shard_bits(),
            significant_bits: self.foundation.get_significant_bits(),
            shards,
        };
        match shard::write_dataset(&path, &dataset) {
            Ok(()) => WorkerResponse::Saved(Ok(path)),
            Err(error) => WorkerResponse::Saved(Err(error.to_string())),
        }
    }
}

/* *****************************************************************************************************************
 *
 * Dispatcher
 *
 * The api task holds one of these. Requests fan out over the worker pool round-robin; the
 * worker owns the request for its duration and answers on the response handle it was given.
 *
 * *****************************************************************************************************************/

#[derive(Clone)]
pub struct Dispatcher {
    tx_commands: TxCommands,
    next: Arc<AtomicUsize>,
}

impl Dispatcher {
    fn new(tx_commands: TxCommands) -> Dispatcher {
        Dispatcher {
            tx_commands,
            next: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub async fn end(&self) {
        for tx_command in &self.tx_commands {
            let _ = tx_command.send(WorkerCommand::End).await;
        }
    }

    async fn dispatch<F>(&self, make_command: F) -> Option<WorkerResponse>
    where
        F: FnOnce(mpsc::Sender<WorkerResponse>) -> WorkerCommand,
    {
        let worker = self.next.fetch_add(1, Ordering::Relaxed) % self.tx_commands.len();
        let (response_tx_handle, mut response_rx) = mpsc::channel(1);
        if self.tx_commands[worker]
            .send(make_command(response_tx_handle))
            .await
            .is_err()
        {
            return None;
        }
        response_rx.recv().await
    }

    pub async fn update_page(
        &self,
        title: String,
        links: Vec<String>,
    ) -> Option<Result<IngestOutcome, AccessError>> {
        match self
            .dispatch(|response_tx_handle| WorkerCommand::UpdatePage {
                title,
                links,
                response_tx_handle,
            })
            .await
        {
            Some(WorkerResponse::Update(result)) => Some(result),
            _ => None,
        }
    }

    pub async fn get_links(
        &self,
        title: String,
        degrees: u32,
    ) -> Option<Result<Subgraph, QueryError>> {
        match self
            .dispatch(|response_tx_handle| WorkerCommand::GetLinks {
                title,
                degrees,
                response_tx_handle,
            })
            .await
        {
            Some(WorkerResponse::Links(result)) => Some(result),
            _ => None,
        }
    }

    pub async fn paths_between(
        &self,
        source: String,
        target: String,
    ) -> Option<Result<PathSet, QueryError>> {
        match self
            .dispatch(|response_tx_handle| WorkerCommand::PathsBetween {
                source,
                target,
                response_tx_handle,
            })
            .await
        {
            Some(WorkerResponse::Paths(result)) => Some(result),
            _ => None,
        }
    }

    pub async fn save_dataset(
        &self,
        filename: Option<PathBuf>,
    ) -> Option<Result<PathBuf, String>> {
        match self
            .dispatch(|response_tx_handle| WorkerCommand::SaveDataset {
                filename,
                response_tx_handle,
            })
            .await
        {
            Some(WorkerResponse::Saved(result)) => Some(result),
            _ => None,
        }
    }
}

/* *****************************************************************************************************************
 *
 * Tests
 *
 * *****************************************************************************************************************/

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foundation::tests::get_test_foundation;

    async fn pool() -> (
        Vec<JoinHandle<()>>,
        Vec<JoinHandle<()>>,
        ShardSet,
        Dispatcher,
    ) {
        let foundation = get_test_foundation();
        let (shard_handles, shards) = shard::new(&foundation).await;
        let save_path = std::env::temp_dir().join("wiki_paths_worker_test.bin");
        let (worker_handles, dispatcher) =
            new(&foundation, shards.clone(), None, 0, save_path).await;
        (shard_handles, worker_handles, shards, dispatcher)
    }

    async fn shut_down_all(
        shard_handles: Vec<JoinHandle<()>>,
        worker_handles: Vec<JoinHandle<()>>,
        shards: &ShardSet,
        dispatcher: &Dispatcher,
    ) {
        dispatcher.end().await;
        shut_down(worker_handles).await.unwrap();
        shards.end().await;
        for join_handle in shard_handles {
            tokio::try_join!(join_handle).unwrap();
        }
    }

    #[tokio::test]
    async fn test_new_worker() {
        let (shard_handles, mut worker_handles, shards, dispatcher) = pool().await;
        assert_eq!(worker_handles.len(), 4);

        dispatcher.end().await;
        for join_handle in worker_handles.drain(..) {
            tokio::try_join!(join_handle).unwrap();
        }
        shards.end().await;
        for join_handle in shard_handles {
            tokio::try_join!(join_handle).unwrap();
        }
    }

    #[tokio::test]
    async fn test_dispatch_round_trip() {
        let (shard_handles, worker_handles, shards, dispatcher) = pool().await;

        let outcome = dispatcher
            .update_page(
                "Value network".to_string(),
                vec!["Adolescent cliques".to_string(), "Assortative mixing".to_string()],
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, IngestOutcome::Stored);

        let subgraph = dispatcher
            .get_links("Value network".to_string(), 1)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(subgraph.nodes.len(), 3);

        let paths = dispatcher
            .paths_between("Value network".to_string(), "Assortative mixing".to_string())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(paths.paths.len(), 1);

        shut_down_all(shard_handles, worker_handles, &shards, &dispatcher).await;
    }

    #[tokio::test]
    async fn test_save_dataset_round_trip() {
        let (shard_handles, worker_handles, shards, dispatcher) = pool().await;

        dispatcher
            .update_page("Rail transport".to_string(), vec!["Train".to_string()])
            .await
            .unwrap()
            .unwrap();

        let path = std::env::temp_dir().join("wiki_paths_save_test.bin");
        let saved_to = dispatcher
            .save_dataset(Some(path.clone()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(saved_to, path);

        // Reload into a fresh mesh and observe identical lookups
        let foundation = get_test_foundation();
        let dataset = shard::read_dataset(&path, &foundation).unwrap();
        let mut stores = Vec::new();
        for (shard_id, saved) in dataset.shards.into_iter().enumerate() {
            stores.push(shard::ShardStore::restore(shard_id, &foundation, saved).unwrap());
        }
        let (reloaded_handles, reloaded) = shard::from_stores(&foundation, stores).await;
        let record = reloaded
            .lookup_title("Rail transport")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.outbound, vec![entry::title_hash("Train")]);
        assert!(reloaded
            .lookup_hash(entry::title_hash("Train"))
            .await
            .unwrap()
            .unwrap()
            .flags
            .is_stub);

        reloaded.end().await;
        for join_handle in reloaded_handles {
            tokio::try_join!(join_handle).unwrap();
        }
        let _ = std::fs::remove_file(&path);

        shut_down_all(shard_handles, worker_handles, &shards, &dispatcher).await;
    }

    #[tokio::test]
    async fn test_save_failure_is_reported() {
        let (shard_handles, worker_handles, shards, dispatcher) = pool().await;

        // A directory path cannot be created as a file
        let result = dispatcher
            .save_dataset(Some(std::env::temp_dir()))
            .await
            .unwrap();
        assert!(result.is_err());

        shut_down_all(shard_handles, worker_handles, &shards, &dispatcher).await;
    }
}
