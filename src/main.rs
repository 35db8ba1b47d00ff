#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate log;
#[macro_use]
extern crate serde_derive;

mod api;
mod entry;
mod fetch;
mod foundation;
mod index;
mod ingest;
mod opt;
mod query;
mod shard;
mod slabs;
mod worker;

use std::env;
use tokio::sync::mpsc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env::set_var("RUST_LOG", "wiki_paths=trace");
    env_logger::init();

    std::panic::set_hook(Box::new(|panic_info| {
        error!("panic: {}", panic_message::panic_info_message(panic_info));
    }));

    info!("Caching to {}", opt::OPT.get_cache().to_string_lossy());

    let foundation = foundation::Foundation::new();
    info!(
        "Foundation: {} shards, {} workers, {} index slots per shard, {} slabs per shard",
        foundation.get_shard_count(),
        foundation.get_worker_count(),
        foundation.get_slot_count(),
        foundation.get_slabs_per_shard()
    );

    // Reload the saved dataset when one exists in the cache directory
    let save_path = opt::OPT.get_cache().join("dataset.bin");
    let stores = if save_path.exists() {
        let dataset = match shard::read_dataset(&save_path, &foundation) {
            Ok(dataset) => dataset,
            Err(error) => {
                error!("Dataset at {:?} is not loadable: {}", save_path, error);
                return Err(error.to_string().into());
            }
        };
        info!("Loading dataset from {:?}", save_path);
        let mut stores = Vec::with_capacity(dataset.shards.len());
        for (shard_id, saved) in dataset.shards.into_iter().enumerate() {
            match shard::ShardStore::restore(shard_id, &foundation, saved) {
                Ok(store) => stores.push(store),
                Err(error) => {
                    error!("Shard {} failed to restore: {}", shard_id, error);
                    return Err(error.to_string().into());
                }
            }
        }
        Some(stores)
    } else {
        None
    };

    let (shard_handles, shards) = match stores {
        Some(stores) => shard::from_stores(&foundation, stores).await,
        None => shard::new(&foundation).await,
    };

    let (fetch_join, fetch_handle) = if opt::OPT.get_offline() {
        info!("Running offline; pages arrive only through the API");
        (None, None)
    } else {
        let (join_handle, handle) = fetch::new(
            opt::OPT.get_cache(),
            opt::OPT.get_domain_name().to_string(),
        );
        (Some(join_handle), Some(handle))
    };

    let (worker_handles, dispatcher) = worker::new(
        &foundation,
        shards.clone(),
        fetch_handle.clone(),
        opt::OPT.get_seed(),
        save_path.clone(),
    )
    .await;

    // Periodic weak-link census scan
    let scan_shards = shards.clone();
    let weak_ratio = opt::OPT.get_weak_ratio();
    let scan_seconds = opt::OPT.get_scan_interval();
    let scan_task = tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(scan_seconds));
        interval.tick().await;
        loop {
            interval.tick().await;
            if let Err(error) = ingest::weak_link_scan(&scan_shards, weak_ratio).await {
                debug!("weak-link scan skipped: {}", error);
            }
        }
    });

    // Serve until /stop or an interrupt
    let (stop_tx, mut stop_rx) = mpsc::channel(1);
    tokio::select! {
        result = api::serve(dispatcher.clone(), stop_tx.clone()) => {
            if let Err(error) = result {
                error!("API server failed: {}", error);
            }
        }
        _ = stop_rx.recv() => info!("Stop requested"),
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
    }

    scan_task.abort();
    dispatcher.end().await;
    worker::shut_down(worker_handles).await?;
    shards.end().await;
    for join_handle in shard_handles {
        tokio::try_join!(join_handle)?;
    }
    if let Some(handle) = fetch_handle {
        handle.end();
    }
    if let Some(join_handle) = fetch_join {
        let _ = join_handle.join();
    }
    info!("Shut down complete");
    Ok(())
}
