/*************************************************************************************************
 *
 * Command line options
 *
 *************************************************************************************************/

use clap::Parser;
use std::{
    cmp::{max, min},
    path::PathBuf,
};

#[derive(Parser, Debug)]
#[command(name = "wiki_paths")]
pub struct Opt {
    // Public API address:port
    #[arg(
        short,
        long,
        help = "Publish the API on this address:port.",
        long_help = "Publish the API on this address:port. Address will default to localhost. Port will default to 6457. The colon is a required attribute to specify the port. IPv6 addresses must be surrounded in square brackets following the recommendations in RFC2732"
    )]
    api: Option<String>,

    // Directory to hold cache files and the saved dataset
    #[arg(
        short,
        long,
        help = "Directory where wiki_paths can cache pages and save its dataset",
        default_value = "$HOME/wiki_paths_cache"
    )]
    cache: PathBuf,

    // Override processor core count
    #[arg(short = 'o', long, help = "Processor core count")]
    cores: Option<u64>,

    // Domain name for wikipedia API URL
    // URLs are defined at https://www.mediawiki.org/wiki/API:Main_page
    #[arg(
        short = 'n',
        long = "domain_name",
        help = "Domain name for wikipedia API URL",
        default_value = "https://en.wikipedia.org/"
    )]
    domain_name: String,

    // Bits used for slot selection within a shard's hash index. More bits means a
    // larger index with shorter collision chains; fewer bits means longer linear
    // scans. This is a deployment-time choice: a saved dataset keeps the value it
    // was built with.
    #[arg(
        short,
        long,
        help = "Hash index slots per shard, as a power of two",
        default_value = "14"
    )]
    index_bits: u32,

    // Management address:port
    #[arg(
        short,
        long,
        help = "Manage the server on this address:port.",
        long_help = "Manage the server on this address:port. Address will default to localhost. Port will default to 6458. The colon is a required attribute to specify the port. IPv6 addresses must be surrounded in square brackets following the recommendations in RFC2732"
    )]
    management: Option<String>,

    // System memory
    // WARNING: USE WITH CARE. Normal operation will avoid the use of swap space
    // This option is intended for development use, to prevent allocation of all memory,
    // relegating the debugger to using swap
    #[arg(
        long,
        help = "The amount of system memory in KB. Use with care to avoid use of swap space"
    )]
    memory: Option<u64>,

    // Run without the wikipedia fetch thread. Pages arrive only through the API,
    // redirect targets are stubbed instead of loaded, and stale reads are served
    // from the stored record.
    #[arg(long, help = "Run without fetching from wikipedia")]
    offline: bool,

    // Seconds between weak-link census scans
    #[arg(
        long,
        help = "Seconds between weak-link scans of the stored graph",
        default_value = "300"
    )]
    scan_interval: u64,

    // Seed for the refresh-policy random source
    #[arg(
        long,
        help = "Seed for the random source used by the stale-page refresh policy",
        default_value = "0"
    )]
    seed: u64,

    // Number of shards
    #[arg(
        short,
        long,
        help = "Number of shards that will own the index and heap partitions",
        long_help = "If no value is provided here, the shard count is calculated from the processor core count, rounded down to the nearest power of 2. A value provided here is rounded the same way. The shard count of a saved dataset cannot be changed at load time"
    )]
    shards: Option<u32>,

    // Inbound:outbound ratio beyond which a page becomes a weak-link hub
    #[arg(
        long,
        help = "Inbound:outbound ratio beyond which a page is excluded as a path transit node",
        default_value = "2.0"
    )]
    weak_ratio: f64,

    // Number of workers
    #[arg(
        short,
        long,
        help = "Number of worker tasks that will be spawned",
        long_help = "If no value is provided here, the number of workers will be calculated from the processor core count, rounded down to the nearest power of 2"
    )]
    workers: Option<u32>,
}

lazy_static! {
    pub static ref OPT: Opt = Opt::parse();
}

impl Opt {
    pub fn get_api(&self) -> Option<&String> {
        self.api.as_ref()
    }

    pub fn get_cache(&self) -> PathBuf {
        if self.cache.starts_with("$HOME") {
            let mut cache = PathBuf::new();
            cache.push(home::home_dir().unwrap());
            cache.push(self.cache.file_name().unwrap());
            cache
        } else {
            self.cache.clone()
        }
    }

    pub fn get_cores(&self) -> Option<&u64> {
        self.cores.as_ref()
    }

    pub fn get_domain_name(&self) -> &str {
        &self.domain_name
    }

    pub fn get_index_bits(&self) -> u32 {
        max(4, min(self.index_bits, 24))
    }

    pub fn get_management(&self) -> Option<&String> {
        self.management.as_ref()
    }

    pub fn get_memory(&self) -> Option<&u64> {
        self.memory.as_ref()
    }

    pub fn get_offline(&self) -> bool {
        self.offline
    }

    pub fn get_scan_interval(&self) -> u64 {
        max(1, self.scan_interval)
    }

    pub fn get_seed(&self) -> u64 {
        self.seed
    }

    pub fn get_shard_count(&self) -> Option<u32> {
        self.shards
    }

    pub fn get_weak_ratio(&self) -> f64 {
        self.weak_ratio
    }

    pub fn get_worker_count(&self) -> Option<u32> {
        self.workers
    }
}
