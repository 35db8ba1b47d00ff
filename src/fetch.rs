/************************************************************************************************
 *
 * ---------------
 * Wikipedia notes
 * ---------------
 *
 * In keeping with the wikimedia API best practices (https://www.mediawiki.org/wiki/API:Etiquette),
 * this module runs a single fetch thread, and uses the reqwest blocking client, thereby ensuring
 * that requests to the wiki API can never overlap (at least from a single session).
 *
 * Use GZip compression when making API calls (Accept-Encoding: gzip). Bots eat up a lot of bandwidth,
 *   which is not free.
 *
 * Set a descriptive User Agent header (User-Agent: User name/email/framework/...). Include your username and
 *   wiki or email address.
 *
 * Resources:
 * Query documentation is at:- https://www.mediawiki.org/wiki/API:Query
 * Parse documentation is at:- https://www.mediawiki.org/wiki/API:Parsing_wikitext
 * Sandbox for testing queries is at: https://en.wikipedia.org/wiki/Special:ApiSandbox
 *
 * Test pages
 * https://en.wikipedia.org/w/api.php?action=parse&format=json&page=supermarine&prop=links
 *
 *************************************************************************************************
 *
 * --------------------
 * Errors and responses
 * --------------------
 *
 * Network error:                   Return FetchError::IO(std::io::Error)
 * MaxLag: Wait, then try again:    Return FetchError::Lag(String) after LAG_DEFERRAL attempts
 * PageNotFound:                    Return FetchError::PageNotFound(String)
 * Unable to parse JSON:            Return FetchError::Parse(String)
 * Fetch thread gone or timed out:  Return FetchError::Unavailable(String)
 *
 *************************************************************************************************
 *
 * ------------
 * Page cache
 * ------------
 *
 * Fetched parse payloads are cached under the cache directory in a folder hierarchy based on
 * the first two digest bytes: 256 dirs, each holding 256 dirs. A cache hit younger than the
 * aging limit (7 days) is served without a network call; anything older is re-fetched and
 * overwritten in place.
 *
 *************************************************************************************************/

use reqwest::{blocking, header::HeaderValue};
use std::{
    fmt, fs, io,
    path::{Path, PathBuf},
    sync::mpsc,
    thread,
    time::Duration,
};

use crate::entry;

/// Attempts against a lagging wiki API before giving up
const LAG_DEFERRAL: u32 = 5;
const LAG_BACKOFF: Duration = Duration::from_secs(5);

/// Cached payloads older than this are re-fetched
const CACHE_AGE_SECS: u64 = 7 * 24 * 60 * 60;

/// A fetch that produces nothing within this window counts as unavailable
const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

lazy_static! {
    static ref ATTRIBUTES_FOR_PAGE: Vec<(&'static str, &'static str)> = {
        let mut v = Vec::with_capacity(4);
        v.push(("action", "parse"));
        v.push(("format", "json"));
        v.push(("prop", "links"));
        v.push(("maxlag", "5"));
        v
    };
    static ref CLIENT: blocking::Client = {
        let user_agent = HeaderValue::from_str("WikiPaths/0.1 wikipaths@streete.net")
            .expect("Internal error parsing USER_AGENT value in fetch::CLIENT");
        reqwest::blocking::Client::builder()
            .gzip(true)
            .user_agent(user_agent)
            .build()
            .expect("Internal error creating fetch::CLIENT")
    };
}

// ***********************************************************************************************

// JSON used on Wikipedia response

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Link {
    pub ns: i32,
    pub exists: Option<String>,
    #[serde(rename = "*")]
    pub title: String,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Links {
    pub title: String,
    pub pageid: u32,
    pub links: Vec<Link>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct Page {
    parse: Links,
}

// JSON used on a Wikipedia error response

#[derive(Deserialize, Debug)]
struct ApiError {
    error: ApiErrorBody,
}

#[derive(Deserialize, Debug)]
struct ApiErrorBody {
    code: String,
    info: String,
}

// ***********************************************************************************************

#[derive(Deserialize, Serialize, Debug)]
pub struct FetchEntry {
    pub digest: [u8; 16],
    pub title: String,
    pub outbound: Vec<String>,
}

#[derive(Debug)]
pub enum FetchError {
    IO(std::io::Error),
    Reqwest(reqwest::Error),
    Http(reqwest::StatusCode),
    Lag(String),
    PageNotFound(String),
    Parse(serde_json::Error),
    Unavailable(String),
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let err_msg = match self {
            FetchError::IO(io_error) => io_error.to_string(),
            FetchError::Reqwest(io_error) => io_error.to_string(),
            FetchError::Http(status_code) => status_code.as_str().to_string(),
            FetchError::Lag(message) => message.to_string(),
            FetchError::PageNotFound(message) => message.to_string(),
            FetchError::Parse(parse_error) => parse_error.to_string(),
            FetchError::Unavailable(message) => message.to_string(),
        };
        write!(f, "{}", err_msg)
    }
}

impl From<io::Error> for FetchError {
    fn from(error: io::Error) -> Self {
        FetchError::IO(error)
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(error: reqwest::Error) -> Self {
        FetchError::Reqwest(error)
    }
}

impl From<serde_json::Error> for FetchError {
    fn from(error: serde_json::Error) -> Self {
        FetchError::Parse(error)
    }
}

/* *****************************************************************************************************************
 *
 * Fetch service
 *
 * Commands arrive over a std channel so the blocking client stays off the async runtime; each
 * request carries its own response handle, answered with blocking_send from this thread.
 *
 * *****************************************************************************************************************/

#[derive(Debug)]
pub enum FetchCommand {
    End,
    Get {
        title: String,
        response_tx_handle: tokio::sync::mpsc::Sender<Result<FetchEntry, FetchError>>,
    },
}

#[derive(Clone)]
pub struct FetchHandle {
    tx_command: mpsc::Sender<FetchCommand>,
}

/// Spawn the fetch thread
pub fn new(cache_dir: PathBuf, domain_name: String) -> (thread::JoinHandle<()>, FetchHandle) {
    trace!("fetch::new");
    let (tx_command, rx_command) = mpsc::channel();
    let join_handle = thread::spawn(move || fetch_service(rx_command, cache_dir, domain_name));
    (join_handle, FetchHandle { tx_command })
}

fn fetch_service(
    rx_command: mpsc::Receiver<FetchCommand>,
    cache_dir: PathBuf,
    domain_name: String,
) {
    trace!("fetch::fetch_service: Spawned fetch thread");
    loop {
        use FetchCommand::*;

        let fetch_command = match rx_command.recv() {
            Ok(command) => command,
            Err(_) => break,
        };
        match fetch_command {
            Get {
                title,
                response_tx_handle,
            } => {
                let result = get_page_from(&title, &cache_dir, &domain_name);
                let _ = response_tx_handle.blocking_send(result);
            }
            End => break,
        }
    }
    debug!("Fetch thread exiting...");
}

impl FetchHandle {
    pub async fn get(&self, title: &str) -> Result<FetchEntry, FetchError> {
        let (response_tx_handle, mut response_rx) = tokio::sync::mpsc::channel(1);
        self.tx_command
            .send(FetchCommand::Get {
                title: title.to_string(),
                response_tx_handle,
            })
            .map_err(|_| FetchError::Unavailable("fetch thread is gone".to_string()))?;
        match tokio::time::timeout(FETCH_TIMEOUT, response_rx.recv()).await {
            Ok(Some(result)) => result,
            Ok(None) | Err(_) => Err(FetchError::Unavailable("fetch timed out".to_string())),
        }
    }

    pub fn end(&self) {
        let _ = self.tx_command.send(FetchCommand::End);
    }
}

/* *****************************************************************************************************************
 *
 * Fetch a page
 *
 * *****************************************************************************************************************/

fn get_page_from(title: &str, cache_dir: &Path, domain_name: &str) -> Result<FetchEntry, FetchError> {
    trace!("fetch::get_page_from {}", title);
    if let Some(payload) = cache_read(cache_dir, title) {
        if let Ok(fetch_entry) = parse(&payload) {
            debug!("fetch:: cache hit for {}", title);
            return Ok(fetch_entry);
        }
    }

    let url = if domain_name.ends_with('/') {
        format!("{}w/api.php", domain_name)
    } else {
        format!("{}/w/api.php", domain_name)
    };

    let mut attempt = 0;
    loop {
        attempt += 1;
        let response = CLIENT
            .get(&url)
            .query(&ATTRIBUTES_FOR_PAGE[..])
            .query(&[("page", title)])
            .send()?;
        if !response.status().is_success() {
            return Err(FetchError::Http(response.status()));
        }
        let payload = response.text()?;
        match parse(&payload) {
            Ok(fetch_entry) => {
                cache_write(cache_dir, title, &payload);
                return Ok(fetch_entry);
            }
            Err(FetchError::Lag(message)) => {
                if attempt >= LAG_DEFERRAL {
                    return Err(FetchError::Lag(message));
                }
                debug!("fetch:: maxlag on {} (attempt {}), deferring", title, attempt);
                thread::sleep(LAG_BACKOFF);
            }
            Err(error) => return Err(error),
        }
    }
}

/* *****************************************************************************************************************
 *
 * Parse page
 *
 * *****************************************************************************************************************/

pub fn parse(payload: &str) -> Result<FetchEntry, FetchError> {
    match parse_for_links_from(payload) {
        Ok(fetch_entry) => Ok(fetch_entry),
        Err(_) => parse_for_error_from(payload),
    }
}

fn parse_for_links_from(payload: &str) -> Result<FetchEntry, FetchError> {
    let page: Page = serde_json::from_str(payload)?;

    let outbound: Vec<String> = page
        .parse
        .links
        .into_iter()
        .filter(|link| link.ns == 0)
        .map(|link| link.title)
        .collect();

    let digest = entry::get_digest(&page.parse.title);
    Ok(FetchEntry {
        digest,
        title: page.parse.title,
        outbound,
    })
}

fn parse_for_error_from(payload: &str) -> Result<FetchEntry, FetchError> {
    let api_error: ApiError = serde_json::from_str(payload)?;
    match api_error.error.code.as_str() {
        "maxlag" => Err(FetchError::Lag(api_error.error.info)),
        "missingtitle" | "invalidtitle" | "pagecannotexist" => {
            Err(FetchError::PageNotFound(api_error.error.info))
        }
        _ => Err(FetchError::Unavailable(api_error.error.info)),
    }
}

/* *****************************************************************************************************************
 *
 * Page cache
 *
 * *****************************************************************************************************************/

fn cache_path(cache_dir: &Path, title: &str) -> PathBuf {
    let digest = entry::get_digest(title);
    cache_dir
        .join(format!("{:02x}", digest[0]))
        .join(format!("{:02x}", digest[1]))
        .join(format!("{:016x}.json", entry::hash_low(&digest)))
}

fn cache_read(cache_dir: &Path, title: &str) -> Option<String> {
    let path = cache_path(cache_dir, title);
    let modified = fs::metadata(&path).ok()?.modified().ok()?;
    let age = modified.elapsed().unwrap_or(Duration::MAX);
    if age.as_secs() > CACHE_AGE_SECS {
        return None;
    }
    fs::read_to_string(&path).ok()
}

fn cache_write(cache_dir: &Path, title: &str, payload: &str) {
    let path = cache_path(cache_dir, title);
    if let Some(parent) = path.parent() {
        if let Err(error) = fs::create_dir_all(parent) {
            debug!("fetch:: cache dir {:?} not created: {}", parent, error);
            return;
        }
    }
    if let Err(error) = fs::write(&path, payload) {
        debug!("fetch:: cache write for {} failed: {}", title, error);
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
    use httpmock::prelude::*;

    #[test]
    #[should_panic]
    fn parse_fail() {
        let _ = parse(FAIL_PAGE).unwrap();
    }

    #[test]
    fn parse_success() {
        let fetch_entry = parse(SUCCESS_PAGE).unwrap();
        assert_eq!(fetch_entry.title, "Value network");
        assert_eq!(
            fetch_entry.digest,
            [165, 46, 141, 56, 102, 47, 14, 148, 186, 90, 70, 92, 181, 12, 96, 46]
        );
        assert_eq!(fetch_entry.outbound.len(), 2);
        assert_eq!(fetch_entry.outbound[0], "Adolescent cliques");
        assert_eq!(fetch_entry.outbound[1], "Assortative mixing");
    }

    #[test]
    fn parse_maxlag_error() {
        let result = parse(LAG_PAGE);
        assert!(matches!(result, Err(FetchError::Lag(_))));
    }

    #[test]
    fn parse_missing_title_error() {
        let result = parse(MISSING_PAGE);
        assert!(matches!(result, Err(FetchError::PageNotFound(_))));
    }

    #[test]
    fn cache_path_fans_out_on_digest_bytes() {
        let base = PathBuf::from("/cache");
        let path = cache_path(&base, "Value network");
        // digest starts a5 2e
        assert!(path.starts_with("/cache/a5/2e"));
        assert!(path.to_string_lossy().ends_with(".json"));
        // Distinct titles land in distinct files
        assert_ne!(path, cache_path(&base, "Rail transport"));
    }

    #[test]
    fn cache_round_trip() {
        let cache_dir = std::env::temp_dir().join("wiki_paths_fetch_cache_test");
        let _ = fs::remove_dir_all(&cache_dir);
        assert!(cache_read(&cache_dir, "Value network").is_none());
        cache_write(&cache_dir, "Value network", SUCCESS_PAGE);
        assert_eq!(
            cache_read(&cache_dir, "Value network").unwrap(),
            SUCCESS_PAGE
        );
        let _ = fs::remove_dir_all(&cache_dir);
    }

    #[test]
    fn fetch_success_populates_cache() {
        let cache_dir = std::env::temp_dir().join("wiki_paths_fetch_http_test");
        let _ = fs::remove_dir_all(&cache_dir);

        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET)
                .path("/w/api.php")
                .query_param("action", "parse")
                .query_param("page", "Value network");
            then.status(200).body(SUCCESS_PAGE);
        });

        let fetch_entry =
            get_page_from("Value network", &cache_dir, &server.base_url()).unwrap();
        mock.assert();
        assert_eq!(fetch_entry.outbound.len(), 2);

        // The second fetch is served from cache without touching the server
        let fetch_entry =
            get_page_from("Value network", &cache_dir, &server.base_url()).unwrap();
        assert_eq!(fetch_entry.title, "Value network");
        mock.assert_hits(1);

        let _ = fs::remove_dir_all(&cache_dir);
    }

    #[test]
    fn fetch_http_error_is_surfaced() {
        let cache_dir = std::env::temp_dir().join("wiki_paths_fetch_error_test");
        let _ = fs::remove_dir_all(&cache_dir);

        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/w/api.php");
            then.status(503);
        });

        let result = get_page_from("Value network", &cache_dir, &server.base_url());
        assert!(matches!(result, Err(FetchError::Http(_))));
        let _ = fs::remove_dir_all(&cache_dir);
    }

    #[tokio::test]
    async fn fetch_thread_round_trip() {
        let cache_dir = std::env::temp_dir().join("wiki_paths_fetch_thread_test");
        let _ = fs::remove_dir_all(&cache_dir);

        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/w/api.php");
                then.status(200).body(SUCCESS_PAGE);
            })
            .await;

        let (join_handle, handle) = new(cache_dir.clone(), server.base_url());
        let fetch_entry = handle.get("Value network").await.unwrap();
        assert_eq!(fetch_entry.title, "Value network");

        handle.end();
        join_handle.join().unwrap();
        let _ = fs::remove_dir_all(&cache_dir);
    }

    const SUCCESS_PAGE: &str = r###"{
	"parse": {
		"title": "Value network",
		"pageid": 1614337,
		"links": [
			{
				"ns": 1,
				"exists": "",
				"*": "Talk:Value network"
			},
			{
				"ns": 0,
				"exists": "",
				"*": "Adolescent cliques"
			},
			{
				"ns": 0,
				"exists": "",
				"*": "Assortative mixing"
			},
			{
				"ns": 11,
				"exists": "",
				"*": "Template talk:Social networking"
			},
			{
				"ns": 12,
				"exists": "",
				"*": "Help:Maintenance template removal"
			}
		]
	}
}
"###;

    const FAIL_PAGE: &str = r###"{
	"invalid": {
		"title": "Value network",
		"pageid": 1614337,
		"links": [
			{
				"ns": 0,
				"exists": "",
				"*": "Adolescent cliques"
			}
		]
	}
}
"###;

    const LAG_PAGE: &str = r###"{
	"error": {
		"code": "maxlag",
		"info": "Waiting for a database server: 6 seconds lagged."
	}
}
"###;

    const MISSING_PAGE: &str = r###"{
	"error": {
		"code": "missingtitle",
		"info": "The page you specified doesn't exist."
	}
}
"###;
}
