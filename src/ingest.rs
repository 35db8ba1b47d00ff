/* ********************************************************************************************************************
 *
 * Ingestion pipeline
 *
 * Every incoming page terminates in exactly one of four states:
 *
 *    Stored          normal page, outbound edges written to the owning shard
 *    Redirect        page carries a redirect marker; the target is ingested as the real node
 *                    and the redirect page itself is cached as a stub pointing at it, so it is
 *                    never re-fetched and contributes no other edges
 *    Disambiguation  page stored with zero edges in either direction and flagged, so a later
 *                    re-ingestion is skipped rather than repeated
 *    Rejected        malformed input, or no space in the owning shard (reported distinctly)
 *
 * A page qualifies as disambiguation when (a) its title matches the marker pattern, (b) an
 * inbound link to it was itself tagged with the marker, or (c) at least 75% of its outbound
 * link phrases contain the page's own base title.
 *
 * Redirect chains are walked iteratively with a hop bound; adversarial chains cannot recurse.
 *
 * Weak-link detection is post-hoc: inbound counts exist nowhere in the store (links are
 * outbound-only), so a periodic census scan aggregates them and flags any page whose inbound
 * count exceeds the configured ratio of its outbound count. Traversal treats flagged pages as
 * non-transit nodes; their direct edges remain valid.
 *
 * The refresh policy is the only place randomness touches the read path: a record older than
 * three months is re-fetched when a uniform draw from [0,99] lands on 0. The random source is
 * seeded and threaded explicitly so tests can pin it down.
 *
 *********************************************************************************************************************/

use std::collections::{HashMap, HashSet};

use rand::{rngs::StdRng, Rng};
use regex::Regex;

use crate::entry::{self, PageFlags, PageRecord};
use crate::fetch;
use crate::shard::{AccessError, ShardSet};

pub const MAX_TITLE_BYTES: usize = 512;
const REDIRECT_MARKER: &str = "#REDIRECT";
const REDIRECT_CHAIN_LIMIT: usize = 4;
const DISAMBIGUATION_SELF_RATIO: f64 = 0.75;

/// A record older than this is a refresh candidate on read
pub const REFRESH_AGE_SECS: u64 = 90 * 24 * 60 * 60;
const REFRESH_DIE_SIDES: u64 = 100;

lazy_static! {
    static ref DISAMBIGUATION_MARKER: Regex =
        Regex::new(r"(?i)\(disambiguation\)\s*$").unwrap();
}

// ***********************************************************************************************

#[derive(Debug, PartialEq, Eq)]
pub enum IngestOutcome {
    Stored,
    Disambiguation,
    Redirect,
    Rejected(Rejection),
}

#[derive(Debug, PartialEq, Eq)]
pub enum Rejection {
    Malformed(String),
    NoSpace,
}

/* *****************************************************************************************************************
 *
 * Validation
 *
 * *****************************************************************************************************************/

pub fn validate_title(title: &str) -> Result<(), String> {
    if title.trim().is_empty() {
        return Err("empty title".to_string());
    }
    if title.len() > MAX_TITLE_BYTES {
        return Err(format!("title exceeds {} bytes", MAX_TITLE_BYTES));
    }
    if title.chars().any(|c| c.is_control()) {
        return Err("title contains control characters".to_string());
    }
    if title.contains(['#', '<', '>', '[', ']', '{', '}', '|']) {
        return Err("title contains characters illegal in page titles".to_string());
    }
    Ok(())
}

/// The redirect target designated by a page's link list, if any. Accepts the target inline
/// after the marker, or as the following link phrase when the marker stands alone.
fn redirect_target(links: &[String]) -> Option<String> {
    let first = links.first()?;
    if first.len() < REDIRECT_MARKER.len() || !first.is_char_boundary(REDIRECT_MARKER.len()) {
        return None;
    }
    let (marker, rest) = first.split_at(REDIRECT_MARKER.len());
    if !marker.eq_ignore_ascii_case(REDIRECT_MARKER) {
        return None;
    }
    let rest = rest.trim();
    if rest.is_empty() {
        links.get(1).cloned()
    } else {
        Some(rest.to_string())
    }
}

fn is_disambiguation_title(title: &str) -> bool {
    DISAMBIGUATION_MARKER.is_match(title)
}

/// The page title with any trailing parenthetical qualifier removed
fn base_title(title: &str) -> String {
    match title.rfind('(') {
        Some(position) if title.trim_end().ends_with(')') => title[..position].trim().to_lowercase(),
        _ => title.trim().to_lowercase(),
    }
}

/// True when at least 75% of the outbound link phrases contain the page's own base title
fn mostly_self_links(title: &str, links: &[String]) -> bool {
    if links.is_empty() {
        return false;
    }
    let base = base_title(title);
    if base.is_empty() {
        return false;
    }
    let matching = links
        .iter()
        .filter(|link| link.to_lowercase().contains(&base))
        .count();
    matching as f64 >= DISAMBIGUATION_SELF_RATIO * links.len() as f64
}

/* *****************************************************************************************************************
 *
 * Pipeline
 *
 * *****************************************************************************************************************/

/// Ingest one page and its link list. This is the updatePage entry point.
pub async fn update_page(
    shards: &ShardSet,
    fetch: Option<&fetch::FetchHandle>,
    title: &str,
    links: &[String],
    now: u64,
) -> Result<IngestOutcome, AccessError> {
    trace!("ingest::update_page for {}", title);
    if let Err(reason) = validate_title(title) {
        return Ok(IngestOutcome::Rejected(Rejection::Malformed(reason)));
    }

    let result = match redirect_target(links) {
        Some(target) => ingest_redirect(shards, fetch, title, target, now).await,
        None => ingest_body(shards, title, links, now).await,
    };

    // Capacity exhaustion is a terminal pipeline state, not a transport fault
    match result {
        Err(AccessError::CapacityExhausted) => Ok(IngestOutcome::Rejected(Rejection::NoSpace)),
        other => other,
    }
}

/// Walk a redirect chain iteratively, ingesting the terminal target as the real node and
/// caching every redirect page on the way as a stub pointing at its successor.
async fn ingest_redirect(
    shards: &ShardSet,
    fetch: Option<&fetch::FetchHandle>,
    title: &str,
    first_target: String,
    now: u64,
) -> Result<IngestOutcome, AccessError> {
    if let Err(reason) = validate_title(&first_target) {
        return Ok(IngestOutcome::Rejected(Rejection::Malformed(reason)));
    }

    let mut seen: HashSet<String> = HashSet::from([title.to_string()]);
    let mut current = title.to_string();
    let mut target = first_target;
    let mut hops = 0;

    loop {
        store_redirect(shards, &current, &target, now).await?;
        hops += 1;
        if hops >= REDIRECT_CHAIN_LIMIT || !seen.insert(target.clone()) {
            break;
        }
        match fetch_links(fetch, &target).await {
            Some(target_links) => match redirect_target(&target_links) {
                Some(next) if validate_title(&next).is_ok() => {
                    current = target;
                    target = next;
                }
                Some(_) => break,
                None => {
                    ingest_body(shards, &target, &target_links, now).await?;
                    break;
                }
            },
            // Offline or fetch failure: the target stays a stub until it arrives by itself
            None => break,
        }
    }
    Ok(IngestOutcome::Redirect)
}

/// Disambiguation checks and edge construction for a non-redirect page
async fn ingest_body(
    shards: &ShardSet,
    title: &str,
    links: &[String],
    now: u64,
) -> Result<IngestOutcome, AccessError> {
    // A page already stored as disambiguation is skipped, not re-processed
    if let Some(existing) = shards.lookup_title(title).await? {
        if existing.flags.is_disambiguation {
            return Ok(IngestOutcome::Disambiguation);
        }
    }

    for link in links {
        if let Err(reason) = validate_title(link) {
            return Ok(IngestOutcome::Rejected(Rejection::Malformed(format!(
                "link '{}': {}",
                link, reason
            ))));
        }
    }

    if is_disambiguation_title(title) || mostly_self_links(title, links) {
        store_disambiguation(shards, title, now).await?;
        return Ok(IngestOutcome::Disambiguation);
    }

    let mut outbound: Vec<u64> = Vec::with_capacity(links.len());
    let mut distinct: HashSet<u64> = HashSet::with_capacity(links.len());
    for link in links {
        if link == title {
            continue;
        }
        // A link phrase carrying the marker tags its target as disambiguation: the target is
        // stored flagged and edgeless, and no edge is kept in either direction
        if is_disambiguation_title(link) {
            ensure_page(shards, link, true).await?;
            continue;
        }
        let hash = ensure_page(shards, link, false).await?;
        if distinct.insert(hash) {
            outbound.push(hash);
        }
    }

    let hash = entry::title_hash(title);
    shards
        .upsert(hash, PageRecord::full(title, outbound, now))
        .await?;
    Ok(IngestOutcome::Stored)
}

/// Resolve a referenced page to its hash, creating a stub if it does not exist yet, so
/// traversal never needs the title again. `tagged` marks the target as disambiguation.
async fn ensure_page(
    shards: &ShardSet,
    title: &str,
    tagged: bool,
) -> Result<u64, AccessError> {
    let hash = entry::title_hash(title);
    match shards.lookup_hash(hash).await? {
        Some(existing) => {
            if tagged && !existing.flags.is_disambiguation {
                // A disambiguation page keeps zero edges in both directions
                let record = PageRecord {
                    title: existing.title,
                    outbound: Vec::new(),
                    redirect: None,
                    flags: PageFlags {
                        is_disambiguation: true,
                        is_stub: existing.flags.is_stub,
                        ..PageFlags::default()
                    },
                    last_loaded: existing.last_loaded,
                };
                shards.upsert(hash, record).await?;
            }
        }
        None => {
            let mut stub = PageRecord::stub(title);
            stub.flags.is_disambiguation = tagged;
            shards.upsert(hash, stub).await?;
        }
    }
    Ok(hash)
}

async fn store_disambiguation(
    shards: &ShardSet,
    title: &str,
    now: u64,
) -> Result<(), AccessError> {
    let hash = entry::title_hash(title);
    let record = PageRecord {
        title: title.to_string(),
        outbound: Vec::new(),
        redirect: None,
        flags: PageFlags {
            is_disambiguation: true,
            ..PageFlags::default()
        },
        last_loaded: now,
    };
    shards.upsert(hash, record).await
}

/// Cache `title` as a stub whose redirect field points at `target`'s hash. The stub carries
/// no outbound edges of its own.
async fn store_redirect(
    shards: &ShardSet,
    title: &str,
    target: &str,
    now: u64,
) -> Result<(), AccessError> {
    let target_hash = ensure_page(shards, target, false).await?;
    let hash = entry::title_hash(title);
    let record = PageRecord {
        title: title.to_string(),
        outbound: Vec::new(),
        redirect: Some(target_hash),
        flags: PageFlags {
            is_redirect: true,
            is_stub: true,
            ..PageFlags::default()
        },
        last_loaded: now,
    };
    shards.upsert(hash, record).await
}

async fn fetch_links(
    fetch: Option<&fetch::FetchHandle>,
    title: &str,
) -> Option<Vec<String>> {
    match fetch {
        Some(handle) => match handle.get(title).await {
            Ok(fetched) => Some(fetched.outbound),
            Err(error) => {
                debug!("ingest:: fetch for {} failed: {}", title, error);
                None
            }
        },
        None => None,
    }
}

/* *****************************************************************************************************************
 *
 * Weak-link scan
 *
 * *****************************************************************************************************************/

/// Aggregate inbound counts from every shard's outbound sets and flag weak-link hubs.
/// Returns the number of pages whose flag changed.
pub async fn weak_link_scan(shards: &ShardSet, ratio: f64) -> Result<usize, AccessError> {
    trace!("ingest::weak_link_scan");
    let census = shards.census().await?;

    let mut inbound: HashMap<u64, u32> = HashMap::with_capacity(census.len());
    for page in &census {
        for target in &page.outbound {
            *inbound.entry(*target).or_insert(0) += 1;
        }
    }

    let mut changed = 0;
    for page in &census {
        let inbound_count = inbound.get(&page.hash).copied().unwrap_or(0);
        let weak = inbound_count as f64 > ratio * page.outbound.len() as f64;
        if weak != page.is_weak_hub {
            shards.set_weak_hub(page.hash, weak).await?;
            changed += 1;
        }
    }
    if changed > 0 {
        info!("weak-link scan flagged {} page(s)", changed);
    }
    Ok(changed)
}

/* *****************************************************************************************************************
 *
 * Refresh policy
 *
 * *****************************************************************************************************************/

/// The stale-read refresh decision. The draw happens only for stale records, and the random
/// source arrives from the caller, so reads are deterministic under a fixed seed.
pub fn should_refresh(last_loaded: u64, now: u64, rng: &mut StdRng) -> bool {
    now.saturating_sub(last_loaded) > REFRESH_AGE_SECS
        && rng.gen_range(0..REFRESH_DIE_SIDES) == 0
}

/// Re-ingest a stale page from the external source. Returns false when the source is
/// unavailable, in which case the caller serves the stored record.
pub async fn refresh_page(
    shards: &ShardSet,
    fetch: Option<&fetch::FetchHandle>,
    title: &str,
    now: u64,
) -> Result<bool, AccessError> {
    match fetch_links(fetch, title).await {
        Some(links) => {
            update_page(shards, fetch, title, &links, now).await?;
            Ok(true)
        }
        None => Ok(false),
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
    use crate::shard;
    use rand::SeedableRng;

    fn links(titles: &[&str]) -> Vec<String> {
        titles.iter().map(|t| t.to_string()).collect()
    }

    async fn mesh() -> (Vec<tokio::task::JoinHandle<()>>, ShardSet) {
        shard::new(&get_test_foundation()).await
    }

    async fn shut_down(join_handles: Vec<tokio::task::JoinHandle<()>>, shards: &ShardSet) {
        shards.end().await;
        for join_handle in join_handles {
            tokio::try_join!(join_handle).unwrap();
        }
    }

    #[test]
    fn test_validate_title() {
        assert!(validate_title("Rail transport").is_ok());
        assert!(validate_title("Mercury (planet)").is_ok());
        assert!(validate_title("").is_err());
        assert!(validate_title("   ").is_err());
        assert!(validate_title("Bad|title").is_err());
        assert!(validate_title("Bad[title]").is_err());
        assert!(validate_title("Tab\there").is_err());
        assert!(validate_title(&"x".repeat(600)).is_err());
    }

    #[test]
    fn test_redirect_target_forms() {
        assert_eq!(
            redirect_target(&links(&["#REDIRECT Value network"])),
            Some("Value network".to_string())
        );
        assert_eq!(
            redirect_target(&links(&["#redirect", "Value network"])),
            Some("Value network".to_string())
        );
        assert_eq!(redirect_target(&links(&["Value network"])), None);
        assert_eq!(redirect_target(&links(&[])), None);
    }

    #[test]
    fn test_mostly_self_links() {
        let title = "Mercury (disambiguation)";
        assert!(is_disambiguation_title(title));
        // 3 of 4 phrases contain "mercury"
        assert!(mostly_self_links(
            "Mercury",
            &links(&[
                "Mercury (planet)",
                "Mercury (element)",
                "Project Mercury",
                "Quicksilver"
            ])
        ));
        // 1 of 3 does not qualify
        assert!(!mostly_self_links(
            "Mercury",
            &links(&["Mercury (planet)", "Venus", "Mars"])
        ));
        assert!(!mostly_self_links("Mercury", &[]));
    }

    #[tokio::test]
    async fn test_update_page_stores_edges_and_stubs() {
        let (join_handles, shards) = mesh().await;

        let outcome = update_page(
            &shards,
            None,
            "Value network",
            &links(&["Adolescent cliques", "Assortative mixing"]),
            100,
        )
        .await
        .unwrap();
        assert_eq!(outcome, IngestOutcome::Stored);

        let record = shards.lookup_title("Value network").await.unwrap().unwrap();
        assert_eq!(record.outbound.len(), 2);
        assert!(!record.flags.is_stub);

        // Link targets exist as stubs, addressable by hash alone
        let stub = shards
            .lookup_hash(entry::title_hash("Adolescent cliques"))
            .await
            .unwrap()
            .unwrap();
        assert!(stub.flags.is_stub);
        assert!(stub.outbound.is_empty());

        shut_down(join_handles, &shards).await;
    }

    #[tokio::test]
    async fn test_malformed_is_rejected() {
        let (join_handles, shards) = mesh().await;

        let outcome = update_page(&shards, None, "", &links(&["A"]), 100).await.unwrap();
        assert!(matches!(
            outcome,
            IngestOutcome::Rejected(Rejection::Malformed(_))
        ));

        let outcome = update_page(&shards, None, "Fine", &links(&["Bad|link"]), 100)
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            IngestOutcome::Rejected(Rejection::Malformed(_))
        ));
        // A rejected page leaves nothing behind
        assert!(shards.lookup_title("Fine").await.unwrap().is_none());

        shut_down(join_handles, &shards).await;
    }

    #[tokio::test]
    async fn test_disambiguation_is_idempotent() {
        let (join_handles, shards) = mesh().await;

        for _ in 0..2 {
            let outcome = update_page(
                &shards,
                None,
                "Mercury (disambiguation)",
                &links(&["Mercury (planet)", "Mercury (element)"]),
                100,
            )
            .await
            .unwrap();
            assert_eq!(outcome, IngestOutcome::Disambiguation);

            let record = shards
                .lookup_title("Mercury (disambiguation)")
                .await
                .unwrap()
                .unwrap();
            assert!(record.flags.is_disambiguation);
            assert!(record.outbound.is_empty());
        }

        shut_down(join_handles, &shards).await;
    }

    #[tokio::test]
    async fn test_self_similar_page_is_disambiguation() {
        let (join_handles, shards) = mesh().await;

        let outcome = update_page(
            &shards,
            None,
            "Mercury",
            &links(&["Mercury (planet)", "Mercury (element)", "Mercury Records", "Project Mercury"]),
            100,
        )
        .await
        .unwrap();
        assert_eq!(outcome, IngestOutcome::Disambiguation);
        let record = shards.lookup_title("Mercury").await.unwrap().unwrap();
        assert!(record.flags.is_disambiguation);
        assert!(record.outbound.is_empty());

        shut_down(join_handles, &shards).await;
    }

    #[tokio::test]
    async fn test_tagged_link_flags_target_and_drops_edge() {
        let (join_handles, shards) = mesh().await;

        let outcome = update_page(
            &shards,
            None,
            "Quicksilver",
            &links(&["Mercury (disambiguation)", "Alchemy"]),
            100,
        )
        .await
        .unwrap();
        assert_eq!(outcome, IngestOutcome::Stored);

        // Only the untagged link became an edge
        let record = shards.lookup_title("Quicksilver").await.unwrap().unwrap();
        assert_eq!(record.outbound, vec![entry::title_hash("Alchemy")]);

        // The tagged target is stored flagged, and a later full ingestion is skipped
        let target = shards
            .lookup_title("Mercury (disambiguation)")
            .await
            .unwrap()
            .unwrap();
        assert!(target.flags.is_disambiguation);
        let outcome = update_page(
            &shards,
            None,
            "Mercury (disambiguation)",
            &links(&["Mercury (planet)"]),
            200,
        )
        .await
        .unwrap();
        assert_eq!(outcome, IngestOutcome::Disambiguation);

        shut_down(join_handles, &shards).await;
    }

    #[tokio::test]
    async fn test_redirect_stores_stub_pointing_at_target() {
        let (join_handles, shards) = mesh().await;

        let outcome = update_page(
            &shards,
            None,
            "UK",
            &links(&["#REDIRECT United Kingdom"]),
            100,
        )
        .await
        .unwrap();
        assert_eq!(outcome, IngestOutcome::Redirect);

        let redirect = shards.lookup_title("UK").await.unwrap().unwrap();
        assert!(redirect.flags.is_redirect);
        assert!(redirect.flags.is_stub);
        assert!(redirect.outbound.is_empty());
        assert_eq!(
            redirect.redirect,
            Some(entry::title_hash("United Kingdom"))
        );

        // The target exists as a stub until its own ingestion arrives
        let target = shards.lookup_title("United Kingdom").await.unwrap().unwrap();
        assert!(target.flags.is_stub);

        // Re-ingesting the redirect page is stable
        let outcome = update_page(
            &shards,
            None,
            "UK",
            &links(&["#REDIRECT United Kingdom"]),
            200,
        )
        .await
        .unwrap();
        assert_eq!(outcome, IngestOutcome::Redirect);

        shut_down(join_handles, &shards).await;
    }

    #[tokio::test]
    async fn test_weak_link_scan_flags_hub() {
        let (join_handles, shards) = mesh().await;

        // W: three inbound (X, A, B), one outbound (Y) -> 3 > 2.0 * 1
        update_page(&shards, None, "X", &links(&["W"]), 100).await.unwrap();
        update_page(&shards, None, "A", &links(&["W"]), 100).await.unwrap();
        update_page(&shards, None, "B", &links(&["W"]), 100).await.unwrap();
        update_page(&shards, None, "W", &links(&["Y"]), 100).await.unwrap();

        let changed = weak_link_scan(&shards, 2.0).await.unwrap();
        assert!(changed >= 1);
        let w = shards.lookup_title("W").await.unwrap().unwrap();
        assert!(w.flags.is_weak_hub);
        // X has one outbound and no inbound; it is not a hub
        let x = shards.lookup_title("X").await.unwrap().unwrap();
        assert!(!x.flags.is_weak_hub);

        // A second scan with unchanged data settles
        let changed = weak_link_scan(&shards, 2.0).await.unwrap();
        assert_eq!(
            changed,
            0,
            "scan must be stable once flags match the census"
        );

        shut_down(join_handles, &shards).await;
    }

    #[test]
    fn test_should_refresh_fresh_page_never_rolls() {
        let mut rng = StdRng::seed_from_u64(7);
        let now = REFRESH_AGE_SECS * 2;
        for _ in 0..1000 {
            assert!(!should_refresh(now - 60, now, &mut rng));
        }
    }

    #[test]
    fn test_should_refresh_is_deterministic_under_seed() {
        let now = REFRESH_AGE_SECS * 2;
        let mut first = StdRng::seed_from_u64(42);
        let mut second = StdRng::seed_from_u64(42);
        for _ in 0..1000 {
            assert_eq!(
                should_refresh(0, now, &mut first),
                should_refresh(0, now, &mut second)
            );
        }
    }

    #[test]
    fn test_should_refresh_rate_is_roughly_one_percent() {
        let now = REFRESH_AGE_SECS * 2;
        let mut rng = StdRng::seed_from_u64(3);
        let hits = (0..10_000)
            .filter(|_| should_refresh(0, now, &mut rng))
            .count();
        assert!(hits > 0, "a stale page must eventually refresh");
        assert!(hits < 500, "refresh rate is far above 1 in 100: {}", hits);
    }
}
