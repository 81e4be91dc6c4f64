//! Search evaluation against the local share.
//!
//! TTH lookups go straight through the store's active-inode binding;
//! term searches are pre-filtered by the share's bloom filter and then
//! matched case-insensitively against the virtual path. Responses are
//! formatted per the `$SR` wire shape and either relayed through the hub
//! (passive searcher) or sent by UDP (active searcher).

use puck_proto::{SearchOrigin, SearchQuery, SearchRequest, SearchResult};
use puck_share::{Share, TthStore};

/// NMDC convention: an active searcher gets at most ten results
pub const MAX_RESULTS_ACTIVE: usize = 10;

/// NMDC convention: a passive searcher gets at most five results
pub const MAX_RESULTS_PASSIVE: usize = 5;

/// Hub-session values needed to format responses
pub struct ResponseContext<'a> {
    /// Our nick on the hub the search came through
    pub my_nick: &'a str,
    /// The hub's display name
    pub hub_name: &'a str,
    /// The hub's `ip:port`
    pub hub_addr: &'a str,
    /// Free upload slots right now
    pub free_slots: u32,
    /// Total upload slots
    pub total_slots: u32,
}

/// Is this our own search, echoed back by the hub? Matching is by nick
/// for passive searches and by exact `ip:port` for active ones, which
/// can spuriously match another peer behind the same NAT.
#[must_use]
pub fn is_self_search(
    request: &SearchRequest,
    my_nick: &str,
    my_ip: Option<&str>,
    my_port: u16,
) -> bool {
    match &request.origin {
        SearchOrigin::Passive { nick } => nick == my_nick,
        SearchOrigin::Active { host, port } => {
            my_ip.is_some_and(|ip| ip == host) && *port == my_port
        }
    }
}

/// Evaluate a search against the share, returning formatted responses
/// ready to deliver. `max` caps the result count.
#[must_use]
pub fn evaluate(
    share: &Share,
    store: &TthStore,
    request: &SearchRequest,
    ctx: &ResponseContext<'_>,
    max: usize,
) -> Vec<SearchResult> {
    let target = match &request.origin {
        SearchOrigin::Passive { nick } => Some(nick.clone()),
        SearchOrigin::Active { .. } => None,
    };

    let format = |virtual_path: String, size: u64, tth: Option<puck_hash::Tth>| SearchResult {
        nick: ctx.my_nick.to_string(),
        virtual_path,
        size: Some(size),
        free_slots: ctx.free_slots,
        total_slots: ctx.total_slots,
        tth,
        hub_name: ctx.hub_name.to_string(),
        hub_addr: ctx.hub_addr.to_string(),
        target: target.clone(),
    };

    match &request.query {
        SearchQuery::Tth(tth) => {
            // content-hash lookup, no term scan
            let Some((path, file)) = share.file_by_tth(tth, store) else {
                return Vec::new();
            };
            let Some(virtual_path) = share.local_to_virtual(path) else {
                return Vec::new();
            };
            if !request.restriction.matches(request.size, file.size) {
                return Vec::new();
            }
            vec![format(virtual_path, file.size, Some(*tth))]
        }

        SearchQuery::Terms(terms) => {
            // the bloom filter gives a cheap "definitely not here" for
            // any term long enough to have been indexed
            if terms
                .iter()
                .filter(|t| t.chars().count() >= 4)
                .any(|t| !share.may_contain(t))
            {
                return Vec::new();
            }

            let lowered: Vec<String> = terms.iter().map(|t| t.to_lowercase()).collect();
            let mut results = Vec::new();

            for (path, file) in share.hashed_files() {
                if !request.kind.accepts(file.kind) {
                    continue;
                }
                if !request.restriction.matches(request.size, file.size) {
                    continue;
                }

                let Some(virtual_path) = share.local_to_virtual(path) else {
                    continue;
                };
                let haystack = virtual_path.to_lowercase();
                if !lowered.iter().all(|term| haystack.contains(term)) {
                    continue;
                }

                let tth = store.tth_by_inode(file.inode);
                results.push(format(virtual_path, file.size, tth));
                if results.len() >= max {
                    break;
                }
            }
            results
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use puck_hash::Tth;
    use puck_share::{walk_mountpoint, Share, TthStore};
    use tempfile::TempDir;

    fn tth(n: u8) -> Tth {
        Tth::from_digest([n; 24])
    }

    fn fixture() -> (TempDir, Share, TthStore) {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("media");
        std::fs::create_dir_all(&root).unwrap();
        // 20 MB audio file and a 5 MB one, plus a 10 MB document
        std::fs::write(root.join("foo bar.mp3"), [0u8; 16]).unwrap();
        std::fs::write(root.join("foo bar small.mp3"), [0u8; 16]).unwrap();
        std::fs::write(root.join("foo bar.pdf"), [0u8; 16]).unwrap();

        let mut store = TthStore::open(dir.path().join("tth2.db")).unwrap();
        let mut share = Share::new();
        let id = share.add_mountpoint(&root).unwrap();
        share.begin_scan(id);
        let mut files = walk_mountpoint(&root).unwrap();
        for f in &mut files {
            // sizes the filesystem fixture cannot conveniently produce
            f.size = match f.path.file_name().and_then(|n| n.to_str()) {
                Some("foo bar.mp3") => 20 * 1024 * 1024,
                Some("foo bar small.mp3") => 5 * 1024 * 1024,
                _ => 10 * 1024 * 1024,
            };
        }
        share.apply_scan(id, files, &mut store).unwrap();

        for (i, name) in ["foo bar.mp3", "foo bar small.mp3", "foo bar.pdf"]
            .iter()
            .enumerate()
        {
            share
                .on_tth_available(
                    &root.join(name),
                    Some((tth(u8::try_from(i).unwrap() + 1), "QUJD", 1)),
                    &mut store,
                )
                .unwrap();
        }
        (dir, share, store)
    }

    fn ctx() -> ResponseContext<'static> {
        ResponseContext {
            my_nick: "me",
            hub_name: "The Hub",
            hub_addr: "10.0.0.1:411",
            free_slots: 1,
            total_slots: 3,
        }
    }

    #[test]
    fn test_min_size_audio_search() {
        let (_dir, share, store) = fixture();
        // at least 10 MiB, audio, terms foo bar
        let request = SearchRequest::parse("1.2.3.4:412 T?F?10485760?1?foo bar").unwrap();

        let results = evaluate(&share, &store, &request, &ctx(), MAX_RESULTS_ACTIVE);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].virtual_path, "media\\foo bar.mp3");
        assert_eq!(results[0].size, Some(20 * 1024 * 1024));
    }

    #[test]
    fn test_terms_all_required() {
        let (_dir, share, store) = fixture();
        let request = SearchRequest::parse("1.2.3.4:412 F?F?0?0?foo quux").unwrap();
        assert!(evaluate(&share, &store, &request, &ctx(), 10).is_empty());
    }

    #[test]
    fn test_tth_lookup_bypasses_terms() {
        let (_dir, share, store) = fixture();
        let hash = tth(1).to_base32();
        let request =
            SearchRequest::parse(&format!("1.2.3.4:412 F?F?0?9?TTH:{hash}")).unwrap();

        let results = evaluate(&share, &store, &request, &ctx(), 10);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].tth, Some(tth(1)));
        assert_eq!(results[0].virtual_path, "media\\foo bar.mp3");
    }

    #[test]
    fn test_passive_results_carry_target_nick() {
        let (_dir, share, store) = fixture();
        let request = SearchRequest::parse("Hub:asker F?F?0?0?foo bar").unwrap();
        let results = evaluate(&share, &store, &request, &ctx(), MAX_RESULTS_PASSIVE);
        assert!(!results.is_empty());
        assert!(results.iter().all(|r| r.target.as_deref() == Some("asker")));
        let line = results[0].to_string();
        assert!(line.ends_with("\x05asker"));
    }

    #[test]
    fn test_bloom_short_circuits_missing_terms() {
        let (_dir, share, store) = fixture();
        let request = SearchRequest::parse("1.2.3.4:412 F?F?0?0?definitelymissing").unwrap();
        assert!(evaluate(&share, &store, &request, &ctx(), 10).is_empty());
    }

    #[test]
    fn test_self_search_detection() {
        let passive = SearchRequest::parse("Hub:me F?F?0?0?x").unwrap();
        assert!(is_self_search(&passive, "me", None, 1412));
        assert!(!is_self_search(&passive, "someone", None, 1412));

        let active = SearchRequest::parse("1.2.3.4:1412 F?F?0?0?x").unwrap();
        assert!(is_self_search(&active, "me", Some("1.2.3.4"), 1412));
        assert!(!is_self_search(&active, "me", Some("1.2.3.4"), 999));
        assert!(!is_self_search(&active, "me", Some("5.6.7.8"), 1412));
    }

    #[test]
    fn test_result_cap() {
        let (_dir, share, store) = fixture();
        let request = SearchRequest::parse("1.2.3.4:412 F?F?0?0?foo").unwrap();
        let results = evaluate(&share, &store, &request, &ctx(), 2);
        assert_eq!(results.len(), 2);
    }
}
