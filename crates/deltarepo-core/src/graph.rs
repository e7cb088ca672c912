//! Graph of available deltas between content hashes and the shortest path
//! search over it.

use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap, HashSet},
};

use deltarepo_dl::{download::fetch_bytes, types::Source};
use deltarepo_utils::hash::ChecksumType;
use tracing::{debug, warn};

use crate::{
    index::{DeltaIndex, DeltaIndexRecord},
    DeltaRepoResult,
};

/// A location serving delta repositories next to their index.
#[derive(Debug, Clone)]
pub struct DeltaMirror {
    pub url: String,
    pub index: DeltaIndex,
}

impl DeltaMirror {
    /// Fetches and parses `<url>/<index_filename>`. `url` may also be a
    /// local directory.
    pub fn load(url: &str, index_filename: &str) -> DeltaRepoResult<Self> {
        let location = Source::parse(url)?.join(index_filename)?;
        debug!("Loading delta index from {location}");
        let data = fetch_bytes(&location.to_string())?;
        let index = DeltaIndex::parse_bytes(&data)?;
        debug!("{} deltas available from {url}", index.len());

        Ok(Self {
            url: url.to_string(),
            index,
        })
    }

    pub fn links(&self) -> Vec<Link> {
        self.index
            .records
            .iter()
            .map(|record| {
                Link {
                    record: record.clone(),
                    mirror_url: self.url.clone(),
                }
            })
            .collect()
    }
}

/// A single delta, an edge of the update graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub record: DeltaIndexRecord,
    pub mirror_url: String,
}

impl Link {
    pub fn src(&self) -> Option<&str> {
        self.record.contenthash_src.as_deref()
    }

    pub fn dst(&self) -> Option<&str> {
        self.record.contenthash_dst.as_deref()
    }

    pub fn contenthash_type(&self) -> Option<&str> {
        self.record.contenthash_type.as_deref()
    }

    /// Bytes to transfer for this hop.
    pub fn cost(&self) -> u64 {
        self.record.size_total
    }

    /// Location of the delta repository root.
    pub fn download_url(&self) -> DeltaRepoResult<String> {
        let base = match &self.record.location_base {
            Some(base) => Source::parse(base)?,
            None => Source::parse(&self.mirror_url)?,
        };
        Ok(base.join(&self.record.location_href)?.to_string())
    }
}

/// An ordered sequence of deltas leading from one content hash to another.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedPath {
    pub links: Vec<Link>,
    pub cost: u64,
}

impl ResolvedPath {
    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}

/// Directed graph with content hashes as nodes and deltas as edges.
#[derive(Debug, Clone)]
pub struct UpdateGraph {
    contenthash_type: ChecksumType,
    links: Vec<Link>,
    nodes: HashMap<String, usize>,
    /// Outgoing link indices per node, in discovery order.
    edges: Vec<Vec<usize>>,
    seen: HashSet<(String, String)>,
}

impl UpdateGraph {
    pub fn new(contenthash_type: ChecksumType) -> Self {
        Self {
            contenthash_type,
            links: Vec::new(),
            nodes: HashMap::new(),
            edges: Vec::new(),
            seen: HashSet::new(),
        }
    }

    pub fn from_links<I>(links: I, contenthash_type: ChecksumType) -> Self
    where
        I: IntoIterator<Item = Link>,
    {
        let mut graph = Self::new(contenthash_type);
        graph.add_links(links);
        graph
    }

    pub fn contenthash_type(&self) -> ChecksumType {
        self.contenthash_type
    }

    /// Adds edges, dropping duplicates and deltas of another hash type.
    pub fn add_links<I>(&mut self, links: I)
    where
        I: IntoIterator<Item = Link>,
    {
        for link in links {
            let (Some(src), Some(dst)) = (link.src(), link.dst()) else {
                warn!(
                    "Delta {} from {} has no content hashes, skipped",
                    link.record.location_href, link.mirror_url
                );
                continue;
            };

            let same_type = link
                .contenthash_type()
                .is_some_and(|t| t.eq_ignore_ascii_case(self.contenthash_type.name()));
            if !same_type {
                warn!(
                    "Content hash type mismatch {} vs {:?}, delta {src}->{dst} from {} skipped",
                    self.contenthash_type,
                    link.contenthash_type(),
                    link.mirror_url
                );
                continue;
            }

            let key = (src.to_string(), dst.to_string());
            if self.seen.contains(&key) {
                warn!("Duplicated path {src}->{dst} from {} skipped", link.mirror_url);
                continue;
            }

            let src_node = self.node(src);
            self.node(dst);
            self.edges[src_node].push(self.links.len());
            self.seen.insert(key);
            self.links.push(link);
        }
    }

    fn node(&mut self, hash: &str) -> usize {
        if let Some(&id) = self.nodes.get(hash) {
            return id;
        }
        let id = self.edges.len();
        self.nodes.insert(hash.to_string(), id);
        self.edges.push(Vec::new());
        id
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.nodes.contains_key(hash)
    }

    pub fn links(&self) -> &[Link] {
        &self.links
    }

    /// Destination of the delta with the newest destination timestamp.
    pub fn latest_target(&self) -> Option<&str> {
        self.links
            .iter()
            .filter(|link| link.record.timestamp_dst.is_some())
            .fold(None::<&Link>, |best, link| {
                match best {
                    Some(b) if b.record.timestamp_dst >= link.record.timestamp_dst => Some(b),
                    _ => Some(link),
                }
            })
            .and_then(Link::dst)
    }

    /// Dijkstra from `src`, stopping once `dst` is settled.
    fn shortest_path(&self, src: &str, dst: &str) -> Option<ResolvedPath> {
        if src == dst {
            return Some(ResolvedPath::default());
        }
        let (&start, &target) = (self.nodes.get(src)?, self.nodes.get(dst)?);

        let mut dist: Vec<Option<u64>> = vec![None; self.edges.len()];
        let mut previous: Vec<Option<usize>> = vec![None; self.edges.len()];
        let mut settled = vec![false; self.edges.len()];
        let mut queue = BinaryHeap::new();

        dist[start] = Some(0);
        queue.push(Reverse((0u64, start)));

        while let Some(Reverse((cost, node))) = queue.pop() {
            if settled[node] {
                continue;
            }
            settled[node] = true;
            if node == target {
                break;
            }

            for &link_id in &self.edges[node] {
                let link = &self.links[link_id];
                let Some(&next) = link.dst().and_then(|d| self.nodes.get(d)) else {
                    continue;
                };
                let alt = cost.saturating_add(link.cost());
                if dist[next].is_none_or(|current| alt < current) {
                    dist[next] = Some(alt);
                    previous[next] = Some(link_id);
                    queue.push(Reverse((alt, next)));
                }
            }
        }

        let cost = dist[target]?;
        let mut links = Vec::new();
        let mut node = target;
        while node != start {
            let link_id = previous[node]?;
            let link = &self.links[link_id];
            links.push(link.clone());
            node = *link.src().and_then(|s| self.nodes.get(s))?;
        }
        links.reverse();

        Some(ResolvedPath { links, cost })
    }
}

type CacheKey = (String, String, ChecksumType);

/// Shortest path lookups over an [`UpdateGraph`], memoized until new deltas
/// are loaded.
#[derive(Debug, Clone)]
pub struct Solver {
    graph: UpdateGraph,
    cache: HashMap<CacheKey, Option<ResolvedPath>>,
}

impl Solver {
    pub fn new(graph: UpdateGraph) -> Self {
        Self {
            graph,
            cache: HashMap::new(),
        }
    }

    pub fn graph(&self) -> &UpdateGraph {
        &self.graph
    }

    pub fn load_mirror(&mut self, mirror: &DeltaMirror) {
        self.add_links(mirror.links());
    }

    pub fn add_links<I>(&mut self, links: I)
    where
        I: IntoIterator<Item = Link>,
    {
        self.graph.add_links(links);
        self.cache.clear();
    }

    /// The cheapest chain of deltas from `src` to `dst`, `None` if there is
    /// none or either hash is unknown.
    pub fn solve(&mut self, src: &str, dst: &str) -> Option<ResolvedPath> {
        let key = (src.to_string(), dst.to_string(), self.graph.contenthash_type);
        if let Some(cached) = self.cache.get(&key) {
            debug!("Using cached path {src} -> {dst}");
            return cached.clone();
        }

        let resolved = self.graph.shortest_path(src, dst);
        match &resolved {
            Some(path) => {
                debug!(
                    "Resolved {src} -> {dst}: {} deltas, cost {}",
                    path.links.len(),
                    path.cost
                )
            }
            None => debug!("No path {src} -> {dst}"),
        }
        self.cache.insert(key, resolved.clone());
        resolved
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::tempdir;

    use super::*;

    fn link(src: &str, dst: &str, cost: u64) -> Link {
        Link {
            record: DeltaIndexRecord {
                location_href: format!("{src}-{dst}"),
                size_total: cost,
                contenthash_src: Some(src.to_string()),
                contenthash_dst: Some(dst.to_string()),
                contenthash_type: Some("sha256".to_string()),
                ..Default::default()
            },
            mirror_url: "https://mirror.example.com/deltas".to_string(),
        }
    }

    fn hops(path: &ResolvedPath) -> Vec<String> {
        path.links
            .iter()
            .map(|l| l.record.location_href.clone())
            .collect()
    }

    #[test]
    fn test_cheaper_indirect_path_wins() {
        let graph = UpdateGraph::from_links(
            [link("X", "Y", 10), link("X", "Z", 3), link("Z", "Y", 4)],
            ChecksumType::Sha256,
        );
        let mut solver = Solver::new(graph);

        let path = solver.solve("X", "Y").unwrap();
        assert_eq!(hops(&path), ["X-Z", "Z-Y"]);
        assert_eq!(path.cost, 7);
    }

    #[test]
    fn test_unreachable_target() {
        let graph = UpdateGraph::from_links(
            [link("X", "Y", 10), link("Z", "W", 1)],
            ChecksumType::Sha256,
        );
        let mut solver = Solver::new(graph);

        assert!(solver.solve("X", "W").is_none());
        assert!(solver.solve("Y", "X").is_none());
        assert!(solver.solve("unknown", "Y").is_none());
        assert!(solver.solve("X", "unknown").is_none());
    }

    #[test]
    fn test_same_source_and_target() {
        let mut solver = Solver::new(UpdateGraph::new(ChecksumType::Sha256));
        let path = solver.solve("X", "X").unwrap();
        assert!(path.is_empty());
        assert_eq!(path.cost, 0);
    }

    #[test]
    fn test_duplicates_and_foreign_types_are_dropped() {
        let mut sha1 = link("X", "Q", 1);
        sha1.record.contenthash_type = Some("sha1".to_string());
        let mut duplicate = link("X", "Y", 1);
        duplicate.mirror_url = "https://other.example.com".to_string();

        let graph = UpdateGraph::from_links(
            [link("X", "Y", 10), duplicate, sha1],
            ChecksumType::Sha256,
        );
        assert_eq!(graph.links().len(), 1);
        assert_eq!(graph.links()[0].cost(), 10);
        assert!(!graph.contains("Q"));
    }

    #[test]
    fn test_load_mirror_invalidates_cache() {
        let mut solver = Solver::new(UpdateGraph::from_links(
            [link("X", "Y", 10)],
            ChecksumType::Sha256,
        ));
        assert!(solver.solve("X", "Z").is_none());

        solver.add_links([link("Y", "Z", 2)]);
        let path = solver.solve("X", "Z").unwrap();
        assert_eq!(hops(&path), ["X-Y", "Y-Z"]);
        assert_eq!(path.cost, 12);
    }

    #[test]
    fn test_latest_target() {
        let mut old = link("X", "Y", 1);
        old.record.timestamp_dst = Some(100);
        let mut new = link("Y", "Z", 1);
        new.record.timestamp_dst = Some(200);

        let graph = UpdateGraph::from_links([new, old], ChecksumType::Sha256);
        assert_eq!(graph.latest_target(), Some("Z"));
        assert_eq!(UpdateGraph::new(ChecksumType::Sha256).latest_target(), None);
    }

    #[test]
    fn test_download_url() {
        let l = link("X", "Y", 1);
        assert_eq!(
            l.download_url().unwrap(),
            "https://mirror.example.com/deltas/X-Y"
        );
    }

    #[test]
    fn test_mirror_load_local() {
        let dir = tempdir().unwrap();
        let mut index = DeltaIndex::new();
        index.upsert(link("X", "Y", 5).record);
        index.write_file(dir.path().join("deltarepos.xml.xz")).unwrap();

        let url = dir.path().to_string_lossy().into_owned();
        let mirror = DeltaMirror::load(&url, "deltarepos.xml.xz").unwrap();
        assert_eq!(mirror.index.len(), 1);

        let links = mirror.links();
        assert_eq!(links[0].mirror_url, url);
        assert_eq!(
            links[0].download_url().unwrap(),
            dir.path().join("X-Y").to_string_lossy()
        );

        fs::remove_file(dir.path().join("deltarepos.xml.xz")).unwrap();
        assert!(DeltaMirror::load(&url, "deltarepos.xml.xz").is_err());
    }
}
