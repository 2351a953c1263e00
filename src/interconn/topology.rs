use std::collections::BTreeMap;
use std::io::BufRead;

/// Error parsing a network topology file.
///
/// Fatal at startup; reports the offending line.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("node ids must be sequential starting at zero (missing node {missing})")]
    NonSequentialNodes { missing: usize },

    #[error("router ids must be sequential starting at zero (missing router {missing})")]
    NonSequentialRouters { missing: usize },

    #[error("node {node} connects to routers {first} and {second}")]
    NodeConnectedTwice {
        node: usize,
        first: usize,
        second: usize,
    },
}

impl Error {
    fn parse(line: usize, message: impl Into<String>) -> Self {
        Error::Parse {
            line,
            message: message.into(),
        }
    }
}

/// The parsed network graph.
///
/// Built from an `anynet`-style description: lines of the form
/// `router R [node N [latency] | router R' [latency]]*`. Latencies are
/// per-direction for router-router links and bidirectional for node links;
/// the default latency is 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    /// The router each node attaches to.
    pub node_to_router: Vec<usize>,
    /// Nodes attached to each router, with their link latency.
    pub router_nodes: Vec<BTreeMap<usize, u64>>,
    /// Directed router-to-router links with latency.
    pub router_links: Vec<BTreeMap<usize, u64>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Endpoint {
    Node(usize),
    Router(usize),
}

impl Topology {
    #[must_use]
    pub fn num_nodes(&self) -> usize {
        self.node_to_router.len()
    }

    #[must_use]
    pub fn num_routers(&self) -> usize {
        self.router_links.len()
    }

    /// A single router connected to `num_nodes` nodes: the default topology
    /// when no network file is configured.
    #[must_use]
    pub fn star(num_nodes: usize) -> Self {
        Self {
            node_to_router: vec![0; num_nodes],
            router_nodes: vec![(0..num_nodes).map(|node| (node, 1)).collect()],
            router_links: vec![BTreeMap::new()],
        }
    }

    pub fn parse(reader: impl BufRead) -> Result<Self, Error> {
        let mut node_to_router: BTreeMap<usize, usize> = BTreeMap::new();
        let mut router_nodes: BTreeMap<usize, BTreeMap<usize, u64>> = BTreeMap::new();
        let mut router_links: BTreeMap<usize, BTreeMap<usize, u64>> = BTreeMap::new();

        let mut connect =
            |head: Endpoint, body: Endpoint, latency: u64, line: usize| -> Result<(), Error> {
                match (head, body) {
                    (Endpoint::Node(_), Endpoint::Node(_)) => {
                        Err(Error::parse(line, "cannot connect a node to a node"))
                    }
                    (Endpoint::Router(router), Endpoint::Node(node))
                    | (Endpoint::Node(node), Endpoint::Router(router)) => {
                        if let Some(previous) = node_to_router.get(&node) {
                            if *previous != router {
                                return Err(Error::NodeConnectedTwice {
                                    node,
                                    first: *previous,
                                    second: router,
                                });
                            }
                        }
                        node_to_router.insert(node, router);
                        router_nodes.entry(router).or_default().insert(node, latency);
                        router_links.entry(router).or_default();
                        Ok(())
                    }
                    (Endpoint::Router(from), Endpoint::Router(to)) => {
                        router_links.entry(from).or_default().insert(to, latency);
                        // the reverse direction defaults to latency 1 unless
                        // the file specifies it
                        router_links.entry(to).or_default().entry(from).or_insert(1);
                        router_nodes.entry(from).or_default();
                        router_nodes.entry(to).or_default();
                        Ok(())
                    }
                }
            };

        for (line_idx, line) in reader.lines().enumerate() {
            let line_num = line_idx + 1;
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let mut tokens = line.split_whitespace().peekable();
            let parse_endpoint = |kind: &str, id: Option<&str>| -> Result<Endpoint, Error> {
                let id = id
                    .ok_or_else(|| Error::parse(line_num, format!("missing {kind} id")))?
                    .parse()
                    .map_err(|_| Error::parse(line_num, format!("invalid {kind} id")))?;
                Ok(match kind {
                    "node" => Endpoint::Node(id),
                    _ => Endpoint::Router(id),
                })
            };

            let head_kind = tokens.next().unwrap();
            if head_kind != "router" && head_kind != "node" {
                return Err(Error::parse(
                    line_num,
                    format!("unknown head of line type {head_kind:?}"),
                ));
            }
            let head = parse_endpoint(head_kind, tokens.next())?;

            while let Some(body_kind) = tokens.next() {
                if body_kind != "router" && body_kind != "node" {
                    return Err(Error::parse(
                        line_num,
                        format!("unknown body type {body_kind:?}"),
                    ));
                }
                let body = parse_endpoint(body_kind, tokens.next())?;
                // an optional latency follows the endpoint
                let latency = match tokens.peek() {
                    Some(token) if token.chars().all(char::is_numeric) => {
                        let latency = tokens
                            .next()
                            .unwrap()
                            .parse()
                            .map_err(|_| Error::parse(line_num, "invalid latency"))?;
                        latency
                    }
                    _ => 1,
                };
                connect(head, body, latency, line_num)?;
            }
        }

        // node and router ids must be dense, starting at zero
        for (expected, id) in node_to_router.keys().enumerate() {
            if *id != expected {
                return Err(Error::NonSequentialNodes { missing: expected });
            }
        }
        for (expected, id) in router_links.keys().enumerate() {
            if *id != expected {
                return Err(Error::NonSequentialRouters { missing: expected });
            }
        }

        let num_routers = router_links.len();
        Ok(Self {
            node_to_router: node_to_router.into_values().collect(),
            router_nodes: (0..num_routers)
                .map(|router| router_nodes.remove(&router).unwrap_or_default())
                .collect(),
            router_links: (0..num_routers)
                .map(|router| router_links.remove(&router).unwrap_or_default())
                .collect(),
        })
    }

    /// Shortest-path routing: for each source router, the neighbor to take
    /// towards every destination router, by Dijkstra over link latencies.
    ///
    /// Ties break towards the lower router id, keeping routes deterministic.
    #[must_use]
    pub fn shortest_path_next_hop(&self, start: usize) -> Vec<Option<usize>> {
        let num_routers = self.num_routers();
        let mut dist = vec![u64::MAX; num_routers];
        let mut prev: Vec<Option<usize>> = vec![None; num_routers];
        let mut remaining: std::collections::BTreeSet<usize> = (0..num_routers).collect();
        dist[start] = 0;

        while !remaining.is_empty() {
            let closest = *remaining
                .iter()
                .min_by_key(|router| dist[**router])
                .unwrap();
            remaining.remove(&closest);
            if dist[closest] == u64::MAX {
                break;
            }
            for (&neighbor, &latency) in &self.router_links[closest] {
                let candidate = dist[closest].saturating_add(latency);
                if candidate < dist[neighbor] {
                    dist[neighbor] = candidate;
                    prev[neighbor] = Some(closest);
                }
            }
        }

        // walk back from each destination to find the first hop
        (0..num_routers)
            .map(|dest| {
                if dest == start || prev[dest].is_none() {
                    return None;
                }
                let mut hop = dest;
                while prev[hop] != Some(start) {
                    hop = prev[hop]?;
                }
                Some(hop)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::Topology;
    use color_eyre::eyre;
    use std::io::Cursor;

    fn chain() -> eyre::Result<Topology> {
        // 0 -- 1 -- 2, one node per router
        let file = "\
router 0 node 0 router 1
router 1 node 1 router 2
router 2 node 2
";
        Ok(Topology::parse(Cursor::new(file))?)
    }

    #[test]
    fn parses_chain() -> eyre::Result<()> {
        let topology = chain()?;
        assert_eq!(topology.num_nodes(), 3);
        assert_eq!(topology.num_routers(), 3);
        assert_eq!(topology.node_to_router, vec![0, 1, 2]);
        assert_eq!(topology.router_links[0].get(&1), Some(&1));
        assert_eq!(topology.router_links[1].get(&0), Some(&1));
        Ok(())
    }

    #[test]
    fn parses_latencies() -> eyre::Result<()> {
        let file = "router 0 router 1 15 router 2\n\
                    router 1 node 0\n\
                    router 2 node 1\n\
                    node 2 router 0\n";
        let topology = Topology::parse(Cursor::new(file))?;
        assert_eq!(topology.router_links[0].get(&1), Some(&15));
        // reverse direction was not specified: single cycle
        assert_eq!(topology.router_links[1].get(&0), Some(&1));
        Ok(())
    }

    #[test]
    fn next_hop_follows_the_chain() -> eyre::Result<()> {
        let topology = chain()?;
        let hops = topology.shortest_path_next_hop(0);
        assert_eq!(hops, vec![None, Some(1), Some(1)]);
        let hops = topology.shortest_path_next_hop(2);
        assert_eq!(hops, vec![Some(1), Some(1), None]);
        Ok(())
    }

    #[test]
    fn rejects_node_connected_to_two_routers() {
        let file = "router 0 node 0\nrouter 1 node 0\n";
        let err = Topology::parse(Cursor::new(file)).unwrap_err();
        assert!(matches!(err, super::Error::NodeConnectedTwice { .. }));
    }

    #[test]
    fn rejects_gaps_in_ids() {
        let file = "router 0 node 0 node 2\n";
        let err = Topology::parse(Cursor::new(file)).unwrap_err();
        assert!(matches!(
            err,
            super::Error::NonSequentialNodes { missing: 1 }
        ));
    }

    #[test]
    fn reports_offending_line() {
        let file = "router 0 node 0\ngarbage 1 2\n";
        let err = Topology::parse(Cursor::new(file)).unwrap_err();
        assert!(matches!(err, super::Error::Parse { line: 2, .. }));
    }
}
