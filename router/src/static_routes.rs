use super::*;
use bundle::{BundleId, MetaBundle};
use eid::Eid;
use events::Event;
use extension::Extension;
use router::BaseRouter;
use std::{
    collections::{HashMap, VecDeque},
    path::Path,
    sync::Mutex,
};
use task_pool::TaskPool;
use task_queue::TaskQueue;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Expecting 'via'")]
    MissingVia,

    #[error("Expecting a next hop after 'via'")]
    MissingNextHop,

    #[error("Unexpected '{0}'")]
    Unexpected(String),

    #[error(transparent)]
    Eid(#[from] eid::Error),
}

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Line {line}: {source}")]
    Parse {
        line: usize,
        #[source]
        source: ParseError,
    },
}

/// Sends bundles whose destination matches `pattern` to `next_hop`.
///
/// The pattern is matched against the whole destination EID. A `*` stands
/// for any run of characters: `dtn://a*` matches by prefix, `*/app` by
/// suffix and `dtn://*/app` by both. Without a `*` the match is exact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticRoute {
    pattern: String,
    next_hop: Eid,
}

impl StaticRoute {
    pub fn new(pattern: impl Into<String>, next_hop: Eid) -> Self {
        Self {
            pattern: pattern.into(),
            next_hop,
        }
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn next_hop(&self) -> &Eid {
        &self.next_hop
    }

    pub fn matches(&self, destination: &Eid) -> bool {
        let destination = destination.as_str();
        match self.pattern.split_once('*') {
            None => destination == self.pattern,
            Some((prefix, suffix)) => {
                destination.len() >= prefix.len() + suffix.len()
                    && destination.starts_with(prefix)
                    && destination.ends_with(suffix)
            }
        }
    }
}

impl std::fmt::Display for StaticRoute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} via {}", self.pattern, self.next_hop)
    }
}

/// One line of a routes file, `None` for blanks and comments.
#[derive(Debug)]
struct RouteLine(Option<StaticRoute>);

impl std::str::FromStr for RouteLine {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split_whitespace();

        let pattern = match parts.next() {
            None => return Ok(Self(None)),
            Some(s) if s.starts_with('#') => return Ok(Self(None)),
            Some(s) => s,
        };

        match parts.next() {
            Some("via") => {}
            Some(s) => return Err(ParseError::Unexpected(s.to_string())),
            None => return Err(ParseError::MissingVia),
        }

        let next_hop = parts.next().ok_or(ParseError::MissingNextHop)?.parse()?;

        match parts.next() {
            None => {}
            Some(s) if s.starts_with('#') => {}
            Some(s) => return Err(ParseError::Unexpected(s.to_string())),
        }

        Ok(Self(Some(StaticRoute::new(pattern, next_hop))))
    }
}

/// Parses routes given inline, in routes file syntax.
pub fn parse_routes<S: AsRef<str>>(lines: &[S]) -> Result<Vec<StaticRoute>, Error> {
    lines
        .iter()
        .enumerate()
        .filter_map(|(idx, line)| match line.as_ref().parse::<RouteLine>() {
            Ok(RouteLine(route)) => route.map(Ok),
            Err(source) => Some(Err(Error::Parse {
                line: idx + 1,
                source,
            })),
        })
        .collect()
}

/// Reads a routes file: one `<pattern> via <next-hop>` per line, `#` starts
/// a comment.
pub async fn load_routes(routes_file: &Path) -> Result<Vec<StaticRoute>, Error> {
    let file = tokio::fs::File::open(routes_file).await?;

    let mut routes = Vec::new();
    let mut lines = BufReader::new(file).lines();
    let mut idx: usize = 1;
    while let Some(line) = lines.next_line().await? {
        match line.parse::<RouteLine>() {
            Err(source) => {
                error!(
                    "Failed to parse '{line}' at line {idx} in static routes file '{}': {source}",
                    routes_file.to_string_lossy()
                );
                return Err(Error::Parse { line: idx, source });
            }
            Ok(RouteLine(Some(route))) => routes.push(route),
            Ok(RouteLine(None)) => {}
        }
        idx += 1;
    }
    Ok(routes)
}

#[derive(Debug)]
enum Task {
    Route(MetaBundle),
    Flush(Eid),
    Delivered(Eid, BundleId),
    Forget(BundleId),
}

/// Forwards bundles along configured static routes.
///
/// Matching bundles go to the route's next hop whether or not it has a
/// summary vector. Bundles for a next hop that is not reachable yet wait in a
/// per-hop queue until it is.
pub struct StaticRoutingExtension {
    router: Arc<BaseRouter>,
    routes: Vec<StaticRoute>,
    pending: Mutex<HashMap<Eid, VecDeque<BundleId>>>,
    queue: TaskQueue<Task>,
    pool: TaskPool,
}

impl StaticRoutingExtension {
    pub fn new(router: Arc<BaseRouter>, routes: Vec<StaticRoute>) -> Arc<Self> {
        for route in &routes {
            debug!("Static route {route}");
        }

        let extension = Arc::new(Self {
            router,
            routes,
            pending: Mutex::new(HashMap::new()),
            queue: TaskQueue::new(),
            pool: TaskPool::new(),
        });

        let worker = extension.clone();
        extension.pool.spawn("static_routes", async move {
            task_queue::drain("static_routes", &worker.queue, |task| worker.execute(task)).await
        });
        extension
    }

    /// Builds the extension from the inline routes and routes file of the
    /// router's configuration.
    #[cfg_attr(feature = "instrument", instrument(skip(router)))]
    pub async fn from_config(router: Arc<BaseRouter>) -> Result<Arc<Self>, Error> {
        let config = &router.config().static_routes;
        let mut routes = parse_routes(config.routes.as_slice())?;
        if let Some(routes_file) = &config.routes_file {
            info!(
                "Loading static routes from '{}'",
                routes_file.to_string_lossy()
            );
            routes.extend(load_routes(routes_file).await?);
        }
        Ok(Self::new(router, routes))
    }

    pub fn routes(&self) -> &[StaticRoute] {
        &self.routes
    }

    /// The first route matching `destination`.
    pub fn lookup(&self, destination: &Eid) -> Option<&StaticRoute> {
        self.routes.iter().find(|route| route.matches(destination))
    }

    /// Bundles waiting for `next_hop` to become reachable.
    pub fn pending(&self, next_hop: &Eid) -> Vec<BundleId> {
        self.pending
            .lock()
            .trace_expect("Failed to lock mutex")
            .get(next_hop)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn defer(&self, next_hop: &Eid, id: BundleId) {
        let mut pending = self.pending.lock().trace_expect("Failed to lock mutex");
        let queue = pending.entry(next_hop.clone()).or_default();
        if !queue.contains(&id) {
            trace!("Bundle {id} waits for {next_hop}");
            queue.push_back(id);
        }
    }

    fn remove(&self, next_hop: &Eid, id: &BundleId) {
        if let Some(queue) = self
            .pending
            .lock()
            .trace_expect("Failed to lock mutex")
            .get_mut(next_hop)
        {
            queue.retain(|i| i != id);
        }
    }

    async fn execute(&self, task: Task) -> Result<(), router::Error> {
        match task {
            Task::Route(meta) => {
                let Some(route) = self.lookup(&meta.destination) else {
                    return Ok(());
                };
                let next_hop = route.next_hop().node();
                if next_hop.same_node(self.router.local()) {
                    return Ok(());
                }
                trace!("Bundle {} matches static route {route}", meta.id);
                self.send(&next_hop, meta.id).await
            }
            Task::Flush(next_hop) => {
                let waiting = self
                    .pending
                    .lock()
                    .trace_expect("Failed to lock mutex")
                    .remove(&next_hop)
                    .unwrap_or_default();
                for id in waiting {
                    if let Err(e) = self.send(&next_hop, id).await {
                        debug!("Failed to send to {next_hop}: {e}");
                    }
                }
                Ok(())
            }
            Task::Delivered(next_hop, id) => {
                self.remove(&next_hop, &id);
                Ok(())
            }
            Task::Forget(id) => {
                for queue in self
                    .pending
                    .lock()
                    .trace_expect("Failed to lock mutex")
                    .values_mut()
                {
                    queue.retain(|i| *i != id);
                }
                Ok(())
            }
        }
    }

    async fn send(&self, next_hop: &Eid, id: BundleId) -> Result<(), router::Error> {
        let neighbors = self.router.neighbors();
        if !neighbors.is_available(next_hop) {
            self.defer(next_hop, id);
            return Ok(());
        }
        if neighbors.has(next_hop, &id, false) == Ok(true) {
            return Ok(());
        }

        match self.router.forward(next_hop, &id).await {
            Ok(()) => Ok(()),
            Err(router::Error::Neighbor(neighbor::Error::AlreadyInTransit(_))) => Ok(()),
            Err(e) if e.is_no_bundle_found() => {
                trace!("Bundle {id} is gone, not routing it");
                Ok(())
            }
            Err(e) => {
                self.defer(next_hop, id);
                Err(e)
            }
        }
    }
}

#[async_trait]
impl Extension for StaticRoutingExtension {
    fn name(&self) -> &'static str {
        "static_routes"
    }

    fn notify(&self, event: &Event) {
        match event {
            Event::Queued { meta, .. } => self.queue.push(Task::Route(meta.clone())),
            Event::NodeAvailable { node: peer } | Event::ConnectionUp { peer } => {
                self.queue.push(Task::Flush(peer.clone()))
            }
            Event::TransferCompleted { peer, meta } => {
                self.queue
                    .push(Task::Delivered(peer.clone(), meta.id.clone()));
                self.queue.push(Task::Flush(peer.clone()));
            }
            Event::BundleExpired { id } | Event::BundleDeleted { id } => {
                self.queue.push(Task::Forget(id.clone()))
            }
            _ => {}
        }
    }

    async fn shutdown(&self) {
        self.queue.abort();
        self.pool.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn eid(s: &str) -> Eid {
        s.parse().unwrap()
    }

    #[test]
    fn patterns() {
        let prefix = StaticRoute::new("dtn://a*", eid("dtn://gw"));
        assert!(prefix.matches(&eid("dtn://abc")));
        assert!(prefix.matches(&eid("dtn://a/app")));
        assert!(!prefix.matches(&eid("dtn://xabc")));

        let suffix = StaticRoute::new("*/sensor", eid("dtn://gw"));
        assert!(suffix.matches(&eid("dtn://node/sensor")));
        assert!(!suffix.matches(&eid("dtn://node/sensors")));

        let infix = StaticRoute::new("dtn://*/app", eid("dtn://gw"));
        assert!(infix.matches(&eid("dtn://n/app")));
        assert!(!infix.matches(&eid("dtn://n/other")));
        assert!(!StaticRoute::new("dtn://a*a", eid("dtn://gw")).matches(&eid("dtn://a")));

        let exact = StaticRoute::new("dtn://abc", eid("dtn://gw"));
        assert!(exact.matches(&eid("dtn://abc")));
        assert!(!exact.matches(&eid("dtn://abc/app")));

        assert!(StaticRoute::new("*", eid("dtn://gw")).matches(&eid("ipn:1.2")));
    }

    #[test]
    fn route_lines() {
        let routes = parse_routes(&[
            "# default",
            "",
            "dtn://a* via dtn://gw",
            "   * via ipn:3.0   # everything else",
        ])
        .unwrap();
        assert_eq!(
            routes,
            vec![
                StaticRoute::new("dtn://a*", eid("dtn://gw")),
                StaticRoute::new("*", eid("ipn:3.0")),
            ]
        );

        assert!(matches!(
            parse_routes(&["dtn://a* via dtn://gw", "dtn://b*"]),
            Err(Error::Parse {
                line: 2,
                source: ParseError::MissingVia
            })
        ));
        assert!(matches!(
            "dtn://a* to dtn://gw".parse::<RouteLine>(),
            Err(ParseError::Unexpected(s)) if s == "to"
        ));
        assert!(matches!(
            "dtn://a* via".parse::<RouteLine>(),
            Err(ParseError::MissingNextHop)
        ));
        assert!(matches!(
            "dtn://a* via http://gw".parse::<RouteLine>(),
            Err(ParseError::Eid(eid::Error::UnsupportedScheme(_)))
        ));
    }

    #[tokio::test]
    async fn routes_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# Static routes").unwrap();
        writeln!(file, "dtn://a* via dtn://gw").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "*/sensor via dtn://collector").unwrap();
        file.flush().unwrap();

        let routes = load_routes(file.path()).await.unwrap();
        assert_eq!(routes.len(), 2);
        assert_eq!(routes[1].next_hop(), &eid("dtn://collector"));

        writeln!(file, "dtn://b* via").unwrap();
        file.flush().unwrap();
        assert!(matches!(
            load_routes(file.path()).await,
            Err(Error::Parse {
                line: 5,
                source: ParseError::MissingNextHop
            })
        ));

        assert!(matches!(
            load_routes(Path::new("/nonexistent/routes")).await,
            Err(Error::Io(_))
        ));
    }
}
