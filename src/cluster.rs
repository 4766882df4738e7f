/// Ordered list of broker cluster members used as failover peers.
///
/// Order matters: it is the attempt order the transport follows when the
/// primary host is unavailable. An empty list means single-node mode.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterAddress {
    nodes: Vec<String>,
}

impl ClusterAddress {
    /// Parse a raw `clusterNames` value such as `"rabbit1,rabbit2:5673"`.
    ///
    /// Segments are trimmed and blank segments are skipped, so `""` and `" , "`
    /// both yield single-node mode rather than an error.
    pub fn parse(raw: &str) -> Self {
        let nodes = raw
            .split(',')
            .map(str::trim)
            .filter(|segment| !segment.is_empty())
            .map(str::to_string)
            .collect();

        Self { nodes }
    }

    pub fn nodes(&self) -> &[String] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Split a node identifier into host and optional port (`"rabbit2:5673"`).
/// A suffix that is not a valid port is kept as part of the host.
pub fn split_node(node: &str) -> (&str, Option<u16>) {
    match node.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => match port.parse::<u16>() {
            Ok(port) => (host, Some(port)),
            Err(_) => (node, None),
        },
        _ => (node, None),
    }
}
