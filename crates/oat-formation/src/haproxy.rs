//! HAProxy configuration rendering.
//!
//! HTTP pools are routed by `Host` header through one frontend per port; TCP
//! pools get a `listen` stanza per service. Output depends only on the pool
//! declarations and member addresses, never on map iteration order.

use std::collections::BTreeMap;

use crate::error::GenerationError;
use crate::pool::{PoolAggregator, PoolGroup, PoolMember};

const PREAMBLE: &str = "\
global
  daemon
  maxconn 1024

defaults
  mode http
  balance leastconn
  timeout connect 5000ms
  timeout client 50000ms
  timeout server 50000ms

listen stats :11000
  mode http
  stats enable
  stats realm Haproxy\\ Statistics
  stats uri /
";

struct HttpRoute {
    acl: String,
    backend: String,
}

/// Render the full proxy configuration. Fails if any pool member has no
/// address rather than emitting a partial config.
pub fn render(pools: &PoolAggregator) -> Result<String, GenerationError> {
    if let Some(member) = pools.all_components().find(|m| m.ip_address.is_none()) {
        return Err(GenerationError::MissingAddress {
            server_name: member.server_name.clone(),
        });
    }

    let mut by_port: BTreeMap<u16, Vec<HttpRoute>> = BTreeMap::new();
    for pool in pools.http_pools() {
        for service in &pool.services {
            let key = format!("{}-{}", pool.name, service.port);
            let acl = format!(
                "  acl {key} hdr_beg(host) -i {}.vip\n  use_backend {key} if {key}",
                pool.name
            );
            let backend = format!(
                "backend {key}\n  option httpchk GET {}\n{}",
                service.healthcheck_path,
                server_lines(pool, service.port, service.healthcheck_port)
            );
            by_port
                .entry(service.port)
                .or_default()
                .push(HttpRoute { acl, backend });
        }
    }

    let frontends = by_port
        .iter()
        .map(|(port, routes)| {
            let acls: Vec<&str> = routes.iter().map(|r| r.acl.as_str()).collect();
            format!("frontend http-in-{port}\n  bind *:{port}\n\n{}", acls.join("\n"))
        })
        .collect::<Vec<_>>()
        .join("\n\n");

    let backends = by_port
        .values()
        .flatten()
        .map(|r| r.backend.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");

    let listeners = pools
        .tcp_pools()
        .flat_map(|pool| {
            pool.services.iter().map(move |service| {
                format!(
                    "listen {}-{port}\n  mode tcp\n  option httpchk GET {}\n  balance leastconn\n  bind *:{port}\n\n{}",
                    pool.name,
                    service.healthcheck_path,
                    server_lines(pool, service.port, service.healthcheck_port),
                    port = service.port,
                )
            })
        })
        .collect::<Vec<_>>()
        .join("\n\n");

    let sections: Vec<&str> = [PREAMBLE, frontends.as_str(), backends.as_str(), listeners.as_str()]
        .into_iter()
        .filter(|s| !s.is_empty())
        .collect();
    let mut config = sections.join("\n\n");
    if !config.ends_with('\n') {
        config.push('\n');
    }
    Ok(config)
}

fn server_lines(pool: &PoolGroup, port: u16, healthcheck_port: u16) -> String {
    pool.members
        .iter()
        .map(|m| server_line(m, port, healthcheck_port))
        .collect::<Vec<_>>()
        .join("\n")
}

fn server_line(member: &PoolMember, port: u16, healthcheck_port: u16) -> String {
    format!(
        "  server {} {}:{port} check port {healthcheck_port}",
        member.server_name,
        member.ip_address.as_deref().unwrap_or_default()
    )
}
