//! Pool membership: which components back which pool, and what each pool
//! exposes. Kept as an ordered list so rendering follows declaration order.

use crate::component::ServerComponent;
use crate::model::{FormationSpec, PoolKind, ServiceDef};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolMember {
    pub server_name: String,
    /// `None` until the component has an address, and for failed components.
    pub ip_address: Option<String>,
}

impl PoolMember {
    pub fn new(server_name: impl Into<String>, ip_address: Option<String>) -> Self {
        Self {
            server_name: server_name.into(),
            ip_address,
        }
    }

    pub fn from_component(component: &ServerComponent) -> Self {
        let ip_address = if component.is_failed() {
            None
        } else {
            component.ip_address().map(str::to_string)
        };
        Self::new(component.server_name(), ip_address)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolGroup {
    pub name: String,
    pub kind: PoolKind,
    pub services: Vec<ServiceDef>,
    pub members: Vec<PoolMember>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolAggregator {
    groups: Vec<PoolGroup>,
}

impl PoolAggregator {
    /// One empty group per declared pool, in declaration order.
    pub fn from_spec(spec: &FormationSpec) -> Self {
        let groups = spec
            .pools
            .iter()
            .map(|pool| PoolGroup {
                name: pool.vm.name.clone(),
                kind: pool.kind,
                services: pool.services.clone(),
                members: Vec::new(),
            })
            .collect();
        Self { groups }
    }

    /// Group `components` under their pools. Load balancer and box
    /// components are ignored.
    pub fn from_components<'a>(
        spec: &FormationSpec,
        components: impl IntoIterator<Item = &'a ServerComponent>,
    ) -> Self {
        let mut aggregator = Self::from_spec(spec);
        for component in components {
            if let Some(pool) = component.role().pool_name() {
                aggregator.add_member(pool, PoolMember::from_component(component));
            }
        }
        aggregator
    }

    /// Returns false when `pool` was never declared.
    pub fn add_member(&mut self, pool: &str, member: PoolMember) -> bool {
        match self.groups.iter_mut().find(|g| g.name == pool) {
            Some(group) => {
                group.members.push(member);
                true
            }
            None => false,
        }
    }

    pub fn group(&self, name: &str) -> Option<&PoolGroup> {
        self.groups.iter().find(|g| g.name == name)
    }

    pub fn http_pools(&self) -> impl Iterator<Item = &PoolGroup> {
        self.groups.iter().filter(|g| g.kind == PoolKind::Http)
    }

    pub fn tcp_pools(&self) -> impl Iterator<Item = &PoolGroup> {
        self.groups.iter().filter(|g| g.kind == PoolKind::Tcp)
    }

    /// Every pool member: HTTP pools first, then TCP pools, each in
    /// declaration order.
    pub fn all_components(&self) -> impl Iterator<Item = &PoolMember> {
        self.http_pools()
            .chain(self.tcp_pools())
            .flat_map(|g| g.members.iter())
    }
}
