//! Formation model: the validated, immutable description of a fleet.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use crate::ast::{DefaultsNode, FormationAst, PoolNode, ServiceNode, StepNode, VmNode};
use crate::component::{ComponentRole, ServerComponent};
use crate::error::SpecValidationError;

/// Settings shared by every server in the formation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Defaults {
    pub ssh_key_name: String,
    pub pem_file: PathBuf,
    pub security_groups: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootstrapStep {
    /// Clone the repository and run its `bootstrap.sh`.
    Git { url: String },
}

impl BootstrapStep {
    pub fn url(&self) -> &str {
        match self {
            Self::Git { url } => url,
        }
    }
}

/// Fields common to pools, boxes and the load balancer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmSpec {
    pub name: String,
    pub count: u32,
    pub image: String,
    pub vm_flavor: String,
    pub bootstrap_sequence: Vec<BootstrapStep>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolKind {
    /// Routed by virtual host through per-port frontends.
    Http,
    /// Routed by port through `listen` stanzas.
    Tcp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDef {
    pub port: u16,
    pub healthcheck_path: String,
    pub healthcheck_port: u16,
}

impl ServiceDef {
    pub fn new(port: u16, healthcheck_path: impl Into<String>, healthcheck_port: u16) -> Self {
        Self {
            port,
            healthcheck_path: healthcheck_path.into(),
            healthcheck_port,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolDef {
    pub vm: VmSpec,
    pub kind: PoolKind,
    pub services: Vec<ServiceDef>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoxDef {
    pub vm: VmSpec,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadBalancerDef {
    pub vm: VmSpec,
}

/// Result of compiling a formation tree. Never mutated after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormationSpec {
    pub defaults: Defaults,
    pub load_balancer: Option<LoadBalancerDef>,
    /// In declaration order.
    pub pools: Vec<PoolDef>,
    /// In declaration order.
    pub boxes: Vec<BoxDef>,
}

/// Services an HTTP pool exposes when the formation does not list any.
const IMPLICIT_HTTP_PORTS: [u16; 2] = [80, 8080];

impl FormationSpec {
    pub fn pool(&self, name: &str) -> Option<&PoolDef> {
        self.pools.iter().find(|p| p.vm.name == name)
    }

    pub fn pool_names(&self) -> impl Iterator<Item = &str> {
        self.pools.iter().map(|p| p.vm.name.as_str())
    }

    /// One component per declared replica: pools in declaration order, then
    /// the load balancer, then boxes. No remote call is made.
    pub fn components(&self) -> Vec<ServerComponent> {
        let mut out = Vec::new();
        for pool in &self.pools {
            self.push_replicas(&mut out, &pool.vm, ComponentRole::Pool(pool.vm.name.clone()));
        }
        if let Some(lb) = &self.load_balancer {
            self.push_replicas(&mut out, &lb.vm, ComponentRole::LoadBalancer);
        }
        for b in &self.boxes {
            self.push_replicas(&mut out, &b.vm, ComponentRole::Box(b.vm.name.clone()));
        }
        out
    }

    pub fn component_names(&self) -> Vec<String> {
        self.components()
            .iter()
            .map(|c| c.server_name().to_string())
            .collect()
    }

    fn push_replicas(&self, out: &mut Vec<ServerComponent>, vm: &VmSpec, role: ComponentRole) {
        for index in 1..=vm.count {
            out.push(ServerComponent::new(
                replica_name(&vm.name, index),
                role.clone(),
                &self.defaults,
                vm.clone(),
            ));
        }
    }
}

pub fn replica_name(name: &str, index: u32) -> String {
    format!("{name}-{index}")
}

/// Turn a parsed formation into a validated [`FormationSpec`].
///
/// Pure data transformation plus local file existence checks.
pub fn compile(ast: &FormationAst) -> Result<FormationSpec, SpecValidationError> {
    let defaults = compile_defaults(ast.defaults.as_ref())?;
    let sequences = SequenceTable::build(ast)?;

    let mut names = HashSet::new();
    let mut claim = |what: &'static str, name: &str| {
        if names.insert(name.to_string()) {
            Ok(())
        } else {
            Err(SpecValidationError::DuplicateName {
                what,
                name: name.to_string(),
            })
        }
    };

    let mut pools = Vec::with_capacity(ast.pools.len());
    for node in &ast.pools {
        claim("pool", &node.vm.name)?;
        pools.push(compile_pool(node, &sequences)?);
    }

    let load_balancer = match &ast.load_balancer {
        Some(node) => {
            claim("load balancer", &node.name)?;
            Some(LoadBalancerDef {
                vm: compile_vm(node, &sequences)?,
            })
        }
        None => None,
    };

    let mut boxes = Vec::with_capacity(ast.boxes.len());
    for node in &ast.boxes {
        claim("box", &node.name)?;
        boxes.push(BoxDef {
            vm: compile_vm(node, &sequences)?,
        });
    }

    let spec = FormationSpec {
        defaults,
        load_balancer,
        pools,
        boxes,
    };

    let mut seen = HashSet::new();
    for name in spec.component_names() {
        if !seen.insert(name.clone()) {
            return Err(SpecValidationError::DuplicateName {
                what: "server",
                name,
            });
        }
    }

    Ok(spec)
}

fn compile_defaults(node: Option<&DefaultsNode>) -> Result<Defaults, SpecValidationError> {
    let missing = |key| SpecValidationError::MissingKey {
        owner: "defaults".into(),
        key,
    };
    let node = node.ok_or_else(|| missing("ssh_key_name"))?;

    let ssh_key_name = node.ssh_key_name.clone().ok_or_else(|| missing("ssh_key_name"))?;
    let pem_file = node.pem_file.as_deref().ok_or_else(|| missing("pem_file"))?;
    let security_groups = node
        .security_groups
        .clone()
        .ok_or_else(|| missing("security_groups"))?;

    let pem_file = expand_home(pem_file);
    if !pem_file.exists() {
        return Err(SpecValidationError::PemFileMissing(pem_file));
    }
    if security_groups.is_empty() {
        return Err(SpecValidationError::EmptySecurityGroups);
    }

    Ok(Defaults {
        ssh_key_name,
        pem_file,
        security_groups,
    })
}

fn compile_vm(node: &VmNode, sequences: &SequenceTable) -> Result<VmSpec, SpecValidationError> {
    let owner = &node.name;
    let missing = |key| SpecValidationError::MissingKey {
        owner: owner.clone(),
        key,
    };

    let count = node.count.ok_or_else(|| missing("count"))?;
    if count == 0 {
        return Err(SpecValidationError::InvalidCount {
            owner: owner.clone(),
        });
    }
    let image = node.image.clone().ok_or_else(|| missing("image"))?;
    let vm_flavor = node.vm_flavor.clone().ok_or_else(|| missing("vm_flavor"))?;
    let steps = node
        .bootstrap_sequence
        .as_deref()
        .ok_or_else(|| missing("bootstrap_sequence"))?;

    Ok(VmSpec {
        name: owner.clone(),
        count,
        image,
        vm_flavor,
        bootstrap_sequence: sequences.resolve(owner, steps)?,
    })
}

fn compile_pool(node: &PoolNode, sequences: &SequenceTable) -> Result<PoolDef, SpecValidationError> {
    let vm = compile_vm(&node.vm, sequences)?;
    let owner = &vm.name;
    let declared: Vec<ServiceDef> = node.services.iter().map(service_def).collect();

    let (kind, services) = match node.kind.as_deref().map(str::to_ascii_lowercase).as_deref() {
        Some("http") => (PoolKind::Http, declared),
        Some("tcp") if declared.is_empty() => (PoolKind::Tcp, port_services(node)),
        Some("tcp") => (PoolKind::Tcp, declared),
        Some(other) => {
            return Err(SpecValidationError::UnknownPoolType {
                owner: owner.clone(),
                kind: other.to_string(),
            });
        }
        // Untagged pools: load-balance ports make a TCP pool.
        None if node.load_balance_ports.is_some() && declared.is_empty() => {
            (PoolKind::Tcp, port_services(node))
        }
        None if node.load_balance_ports.is_some() => (PoolKind::Tcp, declared),
        None if declared.is_empty() => (
            PoolKind::Http,
            IMPLICIT_HTTP_PORTS
                .iter()
                .map(|&port| ServiceDef::new(port, "/", port))
                .collect(),
        ),
        None => (PoolKind::Http, declared),
    };

    if services.is_empty() {
        return Err(SpecValidationError::NoServices {
            owner: owner.clone(),
        });
    }

    Ok(PoolDef { vm, kind, services })
}

fn service_def(node: &ServiceNode) -> ServiceDef {
    ServiceDef::new(node.port, node.healthcheck_path.clone(), node.healthcheck_port)
}

fn port_services(node: &PoolNode) -> Vec<ServiceDef> {
    node.load_balance_ports
        .iter()
        .flatten()
        .map(|&port| ServiceDef::new(port, "/", port))
        .collect()
}

fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), std::env::var_os("HOME")) {
        (Some(rest), Some(home)) => Path::new(&home).join(rest),
        _ => PathBuf::from(path),
    }
}

/// Named bootstrap sequences, resolved lazily so includes may refer to
/// sequences declared later.
struct SequenceTable<'a> {
    named: HashMap<&'a str, &'a [StepNode]>,
}

impl<'a> SequenceTable<'a> {
    fn build(ast: &'a FormationAst) -> Result<Self, SpecValidationError> {
        let mut named = HashMap::new();
        for seq in &ast.bootstrap_sequences {
            if named.insert(seq.name.as_str(), seq.steps.as_slice()).is_some() {
                return Err(SpecValidationError::DuplicateName {
                    what: "bootstrap sequence",
                    name: seq.name.clone(),
                });
            }
        }
        Ok(Self { named })
    }

    fn resolve(&self, owner: &str, steps: &[StepNode]) -> Result<Vec<BootstrapStep>, SpecValidationError> {
        let mut out = Vec::new();
        self.expand(owner, steps, &mut Vec::new(), &mut out)?;
        Ok(out)
    }

    fn expand(
        &self,
        owner: &str,
        steps: &[StepNode],
        stack: &mut Vec<String>,
        out: &mut Vec<BootstrapStep>,
    ) -> Result<(), SpecValidationError> {
        for step in steps {
            match step.kind.as_str() {
                "git" => out.push(BootstrapStep::Git {
                    url: step.value.clone(),
                }),
                "include" => {
                    let name = step.value.as_str();
                    if stack.iter().any(|s| s == name) {
                        return Err(SpecValidationError::SequenceCycle(name.to_string()));
                    }
                    let included = self.named.get(name).ok_or_else(|| {
                        SpecValidationError::UnknownSequence {
                            owner: owner.to_string(),
                            name: name.to_string(),
                        }
                    })?;
                    stack.push(name.to_string());
                    self.expand(owner, included, stack, out)?;
                    stack.pop();
                }
                other => {
                    return Err(SpecValidationError::UnknownBootstrapStep {
                        owner: owner.to_string(),
                        kind: other.to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{self, SequenceNode};
    use crate::testing;

    fn vm(name: &str, count: u32) -> VmNode {
        VmNode {
            name: name.into(),
            count: Some(count),
            image: Some("ubuntu-12.04".into()),
            vm_flavor: Some("small".into()),
            bootstrap_sequence: Some(vec![StepNode::git("git://scm/boilerplate.git")]),
        }
    }

    fn http_pool(name: &str, count: u32, port: u16) -> PoolNode {
        PoolNode {
            vm: vm(name, count),
            kind: Some("http".into()),
            services: vec![ServiceNode {
                port,
                healthcheck_path: format!("/{name}"),
                healthcheck_port: port,
            }],
            load_balance_ports: None,
        }
    }

    fn base_ast(pem: &Path) -> FormationAst {
        FormationAst {
            defaults: Some(DefaultsNode {
                ssh_key_name: Some("milo-qa".into()),
                pem_file: Some(pem.display().to_string()),
                security_groups: Some(vec!["default".into()]),
            }),
            ..Default::default()
        }
    }

    #[test]
    fn component_names_follow_declaration_order() {
        let pem = testing::pem_file();
        let mut ast = base_ast(pem.path());
        ast.pools = vec![http_pool("date", 2, 8080), http_pool("time", 3, 8080)];
        ast.load_balancer = Some(vm("lb", 1));
        ast.boxes = vec![vm("tester", 1)];

        let spec = compile(&ast).unwrap();
        let expected = ["date-1", "date-2", "time-1", "time-2", "time-3", "lb-1", "tester-1"];
        assert_eq!(spec.component_names(), expected);
        // Same tree, same plan.
        assert_eq!(compile(&ast).unwrap().component_names(), expected);
    }

    #[test]
    fn components_carry_role_and_defaults() {
        let pem = testing::pem_file();
        let mut ast = base_ast(pem.path());
        ast.pools = vec![http_pool("date", 1, 8080)];
        ast.load_balancer = Some(vm("lb", 1));

        let spec = compile(&ast).unwrap();
        let components = spec.components();
        assert_eq!(components[0].role(), &ComponentRole::Pool("date".into()));
        assert_eq!(components[1].role(), &ComponentRole::LoadBalancer);
        assert_eq!(components[0].pem_file(), pem.path());
    }

    #[test]
    fn missing_default_keys_are_reported() {
        let pem = testing::pem_file();
        let mut ast = base_ast(pem.path());
        ast.defaults.as_mut().unwrap().ssh_key_name = None;
        assert!(matches!(
            compile(&ast),
            Err(SpecValidationError::MissingKey { key: "ssh_key_name", .. })
        ));

        assert!(matches!(
            compile(&FormationAst::default()),
            Err(SpecValidationError::MissingKey { .. })
        ));
    }

    #[test]
    fn pem_file_must_exist_and_groups_must_be_present() {
        let ast = base_ast(Path::new("/nonexistent/oat/key.pem"));
        assert!(matches!(compile(&ast), Err(SpecValidationError::PemFileMissing(_))));

        let pem = testing::pem_file();
        let mut ast = base_ast(pem.path());
        ast.defaults.as_mut().unwrap().security_groups = Some(vec![]);
        assert!(matches!(compile(&ast), Err(SpecValidationError::EmptySecurityGroups)));
    }

    #[test]
    fn names_collide_across_pools_boxes_and_load_balancer() {
        let pem = testing::pem_file();
        let mut ast = base_ast(pem.path());
        ast.pools = vec![http_pool("web", 1, 80)];
        ast.boxes = vec![vm("web", 1)];
        assert!(matches!(
            compile(&ast),
            Err(SpecValidationError::DuplicateName { what: "box", name }) if name == "web"
        ));

        let mut ast = base_ast(pem.path());
        ast.pools = vec![http_pool("web", 1, 80), http_pool("web", 2, 81)];
        assert!(matches!(
            compile(&ast),
            Err(SpecValidationError::DuplicateName { what: "pool", .. })
        ));
    }

    #[test]
    fn unknown_bootstrap_steps_are_rejected() {
        let pem = testing::pem_file();
        let mut ast = base_ast(pem.path());
        let mut node = vm("tester", 1);
        node.bootstrap_sequence = Some(vec![StepNode {
            kind: "chef".into(),
            value: "cookbooks/api".into(),
        }]);
        ast.boxes = vec![node];

        assert!(matches!(
            compile(&ast),
            Err(SpecValidationError::UnknownBootstrapStep { kind, .. }) if kind == "chef"
        ));
    }

    #[test]
    fn zero_count_and_missing_keys_on_nodes() {
        let pem = testing::pem_file();
        let mut ast = base_ast(pem.path());
        ast.boxes = vec![vm("tester", 0)];
        assert!(matches!(compile(&ast), Err(SpecValidationError::InvalidCount { .. })));

        let mut node = vm("tester", 1);
        node.vm_flavor = None;
        ast.boxes = vec![node];
        assert!(matches!(
            compile(&ast),
            Err(SpecValidationError::MissingKey { key: "vm_flavor", owner }) if owner == "tester"
        ));
    }

    #[test]
    fn includes_expand_named_sequences_in_place() {
        let pem = testing::pem_file();
        let mut ast = base_ast(pem.path());
        ast.bootstrap_sequences = vec![
            SequenceNode {
                name: "boilerplate".into(),
                steps: vec![StepNode::git("git://scm/boilerplate.git"), StepNode::include("tools")],
            },
            SequenceNode {
                name: "tools".into(),
                steps: vec![StepNode::git("git://scm/tools.git")],
            },
        ];
        let mut node = vm("tester", 1);
        node.bootstrap_sequence = Some(vec![
            StepNode::include("boilerplate"),
            StepNode::git("git://scm/app.git"),
        ]);
        ast.boxes = vec![node];

        let spec = compile(&ast).unwrap();
        let urls: Vec<&str> = spec.boxes[0].vm.bootstrap_sequence.iter().map(|s| s.url()).collect();
        assert_eq!(
            urls,
            ["git://scm/boilerplate.git", "git://scm/tools.git", "git://scm/app.git"]
        );
    }

    #[test]
    fn include_errors() {
        let pem = testing::pem_file();
        let mut ast = base_ast(pem.path());
        let mut node = vm("tester", 1);
        node.bootstrap_sequence = Some(vec![StepNode::include("missing")]);
        ast.boxes = vec![node.clone()];
        assert!(matches!(compile(&ast), Err(SpecValidationError::UnknownSequence { .. })));

        ast.bootstrap_sequences = vec![SequenceNode {
            name: "missing".into(),
            steps: vec![StepNode::include("missing")],
        }];
        assert!(matches!(compile(&ast), Err(SpecValidationError::SequenceCycle(_))));
    }

    #[test]
    fn explicit_port_pool_is_tcp() {
        let pem = testing::pem_file();
        let mut ast = base_ast(pem.path());
        ast.pools = vec![PoolNode {
            vm: vm("cache", 2),
            kind: None,
            services: vec![],
            load_balance_ports: Some(vec![6379]),
        }];

        let spec = compile(&ast).unwrap();
        let pool = spec.pool("cache").unwrap();
        assert_eq!(pool.kind, PoolKind::Tcp);
        assert_eq!(pool.services, vec![ServiceDef::new(6379, "/", 6379)]);
    }

    #[test]
    fn portless_pool_is_implicit_http() {
        let pem = testing::pem_file();
        let mut ast = base_ast(pem.path());
        ast.pools = vec![PoolNode {
            vm: vm("web", 1),
            ..Default::default()
        }];

        let spec = compile(&ast).unwrap();
        let pool = spec.pool("web").unwrap();
        assert_eq!(pool.kind, PoolKind::Http);
        assert_eq!(
            pool.services,
            vec![ServiceDef::new(80, "/", 80), ServiceDef::new(8080, "/", 8080)]
        );
    }

    #[test]
    fn explicitly_typed_pools_need_services() {
        let pem = testing::pem_file();
        let mut ast = base_ast(pem.path());
        let mut pool = http_pool("date", 1, 8080);
        pool.services.clear();
        ast.pools = vec![pool];
        assert!(matches!(compile(&ast), Err(SpecValidationError::NoServices { .. })));

        let mut pool = http_pool("date", 1, 8080);
        pool.kind = Some("udp".into());
        ast.pools = vec![pool];
        assert!(matches!(
            compile(&ast),
            Err(SpecValidationError::UnknownPoolType { kind, .. }) if kind == "udp"
        ));
    }

    #[test]
    fn compiles_from_json_source() {
        let pem = testing::pem_file();
        let source = format!(
            r#"{{
                "defaults": {{"ssh_key_name": "milo-qa", "pem_file": "{}", "security_groups": ["default"]}},
                "pools": [{{"name": "cache", "type": "tcp", "count": 2, "image": "ubuntu", "vm_flavor": "tiny",
                            "bootstrap_sequence": [{{"type": "git", "value": "git://scm/noop.git"}}],
                            "services": [{{"port": 6379, "healthcheck_path": "/ok", "healthcheck_port": 8081}}]}}]
            }}"#,
            pem.path().display()
        );
        let spec = compile(&ast::parse(&source).unwrap()).unwrap();
        assert_eq!(spec.component_names(), ["cache-1", "cache-2"]);
        assert_eq!(spec.pools[0].services[0].healthcheck_port, 8081);
    }
}
