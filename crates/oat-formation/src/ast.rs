//! Formation syntax tree, as produced by the upstream formation parser.
//!
//! The tree is deliberately permissive: required keys are optional here and
//! reported by [`compile`](crate::model::compile) with the owning node's name.

use serde::Deserialize;

use crate::error::SpecValidationError;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FormationAst {
    #[serde(default)]
    pub defaults: Option<DefaultsNode>,
    #[serde(default)]
    pub bootstrap_sequences: Vec<SequenceNode>,
    #[serde(default)]
    pub load_balancer: Option<VmNode>,
    #[serde(default)]
    pub pools: Vec<PoolNode>,
    #[serde(default)]
    pub boxes: Vec<VmNode>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DefaultsNode {
    pub ssh_key_name: Option<String>,
    pub pem_file: Option<String>,
    pub security_groups: Option<Vec<String>>,
}

/// Named, reusable bootstrap sequence.
#[derive(Debug, Clone, Deserialize)]
pub struct SequenceNode {
    pub name: String,
    #[serde(default)]
    pub steps: Vec<StepNode>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StepNode {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
}

impl StepNode {
    pub fn git(url: impl Into<String>) -> Self {
        Self {
            kind: "git".into(),
            value: url.into(),
        }
    }

    pub fn include(name: impl Into<String>) -> Self {
        Self {
            kind: "include".into(),
            value: name.into(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct VmNode {
    pub name: String,
    pub count: Option<u32>,
    pub image: Option<String>,
    pub vm_flavor: Option<String>,
    pub bootstrap_sequence: Option<Vec<StepNode>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PoolNode {
    #[serde(flatten)]
    pub vm: VmNode,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub services: Vec<ServiceNode>,
    #[serde(default)]
    pub load_balance_ports: Option<Vec<u16>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServiceNode {
    pub port: u16,
    #[serde(alias = "healthcheck_endpoint")]
    pub healthcheck_path: String,
    pub healthcheck_port: u16,
}

/// Read a formation tree from its JSON rendering.
pub fn parse(source: &str) -> Result<FormationAst, SpecValidationError> {
    Ok(serde_json::from_str(source)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_formation() {
        let ast = parse(
            r#"{
                "defaults": {"ssh_key_name": "qa", "pem_file": "/k.pem", "security_groups": ["default"]},
                "bootstrap_sequences": [{"name": "base", "steps": [{"type": "git", "value": "git://h/base.git"}]}],
                "load_balancer": {"name": "lb", "count": 1, "image": "ubuntu", "vm_flavor": "small",
                                  "bootstrap_sequence": [{"type": "include", "value": "base"}]},
                "pools": [{"name": "date", "type": "http", "count": 2, "image": "ubuntu", "vm_flavor": "small",
                           "bootstrap_sequence": [],
                           "services": [{"port": 8080, "healthcheck_endpoint": "/date", "healthcheck_port": 8080}]}],
                "boxes": [{"name": "tester", "count": 1, "image": "ubuntu", "vm_flavor": "small", "bootstrap_sequence": []}]
            }"#,
        )
        .unwrap();

        assert_eq!(ast.bootstrap_sequences[0].steps, vec![StepNode::git("git://h/base.git")]);
        let lb = ast.load_balancer.unwrap();
        assert_eq!(lb.bootstrap_sequence.unwrap(), vec![StepNode::include("base")]);
        let pool = &ast.pools[0];
        assert_eq!(pool.vm.name, "date");
        assert_eq!(pool.kind.as_deref(), Some("http"));
        assert_eq!(pool.services[0].healthcheck_path, "/date");
        assert_eq!(ast.boxes[0].name, "tester");
    }

    #[test]
    fn missing_sections_default_to_empty() {
        let ast = parse("{}").unwrap();
        assert!(ast.defaults.is_none());
        assert!(ast.load_balancer.is_none());
        assert!(ast.pools.is_empty());
        assert!(ast.boxes.is_empty());
    }

    #[test]
    fn malformed_source_is_a_syntax_error() {
        assert!(matches!(parse("{\"pools\": 3}"), Err(SpecValidationError::Syntax(_))));
    }
}
