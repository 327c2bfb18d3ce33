//! Container target expressions: `123`, `pve1:123`, `pve1/web`, `web`, or a comma list.

use crate::error::{LifecycleError, Result};
use crate::proxmox::client::ClusterResource;
use crate::proxmox::{ProxmoxClient, ResourceKind, ResourceRef};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Term {
    Id(i64),
    NodeId(String, i64),
    NodeName(String, String),
    Name(String),
}

impl Term {
    fn matches(&self, ct: &ClusterResource) -> bool {
        let node = ct.node.as_deref();
        let name = ct.name.as_deref();
        match self {
            Term::Id(id) => ct.vmid == Some(*id),
            Term::NodeId(n, id) => node == Some(n.as_str()) && ct.vmid == Some(*id),
            Term::NodeName(n, nm) => node == Some(n.as_str()) && name == Some(nm.as_str()),
            Term::Name(nm) => name == Some(nm.as_str()),
        }
    }
}

fn invalid(message: String) -> LifecycleError {
    LifecycleError::validation("selector", message)
}

pub fn parse(selector: &str) -> Result<Vec<Term>> {
    let tokens: Vec<&str> = selector
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect();
    if tokens.is_empty() {
        return Err(invalid("selector is empty".into()));
    }

    tokens
        .into_iter()
        .map(|tok| {
            if let Some((node, id)) = tok.split_once(':') {
                let vmid = id
                    .trim()
                    .parse()
                    .map_err(|_| invalid(format!("'{}' is not a valid node:vmid pair", tok)))?;
                Ok(Term::NodeId(node.trim().to_string(), vmid))
            } else if let Some((node, name)) = tok.split_once('/') {
                Ok(Term::NodeName(node.trim().to_string(), name.trim().to_string()))
            } else if let Ok(vmid) = tok.parse() {
                Ok(Term::Id(vmid))
            } else {
                Ok(Term::Name(tok.to_string()))
            }
        })
        .collect()
}

/// Match terms against the container inventory. Order follows the terms; duplicates collapse.
pub fn select(terms: &[Term], inventory: &[ClusterResource]) -> Vec<ResourceRef> {
    let mut out: Vec<ResourceRef> = Vec::new();
    for term in terms {
        for ct in inventory.iter().filter(|ct| term.matches(ct)) {
            if let Some(r) = ct.resource_ref() {
                if !out.contains(&r) {
                    out.push(r);
                }
            }
        }
    }
    out
}

pub async fn resolve(client: &ProxmoxClient, selector: &str) -> Result<Vec<ResourceRef>> {
    let terms = parse(selector)?;
    let inventory = client
        .get_guests(ResourceKind::Container, None)
        .await
        .map_err(|e| LifecycleError::from(e).with_context("resolving selector"))?;
    let targets = select(&terms, &inventory);
    if targets.is_empty() {
        return Err(invalid(format!("no containers matched '{}'", selector)));
    }
    Ok(targets)
}
