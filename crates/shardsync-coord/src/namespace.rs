//! Namespace filtering and resolution of the set of namespaces to copy.

use std::collections::BTreeSet;
use tracing::{debug, info};

use crate::client::{ConnectOptions, Connector};
use crate::config::FilterConfig;
use crate::error::{Result, SyncError};
use crate::types::{Namespace, Source};

const SYSTEM_DATABASES: [&str; 3] = ["admin", "local", "config"];

#[derive(Debug, Clone, PartialEq, Eq)]
enum Rule {
    Allow(Vec<String>),
    Deny(Vec<String>),
    All,
}

/// Include/exclude rules over namespaces.
#[derive(Debug, Clone)]
pub struct NamespaceFilter {
    rule: Rule,
    pass_special_db: Vec<String>,
}

impl NamespaceFilter {
    /// Build from configuration. White and black lists are mutually exclusive.
    pub fn from_config(config: &FilterConfig) -> Result<Self> {
        let rule = match (
            config.namespace_white.is_empty(),
            config.namespace_black.is_empty(),
        ) {
            (false, false) => {
                return Err(SyncError::Config {
                    msg: "namespace white list and black list cannot both be set".to_string(),
                })
            }
            (false, true) => Rule::Allow(config.namespace_white.clone()),
            (true, false) => Rule::Deny(config.namespace_black.clone()),
            (true, true) => Rule::All,
        };
        Ok(Self {
            rule,
            pass_special_db: config.pass_special_db.clone(),
        })
    }

    /// True when `ns` must not be copied.
    pub fn is_filtered(&self, ns: &Namespace) -> bool {
        if self.is_system(ns) {
            return true;
        }
        match &self.rule {
            Rule::All => false,
            Rule::Allow(list) => !list.iter().any(|entry| matches_entry(entry, ns)),
            Rule::Deny(list) => list.iter().any(|entry| matches_entry(entry, ns)),
        }
    }

    fn is_system(&self, ns: &Namespace) -> bool {
        if self.pass_special_db.iter().any(|db| db == &ns.database) {
            return false;
        }
        SYSTEM_DATABASES.contains(&ns.database.as_str()) || ns.collection.starts_with("system.")
    }
}

/// `db` matches every collection of the database, `db.coll` exactly one.
fn matches_entry(entry: &str, ns: &Namespace) -> bool {
    let rule = Namespace::parse(entry);
    if rule.database != ns.database {
        return false;
    }
    rule.collection.is_empty() || rule.collection == ns.collection
}

/// List namespaces on every source and keep the ones the filter lets through.
pub async fn resolve_namespaces(
    connector: &dyn Connector,
    sources: &[Source],
    opts: &ConnectOptions,
    filter: &NamespaceFilter,
) -> Result<BTreeSet<Namespace>> {
    let mut set = BTreeSet::new();
    for src in sources {
        let client = connector.source(&src.url, opts).await?;
        for ns in client.list_namespaces().await? {
            if filter.is_filtered(&ns) {
                debug!(source = %src, ns = %ns, "namespace filtered");
                continue;
            }
            set.insert(ns);
        }
    }
    info!(count = set.len(), "namespaces resolved");
    Ok(set)
}
