//! The staleness oracle: decides per target whether the cached result is
//! still valid, by comparing recorded hashes against the current state of
//! the command, its dependencies, and its output files.

use crate::analyze::DepSet;
use crate::env::{self, Environment};
use crate::error::EngineResult;
use crate::eval::Value;
use crate::graph::{Graph, NodeId, NodeKind, Trigger};
use crate::hash::{self, FileSig, Hashers};
use crate::store::Store;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::debug;

pub struct Oracle<'a> {
    pub graph: &'a Graph,
    pub depsets: &'a HashMap<NodeId, DepSet>,
    pub env: &'a Environment,
    pub store: &'a Store,
    pub hashers: &'a Hashers,
    /// Hash file contents; when false mtime+size is the cheap surrogate.
    pub hash_file_contents: bool,
}

impl<'a> Oracle<'a> {
    /// The current identity hash a node contributes to its dependents'
    /// depends-hash.  None is the sentinel for "not available yet": an
    /// unbuilt or failed target, or a missing file.
    pub fn dep_identity(&self, id: NodeId) -> EngineResult<Option<String>> {
        let node = self.graph.node(id);
        match node.kind {
            NodeKind::Target => {
                let meta = self.store.get_meta(&node.name)?;
                Ok(meta.and_then(|m| m.value_hash))
            }
            NodeKind::ImportedFunction | NodeKind::ImportedObject => {
                let import = self
                    .env
                    .get(&node.name)
                    .expect("import node resolves in environment");
                Ok(Some(self.hashers.text_hash(&env::import_identity(import))))
            }
            NodeKind::InputFile | NodeKind::OutputFile | NodeKind::SubDoc => {
                let path = node.path.as_deref().unwrap_or(&node.name);
                Ok(self.fingerprint(path)?.map(|sig| sig.identity()))
            }
        }
    }

    pub fn fingerprint(&self, path: &str) -> EngineResult<Option<FileSig>> {
        hash::fingerprint(self.hashers, Path::new(path), self.hash_file_contents).map_err(|err| {
            crate::error::EngineError::Cache {
                path: path.into(),
                message: format!("stat: {}", err),
            }
        })
    }

    /// Composite hash of the target's immediate dependencies, or None when
    /// some dependency has no identity yet (which forces outdated).
    pub fn current_depends_hash(&self, id: NodeId) -> EngineResult<Option<String>> {
        let node = self.graph.node(id);
        let mut pairs = Vec::with_capacity(node.deps.len());
        for &dep in &node.deps {
            match self.dep_identity(dep)? {
                Some(hash) => pairs.push((self.graph.node(dep).name.clone(), hash)),
                None => return Ok(None),
            }
        }
        pairs.sort();
        Ok(Some(self.hashers.depends_hash(&pairs)))
    }

    /// The outdated rules for a single target, modulated by its trigger.
    /// Does not look at whether dependencies will rebuild; see
    /// outdated_set for the transitive view.
    pub fn is_outdated(&self, id: NodeId) -> EngineResult<bool> {
        let node = self.graph.node(id);
        debug_assert!(node.is_target());
        let name = &node.name;

        let meta = match self.store.get_meta(name)? {
            Some(meta) => meta,
            None => {
                debug!(node = %name, "outdated: no meta record");
                return Ok(true);
            }
        };

        if node.trigger == Trigger::Always {
            return Ok(true);
        }

        // Cache integrity: a meta that points at an evicted or never-stored
        // value cannot satisfy dependents.
        match &meta.value_hash {
            Some(hash) if self.store.has_object(hash) => {}
            _ => {
                debug!(node = %name, "outdated: cached value unavailable");
                return Ok(true);
            }
        }

        if node.trigger == Trigger::Missing {
            return Ok(false);
        }

        if matches!(node.trigger, Trigger::Any | Trigger::Command) {
            let command = node.command.as_ref().expect("target has a command");
            if self.hashers.command_hash(command) != meta.command_hash {
                debug!(node = %name, "outdated: command changed");
                return Ok(true);
            }
        }

        if matches!(node.trigger, Trigger::Any | Trigger::Depends) {
            match self.current_depends_hash(id)? {
                Some(current) if current == meta.depends_hash => {}
                _ => {
                    debug!(node = %name, "outdated: dependencies changed");
                    return Ok(true);
                }
            }
        }

        if matches!(node.trigger, Trigger::Any | Trigger::FileChange) {
            if let Some(depset) = self.depsets.get(&id) {
                for path in &depset.writes {
                    let recorded = meta.output_files.get(path);
                    let current = self.fingerprint(path)?;
                    let same = matches!(
                        (recorded, &current),
                        (Some(a), Some(b)) if a.same_as(b)
                    );
                    if !same {
                        debug!(node = %name, file = %path, "outdated: output file changed");
                        return Ok(true);
                    }
                }
            }
        }

        Ok(false)
    }

    /// Predict the full set of nodes that will rebuild this run: a target
    /// is outdated if its own checks fail or any dependency is outdated;
    /// output files rebuild with their producer.  Computed in topological
    /// order so each node sees its dependencies' verdicts.
    pub fn outdated_set(&self) -> EngineResult<HashSet<NodeId>> {
        let mut outdated = HashSet::new();
        for layer in self.graph.layers() {
            for id in layer {
                let node = self.graph.node(id);
                let dep_outdated = node.deps.iter().any(|dep| outdated.contains(dep));
                let is_out = match node.kind {
                    NodeKind::Target => dep_outdated || self.is_outdated(id)?,
                    NodeKind::OutputFile => dep_outdated,
                    _ => false,
                };
                if is_out {
                    outdated.insert(id);
                }
            }
        }
        Ok(outdated)
    }

    /// Record-keeping for a finished build: fingerprints of the declared
    /// output files, for the FileChange rules next run.
    pub fn output_fingerprints(
        &self,
        id: NodeId,
    ) -> EngineResult<std::collections::BTreeMap<String, FileSig>> {
        let mut out = std::collections::BTreeMap::new();
        if let Some(depset) = self.depsets.get(&id) {
            for path in &depset.writes {
                if let Some(sig) = self.fingerprint(path)? {
                    out.insert(path.clone(), sig);
                }
            }
        }
        Ok(out)
    }

    /// The value a built dependency contributes to an eval scope.
    pub fn load_value(&self, id: NodeId) -> EngineResult<Option<Value>> {
        let node = self.graph.node(id);
        let meta = match self.store.get_meta(&node.name)? {
            Some(meta) => meta,
            None => return Ok(None),
        };
        match meta.value_hash {
            Some(hash) => self.store.get_object(&hash),
            None => Ok(None),
        }
    }
}
