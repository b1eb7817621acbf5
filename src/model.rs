use std::collections::{BTreeMap, BTreeSet};

use log::{debug, info};
use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::emu::Emu;
use crate::error::{Error, Result};

/// Static description of a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelSpec {
    pub name: &'static str,
    /// Version of the events understood, as `major.minor.patch`.
    pub version: &'static str,
    /// Model byte of the events handled by this model.
    pub tag: u8,
    /// Models that must be connected before this one.
    pub depends: &'static [&'static str],
}

/// A subsystem plugin. Hooks are run in dependency order: `create` and
/// `connect` once before the replay, `event` for every event with the model
/// tag, and `finish` once at the end.
pub trait Model {
    fn spec(&self) -> ModelSpec;

    /// Decides if the model is needed for this trace. By default, the model
    /// is enabled when some process was traced with a compatible version of
    /// it.
    fn probe(&mut self, emu: &Emu) -> Result<bool> {
        version_probe(&self.spec(), emu)
    }

    fn create(&mut self, _emu: &mut Emu) -> Result<()> {
        Ok(())
    }

    fn connect(&mut self, _emu: &mut Emu) -> Result<()> {
        Ok(())
    }

    fn event(&mut self, emu: &mut Emu) -> Result<()>;

    fn finish(&mut self, _emu: &mut Emu) -> Result<()> {
        Ok(())
    }
}

fn parse_version(version: &str) -> Option<(u32, u32, u32)> {
    let mut parts = version.split('.').map(|p| p.parse::<u32>().ok());
    let major = parts.next()??;
    let minor = parts.next()??;
    let patch = parts.next()??;
    if parts.next().is_some() {
        return None;
    }
    Some((major, minor, patch))
}

/// A trace version is compatible with the model version if the major is the
/// same and the minor is not newer.
pub fn version_compatible(model: &str, trace: &str) -> Result<bool> {
    let m = parse_version(model)
        .ok_or_else(|| Error::config(format!("bad model version '{}'", model)))?;
    let t = parse_version(trace)
        .ok_or_else(|| Error::config(format!("bad trace model version '{}'", trace)))?;
    Ok(m.0 == t.0 && t.1 <= m.1)
}

/// Enables the model if any process lists it in its metadata, failing if
/// the versions are incompatible. Processes without a model list enable
/// every model.
pub fn version_probe(spec: &ModelSpec, emu: &Emu) -> Result<bool> {
    let mut enabled = false;
    for proc in &emu.system.procs {
        let Some(models) = &proc.models else {
            enabled = true;
            continue;
        };
        let Some(version) = models.get(spec.name) else {
            continue;
        };
        if !version_compatible(spec.version, version)? {
            return Err(Error::config(format!(
                "model {}: unsupported version {} in process {} (emulator has {})",
                spec.name, version, proc.pid, spec.version
            )));
        }
        enabled = true;
    }
    Ok(enabled)
}

/// The registered models and their dispatch order.
#[derive(Default)]
pub struct ModelSet {
    models: Vec<Box<dyn Model>>,
    specs: Vec<ModelSpec>,
    enabled: Vec<bool>,
    order: Vec<usize>,
    by_tag: BTreeMap<u8, Vec<usize>>,
}

impl ModelSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, model: Box<dyn Model>) -> Result<()> {
        let spec = model.spec();
        if let Some(old) = self
            .specs
            .iter()
            .find(|s| s.name == spec.name || s.tag == spec.tag)
        {
            return Err(Error::config(format!(
                "model {} ('{}') clashes with registered model {} ('{}')",
                spec.name, spec.tag as char, old.name, old.tag as char
            )));
        }
        parse_version(spec.version).ok_or_else(|| {
            Error::config(format!("model {}: bad version '{}'", spec.name, spec.version))
        })?;
        debug!("registering model {} ('{}')", spec.name, spec.tag as char);
        self.models.push(model);
        self.specs.push(spec);
        self.enabled.push(false);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    pub fn specs(&self) -> &[ModelSpec] {
        &self.specs
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.specs
            .iter()
            .zip(&self.enabled)
            .any(|(s, e)| s.name == name && *e)
    }

    /// Names of the models in dispatch order.
    pub fn order(&self) -> Vec<&'static str> {
        self.order.iter().map(|i| self.specs[*i].name).collect()
    }

    /// Orders the models so that every model comes after its dependencies.
    /// Among the models that are ready, the one registered first goes first.
    fn resolve(&mut self) -> Result<()> {
        let mut graph = DiGraph::<usize, ()>::new();
        let nodes: Vec<NodeIndex> = (0..self.specs.len()).map(|i| graph.add_node(i)).collect();
        for (i, spec) in self.specs.iter().enumerate() {
            for dep in spec.depends {
                let j = self
                    .specs
                    .iter()
                    .position(|s| s.name == *dep)
                    .ok_or_else(|| {
                        Error::config(format!(
                            "model {} depends on unknown model {}",
                            spec.name, dep
                        ))
                    })?;
                graph.add_edge(nodes[j], nodes[i], ());
            }
        }

        let mut indegree: Vec<usize> = nodes
            .iter()
            .map(|n| graph.neighbors_directed(*n, Direction::Incoming).count())
            .collect();
        let mut ready: BTreeSet<usize> = (0..nodes.len()).filter(|i| indegree[*i] == 0).collect();
        let mut order = Vec::new();
        while let Some(i) = ready.pop_first() {
            order.push(i);
            for next in graph.neighbors_directed(nodes[i], Direction::Outgoing) {
                let j = graph[next];
                indegree[j] -= 1;
                if indegree[j] == 0 {
                    ready.insert(j);
                }
            }
        }
        if order.len() != nodes.len() {
            return Err(Error::config("cyclic model dependencies"));
        }
        self.order = order;
        Ok(())
    }

    /// Runs the probe, create and connect hooks and builds the tag table.
    pub fn connect(&mut self, emu: &mut Emu) -> Result<()> {
        self.resolve()?;

        for &i in &self.order {
            self.enabled[i] = self.models[i].probe(emu)?;
            debug!("model {} enabled: {}", self.specs[i].name, self.enabled[i]);
        }

        for &i in &self.order {
            if !self.enabled[i] {
                continue;
            }
            for dep in self.specs[i].depends {
                if !self.is_enabled(dep) {
                    return Err(Error::config(format!(
                        "model {} requires model {}, which is not enabled",
                        self.specs[i].name, dep
                    )));
                }
            }
        }

        for &i in &self.order {
            if self.enabled[i] {
                self.models[i].create(emu)?;
            }
        }
        for &i in &self.order {
            if self.enabled[i] {
                self.models[i].connect(emu)?;
            }
        }

        self.by_tag.clear();
        for &i in &self.order {
            if self.enabled[i] {
                self.by_tag.entry(self.specs[i].tag).or_default().push(i);
            }
        }

        let enabled: Vec<_> = self
            .order
            .iter()
            .filter(|i| self.enabled[**i])
            .map(|i| self.specs[*i].name)
            .collect();
        info!("enabled models: {}", enabled.join(" "));
        Ok(())
    }

    /// Sends the current event to the models handling `tag`. Events of
    /// unknown models are ignored.
    pub fn event(&mut self, emu: &mut Emu, tag: u8) -> Result<()> {
        let Some(models) = self.by_tag.get(&tag) else {
            return Ok(());
        };
        for &i in models {
            self.models[i].event(emu)?;
        }
        Ok(())
    }

    pub fn finish(&mut self, emu: &mut Emu) -> Result<()> {
        for &i in &self.order {
            if self.enabled[i] {
                self.models[i].finish(emu)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Dummy(ModelSpec);

    impl Model for Dummy {
        fn spec(&self) -> ModelSpec {
            self.0
        }

        fn event(&mut self, _emu: &mut Emu) -> Result<()> {
            Ok(())
        }
    }

    fn dummy(name: &'static str, tag: u8, depends: &'static [&'static str]) -> Box<dyn Model> {
        Box::new(Dummy(ModelSpec {
            name,
            version: "1.0.0",
            tag,
            depends,
        }))
    }

    #[test]
    fn test_versions() {
        assert!(version_compatible("1.2.0", "1.0.3").unwrap());
        assert!(version_compatible("1.2.0", "1.2.9").unwrap());
        assert!(!version_compatible("1.2.0", "1.3.0").unwrap());
        assert!(!version_compatible("2.0.0", "1.0.0").unwrap());
        assert!(version_compatible("1.0", "1.0.0").is_err());
    }

    #[test]
    fn test_register() {
        let mut set = ModelSet::new();
        set.register(dummy("ovni", b'O', &[])).unwrap();
        assert!(set.register(dummy("ovni", b'X', &[])).is_err());
        assert!(set.register(dummy("other", b'O', &[])).is_err());
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_order() {
        let mut set = ModelSet::new();
        set.register(dummy("c", b'C', &["b"])).unwrap();
        set.register(dummy("b", b'B', &["a"])).unwrap();
        set.register(dummy("d", b'D', &[])).unwrap();
        set.register(dummy("a", b'A', &[])).unwrap();
        set.resolve().unwrap();
        assert_eq!(set.order(), vec!["d", "a", "b", "c"]);
    }

    #[test]
    fn test_bad_dependencies() {
        let mut set = ModelSet::new();
        set.register(dummy("a", b'A', &["missing"])).unwrap();
        assert!(set.resolve().is_err());

        let mut set = ModelSet::new();
        set.register(dummy("a", b'A', &["b"])).unwrap();
        set.register(dummy("b", b'B', &["a"])).unwrap();
        assert!(set.resolve().is_err());
    }
}
