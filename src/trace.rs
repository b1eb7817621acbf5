use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::stream::Stream;
use crate::system::{CpuInfo, ProcInfo, SystemBuilder};

pub const METADATA_VERSION: u32 = 1;

/// Contents of `metadata.json`, one per process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub version: u32,
    pub app_id: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rank: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nranks: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpus: Option<Vec<CpuInfo>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub models: Option<BTreeMap<String, String>>,
}

impl Metadata {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        let meta: Metadata = serde_json::from_str(&text).map_err(|source| Error::Metadata {
            path: path.to_owned(),
            source,
        })?;
        if meta.version != METADATA_VERSION {
            return Err(Error::config(format!(
                "{:?}: unsupported metadata version {} (expected {})",
                path, meta.version, METADATA_VERSION
            )));
        }
        Ok(meta)
    }
}

/// The topology of a trace and one stream per thread, in thread order.
#[derive(Debug)]
pub struct Trace {
    pub builder: SystemBuilder,
    pub streams: Vec<Stream>,
}

/// Entries of `dir` named `<prefix><id><suffix>`, sorted by `key`.
fn list<K: Ord>(
    dir: &Path,
    prefix: &str,
    suffix: &str,
    key: impl Fn(&str) -> Option<K>,
) -> Result<Vec<(K, String, PathBuf)>> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir).map_err(|e| Error::io(dir, e))? {
        let entry = entry.map_err(|e| Error::io(dir, e))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some(id) = name
            .strip_prefix(prefix)
            .and_then(|rest| rest.strip_suffix(suffix))
        else {
            continue;
        };
        let Some(k) = key(id) else {
            debug!("skipping {:?}", entry.path());
            continue;
        };
        entries.push((k, name, entry.path()));
    }
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(entries)
}

impl Trace {
    /// Discovers `loom.*/proc.<pid>/thread.<tid>.obs` under `dir` and maps
    /// every stream.
    pub fn load<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        let mut builder = SystemBuilder::new();
        let mut paths = Vec::new();

        let looms = list(dir, "loom.", "", |host| {
            (!host.is_empty()).then(|| host.to_owned())
        })?;
        for (_, loom_name, loom_path) in looms {
            if !loom_path.is_dir() {
                continue;
            }
            let loom = builder.add_loom(&loom_name);
            let procs = list(&loom_path, "proc.", "", |pid| pid.parse::<i32>().ok())?;
            for (pid, proc_name, proc_path) in procs {
                let meta = Metadata::load(proc_path.join("metadata.json"))?;
                if let Some(cpus) = meta.cpus {
                    builder.set_cpus(loom, cpus)?;
                }
                let proc = builder.add_proc(
                    loom,
                    ProcInfo {
                        pid,
                        appid: meta.app_id,
                        rank: meta.rank,
                        nranks: meta.nranks,
                        models: meta.models,
                    },
                );
                let threads = list(&proc_path, "thread.", ".obs", |tid| tid.parse::<i32>().ok())?;
                for (tid, thread_name, thread_path) in threads {
                    let relpath = format!("{}/{}/{}", loom_name, proc_name, thread_name);
                    builder.add_thread(proc, tid, &relpath);
                    paths.push((thread_path, relpath));
                }
            }
        }

        if paths.is_empty() {
            return Err(Error::config(format!("no streams found in {:?}", dir)));
        }

        info!("mapping {} streams", paths.len());
        let streams = paths
            .par_iter()
            .map(|(path, relpath)| Stream::load(path, relpath))
            .collect::<Result<Vec<_>>>()?;

        Ok(Trace { builder, streams })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata() {
        let meta: Metadata = serde_json::from_str(
            r#"{"version": 1, "app_id": 3, "cpus": [{"index": 0, "phyid": 4}],
                "models": {"ovni": "1.0.0"}}"#,
        )
        .unwrap();
        assert_eq!(meta.app_id, 3);
        assert_eq!(meta.rank, None);
        assert_eq!(meta.cpus, Some(vec![CpuInfo { index: 0, phyid: 4 }]));
        assert_eq!(meta.models.unwrap()["ovni"], "1.0.0");
    }

    #[test]
    fn test_bad_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metadata.json");
        fs::write(&path, r#"{"version": 2, "app_id": 1}"#).unwrap();
        assert!(matches!(Metadata::load(&path), Err(Error::Config(_))));
        fs::write(&path, r#"{"version": 1"#).unwrap();
        assert!(matches!(Metadata::load(&path), Err(Error::Metadata { .. })));
    }
}
