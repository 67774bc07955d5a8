//! Declared-method table.
//!
//! The companion metadata is consumed as a JSON method table:
//!
//! ```json
//! { "methods": [ { "rva": 4096, "assembly": "Assembly-CSharp.dll",
//!                  "typeName": "Character.HumanBody", "name": "Update",
//!                  "parameters": [] } ] }
//! ```
//!
//! Methods without code (RVA 0) are dropped. Several methods can share one
//! RVA; they keep their declaration order.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::error::{Error, Result};
use crate::path::{MethodInfo, MethodList};

use serde::Deserialize;
use tracing::debug;

#[derive(Deserialize)]
struct MetadataDoc {
    #[serde(default)]
    methods: Vec<MethodInfo>,
}

/// RVA to declared methods, in RVA order.
#[derive(Clone, Debug, Default)]
pub struct MethodTable {
    by_rva: BTreeMap<u64, MethodList>,
    declared: usize,
}

impl MethodTable {
    /// Read and parse a metadata file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read(path).map_err(|source| Error::MetadataRead {
            path: path.to_path_buf(),
            source,
        })?;
        let doc: MetadataDoc =
            serde_json::from_slice(&text).map_err(|source| Error::MetadataParse {
                path: path.to_path_buf(),
                source,
            })?;

        let table = Self::from_methods(doc.methods);
        debug!(
            "loaded {} methods at {} addresses from {}",
            table.declared,
            table.len(),
            path.display()
        );
        Ok(table)
    }

    pub fn from_methods(methods: impl IntoIterator<Item = MethodInfo>) -> Self {
        let mut grouped: BTreeMap<u64, Vec<MethodInfo>> = BTreeMap::new();
        let mut declared = 0;

        for method in methods {
            if method.rva == 0 {
                continue;
            }
            declared += 1;
            grouped.entry(method.rva).or_default().push(method);
        }

        Self {
            by_rva: grouped
                .into_iter()
                .map(|(rva, list)| (rva, MethodList::from(list)))
                .collect(),
            declared,
        }
    }

    pub fn get(&self, rva: u64) -> Option<&MethodList> {
        self.by_rva.get(&rva)
    }

    pub fn contains(&self, rva: u64) -> bool {
        self.by_rva.contains_key(&rva)
    }

    /// Distinct method addresses.
    pub fn len(&self) -> usize {
        self.by_rva.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_rva.is_empty()
    }

    /// Methods with code, counting folded ones separately.
    pub fn declared(&self) -> usize {
        self.declared
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, &MethodList)> {
        self.by_rva.iter().map(|(rva, list)| (*rva, list))
    }

    /// RVA of the first method, in RVA order, the probe accepts.
    pub fn find(&self, probe: &MethodProbe) -> Option<u64> {
        self.by_rva
            .iter()
            .find(|(_, list)| list.iter().any(|m| probe.accepts(m)))
            .map(|(rva, _)| *rva)
    }
}

/// Locates an auxiliary method by its shape.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MethodProbe {
    /// Name the resolved RVA is stored under in the cache fields.
    pub key: String,
    pub type_suffix: String,
    pub method: String,
    pub param_count: Option<usize>,
    /// Required parameter name at a position.
    pub param_name: Option<(usize, String)>,
}

impl MethodProbe {
    /// The animation-key lookup whose address the host hooks after patching.
    pub fn get_info() -> Self {
        Self {
            key: "AnimationKeyInfo.Controller:GetInfo".to_string(),
            type_suffix: "AnimationKeyInfo.Controller".to_string(),
            method: "GetInfo".to_string(),
            param_count: Some(6),
            param_name: Some((1, "rate".to_string())),
        }
    }

    pub fn accepts(&self, method: &MethodInfo) -> bool {
        if !method.type_name.ends_with(&self.type_suffix) || method.name != self.method {
            return false;
        }
        if self
            .param_count
            .is_some_and(|count| method.parameters.len() != count)
        {
            return false;
        }
        match &self.param_name {
            Some((pos, name)) => method.parameters.get(*pos) == Some(name),
            None => true,
        }
    }
}
