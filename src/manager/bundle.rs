//! Code bundles served to workers and components

use std::collections::{BTreeMap, HashSet};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// A named archive of files with its dependencies
#[derive(Debug, Clone)]
pub struct Bundle {
    pub name: String,
    pub payload: Bytes,
    pub files: Vec<String>,
    pub modules: Vec<String>,
    pub dependencies: Vec<String>,
    checksum: String,
}

impl Bundle {
    pub fn new(name: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        let payload = payload.into();
        let checksum = hex::encode(Sha256::digest(&payload));
        Self {
            name: name.into(),
            payload,
            files: Vec::new(),
            modules: Vec::new(),
            dependencies: Vec::new(),
            checksum,
        }
    }

    pub fn file(mut self, path: impl Into<String>) -> Self {
        self.files.push(path.into());
        self
    }

    pub fn module(mut self, module: impl Into<String>) -> Self {
        self.modules.push(module.into());
        self
    }

    pub fn depends_on(mut self, bundle: impl Into<String>) -> Self {
        self.dependencies.push(bundle.into());
        self
    }

    /// Hex SHA-256 of the payload
    pub fn checksum(&self) -> &str {
        &self.checksum
    }
}

#[derive(Debug, Default)]
pub struct BundleRegistry {
    bundles: BTreeMap<String, Bundle>,
}

impl BundleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, bundle: Bundle) {
        tracing::debug!(bundle = %bundle.name, checksum = %bundle.checksum, "Registered bundle");
        self.bundles.insert(bundle.name.clone(), bundle);
    }

    pub fn len(&self) -> usize {
        self.bundles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bundles.is_empty()
    }

    fn lookup(
        &self,
        bundle_name: Option<&str>,
        file_name: Option<&str>,
        module_name: Option<&str>,
    ) -> Result<&Bundle> {
        if let Some(name) = bundle_name {
            return self
                .bundles
                .get(name)
                .ok_or_else(|| Error::NoBundle(name.to_string()));
        }
        if let Some(file) = file_name {
            return self
                .bundles
                .values()
                .find(|b| b.files.iter().any(|f| f == file))
                .ok_or_else(|| Error::NoBundle(format!("no bundle holds file {}", file)));
        }
        if let Some(module) = module_name {
            return self
                .bundles
                .values()
                .find(|b| b.modules.iter().any(|m| m == module))
                .ok_or_else(|| Error::NoBundle(format!("no bundle holds module {}", module)));
        }
        Err(Error::NoBundle("no bundle, file or module named".to_string()))
    }

    /// `(name, checksum)` of a bundle and everything it depends on,
    /// dependencies first
    pub fn sums(
        &self,
        bundle_name: Option<&str>,
        file_name: Option<&str>,
        module_name: Option<&str>,
    ) -> Result<Vec<(String, String)>> {
        let root = self.lookup(bundle_name, file_name, module_name)?;
        let mut seen = HashSet::new();
        let mut order = Vec::new();
        self.visit(root, &mut seen, &mut order)?;
        Ok(order
            .into_iter()
            .map(|b| (b.name.clone(), b.checksum.clone()))
            .collect())
    }

    fn visit<'a>(
        &'a self,
        bundle: &'a Bundle,
        seen: &mut HashSet<&'a str>,
        order: &mut Vec<&'a Bundle>,
    ) -> Result<()> {
        if !seen.insert(bundle.name.as_str()) {
            return Ok(());
        }
        for dep in &bundle.dependencies {
            let dep = self
                .bundles
                .get(dep)
                .ok_or_else(|| Error::NoBundle(dep.clone()))?;
            self.visit(dep, seen, order)?;
        }
        order.push(bundle);
        Ok(())
    }

    /// Base64 payloads of the named bundles
    pub fn zips(&self, names: &[String]) -> Result<BTreeMap<String, String>> {
        names
            .iter()
            .map(|name| {
                let bundle = self
                    .bundles
                    .get(name)
                    .ok_or_else(|| Error::NoBundle(name.clone()))?;
                Ok((name.clone(), STANDARD.encode(&bundle.payload)))
            })
            .collect()
    }
}
