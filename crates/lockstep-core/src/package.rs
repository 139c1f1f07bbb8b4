//! Package model.
//!
//! Wraps one manifest into a typed record and classifies every declared
//! dependency as either *in-set* (another package of this run, linked
//! locally) or *external* (installed from the registry).

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{LockstepError, Result};
use crate::manifest::{manifest_path, package_dir, Manifest, ManifestLoader};

/// Stable package identity, rendered as `owner/name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PackageId {
    pub owner: String,
    pub name: String,
}

impl PackageId {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for PackageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

impl FromStr for PackageId {
    type Err = LockstepError;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('/') {
            Some((owner, name))
                if !owner.is_empty() && !name.is_empty() && !name.contains('/') =>
            {
                Ok(Self::new(owner, name))
            }
            _ => Err(LockstepError::InvalidPackageId(s.to_string())),
        }
    }
}

impl TryFrom<String> for PackageId {
    type Error = LockstepError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<PackageId> for String {
    fn from(id: PackageId) -> Self {
        id.to_string()
    }
}

// Ordered by the `owner/name` rendering, not field by field.
impl Ord for PackageId {
    fn cmp(&self, other: &Self) -> Ordering {
        let lhs = self.owner.bytes().chain([b'/']).chain(self.name.bytes());
        let rhs = other.owner.bytes().chain([b'/']).chain(other.name.bytes());
        lhs.cmp(rhs)
    }
}

impl PartialOrd for PackageId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Which manifest map a dependency was declared in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyKind {
    Runtime,
    Development,
}

/// One declared dependency: version constraint plus kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub constraint: String,
    pub kind: DependencyKind,
}

/// Maps dependency keys to package identities for one run.
///
/// Identity renderings (`owner/name`) and published names are both
/// registered. An identity rendering wins over a published name when they
/// collide; between published names the first registered wins.
#[derive(Debug, Clone, Default)]
pub struct NameIndex {
    by_key: HashMap<String, PackageId>,
}

impl NameIndex {
    pub fn new<'a, I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (&'a PackageId, &'a str)>,
    {
        let entries: Vec<_> = entries.into_iter().collect();
        let mut by_key = HashMap::new();
        for (id, _) in &entries {
            by_key.insert(id.to_string(), (*id).clone());
        }
        for (id, published) in &entries {
            by_key
                .entry((*published).to_string())
                .or_insert_with(|| (*id).clone());
        }
        Self { by_key }
    }

    pub fn resolve(&self, key: &str) -> Option<&PackageId> {
        self.by_key.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.by_key.contains_key(key)
    }
}

/// One unit in the build set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Package {
    pub id: PackageId,
    /// Manifest `name`, falling back to the identity rendering.
    pub published_name: String,
    pub dir: PathBuf,
    pub version: Option<String>,
    /// Runtime and development maps merged; runtime wins on key collision.
    pub declared: BTreeMap<String, Dependency>,
    /// Declared keys that resolve to another package of this run.
    pub in_set: BTreeMap<String, PackageId>,
    /// Declared keys that must come from the registry.
    pub external: BTreeMap<String, Dependency>,
    pub build_capable: bool,
    /// Explicit distributable surface; `None` means the whole tree.
    pub output_files: Option<Vec<String>>,
    /// In-set packages that declare this one. Filled by [`populate_dependents`].
    pub dependents: BTreeSet<PackageId>,
}

impl Package {
    /// Classify a loaded manifest against the run's name index.
    pub fn classify(
        id: PackageId,
        dir: PathBuf,
        manifest: Manifest,
        index: &NameIndex,
        build_script: &str,
    ) -> Self {
        let build_capable = manifest.has_script(build_script);
        let mut declared = BTreeMap::new();
        for (key, constraint) in manifest.dev_dependencies {
            declared.insert(
                key,
                Dependency {
                    constraint,
                    kind: DependencyKind::Development,
                },
            );
        }
        for (key, constraint) in manifest.dependencies {
            declared.insert(
                key,
                Dependency {
                    constraint,
                    kind: DependencyKind::Runtime,
                },
            );
        }

        let mut in_set = BTreeMap::new();
        let mut external = BTreeMap::new();
        for (key, dep) in &declared {
            match index.resolve(key) {
                Some(target) => {
                    in_set.insert(key.clone(), target.clone());
                }
                None => {
                    external.insert(key.clone(), dep.clone());
                }
            }
        }

        let published_name = manifest.name.unwrap_or_else(|| id.to_string());

        Self {
            id,
            published_name,
            dir,
            version: manifest.version,
            declared,
            in_set,
            external,
            build_capable,
            output_files: manifest.files,
            dependents: BTreeSet::new(),
        }
    }

    /// Kind under which an in-set or external key was declared.
    pub fn kind_of(&self, key: &str) -> Option<DependencyKind> {
        self.declared.get(key).map(|d| d.kind)
    }

    /// External dependencies of one kind.
    pub fn external_of_kind(
        &self,
        kind: DependencyKind,
    ) -> impl Iterator<Item = (&String, &Dependency)> {
        self.external.iter().filter(move |(_, d)| d.kind == kind)
    }

    /// In-set dependencies of one kind, as `(key, identity)`.
    pub fn in_set_of_kind(
        &self,
        kind: DependencyKind,
    ) -> impl Iterator<Item = (&String, &PackageId)> + '_ {
        self.in_set
            .iter()
            .filter(move |(key, _)| self.kind_of(key) == Some(kind))
    }

    /// The key this package used to declare `dependency`, if it does.
    pub fn key_for(&self, dependency: &PackageId) -> Option<&str> {
        self.in_set
            .iter()
            .find(|(_, id)| *id == dependency)
            .map(|(key, _)| key.as_str())
    }

    pub fn in_set_ids(&self) -> BTreeSet<PackageId> {
        self.in_set.values().cloned().collect()
    }
}

/// Fill every package's `dependents` as the inverse of `in_set`.
pub fn populate_dependents(packages: &mut [Package]) {
    let mut inverse: HashMap<PackageId, BTreeSet<PackageId>> = HashMap::new();
    for pkg in packages.iter() {
        for target in pkg.in_set.values() {
            inverse
                .entry(target.clone())
                .or_default()
                .insert(pkg.id.clone());
        }
    }
    for pkg in packages.iter_mut() {
        pkg.dependents = inverse.remove(&pkg.id).unwrap_or_default();
    }
}

/// Load and classify every package of a run.
///
/// All manifests are read first, since published names are only known
/// once every manifest is available. Any manifest error aborts the load.
pub fn load_packages(
    root: &Path,
    ids: &[PackageId],
    loader: &dyn ManifestLoader,
    build_script: &str,
) -> Result<Vec<Package>> {
    let mut seen = HashSet::new();
    for id in ids {
        if !seen.insert(id) {
            return Err(LockstepError::DuplicatePackage(id.to_string()));
        }
    }

    let mut manifests = Vec::with_capacity(ids.len());
    for id in ids {
        let path = manifest_path(root, id);
        debug!(package = %id, path = %path.display(), "Loading manifest");
        manifests.push(loader.load(&path)?);
    }

    let published: Vec<String> = ids
        .iter()
        .zip(&manifests)
        .map(|(id, m)| m.name.clone().unwrap_or_else(|| id.to_string()))
        .collect();
    let index = NameIndex::new(ids.iter().zip(published.iter().map(String::as_str)));

    let mut packages: Vec<Package> = ids
        .iter()
        .cloned()
        .zip(manifests)
        .map(|(id, manifest)| {
            let dir = package_dir(root, &id);
            Package::classify(id, dir, manifest, &index, build_script)
        })
        .collect();

    populate_dependents(&mut packages);
    Ok(packages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::MANIFEST_FILE;

    fn id(s: &str) -> PackageId {
        s.parse().unwrap()
    }

    fn manifest(name: &str, deps: &[(&str, &str)], dev: &[(&str, &str)]) -> Manifest {
        Manifest {
            name: Some(name.to_string()),
            dependencies: deps
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            dev_dependencies: dev
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..Manifest::default()
        }
    }

    #[test]
    fn test_package_id_parse_and_display() {
        let pid = id("fusionjs/fusion-core");
        assert_eq!(pid.owner, "fusionjs");
        assert_eq!(pid.name, "fusion-core");
        assert_eq!(pid.to_string(), "fusionjs/fusion-core");
    }

    #[test]
    fn test_package_id_rejects_malformed() {
        for bad in ["", "noslash", "/name", "owner/", "a/b/c"] {
            assert!(bad.parse::<PackageId>().is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn test_package_id_orders_by_rendering() {
        // '-' sorts before '/', so "a-b/c" < "a/z" as strings.
        assert!(id("a-b/c") < id("a/z"));
        assert!(id("org/a") < id("org/b"));
    }

    #[test]
    fn test_package_id_serde_as_string() {
        let json = serde_json::to_string(&id("org/a")).unwrap();
        assert_eq!(json, "\"org/a\"");
        let back: PackageId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id("org/a"));
    }

    #[test]
    fn test_classify_partitions_declared() {
        let a = id("pub/a");
        let b = id("pub/b");
        let index = NameIndex::new([(&a, "a"), (&b, "b")]);
        let pkg = Package::classify(
            b.clone(),
            PathBuf::from("packages/pub/b"),
            manifest("b", &[("a", "^1.0.0"), ("koa", "^2.0.0")], &[("jest", "^23")]),
            &index,
            "transpile",
        );

        assert_eq!(pkg.declared.len(), 3);
        assert_eq!(pkg.in_set.get("a"), Some(&a));
        assert!(pkg.external.contains_key("koa"));
        assert!(pkg.external.contains_key("jest"));
        let in_set: BTreeSet<_> = pkg.in_set.keys().collect();
        let external: BTreeSet<_> = pkg.external.keys().collect();
        assert!(in_set.is_disjoint(&external));
        assert_eq!(in_set.len() + external.len(), pkg.declared.len());
    }

    #[test]
    fn test_runtime_overrides_dev_on_collision() {
        let index = NameIndex::default();
        let pkg = Package::classify(
            id("org/x"),
            PathBuf::from("x"),
            manifest("x", &[("lodash", "^4.0.0")], &[("lodash", "^3.0.0")]),
            &index,
            "transpile",
        );
        let dep = &pkg.declared["lodash"];
        assert_eq!(dep.kind, DependencyKind::Runtime);
        assert_eq!(dep.constraint, "^4.0.0");
    }

    #[test]
    fn test_in_set_takes_precedence_over_registry_name() {
        // "react" is also a registry package, but a run member publishes it.
        let r = id("facebook/react");
        let index = NameIndex::new([(&r, "react")]);
        let pkg = Package::classify(
            id("org/app"),
            PathBuf::from("app"),
            manifest("app", &[("react", "^16.0.0")], &[]),
            &index,
            "transpile",
        );
        assert_eq!(pkg.in_set.get("react"), Some(&r));
        assert!(pkg.external.is_empty());
    }

    #[test]
    fn test_identity_rendering_resolves() {
        let a = id("pub/a");
        let index = NameIndex::new([(&a, "something-else")]);
        assert_eq!(index.resolve("pub/a"), Some(&a));
        assert_eq!(index.resolve("something-else"), Some(&a));
        assert!(!index.contains("a"));
    }

    #[test]
    fn test_build_capability_from_script() {
        let index = NameIndex::default();
        let mut m = manifest("x", &[], &[]);
        m.scripts
            .insert("transpile".to_string(), "babel src".to_string());
        let pkg = Package::classify(id("o/x"), PathBuf::from("x"), m, &index, "transpile");
        assert!(pkg.build_capable);

        let pkg = Package::classify(
            id("o/y"),
            PathBuf::from("y"),
            manifest("y", &[], &[]),
            &index,
            "transpile",
        );
        assert!(!pkg.build_capable);
    }

    #[test]
    fn test_build_capability_alongside_dependencies() {
        let index = NameIndex::default();
        let mut m = manifest("z", &[("koa", "^2.0.0")], &[("jest", "^23.0.0")]);
        m.scripts
            .insert("transpile".to_string(), "babel src".to_string());
        let pkg = Package::classify(id("o/z"), PathBuf::from("z"), m, &index, "transpile");
        assert!(pkg.build_capable);
        assert_eq!(pkg.external.len(), 2);
        assert_eq!(pkg.kind_of("jest"), Some(DependencyKind::Development));
    }

    #[test]
    fn test_published_name_falls_back_to_identity() {
        let index = NameIndex::default();
        let pkg = Package::classify(
            id("o/x"),
            PathBuf::from("x"),
            Manifest::default(),
            &index,
            "transpile",
        );
        assert_eq!(pkg.published_name, "o/x");
    }

    #[test]
    fn test_dependents_is_inverse_of_in_set() {
        let a = id("pub/a");
        let b = id("pub/b");
        let c = id("pub/c");
        let index = NameIndex::new([(&a, "a"), (&b, "b"), (&c, "c")]);
        let mut packages = vec![
            Package::classify(a.clone(), "a".into(), manifest("a", &[], &[]), &index, "t"),
            Package::classify(b.clone(), "b".into(), manifest("b", &[("a", "1")], &[]), &index, "t"),
            Package::classify(
                c.clone(),
                "c".into(),
                manifest("c", &[("a", "1")], &[("b", "1")]),
                &index,
                "t",
            ),
        ];
        populate_dependents(&mut packages);

        for target in &packages {
            for candidate in &packages {
                let declares = candidate.in_set_ids().contains(&target.id);
                assert_eq!(target.dependents.contains(&candidate.id), declares);
            }
        }
        assert_eq!(packages[0].dependents, BTreeSet::from([b.clone(), c.clone()]));
        assert_eq!(packages[1].dependents, BTreeSet::from([c]));
        assert!(packages[2].dependents.is_empty());
    }

    #[test]
    fn test_load_packages_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        for (pid, body) in [
            ("pub/a", r#"{"name":"a","dependencies":{"nop":"^1.0.0"}}"#),
            ("pub/b", r#"{"name":"b","dependencies":{"a":"^1.0.0"}}"#),
        ] {
            let pkg_dir = root.join(pid);
            std::fs::create_dir_all(&pkg_dir).unwrap();
            std::fs::write(pkg_dir.join(MANIFEST_FILE), body).unwrap();
        }

        let ids = vec![id("pub/a"), id("pub/b")];
        let packages =
            load_packages(root, &ids, &crate::manifest::FsManifestLoader, "transpile").unwrap();
        assert_eq!(packages.len(), 2);
        assert!(packages[0].dependents.contains(&id("pub/b")));
        assert_eq!(packages[1].in_set.get("a"), Some(&id("pub/a")));
        assert_eq!(packages[1].dir, root.join("pub").join("b"));
    }

    #[test]
    fn test_load_packages_rejects_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let ids = vec![id("pub/a"), id("pub/a")];
        let err = load_packages(dir.path(), &ids, &crate::manifest::FsManifestLoader, "t")
            .unwrap_err();
        assert!(matches!(err, LockstepError::DuplicatePackage(p) if p == "pub/a"));
    }

    #[test]
    fn test_load_packages_missing_manifest_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let ids = vec![id("pub/missing")];
        let err = load_packages(dir.path(), &ids, &crate::manifest::FsManifestLoader, "t")
            .unwrap_err();
        assert!(matches!(err, LockstepError::ManifestNotFound { .. }));
    }
}
