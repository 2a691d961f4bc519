/*!
 * Declarative Config Store
 * Netplan documents on disk: read, merge, conflict checks and guarded writes
 */

use serde::Serialize;
use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

use super::apply::{ApplyPath, NetplanApplier};
use super::{ConstructDefinition, DeviceKind, NetplanDocument};
use crate::error::{ApplyPhase, ConstructError, StoreError};
use crate::exec::CommandExecutor;

const DOCUMENT_MODE: u32 = 0o600;
const HEADER: &str = "# Managed by netweaved\n";

#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub directory: PathBuf,
    pub vendor_prefix: String,
    pub renderer: Option<String>,
    pub try_timeout: Duration,
    pub try_grace: Duration,
}

/// A document as it was read, kept so a later write can detect outside edits
#[derive(Debug, Clone)]
pub struct DocumentSnapshot {
    pub path: PathBuf,
    /// `None` when the file did not exist
    pub raw: Option<String>,
    pub document: NetplanDocument,
}

impl DocumentSnapshot {
    pub fn exists(&self) -> bool {
        self.raw.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OwnedDefinition {
    pub path: PathBuf,
    pub vendor_managed: bool,
    #[serde(flatten)]
    pub definition: ConstructDefinition,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictInfo {
    pub name: String,
    pub path: PathBuf,
    pub existing: DeviceKind,
    pub intended: DeviceKind,
    pub vendor_managed: bool,
}

impl ConflictInfo {
    fn into_error(self) -> ConstructError {
        ConstructError::Conflict {
            message: format!(
                "{} is already declared as {} in {}, which is not managed by netweave",
                self.name,
                self.existing,
                self.path.display()
            ),
            path: Some(self.path),
            existing: Some(self.existing),
        }
    }
}

pub struct ConfigStore {
    settings: StoreSettings,
    applier: NetplanApplier,
}

impl ConfigStore {
    pub fn new(settings: StoreSettings, executor: Arc<dyn CommandExecutor>) -> Self {
        let applier = NetplanApplier::new(executor, settings.try_timeout, settings.try_grace);
        Self { settings, applier }
    }

    pub fn is_vendor_managed(&self, path: &Path) -> bool {
        let prefix = format!("{}-", self.settings.vendor_prefix);
        path.file_name()
            .and_then(|name| name.to_str())
            .map(|name| name.starts_with(&prefix))
            .unwrap_or(false)
    }

    fn managed_path(&self, stem: &str) -> PathBuf {
        self.settings
            .directory
            .join(format!("{}-{}.yaml", self.settings.vendor_prefix, stem))
    }

    /// `<prefix>-vlan<id>.yaml`, or `<prefix>-<link>-vlan<id>.yaml` when the
    /// short name already holds a different VLAN.
    pub async fn vlan_document_path(
        &self,
        name: &str,
        link: &str,
        id: u16,
    ) -> Result<PathBuf, StoreError> {
        let preferred = self.managed_path(&format!("vlan{id}"));
        let snapshot = self.load(&preferred).await?;
        let network = &snapshot.document.network;
        if !snapshot.exists() || network.contains(name) || network.is_placeholder_only() {
            return Ok(preferred);
        }
        Ok(self.managed_path(&format!("{link}-vlan{id}")))
    }

    pub fn construct_document_path(&self, name: &str) -> PathBuf {
        self.managed_path(name)
    }

    pub fn override_document_path(&self, name: &str) -> PathBuf {
        self.managed_path(&format!("override-{name}"))
    }

    /// Every `*.yaml` / `*.yml` in the directory, sorted the way netplan merges them
    pub async fn list_documents(&self) -> Result<Vec<PathBuf>, StoreError> {
        let directory = &self.settings.directory;
        let mut entries = match tokio::fs::read_dir(directory).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(directory, e)),
        };

        let mut documents = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::io(directory, e))?
        {
            let path = entry.path();
            let is_yaml = matches!(
                path.extension().and_then(|ext| ext.to_str()),
                Some("yaml") | Some("yml")
            );
            let is_file = entry
                .file_type()
                .await
                .map(|kind| kind.is_file())
                .unwrap_or(false);
            if is_yaml && is_file {
                documents.push(path);
            }
        }
        documents.sort();
        Ok(documents)
    }

    pub async fn load(&self, path: &Path) -> Result<DocumentSnapshot, StoreError> {
        let raw = match tokio::fs::read_to_string(path).await {
            Ok(raw) => Some(raw),
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => return Err(StoreError::io(path, e)),
        };

        let document = match raw.as_deref() {
            None => NetplanDocument::new(self.settings.renderer.clone()),
            Some(text) if is_blank_yaml(text) => NetplanDocument::default(),
            Some(text) => serde_yaml::from_str(text).map_err(|source| StoreError::Parse {
                path: path.to_path_buf(),
                source,
            })?,
        };

        Ok(DocumentSnapshot {
            path: path.to_path_buf(),
            raw,
            document,
        })
    }

    pub async fn read_definitions(&self, path: &Path) -> Result<Vec<ConstructDefinition>, StoreError> {
        Ok(self.load(path).await?.document.network.definitions())
    }

    /// Every definition across every document, with its owner
    pub async fn merged_definitions(&self) -> Result<Vec<OwnedDefinition>, StoreError> {
        let mut merged = Vec::new();
        for path in self.list_documents().await? {
            let vendor_managed = self.is_vendor_managed(&path);
            for definition in self.read_definitions(&path).await? {
                merged.push(OwnedDefinition {
                    path: path.clone(),
                    vendor_managed,
                    definition,
                });
            }
        }
        Ok(merged)
    }

    pub async fn owners_of(&self, name: &str) -> Result<Vec<OwnedDefinition>, StoreError> {
        Ok(self
            .merged_definitions()
            .await?
            .into_iter()
            .filter(|owned| owned.definition.name == name)
            .collect())
    }

    /// Definitions of `name` under any kind other than `intended`
    pub async fn detect_conflicts(
        &self,
        name: &str,
        intended: DeviceKind,
    ) -> Result<Vec<ConflictInfo>, StoreError> {
        Ok(self
            .owners_of(name)
            .await?
            .into_iter()
            .filter(|owned| owned.definition.kind() != intended)
            .map(|owned| ConflictInfo {
                name: name.to_string(),
                existing: owned.definition.kind(),
                intended,
                vendor_managed: owned.vendor_managed,
                path: owned.path,
            })
            .collect())
    }

    /// The conflict a caller must act on first: foreign owners before our own
    pub async fn detect_conflict(
        &self,
        name: &str,
        intended: DeviceKind,
    ) -> Result<Option<ConflictInfo>, StoreError> {
        let mut conflicts = self.detect_conflicts(name, intended).await?;
        conflicts.sort_by_key(|conflict| conflict.vendor_managed);
        Ok(conflicts.into_iter().next())
    }

    /// Fails with a conflict naming the file and kind when a foreign document
    /// declares `name` differently. Nothing on disk changes in that case.
    pub async fn ensure_resolvable(&self, name: &str, intended: DeviceKind) -> crate::error::Result<Vec<ConflictInfo>> {
        let conflicts = self.detect_conflicts(name, intended).await?;
        if let Some(foreign) = conflicts.iter().find(|conflict| !conflict.vendor_managed) {
            return Err(foreign.clone().into_error());
        }
        Ok(conflicts)
    }

    /// Drop conflicting definitions from our own documents, deleting any
    /// document left with nothing but placeholders. Returns the pre-images
    /// so the caller can put them back if the operation fails later.
    pub async fn resolve_conflicts(
        &self,
        name: &str,
        intended: DeviceKind,
    ) -> crate::error::Result<Vec<DocumentSnapshot>> {
        let conflicts = self.ensure_resolvable(name, intended).await?;

        let mut paths: Vec<PathBuf> = conflicts.into_iter().map(|conflict| conflict.path).collect();
        paths.dedup();

        let mut touched = Vec::new();
        for path in paths {
            let snapshot = self.load(&path).await?;
            let mut document = snapshot.document.clone();
            let removed = document.network.remove(name);
            tracing::info!(
                "Resolving conflict: dropping {} ({:?}) from {}",
                name,
                removed,
                path.display()
            );
            if document.network.is_placeholder_only() {
                self.remove(&snapshot).await?;
            } else {
                self.write(&snapshot, &document).await?;
            }
            touched.push(snapshot);
        }
        Ok(touched)
    }

    /// Replace the whole document. Fails with `Modified` if the file changed
    /// since `snapshot` was taken.
    pub async fn write(
        &self,
        snapshot: &DocumentSnapshot,
        document: &NetplanDocument,
    ) -> Result<(), StoreError> {
        let rendered = format!("{HEADER}{}", serde_yaml::to_string(document)?);
        self.ensure_unchanged(snapshot).await?;
        write_atomic(&snapshot.path, &rendered).await?;
        tracing::debug!("Wrote {}", snapshot.path.display());
        Ok(())
    }

    pub async fn remove(&self, snapshot: &DocumentSnapshot) -> Result<(), StoreError> {
        self.ensure_unchanged(snapshot).await?;
        match tokio::fs::remove_file(&snapshot.path).await {
            Ok(()) => {
                tracing::debug!("Removed {}", snapshot.path.display());
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io(&snapshot.path, e)),
        }
    }

    /// Put a document back exactly as `snapshot` saw it
    pub async fn restore(&self, snapshot: &DocumentSnapshot) -> Result<(), StoreError> {
        match &snapshot.raw {
            Some(raw) => write_atomic(&snapshot.path, raw).await,
            None => match tokio::fs::remove_file(&snapshot.path).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
                Err(e) => Err(StoreError::io(&snapshot.path, e)),
            },
        }
    }

    pub async fn validate(&self) -> crate::error::Result<()> {
        self.applier.validate().await
    }

    pub async fn test_and_apply_observed<F>(
        &self,
        kind: DeviceKind,
        observe: F,
    ) -> crate::error::Result<ApplyPath>
    where
        F: FnMut(ApplyPhase) + Send,
    {
        self.applier.test_and_apply_observed(kind, observe).await
    }

    async fn ensure_unchanged(&self, snapshot: &DocumentSnapshot) -> Result<(), StoreError> {
        let current = match tokio::fs::read_to_string(&snapshot.path).await {
            Ok(raw) => Some(raw),
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => return Err(StoreError::io(&snapshot.path, e)),
        };
        if current != snapshot.raw {
            tracing::warn!("{} changed on disk since it was read", snapshot.path.display());
            return Err(StoreError::Modified {
                path: snapshot.path.clone(),
            });
        }
        Ok(())
    }
}

fn is_blank_yaml(text: &str) -> bool {
    text.lines()
        .map(str::trim)
        .all(|line| line.is_empty() || line.starts_with('#') || line == "---")
}

/// Temp file created 0600 next to the target, then renamed over it
async fn write_atomic(path: &Path, contents: &str) -> Result<(), StoreError> {
    let directory = path.parent().unwrap_or_else(|| Path::new("."));
    tokio::fs::create_dir_all(directory)
        .await
        .map_err(|e| StoreError::io(directory, e))?;

    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("netplan.yaml");
    let temp = directory.join(format!(".{file_name}.tmp"));

    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(DOCUMENT_MODE)
        .open(&temp)
        .await
        .map_err(|e| StoreError::io(&temp, e))?;
    file.write_all(contents.as_bytes())
        .await
        .map_err(|e| StoreError::io(&temp, e))?;
    file.sync_all().await.map_err(|e| StoreError::io(&temp, e))?;
    drop(file);

    tokio::fs::rename(&temp, path)
        .await
        .map_err(|e| StoreError::io(path, e))?;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(DOCUMENT_MODE))
        .await
        .map_err(|e| StoreError::io(path, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netplan::{Addressing, Topology};
    use crate::test_support::ScriptedExecutor;
    use pretty_assertions::assert_eq;

    const FOREIGN: &str = "\
network:
  version: 2
  ethernets:
    eth0:
      dhcp4: true
";

    fn store(directory: &Path) -> ConfigStore {
        ConfigStore::new(
            StoreSettings {
                directory: directory.to_path_buf(),
                vendor_prefix: "90-netweave".into(),
                renderer: Some("networkd".into()),
                try_timeout: Duration::from_secs(30),
                try_grace: Duration::from_secs(5),
            },
            Arc::new(ScriptedExecutor::new()),
        )
    }

    fn vlan(name: &str, link: &str, id: u16) -> ConstructDefinition {
        ConstructDefinition {
            name: name.into(),
            topology: Topology::Vlan {
                id,
                link: link.into(),
            },
            addressing: Addressing::default(),
        }
    }

    async fn write_vlan(store: &ConfigStore, path: &Path, definition: &ConstructDefinition) {
        let snapshot = store.load(path).await.unwrap();
        let mut document = snapshot.document.clone();
        document.network.insert(definition);
        store.write(&snapshot, &document).await.unwrap();
    }

    #[tokio::test]
    async fn lists_only_yaml_files_sorted() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("90-netweave-vlan5.yaml"), "").unwrap();
        std::fs::write(dir.path().join("01-netcfg.yml"), "").unwrap();
        std::fs::write(dir.path().join("README"), "").unwrap();
        std::fs::create_dir(dir.path().join("sub.yaml")).unwrap();

        let names: Vec<String> = store(dir.path())
            .list_documents()
            .await
            .unwrap()
            .iter()
            .map(|path| path.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["01-netcfg.yml", "90-netweave-vlan5.yaml"]);
    }

    #[tokio::test]
    async fn missing_directory_has_no_documents() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir.path().join("absent"));
        assert!(store.list_documents().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn writes_are_owner_only_and_readable() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let path = store.vlan_document_path("eth0.100", "eth0", 100).await.unwrap();
        assert_eq!(path, dir.path().join("90-netweave-vlan100.yaml"));

        write_vlan(&store, &path, &vlan("eth0.100", "eth0", 100)).await;

        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
        assert_eq!(
            store.read_definitions(&path).await.unwrap(),
            vec![vlan("eth0.100", "eth0", 100)]
        );
        assert!(!dir.path().join(".90-netweave-vlan100.yaml.tmp").exists());
    }

    #[tokio::test]
    async fn outside_edit_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let path = dir.path().join("90-netweave-br0.yaml");
        let snapshot = store.load(&path).await.unwrap();

        std::fs::write(&path, FOREIGN).unwrap();

        let err = store.write(&snapshot, &snapshot.document).await.unwrap_err();
        assert!(matches!(err, StoreError::Modified { .. }));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), FOREIGN);
    }

    #[tokio::test]
    async fn second_vlan_with_same_id_gets_link_qualified_name() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let first = store.vlan_document_path("eth0.100", "eth0", 100).await.unwrap();
        write_vlan(&store, &first, &vlan("eth0.100", "eth0", 100)).await;

        let second = store.vlan_document_path("eth1.100", "eth1", 100).await.unwrap();
        assert_eq!(second, dir.path().join("90-netweave-eth1-vlan100.yaml"));
        assert_eq!(
            store.vlan_document_path("eth0.100", "eth0", 100).await.unwrap(),
            first
        );
    }

    #[tokio::test]
    async fn foreign_conflict_is_reported_and_nothing_changes() {
        let dir = tempfile::tempdir().unwrap();
        let foreign = dir.path().join("50-cloud-init.yaml");
        std::fs::write(&foreign, FOREIGN).unwrap();
        let store = store(dir.path());

        let conflict = store
            .detect_conflict("eth0", DeviceKind::Bridge)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(conflict.existing, DeviceKind::Ethernet);
        assert!(!conflict.vendor_managed);

        let err = store
            .resolve_conflicts("eth0", DeviceKind::Bridge)
            .await
            .unwrap_err();
        match err {
            ConstructError::Conflict { path, existing, .. } => {
                assert_eq!(path, Some(foreign.clone()));
                assert_eq!(existing, Some(DeviceKind::Ethernet));
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(std::fs::read_to_string(&foreign).unwrap(), FOREIGN);
        assert_eq!(store.list_documents().await.unwrap(), vec![foreign]);
    }

    #[tokio::test]
    async fn own_conflicting_document_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let path = store.construct_document_path("br5");
        write_vlan(&store, &path, &vlan("br5", "eth0", 5)).await;

        let touched = store.resolve_conflicts("br5", DeviceKind::Bridge).await.unwrap();
        assert_eq!(touched.len(), 1);
        assert!(!path.exists());

        store.restore(&touched[0]).await.unwrap();
        assert_eq!(store.read_definitions(&path).await.unwrap(), vec![vlan("br5", "eth0", 5)]);
    }

    #[tokio::test]
    async fn merged_definitions_mark_ownership() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("50-cloud-init.yaml"), FOREIGN).unwrap();
        let store = store(dir.path());
        let path = store.vlan_document_path("eth0.7", "eth0", 7).await.unwrap();
        write_vlan(&store, &path, &vlan("eth0.7", "eth0", 7)).await;

        let merged = store.merged_definitions().await.unwrap();
        let ownership: Vec<(String, bool)> = merged
            .iter()
            .map(|owned| (owned.definition.name.clone(), owned.vendor_managed))
            .collect();
        assert_eq!(
            ownership,
            vec![("eth0".to_string(), false), ("eth0.7".to_string(), true)]
        );
    }

    #[tokio::test]
    async fn unparseable_document_names_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let broken = dir.path().join("10-broken.yaml");
        std::fs::write(&broken, "network: [unclosed\n").unwrap();

        let err = store(dir.path()).merged_definitions().await.unwrap_err();
        assert!(matches!(err, StoreError::Parse { path, .. } if path == broken));
    }
}
