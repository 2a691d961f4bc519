/*!
 * Construct Lifecycle Controller
 * Create, edit and delete of VLANs, bridges and bonds with guarded commits
 */

pub mod outcome;
pub mod request;
pub mod validate;

use ipnetwork::IpNetwork;
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::error::{ApplyPhase, ConstructError, Result, StoreError};
use crate::exec::{CommandExecutor, ExecOptions};
use crate::netplan::apply::{classify_failure, ApplyPath};
use crate::netplan::store::{ConfigStore, DocumentSnapshot, OwnedDefinition};
use crate::netplan::{Addressing, ConstructDefinition, DeviceKind, Topology};
use crate::network::criticality::{self, Confirmation, CriticalityAssessment};
use crate::network::dependencies;
use crate::network::inventory::Inventory;
use crate::network::{classify_name, normalize_name, vlan_parts, InterfaceKind, NetworkInterface};

pub use outcome::{LifecycleState, Operation, OperationOutcome, VerificationWarning};
use outcome::OperationTracker;
use request::{CreateRequest, DeleteRequest, EditRequest, LinkStateRequest};

#[derive(Debug, Clone)]
pub struct ControllerSettings {
    /// Live-state polls after a commit before giving up with a warning
    pub verify_attempts: u32,
    pub verify_interval: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            verify_attempts: 5,
            verify_interval: Duration::from_millis(500),
        }
    }
}

/// Serializes every mutation and drives it through the lifecycle.
///
/// Read operations never take the mutation lock.
pub struct ConstructController {
    store: ConfigStore,
    inventory: Arc<Inventory>,
    executor: Arc<dyn CommandExecutor>,
    settings: ControllerSettings,
    mutation: Mutex<()>,
}

/// Where an edit is written and what it starts from
struct EditTarget {
    path: PathBuf,
    base: ConstructDefinition,
    /// The device already lives in one of our documents
    owned: bool,
}

/// What live state should show once a commit has settled
struct Expectation<'a> {
    name: &'a str,
    link: Option<&'a str>,
    mtu: Option<u32>,
    address: Option<&'a str>,
}

impl ConstructController {
    pub fn new(
        store: ConfigStore,
        inventory: Arc<Inventory>,
        executor: Arc<dyn CommandExecutor>,
        settings: ControllerSettings,
    ) -> Self {
        Self {
            store,
            inventory,
            executor,
            settings,
            mutation: Mutex::new(()),
        }
    }

    pub fn inventory(&self) -> &Inventory {
        &self.inventory
    }

    pub async fn list_interfaces(&self) -> Vec<NetworkInterface> {
        self.inventory.list_interfaces().await
    }

    /// Candidate VLAN parents and bond/bridge members. Names we already
    /// declare as constructs are not offered even when they look physical.
    pub async fn physical_parents(&self) -> Result<Vec<String>> {
        let declared: HashSet<String> = self
            .list_constructs()
            .await?
            .into_iter()
            .map(|owned| owned.definition.name)
            .collect();
        Ok(self
            .inventory
            .list_physical_interfaces()
            .await
            .into_iter()
            .filter(|name| !declared.contains(name))
            .collect())
    }

    pub async fn list_constructs(&self) -> Result<Vec<OwnedDefinition>> {
        Ok(self
            .store
            .merged_definitions()
            .await?
            .into_iter()
            .filter(|owned| owned.definition.kind().is_construct())
            .collect())
    }

    pub async fn assess(&self, name: &str) -> Result<CriticalityAssessment> {
        let name = normalize_name(name);
        validate::interface_name(name)?;
        let iface = match self.inventory.find(name).await {
            Some(iface) => iface,
            None => self
                .store
                .owners_of(name)
                .await?
                .last()
                .map(|owned| NetworkInterface::from_definition(&owned.definition))
                .ok_or_else(|| not_found(name))?,
        };
        Ok(criticality::assess(&iface))
    }

    pub async fn create(&self, request: CreateRequest) -> Result<OperationOutcome> {
        let _guard = self.mutation.try_lock().map_err(|_| ConstructError::Busy)?;
        let mut tracker = OperationTracker::new(
            Operation::Create,
            request.name.clone().unwrap_or_default(),
        );
        let result = self.run_create(&mut tracker, &request).await;
        self.inventory.invalidate().await;
        tracker.conclude(result)
    }

    pub async fn edit(&self, request: EditRequest) -> Result<OperationOutcome> {
        let _guard = self.mutation.try_lock().map_err(|_| ConstructError::Busy)?;
        let mut tracker = OperationTracker::new(Operation::Edit, request.name.clone());
        let result = self.run_edit(&mut tracker, &request).await;
        self.inventory.invalidate().await;
        tracker.conclude(result)
    }

    pub async fn delete(&self, request: DeleteRequest) -> Result<OperationOutcome> {
        let _guard = self.mutation.try_lock().map_err(|_| ConstructError::Busy)?;
        let mut tracker = OperationTracker::new(Operation::Delete, request.name.clone());
        let result = self.run_delete(&mut tracker, &request).await;
        self.inventory.invalidate().await;
        tracker.conclude(result)
    }

    pub async fn set_link_state(&self, request: LinkStateRequest) -> Result<OperationOutcome> {
        let _guard = self.mutation.try_lock().map_err(|_| ConstructError::Busy)?;
        let mut tracker = OperationTracker::new(Operation::SetLinkState, request.name.clone());
        let result = self.run_link_state(&mut tracker, &request).await;
        self.inventory.invalidate().await;
        tracker.conclude(result)
    }

    async fn run_create(&self, tracker: &mut OperationTracker, request: &CreateRequest) -> Result<String> {
        tracker.enter(LifecycleState::Validating);
        let validate::ResolvedCreate { definition, notes } = validate::resolve_create(request)?;
        tracker.rename(&definition.name);
        for note in notes {
            tracker.note(note);
        }
        let name = definition.name.as_str();
        let kind = definition.kind();

        let merged = self.store.merged_definitions().await?;
        let live = self.inventory.refresh().await;
        check_lower_devices(&definition, &merged, &live)?;

        tracker.enter(LifecycleState::ConflictChecking);
        self.store.ensure_resolvable(name, kind).await?;
        if let Some(existing) = merged
            .iter()
            .find(|owned| owned.definition.name == name && owned.definition.kind() == kind)
        {
            return Err(ConstructError::Conflict {
                message: format!(
                    "{kind} {name} is already declared in {}",
                    existing.path.display()
                ),
                path: Some(existing.path.clone()),
                existing: Some(kind),
            });
        }
        if live.iter().any(|iface| iface.name == name) {
            return Err(ConstructError::conflict(format!(
                "{name} already exists on this host"
            )));
        }

        tracker.enter(LifecycleState::Writing);
        let mut snapshots = self.store.resolve_conflicts(name, kind).await?;
        match self.stage_create(&definition, &merged).await {
            Ok(snapshot) => {
                tracker.set_document(snapshot.path.clone());
                snapshots.push(snapshot);
            }
            Err(err) => {
                self.rollback(&snapshots).await;
                return Err(err);
            }
        }

        let apply_path = self.commit(tracker, kind, &snapshots).await?;
        tracker.set_apply_path(apply_path);

        tracker.enter(LifecycleState::Verifying);
        let expectation = Expectation {
            name,
            link: vlan_link(&definition.topology),
            mtu: definition.addressing.mtu,
            address: definition.addressing.addresses.first().map(String::as_str),
        };
        for warning in self.verify_present(&expectation).await {
            tracker.warn(warning);
        }

        Ok(format!("Created {kind} {name}, {}", apply_path.describe()))
    }

    /// Write the new construct's document. Physical lower devices nobody
    /// declares get a bare placeholder so netplan can resolve them.
    async fn stage_create(
        &self,
        definition: &ConstructDefinition,
        merged: &[OwnedDefinition],
    ) -> Result<DocumentSnapshot> {
        let path = match &definition.topology {
            Topology::Vlan { id, link } => {
                self.store
                    .vlan_document_path(&definition.name, link, *id)
                    .await?
            }
            _ => self.store.construct_document_path(&definition.name),
        };
        let snapshot = self.store.load(&path).await?;
        let mut document = snapshot.document.clone();
        document.network.insert(definition);
        for lower in definition.topology.lower_devices() {
            let declared = merged.iter().any(|owned| owned.definition.name == lower);
            if !declared && classify_name(&lower) == InterfaceKind::Physical {
                document.network.ensure_placeholder(&lower);
            }
        }
        self.store
            .write(&snapshot, &document)
            .await
            .map_err(write_failure)?;
        Ok(snapshot)
    }

    async fn run_edit(&self, tracker: &mut OperationTracker, request: &EditRequest) -> Result<String> {
        tracker.enter(LifecycleState::Validating);
        let name = normalize_name(&request.name).to_string();
        tracker.rename(&name);
        validate::interface_name(&name)?;
        if request.changes.is_empty() {
            return Err(ConstructError::validation(format!(
                "No changes requested for {name}"
            )));
        }

        let owners = self.store.owners_of(&name).await?;
        let live = self.inventory.find(&name).await;
        if owners.is_empty() && live.is_none() {
            return Err(not_found(&name));
        }
        let target = self.edit_target(&name, &owners, live.as_ref())?;
        let updated = validate::merge_changes(&target.base.addressing, &request.changes)?;
        let kind = target.base.kind();

        tracker.enter(LifecycleState::ConflictChecking);
        let kinds: BTreeSet<DeviceKind> = owners.iter().map(|owned| owned.definition.kind()).collect();
        if kinds.len() > 1 {
            let listed: Vec<String> = kinds.iter().map(ToString::to_string).collect();
            return Err(ConstructError::conflict(format!(
                "{name} is declared as more than one type ({}); fix the configuration by hand first",
                listed.join(", ")
            )));
        }

        tracker.enter(LifecycleState::CriticalGate);
        let address_changes =
            request.changes.address.is_some() && updated.addresses != target.base.addressing.addresses;
        let iface = live
            .clone()
            .unwrap_or_else(|| NetworkInterface::from_definition(&target.base));
        let expected = if address_changes {
            Confirmation::CHANGE_IP
        } else {
            Confirmation::EDIT_CRITICAL
        };
        criticality::require_confirmation(
            &criticality::assess(&iface),
            "edit",
            &expected,
            request.confirmation.as_deref(),
        )?;

        tracker.enter(LifecycleState::Writing);
        let snapshot = self.store.load(&target.path).await?;
        let mut document = snapshot.document.clone();
        match document.network.device_mut(&name) {
            Some(device) => device.set_addressing(&updated),
            None => document.network.insert(&ConstructDefinition {
                name: name.clone(),
                topology: target.base.topology.clone(),
                addressing: updated.clone(),
            }),
        }
        self.store
            .write(&snapshot, &document)
            .await
            .map_err(write_failure)?;
        tracker.set_document(target.path.clone());
        if !target.owned {
            tracker.note(format!(
                "{name} is declared outside netweave; the change was written to {}",
                target.path.display()
            ));
        }

        let apply_path = self
            .commit(tracker, kind, std::slice::from_ref(&snapshot))
            .await?;
        tracker.set_apply_path(apply_path);

        tracker.enter(LifecycleState::Verifying);
        let expectation = Expectation {
            name: &name,
            link: vlan_link(&target.base.topology),
            mtu: request.changes.mtu,
            address: if address_changes {
                updated.addresses.first().map(String::as_str)
            } else {
                None
            },
        };
        for warning in self.verify_present(&expectation).await {
            tracker.warn(warning);
        }

        Ok(format!("Updated {kind} {name}, {}", apply_path.describe()))
    }

    /// Our own document is rewritten in place. Anything declared elsewhere,
    /// or only present at runtime, gets an override document that restates
    /// the identifying fields.
    fn edit_target(
        &self,
        name: &str,
        owners: &[OwnedDefinition],
        live: Option<&NetworkInterface>,
    ) -> Result<EditTarget> {
        let override_path = self.store.override_document_path(name);

        if let Some(owned) = owners.iter().find(|owned| {
            owned.vendor_managed
                && owned.path != override_path
                && owned.definition.kind().is_construct()
        }) {
            return Ok(EditTarget {
                path: owned.path.clone(),
                base: owned.definition.clone(),
                owned: true,
            });
        }

        let current = owners
            .iter()
            .find(|owned| owned.path == override_path)
            .or_else(|| {
                owners
                    .iter()
                    .rev()
                    .find(|owned| owned.definition.addressing != Addressing::default())
            })
            .or_else(|| owners.last());
        if let Some(owned) = current {
            return Ok(EditTarget {
                path: override_path,
                base: owned.definition.clone(),
                owned: false,
            });
        }

        let Some(iface) = live else {
            return Err(not_found(name));
        };
        let topology = match iface.kind {
            InterfaceKind::Physical => Topology::Ethernet,
            InterfaceKind::Vlan => {
                let id = vlan_parts(name).map(|(_, id)| id);
                match (iface.parent.clone(), id) {
                    (Some(link), Some(id)) => Topology::Vlan { id, link },
                    _ => {
                        return Err(ConstructError::validation(format!(
                            "Cannot tell the parent and VLAN ID of runtime-only VLAN {name}"
                        )))
                    }
                }
            }
            InterfaceKind::Bridge | InterfaceKind::Bond => {
                return Err(ConstructError::validation(format!(
                    "{name} exists only at runtime; recreate it through netweave before editing it"
                )))
            }
        };
        Ok(EditTarget {
            path: override_path,
            base: ConstructDefinition {
                name: name.to_string(),
                topology,
                addressing: Addressing::default(),
            },
            owned: false,
        })
    }

    async fn run_delete(&self, tracker: &mut OperationTracker, request: &DeleteRequest) -> Result<String> {
        tracker.enter(LifecycleState::Validating);
        let name = normalize_name(&request.name).to_string();
        tracker.rename(&name);
        validate::interface_name(&name)?;

        let owners = self.store.owners_of(&name).await?;
        let lookup = self
            .inventory
            .try_refresh()
            .await
            .map(|interfaces| interfaces.into_iter().find(|iface| iface.name == name));
        if owners.is_empty() {
            match &lookup {
                Ok(None) => {
                    tracing::info!("{} is in neither configuration nor kernel state", name);
                    return Ok(format!("{name} already removed"));
                }
                Err(e) => {
                    return Err(ConstructError::Apply {
                        phase: ApplyPhase::Runtime,
                        message: format!("Could not check whether {name} exists: {e}"),
                        hint: Some("Check that `ip addr show` works for netweaved".to_string()),
                        rolled_back: true,
                    })
                }
                Ok(Some(_)) => {}
            }
        }
        // an unreadable kernel state still gets the dependency check below,
        // which records the failure and demands force
        let live = match lookup {
            Ok(live) => live,
            Err(e) => {
                tracing::warn!("Could not list interfaces before deleting {}: {}", name, e);
                None
            }
        };

        let kind = owners
            .iter()
            .map(|owned| owned.definition.kind())
            .find(|kind| kind.is_construct())
            .or_else(|| live.as_ref().and_then(|iface| construct_kind(iface.kind)))
            .ok_or_else(|| {
                ConstructError::validation(format!(
                    "{name} is a physical interface and cannot be deleted"
                ))
            })?;

        tracker.enter(LifecycleState::ConflictChecking);
        if let Some(foreign) = owners.iter().find(|owned| !owned.vendor_managed) {
            return Err(ConstructError::Conflict {
                message: format!(
                    "{name} is declared as {} in {}, which is not managed by netweave",
                    foreign.definition.kind(),
                    foreign.path.display()
                ),
                path: Some(foreign.path.clone()),
                existing: Some(foreign.definition.kind()),
            });
        }

        tracker.enter(LifecycleState::CriticalGate);
        let iface = live.clone().or_else(|| {
            owners
                .first()
                .map(|owned| NetworkInterface::from_definition(&owned.definition))
        });
        if let Some(iface) = &iface {
            criticality::require_confirmation(
                &criticality::assess(iface),
                "delete",
                &Confirmation::NameEcho(name.clone()),
                request.confirmation.as_deref(),
            )?;
        }
        if live.is_some() || !owners.is_empty() {
            let report = dependencies::probe(&self.inventory, &name).await;
            if report.requires_force() {
                if !request.force {
                    return Err(ConstructError::Dependency {
                        name: name.clone(),
                        details: report.details(),
                    });
                }
                tracker.note(format!(
                    "Deleted despite dependents: {}",
                    report.details().join("; ")
                ));
            }
        }

        if owners.is_empty() {
            tracker.enter(LifecycleState::Applying);
            self.delete_link(&name).await?;
            tracker.enter(LifecycleState::Verifying);
            for warning in self.verify_absent(&name).await {
                tracker.warn(warning);
            }
            return Ok(format!("Removed runtime-only {kind} {name}"));
        }

        tracker.enter(LifecycleState::Writing);
        let snapshots = self.remove_declarations(&name, &owners).await?;
        if let Some(first) = snapshots.first() {
            tracker.set_document(first.path.clone());
        }

        let apply_path = self.commit(tracker, kind, &snapshots).await?;
        tracker.set_apply_path(apply_path);

        // netplan apply does not tear down virtual devices it no longer manages
        if self.inventory.find(&name).await.is_some() {
            if let Err(e) = self.delete_link(&name).await {
                tracker.note(format!("Could not remove lingering device {name}: {e}"));
            }
        }

        tracker.enter(LifecycleState::Verifying);
        for warning in self.verify_absent(&name).await {
            tracker.warn(warning);
        }
        if let Some(warning) = self.verify_undeclared(&name).await {
            tracker.warn(warning);
        }

        Ok(format!("Deleted {kind} {name}, {}", apply_path.describe()))
    }

    /// Drop `name` from each of our documents that declares it. Placeholders
    /// still referenced by constructs in other documents are kept; a document
    /// left with nothing needed is removed.
    async fn remove_declarations(
        &self,
        name: &str,
        owners: &[OwnedDefinition],
    ) -> Result<Vec<DocumentSnapshot>> {
        let mut paths: Vec<PathBuf> = owners.iter().map(|owned| owned.path.clone()).collect();
        paths.sort();
        paths.dedup();

        let merged = self.store.merged_definitions().await?;
        let outside: Vec<&OwnedDefinition> = merged
            .iter()
            .filter(|owned| !paths.contains(&owned.path))
            .collect();
        let declared_outside: HashSet<&str> = outside
            .iter()
            .map(|owned| owned.definition.name.as_str())
            .collect();
        let needed: HashSet<String> = outside
            .iter()
            .flat_map(|owned| owned.definition.topology.lower_devices())
            .filter(|device| !declared_outside.contains(device.as_str()))
            .collect();

        let mut touched: Vec<DocumentSnapshot> = Vec::new();
        for path in paths {
            match self.drop_declaration(&path, name, &needed).await {
                Ok(snapshot) => touched.push(snapshot),
                Err(err) => {
                    self.rollback(&touched).await;
                    return Err(write_failure(err));
                }
            }
        }
        Ok(touched)
    }

    async fn drop_declaration(
        &self,
        path: &Path,
        name: &str,
        needed: &HashSet<String>,
    ) -> std::result::Result<DocumentSnapshot, StoreError> {
        let snapshot = self.store.load(path).await?;
        let mut document = snapshot.document.clone();
        document.network.remove(name);
        if document.network.is_placeholder_only() {
            document
                .network
                .ethernets
                .retain(|device, _| needed.contains(device));
            if document.network.ethernets.is_empty() {
                self.store.remove(&snapshot).await?;
                return Ok(snapshot);
            }
        }
        self.store.write(&snapshot, &document).await?;
        Ok(snapshot)
    }

    async fn run_link_state(
        &self,
        tracker: &mut OperationTracker,
        request: &LinkStateRequest,
    ) -> Result<String> {
        tracker.enter(LifecycleState::Validating);
        let name = normalize_name(&request.name).to_string();
        tracker.rename(&name);
        validate::interface_name(&name)?;
        let iface = self.inventory.find(&name).await.ok_or_else(|| {
            ConstructError::validation(format!("{name} is not present on this host"))
        })?;

        tracker.enter(LifecycleState::CriticalGate);
        if !request.up {
            criticality::require_confirmation(
                &criticality::assess(&iface),
                "bring down",
                &Confirmation::BRING_DOWN,
                request.confirmation.as_deref(),
            )?;
        }

        tracker.enter(LifecycleState::Applying);
        let state = if request.up { "up" } else { "down" };
        self.executor
            .execute(
                &["ip", "link", "set", "dev", name.as_str(), state],
                ExecOptions::elevated(),
            )
            .await
            .map_err(|e| ConstructError::Apply {
                phase: ApplyPhase::Runtime,
                message: format!("ip link set {name} {state} failed: {e}"),
                hint: classify_failure(&e.output_text()).map(str::to_string),
                rolled_back: true,
            })?;

        tracker.enter(LifecycleState::Verifying);
        let mut confirmed = false;
        for attempt in 0..self.settings.verify_attempts.max(1) {
            if attempt > 0 {
                tokio::time::sleep(self.settings.verify_interval).await;
            }
            if let Some(iface) = self.inventory.find(&name).await {
                if iface.is_admin_up() == request.up {
                    confirmed = true;
                    break;
                }
            }
        }
        if !confirmed {
            tracker.warn(VerificationWarning {
                message: format!("{name} did not report administratively {state} yet"),
                hint: Some(format!("Check `ip link show {name}`")),
            });
        }

        Ok(format!("{name} is now {state}"))
    }

    /// Validate, then trial/apply. Any failure puts the documents back and
    /// says whether the live system is known to be back in its prior state.
    async fn commit(
        &self,
        tracker: &mut OperationTracker,
        kind: DeviceKind,
        snapshots: &[DocumentSnapshot],
    ) -> Result<ApplyPath> {
        tracker.enter(LifecycleState::Testing);
        let result = match self.store.validate().await {
            Ok(()) => {
                self.store
                    .test_and_apply_observed(kind, |phase| {
                        if phase == ApplyPhase::Apply {
                            tracker.enter(LifecycleState::Applying);
                        }
                    })
                    .await
            }
            Err(err) => Err(err),
        };

        match result {
            Ok(path) => Ok(path),
            Err(err) => {
                let restored = self.rollback(snapshots).await;
                Err(annotate_rollback(err, restored))
            }
        }
    }

    /// Restore pre-images newest first. True when every one went back.
    async fn rollback(&self, snapshots: &[DocumentSnapshot]) -> bool {
        let mut restored = true;
        for snapshot in snapshots.iter().rev() {
            match self.store.restore(snapshot).await {
                Ok(()) => tracing::info!("Restored {}", snapshot.path.display()),
                Err(e) => {
                    tracing::error!("Could not restore {}: {}", snapshot.path.display(), e);
                    restored = false;
                }
            }
        }
        restored
    }

    async fn delete_link(&self, name: &str) -> Result<()> {
        self.executor
            .execute(&["ip", "link", "delete", "dev", name], ExecOptions::elevated())
            .await
            .map_err(|e| ConstructError::Apply {
                phase: ApplyPhase::Runtime,
                message: format!("ip link delete {name} failed: {e}"),
                hint: classify_failure(&e.output_text()).map(str::to_string),
                rolled_back: true,
            })?;
        Ok(())
    }

    async fn verify_present(&self, expectation: &Expectation<'_>) -> Vec<VerificationWarning> {
        let mut snapshot = Vec::new();
        for attempt in 0..self.settings.verify_attempts.max(1) {
            if attempt > 0 {
                tokio::time::sleep(self.settings.verify_interval).await;
            }
            snapshot = self.inventory.refresh().await;
            if let Some(iface) = snapshot.iter().find(|iface| iface.name == expectation.name) {
                if expectation.satisfied_by(iface) {
                    return Vec::new();
                }
            }
        }
        expectation.mismatches(&snapshot)
    }

    async fn verify_absent(&self, name: &str) -> Vec<VerificationWarning> {
        let mut seen = false;
        for attempt in 0..self.settings.verify_attempts.max(1) {
            if attempt > 0 {
                tokio::time::sleep(self.settings.verify_interval).await;
            }
            match self.inventory.try_refresh().await {
                Ok(interfaces) if !interfaces.iter().any(|iface| iface.name == name) => {
                    return Vec::new()
                }
                Ok(_) => seen = true,
                Err(e) => tracing::warn!("Could not list interfaces to verify {}: {}", name, e),
            }
        }
        if seen {
            vec![VerificationWarning {
                message: format!("{name} is still present on this host"),
                hint: Some(format!(
                    "Remove it with `ip link delete dev {name}` or reboot"
                )),
            }]
        } else {
            vec![VerificationWarning {
                message: format!("Could not confirm that {name} is gone"),
                hint: Some(format!("Check `ip link show {name}`")),
            }]
        }
    }

    /// Another writer may have declared the name again while we applied
    async fn verify_undeclared(&self, name: &str) -> Option<VerificationWarning> {
        match self.store.owners_of(name).await {
            Ok(owners) if owners.is_empty() => None,
            Ok(owners) => {
                let paths: Vec<String> = owners
                    .iter()
                    .map(|owned| owned.path.display().to_string())
                    .collect();
                Some(VerificationWarning {
                    message: format!("{name} is declared again in {}", paths.join(", ")),
                    hint: Some(
                        "Another tool edited the netplan directory; review it and apply again"
                            .to_string(),
                    ),
                })
            }
            Err(e) => Some(VerificationWarning {
                message: format!("Could not re-read configuration after deleting {name}: {e}"),
                hint: None,
            }),
        }
    }
}

impl Expectation<'_> {
    fn satisfied_by(&self, iface: &NetworkInterface) -> bool {
        self.mtu.map_or(true, |mtu| iface.mtu == mtu)
            && self.address.map_or(true, |address| address_matches(iface, address))
    }

    fn mismatches(&self, snapshot: &[NetworkInterface]) -> Vec<VerificationWarning> {
        let name = self.name;
        let Some(iface) = snapshot.iter().find(|iface| iface.name == name) else {
            return vec![VerificationWarning {
                message: format!("{name} did not appear on this host yet"),
                hint: Some(format!(
                    "Check `ip link show {name}` and `journalctl -u systemd-networkd`"
                )),
            }];
        };

        let mut warnings = Vec::new();
        if let Some(mtu) = self.mtu.filter(|mtu| *mtu != iface.mtu) {
            let parent_mtu = self
                .link
                .and_then(|link| snapshot.iter().find(|candidate| candidate.name == link))
                .map(|parent| parent.mtu);
            let hint = match (self.link, parent_mtu) {
                (Some(link), Some(parent_mtu)) if parent_mtu < mtu => format!(
                    "Parent interface {link} MTU is {parent_mtu}; raise it to at least {mtu} first"
                ),
                _ => format!("Check that the driver of {name} supports MTU {mtu}"),
            };
            warnings.push(VerificationWarning {
                message: format!(
                    "Requested MTU {mtu} on {name}, but the kernel reports {}",
                    iface.mtu
                ),
                hint: Some(hint),
            });
        }
        if let Some(address) = self.address {
            if !address_matches(iface, address) {
                warnings.push(VerificationWarning {
                    message: format!("Address {address} is not on {name} yet"),
                    hint: Some(
                        "Check whether another host already uses this address".to_string(),
                    ),
                });
            }
        }
        warnings
    }
}

// Only IPv4 is tracked in the inventory snapshot.
fn address_matches(iface: &NetworkInterface, address: &str) -> bool {
    match address.parse::<IpNetwork>() {
        Ok(IpNetwork::V4(network)) => iface.ipv4() == Some(network.ip()),
        Ok(IpNetwork::V6(_)) => true,
        Err(_) => false,
    }
}

/// Lower devices must exist somewhere, and members cannot be taken twice
fn check_lower_devices(
    definition: &ConstructDefinition,
    merged: &[OwnedDefinition],
    live: &[NetworkInterface],
) -> Result<()> {
    let lower_devices = definition.topology.lower_devices();
    for lower in &lower_devices {
        let declared = merged.iter().any(|owned| &owned.definition.name == lower);
        let present = live.iter().any(|iface| &iface.name == lower);
        if !declared && !present {
            return Err(ConstructError::validation(format!(
                "Interface {lower} does not exist"
            )));
        }
    }

    if definition.kind() == DeviceKind::Vlan {
        return Ok(());
    }
    for member in &lower_devices {
        let claimed = merged.iter().find(|owned| {
            owned.definition.name != definition.name
                && match &owned.definition.topology {
                    Topology::Bridge { interfaces, .. } => interfaces.contains(member),
                    Topology::Bond { interfaces, .. } => interfaces.contains(member),
                    _ => false,
                }
        });
        if let Some(owner) = claimed {
            return Err(ConstructError::Conflict {
                message: format!(
                    "{member} is already a member of {} {} in {}",
                    owner.definition.kind(),
                    owner.definition.name,
                    owner.path.display()
                ),
                path: Some(owner.path.clone()),
                existing: Some(owner.definition.kind()),
            });
        }
        let enslaved = live
            .iter()
            .find(|iface| &iface.name == member)
            .and_then(|iface| iface.master.as_deref())
            .filter(|master| *master != definition.name);
        if let Some(master) = enslaved {
            return Err(ConstructError::conflict(format!(
                "{member} is already enslaved to {master}"
            )));
        }
    }
    Ok(())
}

fn vlan_link(topology: &Topology) -> Option<&str> {
    match topology {
        Topology::Vlan { link, .. } => Some(link.as_str()),
        _ => None,
    }
}

fn construct_kind(kind: InterfaceKind) -> Option<DeviceKind> {
    match kind {
        InterfaceKind::Vlan => Some(DeviceKind::Vlan),
        InterfaceKind::Bridge => Some(DeviceKind::Bridge),
        InterfaceKind::Bond => Some(DeviceKind::Bond),
        InterfaceKind::Physical => None,
    }
}

fn not_found(name: &str) -> ConstructError {
    ConstructError::validation(format!(
        "{name} was not found in configuration or on this host"
    ))
}

/// Outside edits surface as-is so the caller reloads; anything else is a
/// failed write with the documents put back.
fn write_failure(err: StoreError) -> ConstructError {
    match err {
        StoreError::Modified { .. } => ConstructError::Store(err),
        other => ConstructError::Apply {
            phase: ApplyPhase::Write,
            message: other.to_string(),
            hint: Some("Check that netweaved can write to the netplan directory".to_string()),
            rolled_back: true,
        },
    }
}

fn annotate_rollback(err: ConstructError, restored: bool) -> ConstructError {
    match err {
        ConstructError::Apply {
            phase,
            message,
            hint,
            rolled_back,
        } => {
            let mut message = message;
            message.push_str(if restored {
                "; previous configuration documents restored"
            } else {
                "; previous configuration documents could not be restored"
            });
            if !rolled_back {
                message.push_str("; live state may be partially applied");
            }
            ConstructError::Apply {
                phase,
                message,
                hint,
                rolled_back: rolled_back && restored,
            }
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::request::{AddressingRequest, EditChanges, IdInput, TopologyRequest};
    use super::*;
    use crate::netplan::store::StoreSettings;
    use crate::network::inventory::InventorySettings;
    use crate::test_support::{ip_addr_without, Reply, ScriptedExecutor, IP_ADDR_SAMPLE};
    use pretty_assertions::assert_eq;

    const IP_ADDR: [&str; 3] = ["ip", "addr", "show"];
    const TRY: [&str; 3] = ["netplan", "try", "--timeout=30"];
    const APPLY: [&str; 2] = ["netplan", "apply"];

    const CLOUD_INIT: &str = "\
network:
  version: 2
  ethernets:
    eth0:
      dhcp4: true
";

    struct Fixture {
        dir: tempfile::TempDir,
        exec: Arc<ScriptedExecutor>,
        controller: ConstructController,
    }

    impl Fixture {
        fn new(ip_addr: &str) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let exec = Arc::new(ScriptedExecutor::new());
            exec.on(&IP_ADDR, Reply::stdout(ip_addr));
            let executor: Arc<dyn CommandExecutor> = exec.clone();

            let inventory = Arc::new(Inventory::new(
                executor.clone(),
                InventorySettings {
                    cache_ttl: Duration::from_secs(60),
                    proc_net_dev: dir.path().join("no-such-proc-file"),
                    fallback_interfaces: Vec::new(),
                },
            ));
            let store = ConfigStore::new(
                StoreSettings {
                    directory: dir.path().join("netplan"),
                    vendor_prefix: "90-netweave".into(),
                    renderer: Some("networkd".into()),
                    try_timeout: Duration::from_secs(30),
                    try_grace: Duration::from_secs(5),
                },
                executor.clone(),
            );
            let controller = ConstructController::new(
                store,
                inventory,
                executor,
                ControllerSettings {
                    verify_attempts: 2,
                    verify_interval: Duration::from_millis(1),
                },
            );
            Self {
                dir,
                exec,
                controller,
            }
        }

        fn netplan(&self) -> PathBuf {
            self.dir.path().join("netplan")
        }

        fn put(&self, file: &str, contents: &str) {
            std::fs::create_dir_all(self.netplan()).unwrap();
            std::fs::write(self.netplan().join(file), contents).unwrap();
        }

        fn read(&self, file: &str) -> String {
            std::fs::read_to_string(self.netplan().join(file)).unwrap()
        }

        fn files(&self) -> Vec<String> {
            let mut names: Vec<String> = std::fs::read_dir(self.netplan())
                .map(|entries| {
                    entries
                        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
                        .collect()
                })
                .unwrap_or_default();
            names.sort();
            names
        }

        fn ran_netplan(&self) -> bool {
            self.exec.calls().iter().any(|call| call.starts_with("netplan"))
        }

        async fn definitions(&self, file: &str) -> Vec<ConstructDefinition> {
            self.controller
                .store
                .read_definitions(&self.netplan().join(file))
                .await
                .unwrap()
        }
    }

    fn vlan_request(name: Option<&str>, id: IdInput, link: &str) -> CreateRequest {
        CreateRequest {
            name: name.map(str::to_string),
            topology: TopologyRequest::Vlan {
                id,
                link: link.into(),
            },
            addressing: AddressingRequest::default(),
        }
    }

    fn bond_request(name: &str, interfaces: &[&str], mode: &str) -> CreateRequest {
        CreateRequest {
            name: Some(name.into()),
            topology: TopologyRequest::Bond {
                interfaces: interfaces.iter().map(|i| i.to_string()).collect(),
                mode: Some(mode.into()),
                primary: None,
            },
            addressing: AddressingRequest::default(),
        }
    }

    fn delete_request(name: &str, confirmation: Option<&str>, force: bool) -> DeleteRequest {
        DeleteRequest {
            name: name.into(),
            confirmation: confirmation.map(str::to_string),
            force,
        }
    }

    const VENDOR_VLAN100: &str = "\
network:
  version: 2
  vlans:
    eth0.100:
      id: 100
      link: eth0
      mtu: 1500
";

    #[tokio::test]
    async fn vlan_on_declared_parent_gets_canonical_name_and_own_document() {
        let fx = Fixture::new(&ip_addr_without(IP_ADDR_SAMPLE, "eth0.100"));
        fx.put("50-cloud-init.yaml", CLOUD_INIT);
        fx.exec.after(&APPLY, &IP_ADDR, Reply::stdout(IP_ADDR_SAMPLE));

        let outcome = fx
            .controller
            .create(vlan_request(None, IdInput::from(100), "eth0"))
            .await
            .unwrap();

        assert_eq!(outcome.name, "eth0.100");
        assert_eq!(outcome.status, LifecycleState::Done);
        assert_eq!(outcome.apply_path, Some(ApplyPath::TrialThenApply));
        assert!(outcome.warnings.is_empty());
        assert_eq!(
            outcome.document,
            Some(fx.netplan().join("90-netweave-vlan100.yaml"))
        );
        assert_eq!(
            fx.definitions("90-netweave-vlan100.yaml").await,
            vec![ConstructDefinition {
                name: "eth0.100".into(),
                topology: Topology::Vlan {
                    id: 100,
                    link: "eth0".into()
                },
                addressing: Addressing {
                    dhcp4: Some(true),
                    ..Default::default()
                },
            }]
        );
        assert_eq!(fx.read("50-cloud-init.yaml"), CLOUD_INIT);
        assert!(fx.exec.ran(&["netplan", "generate"]));
        assert!(fx.exec.ran(&TRY));
        assert!(!outcome.trail.contains(&LifecycleState::CriticalGate));
        assert_eq!(
            &outcome.trail[outcome.trail.len() - 4..],
            &[
                LifecycleState::Testing,
                LifecycleState::Applying,
                LifecycleState::Verifying,
                LifecycleState::Done
            ]
        );
    }

    #[tokio::test]
    async fn undeclared_physical_parent_gets_a_placeholder() {
        let fx = Fixture::new(IP_ADDR_SAMPLE);
        let mut request = vlan_request(Some("eth2.20"), IdInput::from(20), "eth2");
        request.addressing.address = Some("10.20.0.2/24".into());

        let outcome = fx.controller.create(request).await.unwrap();

        let definitions = fx.definitions("90-netweave-vlan20.yaml").await;
        let names: Vec<&str> = definitions.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["eth2", "eth2.20"]);
        assert_eq!(definitions[0].topology, Topology::Ethernet);
        assert!(fx.read("90-netweave-vlan20.yaml").contains("optional: true"));
        // never shows up in the canned kernel state
        assert_eq!(outcome.status, LifecycleState::Done);
        assert_eq!(outcome.warnings.len(), 1);
    }

    #[tokio::test]
    async fn out_of_range_vlan_ids_touch_nothing() {
        let fractional: IdInput = serde_json::from_str("1.5").unwrap();
        for id in [
            IdInput::from(0),
            IdInput::from(4095),
            IdInput::Text("abc".into()),
            fractional,
        ] {
            let fx = Fixture::new(IP_ADDR_SAMPLE);
            let err = fx
                .controller
                .create(vlan_request(None, id, "eth0"))
                .await
                .unwrap_err();
            assert_eq!(err.kind(), "validation");
            assert!(fx.exec.calls().is_empty());
            assert!(fx.files().is_empty());
        }
    }

    #[tokio::test]
    async fn bond_with_one_member_is_rejected() {
        let fx = Fixture::new(IP_ADDR_SAMPLE);
        let err = fx
            .controller
            .create(bond_request("bond1", &["eth2"], "active-backup"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation");
        assert!(fx.files().is_empty());
    }

    #[tokio::test]
    async fn bridge_named_after_foreign_ethernet_conflicts() {
        let fx = Fixture::new(IP_ADDR_SAMPLE);
        fx.put("50-cloud-init.yaml", CLOUD_INIT);
        let request = CreateRequest {
            name: Some("eth0".into()),
            topology: TopologyRequest::Bridge {
                interfaces: vec!["eth2".into()],
                stp: None,
            },
            addressing: AddressingRequest::default(),
        };

        let err = fx.controller.create(request).await.unwrap_err();
        match &err {
            ConstructError::Conflict { path, existing, .. } => {
                assert_eq!(path.as_deref(), Some(fx.netplan().join("50-cloud-init.yaml").as_path()));
                assert_eq!(*existing, Some(DeviceKind::Ethernet));
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(fx.files(), vec!["50-cloud-init.yaml"]);
        assert_eq!(fx.read("50-cloud-init.yaml"), CLOUD_INIT);
        assert!(!fx.ran_netplan());
    }

    #[tokio::test]
    async fn bond_is_applied_without_trial() {
        let fx = Fixture::new(IP_ADDR_SAMPLE);
        let outcome = fx
            .controller
            .create(bond_request("bond1", &["eth2", "eth3"], "lacp"))
            .await
            .unwrap();

        assert_eq!(outcome.apply_path, Some(ApplyPath::Direct));
        assert!(!fx.exec.ran(&TRY));
        assert!(fx.exec.ran(&APPLY));

        let definitions = fx.definitions("90-netweave-bond1.yaml").await;
        let names: Vec<&str> = definitions.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["eth2", "eth3", "bond1"]);
        assert!(fx.read("90-netweave-bond1.yaml").contains("lacp-rate: fast"));
    }

    #[tokio::test]
    async fn enslaved_member_is_refused() {
        let fx = Fixture::new(IP_ADDR_SAMPLE);
        let err = fx
            .controller
            .create(bond_request("bond2", &["eth1", "eth2"], "balance-rr"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "conflict");
        assert!(err.to_string().contains("bond0"));
        assert!(fx.files().is_empty());
    }

    #[tokio::test]
    async fn missing_parent_is_a_validation_error() {
        let fx = Fixture::new(IP_ADDR_SAMPLE);
        let err = fx
            .controller
            .create(vlan_request(None, IdInput::from(5), "eth9"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation");
        assert!(err.to_string().contains("eth9"));
    }

    #[tokio::test]
    async fn own_conflicting_declaration_is_replaced() {
        let fx = Fixture::new(IP_ADDR_SAMPLE);
        fx.put(
            "90-netweave-vlan9.yaml",
            "network:\n  version: 2\n  vlans:\n    br9:\n      id: 9\n      link: eth2\n",
        );
        let request = CreateRequest {
            name: Some("br9".into()),
            topology: TopologyRequest::Bridge {
                interfaces: vec!["eth3".into()],
                stp: Some(false),
            },
            addressing: AddressingRequest::default(),
        };

        fx.controller.create(request).await.unwrap();

        assert_eq!(fx.files(), vec!["90-netweave-br9.yaml"]);
        let kinds: Vec<DeviceKind> = fx
            .definitions("90-netweave-br9.yaml")
            .await
            .iter()
            .map(ConstructDefinition::kind)
            .collect();
        assert_eq!(kinds, vec![DeviceKind::Ethernet, DeviceKind::Bridge]);
    }

    #[tokio::test]
    async fn failed_trial_restores_documents() {
        let fx = Fixture::new(&ip_addr_without(IP_ADDR_SAMPLE, "eth0.100"));
        fx.put("50-cloud-init.yaml", CLOUD_INIT);
        fx.exec.on(&TRY, Reply::failure("eth0.100: Invalid MTU"));

        let err = fx
            .controller
            .create(vlan_request(None, IdInput::from(100), "eth0"))
            .await
            .unwrap_err();

        match &err {
            ConstructError::Apply {
                phase,
                rolled_back,
                message,
                ..
            } => {
                assert_eq!(*phase, ApplyPhase::Trial);
                assert!(*rolled_back);
                assert!(message.contains("previous configuration documents restored"));
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(err.hint().unwrap().contains("invalid values"));
        assert_eq!(fx.files(), vec!["50-cloud-init.yaml"]);
        assert!(!fx.exec.ran(&APPLY));
    }

    #[tokio::test]
    async fn failed_direct_apply_is_flagged_partial() {
        let fx = Fixture::new(IP_ADDR_SAMPLE);
        fx.exec.on(&APPLY, Reply::failure("Permission denied"));

        let err = fx
            .controller
            .create(bond_request("bond1", &["eth2", "eth3"], "balance-rr"))
            .await
            .unwrap_err();

        assert_eq!(err.rolled_back(), Some(false));
        assert!(err.to_string().contains("partially applied"));
        assert!(fx.files().is_empty());
    }

    #[tokio::test]
    async fn concurrent_mutation_is_busy() {
        let fx = Fixture::new(IP_ADDR_SAMPLE);
        let _held = fx.controller.mutation.lock().await;
        let err = fx
            .controller
            .create(vlan_request(None, IdInput::from(7), "eth2"))
            .await
            .unwrap_err();
        assert!(matches!(err, ConstructError::Busy));
        assert!(fx.exec.calls().is_empty());
    }

    #[tokio::test]
    async fn deleting_something_already_gone_succeeds() {
        let fx = Fixture::new(IP_ADDR_SAMPLE);
        for name in ["eth0.200", "br9", "bond7"] {
            let outcome = fx
                .controller
                .delete(delete_request(name, None, false))
                .await
                .unwrap();
            assert!(outcome.message.contains("already removed"));
        }
        assert!(!fx.ran_netplan());
        assert!(!fx.exec.calls().iter().any(|call| call.starts_with("ip link delete")));
    }

    #[tokio::test]
    async fn physical_interfaces_cannot_be_deleted() {
        let fx = Fixture::new(IP_ADDR_SAMPLE);
        let err = fx
            .controller
            .delete(delete_request("eth2", None, false))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[tokio::test]
    async fn foreign_declaration_blocks_delete() {
        let fx = Fixture::new(IP_ADDR_SAMPLE);
        fx.put(
            "50-cloud-init.yaml",
            "network:\n  version: 2\n  vlans:\n    eth2.30:\n      id: 30\n      link: eth2\n",
        );
        let err = fx
            .controller
            .delete(delete_request("eth2.30", None, false))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "conflict");
        assert!(fx.netplan().join("50-cloud-init.yaml").exists());
        assert!(!fx.ran_netplan());
    }

    #[tokio::test]
    async fn critical_delete_needs_exact_name_echo() {
        let fx = Fixture::new(IP_ADDR_SAMPLE);
        fx.put("90-netweave-vlan100.yaml", VENDOR_VLAN100);

        for confirmation in [None, Some("ETH0.100")] {
            let err = fx
                .controller
                .delete(delete_request("eth0.100", confirmation, false))
                .await
                .unwrap_err();
            match err {
                ConstructError::ConfirmationRequired {
                    token, name_echo, ..
                } => {
                    assert_eq!(token, "eth0.100");
                    assert!(name_echo);
                }
                other => panic!("unexpected error {other:?}"),
            }
        }
        assert!(fx.netplan().join("90-netweave-vlan100.yaml").exists());
        assert!(!fx.ran_netplan());

        let gone = ip_addr_without(IP_ADDR_SAMPLE, "eth0.100");
        fx.exec.after(
            &["ip", "link", "delete", "dev", "eth0.100"],
            &IP_ADDR,
            Reply::stdout(&gone),
        );
        let outcome = fx
            .controller
            .delete(delete_request("eth0.100", Some("eth0.100"), false))
            .await
            .unwrap();

        assert!(fx.files().is_empty());
        assert_eq!(outcome.apply_path, Some(ApplyPath::TrialThenApply));
        assert!(fx.exec.ran(&["ip", "link", "delete", "dev", "eth0.100"]));
        assert!(outcome.warnings.is_empty());
    }

    #[tokio::test]
    async fn dependents_block_delete_unless_forced() {
        let fx = Fixture::new(IP_ADDR_SAMPLE);
        fx.put(
            "90-netweave-bond0.yaml",
            "\
network:
  version: 2
  ethernets:
    eth1: {}
    eth2: {}
  bonds:
    bond0:
      interfaces: [eth1, eth2]
      parameters:
        mode: active-backup
",
        );

        let err = fx
            .controller
            .delete(delete_request("bond0", Some("bond0"), false))
            .await
            .unwrap_err();
        match &err {
            ConstructError::Dependency { details, .. } => {
                assert!(details.iter().any(|d| d.contains("has members eth1")));
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(fx.netplan().join("90-netweave-bond0.yaml").exists());

        fx.exec.after(
            &["ip", "link", "delete", "dev", "bond0"],
            &IP_ADDR,
            Reply::stdout(&ip_addr_without(IP_ADDR_SAMPLE, "bond0")),
        );
        let outcome = fx
            .controller
            .delete(delete_request("bond0", Some("bond0"), true))
            .await
            .unwrap();
        assert!(fx.files().is_empty());
        assert_eq!(outcome.apply_path, Some(ApplyPath::Direct));
        assert!(outcome.notes.iter().any(|n| n.contains("despite dependents")));
    }

    #[tokio::test]
    async fn placeholder_still_needed_elsewhere_survives_delete() {
        let fx = Fixture::new(IP_ADDR_SAMPLE);
        fx.put(
            "90-netweave-vlan100.yaml",
            "network:\n  version: 2\n  ethernets:\n    eth2: {}\n  vlans:\n    eth2.100:\n      id: 100\n      link: eth2\n",
        );
        fx.put(
            "90-netweave-vlan200.yaml",
            "network:\n  version: 2\n  vlans:\n    eth2.200:\n      id: 200\n      link: eth2\n",
        );

        fx.controller
            .delete(delete_request("eth2.100", None, false))
            .await
            .unwrap();

        let left = fx.definitions("90-netweave-vlan100.yaml").await;
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].name, "eth2");
        assert_eq!(left[0].topology, Topology::Ethernet);
        assert_eq!(fx.definitions("90-netweave-vlan200.yaml").await.len(), 1);
    }

    #[tokio::test]
    async fn runtime_only_device_is_removed_directly() {
        let live = format!(
            "{IP_ADDR_SAMPLE}8: eth2.50@eth2: <BROADCAST,MULTICAST> mtu 1500 qdisc noop state DOWN group default qlen 1000\n"
        );
        let fx = Fixture::new(&live);
        fx.exec.after(
            &["ip", "link", "delete", "dev", "eth2.50"],
            &IP_ADDR,
            Reply::stdout(IP_ADDR_SAMPLE),
        );

        let outcome = fx
            .controller
            .delete(delete_request("eth2.50", None, false))
            .await
            .unwrap();

        assert!(outcome.message.contains("runtime-only"));
        assert!(outcome.warnings.is_empty());
        assert!(!fx.ran_netplan());
    }

    const VENDOR_VLAN30: &str = "network:\n  version: 2\n  vlans:\n    eth2.30:\n      id: 30\n      link: eth2\n";

    #[tokio::test]
    async fn unreadable_kernel_state_requires_force() {
        let fx = Fixture::new(IP_ADDR_SAMPLE);
        fx.put("90-netweave-vlan30.yaml", VENDOR_VLAN30);
        fx.exec.set(&IP_ADDR, Reply::failure("Cannot open netlink socket"));
        fx.exec.on(
            &["ip", "route", "show", "default"],
            Reply::stdout("default via 10.30.0.1 dev eth2.30\n"),
        );

        let err = fx
            .controller
            .delete(delete_request("eth2.30", None, false))
            .await
            .unwrap_err();
        match &err {
            ConstructError::Dependency { details, .. } => {
                assert!(details.iter().any(|d| d == "could not check interface membership"));
                assert!(details.iter().any(|d| d.contains("default route via 10.30.0.1")));
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(fx.read("90-netweave-vlan30.yaml"), VENDOR_VLAN30);
        assert!(!fx.ran_netplan());
        assert!(fx.exec.ran(&["ss", "-Htn", "state", "established"]));
    }

    #[tokio::test]
    async fn unreadable_kernel_state_is_no_ghost() {
        let fx = Fixture::new(IP_ADDR_SAMPLE);
        fx.exec.set(&IP_ADDR, Reply::failure("Cannot open netlink socket"));

        let err = fx
            .controller
            .delete(delete_request("eth2.30", None, true))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "apply");
        assert!(!fx.exec.calls().iter().any(|call| call.starts_with("ip link delete")));
    }

    #[tokio::test]
    async fn device_that_survives_delete_is_a_warning() {
        let live = format!(
            "{IP_ADDR_SAMPLE}8: eth2.30@eth2: <BROADCAST,MULTICAST> mtu 1500 qdisc noop state DOWN group default qlen 1000\n"
        );
        let fx = Fixture::new(&live);
        fx.put("90-netweave-vlan30.yaml", VENDOR_VLAN30);
        fx.exec.on(
            &["ip", "link", "delete", "dev", "eth2.30"],
            Reply::failure("RTNETLINK answers: Operation not permitted"),
        );

        let outcome = fx
            .controller
            .delete(delete_request("eth2.30", None, false))
            .await
            .unwrap();

        assert_eq!(outcome.status, LifecycleState::Done);
        assert!(fx.files().is_empty());
        assert!(outcome
            .notes
            .iter()
            .any(|n| n.contains("Could not remove lingering device eth2.30")));
        assert_eq!(outcome.warnings.len(), 1);
        assert!(outcome.warnings[0].message.contains("still present"));
    }

    #[tokio::test]
    async fn name_declared_again_during_delete_is_a_warning() {
        let fx = Fixture::new(IP_ADDR_SAMPLE);
        fx.put("90-netweave-vlan30.yaml", VENDOR_VLAN30);
        let netplan = fx.netplan();
        fx.exec.effect(&APPLY, move || {
            std::fs::write(netplan.join("60-local.yaml"), VENDOR_VLAN30).unwrap();
        });

        let outcome = fx
            .controller
            .delete(delete_request("eth2.30", None, false))
            .await
            .unwrap();

        assert_eq!(outcome.status, LifecycleState::Done);
        assert_eq!(fx.files(), vec!["60-local.yaml".to_string()]);
        assert_eq!(outcome.warnings.len(), 1);
        assert!(outcome.warnings[0].message.contains("declared again"));
        assert!(outcome.warnings[0].message.contains("60-local.yaml"));
    }

    #[tokio::test]
    async fn mtu_above_parent_succeeds_with_hint() {
        let fx = Fixture::new(IP_ADDR_SAMPLE);
        fx.put("90-netweave-vlan100.yaml", VENDOR_VLAN100);

        let outcome = fx
            .controller
            .edit(EditRequest {
                name: "eth0.100".into(),
                changes: EditChanges {
                    mtu: Some(9000),
                    ..Default::default()
                },
                confirmation: Some("EDIT CRITICAL".into()),
            })
            .await
            .unwrap();

        assert_eq!(outcome.status, LifecycleState::Done);
        assert_eq!(outcome.warnings.len(), 1);
        let hint = outcome.hint.unwrap();
        assert!(hint.contains("Parent interface eth0 MTU is 1500"));
        let definitions = fx.definitions("90-netweave-vlan100.yaml").await;
        assert_eq!(definitions[0].addressing.mtu, Some(9000));
    }

    #[tokio::test]
    async fn critical_edit_needs_the_right_phrase() {
        let fx = Fixture::new(IP_ADDR_SAMPLE);
        fx.put("90-netweave-vlan100.yaml", VENDOR_VLAN100);

        let mtu_only = EditRequest {
            name: "eth0.100".into(),
            changes: EditChanges {
                mtu: Some(1400),
                ..Default::default()
            },
            confirmation: None,
        };
        let err = fx.controller.edit(mtu_only.clone()).await.unwrap_err();
        assert!(matches!(err, ConstructError::ConfirmationRequired { ref token, .. } if token == "EDIT CRITICAL"));

        let readdress = EditRequest {
            name: "eth0.100".into(),
            changes: EditChanges {
                address: Some("192.168.1.50/24".into()),
                ..Default::default()
            },
            confirmation: Some("edit critical".into()),
        };
        let err = fx.controller.edit(readdress).await.unwrap_err();
        assert!(matches!(err, ConstructError::ConfirmationRequired { ref token, .. } if token == "CHANGE IP"));

        assert_eq!(fx.read("90-netweave-vlan100.yaml"), VENDOR_VLAN100);
        assert!(!fx.ran_netplan());

        let confirmed = EditRequest {
            confirmation: Some(" edit critical ".into()),
            ..mtu_only
        };
        fx.controller.edit(confirmed).await.unwrap();
        assert!(fx.exec.ran(&APPLY));
    }

    #[tokio::test]
    async fn foreign_device_is_edited_through_override() {
        let fx = Fixture::new(IP_ADDR_SAMPLE);
        let foreign = "network:\n  version: 2\n  ethernets:\n    eth2:\n      dhcp4: true\n";
        fx.put("50-cloud-init.yaml", foreign);

        let outcome = fx
            .controller
            .edit(EditRequest {
                name: "eth2".into(),
                changes: EditChanges {
                    mtu: Some(9000),
                    ..Default::default()
                },
                confirmation: None,
            })
            .await
            .unwrap();

        assert_eq!(fx.read("50-cloud-init.yaml"), foreign);
        let written = fx.definitions("90-netweave-override-eth2.yaml").await;
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].addressing.mtu, Some(9000));
        assert_eq!(written[0].addressing.dhcp4, Some(true));
        assert!(outcome.notes.iter().any(|n| n.contains("declared outside netweave")));
        // eth2 stays at 1500 in the canned state
        assert!(outcome.hint.unwrap().contains("driver of eth2"));
    }

    #[tokio::test]
    async fn runtime_only_bond_cannot_be_edited() {
        let fx = Fixture::new(IP_ADDR_SAMPLE);
        let err = fx
            .controller
            .edit(EditRequest {
                name: "bond0".into(),
                changes: EditChanges {
                    mtu: Some(9000),
                    ..Default::default()
                },
                confirmation: Some("EDIT CRITICAL".into()),
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation");
        assert!(fx.files().is_empty());
    }

    #[tokio::test]
    async fn runtime_vlan_on_a_bond_is_edited_through_override() {
        let live = format!(
            "{IP_ADDR_SAMPLE}8: bond0.100@bond0: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500 qdisc noqueue state UP group default qlen 1000\n"
        );
        let fx = Fixture::new(&live);

        let outcome = fx
            .controller
            .edit(EditRequest {
                name: "bond0.100".into(),
                changes: EditChanges {
                    mtu: Some(1400),
                    ..Default::default()
                },
                confirmation: Some("EDIT CRITICAL".into()),
            })
            .await
            .unwrap();

        assert_eq!(outcome.status, LifecycleState::Done);
        assert_eq!(outcome.apply_path, Some(ApplyPath::TrialThenApply));
        let written = fx.definitions("90-netweave-override-bond0.100.yaml").await;
        assert_eq!(written.len(), 1);
        assert_eq!(
            written[0].topology,
            Topology::Vlan {
                id: 100,
                link: "bond0".into()
            }
        );
        assert_eq!(written[0].addressing.mtu, Some(1400));
    }

    #[tokio::test]
    async fn bringing_down_a_critical_link_needs_confirmation() {
        let fx = Fixture::new(IP_ADDR_SAMPLE);
        let down = |confirmation: Option<&str>| LinkStateRequest {
            name: "eth0".into(),
            up: false,
            confirmation: confirmation.map(str::to_string),
        };

        let err = fx.controller.set_link_state(down(None)).await.unwrap_err();
        assert!(matches!(err, ConstructError::ConfirmationRequired { ref token, .. } if token == "BRING DOWN"));
        assert!(!fx.exec.ran(&["ip", "link", "set", "dev", "eth0", "down"]));

        fx.exec.after(
            &["ip", "link", "set", "dev", "eth0", "down"],
            &IP_ADDR,
            Reply::stdout(&IP_ADDR_SAMPLE.replace(
                "2: eth0: <BROADCAST,MULTICAST,UP,LOWER_UP>",
                "2: eth0: <BROADCAST,MULTICAST>",
            )),
        );
        let outcome = fx
            .controller
            .set_link_state(down(Some("bring down")))
            .await
            .unwrap();
        assert!(outcome.warnings.is_empty());
    }

    #[tokio::test]
    async fn declared_constructs_are_not_offered_as_parents() {
        let fx = Fixture::new(IP_ADDR_SAMPLE);
        fx.exec.on(
            &["ip", "link", "show"],
            Reply::stdout(
                "\
2: eth0: <BROADCAST,UP,LOWER_UP> mtu 1500 state UP
4: eth2: <BROADCAST,MULTICAST> mtu 1500 state DOWN
9: storage@eth2: <BROADCAST,UP> mtu 1500 state UP
",
            ),
        );
        fx.put(
            "90-netweave-storage.yaml",
            "network:\n  version: 2\n  vlans:\n    storage:\n      id: 30\n      link: eth2\n",
        );

        let constructs = fx.controller.list_constructs().await.unwrap();
        assert_eq!(constructs.len(), 1);
        assert!(constructs[0].vendor_managed);

        let parents = fx.controller.physical_parents().await.unwrap();
        assert!(!parents.contains(&"storage".to_string()));
        assert!(parents.contains(&"eth2".to_string()));
    }

    #[tokio::test]
    async fn assessment_falls_back_to_declaration() {
        let fx = Fixture::new(IP_ADDR_SAMPLE);
        fx.put(
            "90-netweave-vlan5.yaml",
            "network:\n  version: 2\n  vlans:\n    eth2.5:\n      id: 5\n      link: eth2\n      addresses: [8.8.4.4/24]\n",
        );

        let assessment = fx.controller.assess("eth2.5").await.unwrap();
        assert!(assessment.is_critical);
        assert!(fx.controller.assess("eth7").await.is_err());
        assert!(!fx.controller.assess("eth2").await.unwrap().is_critical);
    }
}
