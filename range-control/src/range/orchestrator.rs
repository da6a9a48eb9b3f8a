//! Top-level range lifecycle.
//!
//! The orchestrator is the only writer of the metadata store and the owner
//! of each request's operation ledger. A create walks: validate →
//! allocate id → topology → disks → domains → IP discovery → tasks →
//! policy → persist. Every allocation registers a rollback hook; any
//! failure after the first side effect walks the ledger newest-first and
//! undoes what was done.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use fs::directory_manager::{DirectoryManager, DirectoryManagerFs};
use fs::file_reader::FileReader;
use fs::writer_file::FileWriter;
use fs::LocalFile;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::description::{BaseVmType, GuestConfig, RangeDescription, TopologySpec};
use crate::config::settings::Settings;
use crate::defaults;
use crate::discovery::{DiscoveryRequest, IpDiscovery};
use crate::hypervisor::xml::DomainXmlBuilder;
use crate::hypervisor::Hypervisor;
use crate::image::{BuildRequest, ImageBuilder};
use crate::network::firewall::FirewallManager;
use crate::network::policy::NetworkPolicy;
use crate::network::topology::{TopologyManager, TopologyOutcome};
use crate::operation::{AtomicOperation, ComprehensiveStatus, OperationTracker, OperationType};
use crate::range::entity::{RangeMetadata, RangeStatus};
use crate::range::error::RangeError;
use crate::range::id::RangeId;
use crate::range::status::{DetailedStatus, GuestStatus, StatusCache};
use crate::range::store::{MetadataStore, StoreError};
use crate::tasks::executor::{TaskExecutor, TaskTarget};
use crate::utils::cancel::CancelFlag;
use crate::utils::net::probe_tcp;

#[derive(Debug, Clone)]
pub struct CreateOptions {
    pub range_id: Option<String>,
    pub dry_run: bool,
    pub enable_ssh: bool,
    /// On failure, tear everything down and drop the metadata entry;
    /// otherwise keep the entry in `error` for diagnostics.
    pub cleanup_on_failure: bool,
}

impl Default for CreateOptions {
    fn default() -> Self {
        Self {
            range_id: None,
            dry_run: false,
            enable_ssh: false,
            cleanup_on_failure: true,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub enum Verdict {
    #[serde(rename = "SUCCESS")]
    Success,
    #[serde(rename = "SUCCESS_WITH_WARNINGS")]
    SuccessWithWarnings(Vec<String>),
    #[serde(rename = "FAILURE")]
    Failure {
        cause: String,
        hint: Option<String>,
    },
}

impl Verdict {
    pub fn is_success(&self) -> bool {
        !matches!(self, Verdict::Failure { .. })
    }
}

/// Structured result of a create request.
#[derive(Debug, Clone, Serialize)]
pub struct CreateOutcome {
    pub range_id: String,
    pub verdict: Verdict,
    pub operations: Vec<AtomicOperation>,
    pub summary: ComprehensiveStatus,
    pub rollbacks: usize,
}

pub struct RangeOrchestrator {
    settings: Settings,
    hypervisor: Arc<dyn Hypervisor>,
    store: Arc<MetadataStore>,
    topology: Arc<TopologyManager>,
    firewall: Arc<FirewallManager>,
    image_builder: Arc<ImageBuilder>,
    task_executor: Arc<TaskExecutor>,
    discovery: Arc<IpDiscovery>,
    cancel: CancelFlag,
    range_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    status_cache: StatusCache,
}

impl RangeOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: Settings,
        hypervisor: Arc<dyn Hypervisor>,
        store: Arc<MetadataStore>,
        topology: Arc<TopologyManager>,
        firewall: Arc<FirewallManager>,
        image_builder: Arc<ImageBuilder>,
        task_executor: Arc<TaskExecutor>,
        discovery: Arc<IpDiscovery>,
    ) -> Self {
        Self {
            settings,
            hypervisor,
            store,
            topology,
            firewall,
            image_builder,
            task_executor,
            discovery,
            cancel: CancelFlag::new(),
            range_locks: Mutex::new(HashMap::new()),
            status_cache: StatusCache::default(),
        }
    }

    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn get_range(&self, range_id: &str) -> Option<RangeMetadata> {
        self.store.get(range_id)
    }

    pub fn list_ranges(&self) -> Vec<RangeMetadata> {
        self.store.list()
    }

    /// Creates a range from a validated description. Validation and
    /// allocation failures return an error before any side effect;
    /// failures after that are surfaced as a `FAILURE` outcome with
    /// rollback already performed.
    pub fn create_range(
        &self,
        description: &RangeDescription,
        options: &CreateOptions,
    ) -> Result<CreateOutcome, RangeError> {
        description.validate(self.settings.legacy_build_task_compat)?;

        let range_id = self.allocate_range_id(description, options)?;
        let guests: Vec<GuestConfig> =
            description.placed_guests().into_iter().cloned().collect();
        let topology_spec = description.topology().cloned().unwrap_or(empty_topology());

        if options.dry_run {
            return self.dry_run(description, &range_id, &topology_spec, &guests);
        }

        let range_lock = self.range_lock(&range_id);
        let _range_guard = range_lock.lock().expect("range lock");

        // Claiming the id in the store is the collision gate: with two
        // concurrent creates for the same id, exactly one insert succeeds.
        let mut metadata = RangeMetadata::new(range_id.get());
        metadata.owner = description
            .host_settings
            .first()
            .map(|host| host.account.clone())
            .unwrap_or_default();
        metadata.resource_ids.hosts = description
            .host_settings
            .iter()
            .map(|host| host.host_id.clone())
            .collect();
        metadata
            .provider_config
            .insert("uri".to_string(), self.hypervisor.uri().into());
        self.store.insert(metadata)?;

        let range_dir = self.settings.range_dir(&range_id);
        DirectoryManagerFs.create(&range_dir.join(defaults::DISKS_DIR_NAME))?;

        let tracker = OperationTracker::new(range_id.get());
        tracker.set_comprehensive_log_file(range_dir.join(defaults::CREATION_LOG_FILENAME));

        info!(range_id = %range_id, guests = guests.len(), "creating range");
        let result = self.create_body(&tracker, &range_id, &topology_spec, &guests, options);

        match result {
            Ok(warnings) => {
                self.finish_success(&range_id, &tracker, warnings)
            }
            Err(err) => {
                error!(range_id = %range_id, %err, "range creation failed, rolling back");
                let rollbacks = tracker.rollback_all_operations();
                self.finish_failure(&range_id, &tracker, err, rollbacks, options)
            }
        }
    }

    /// Tears a range down: domains, networks, firewall rules. The metadata
    /// entry survives as `destroyed` until `remove_range`.
    pub fn destroy_range(&self, range_id: &str) -> Result<(), RangeError> {
        let range_lock = self.range_lock(range_id);
        let _range_guard = range_lock.lock().expect("range lock");

        let metadata = self
            .store
            .get(range_id)
            .ok_or_else(|| RangeError::NotFound(range_id.to_string()))?;
        if metadata.status == RangeStatus::Destroyed {
            // Destroying twice reads as "nothing left to destroy".
            return Err(RangeError::NotFound(range_id.to_string()));
        }
        if !metadata.status.is_destroyable() {
            return Err(RangeError::Transition(
                crate::range::entity::InvalidTransition {
                    range_id: range_id.to_string(),
                    from: metadata.status,
                    to: RangeStatus::Destroying,
                },
            ));
        }

        self.store.update(range_id, |range| {
            range.status = RangeStatus::Destroying;
        })?;
        self.status_cache.invalidate(range_id);

        let tracker = OperationTracker::new(range_id);
        info!(range_id, domains = metadata.resource_ids.domains.len(), "destroying range");

        for domain_name in &metadata.resource_ids.domains {
            let operation_id = tracker.start_operation(
                OperationType::VmDestroy,
                format!("Destroy domain {domain_name}"),
                None,
            );
            let stopped = self.hypervisor.stop_domain(
                domain_name,
                true,
                defaults::DOMAIN_SHUTDOWN_TIMEOUT,
            );
            if let Err(err) = &stopped {
                warn!(domain = %domain_name, %err, "stop failed, destroying anyway");
            }
            match self.hypervisor.destroy_domain(domain_name, true, true) {
                Ok(_) => {
                    tracker.complete_operation(&operation_id, None).ok();
                }
                Err(err) => {
                    tracker.fail_operation(&operation_id, err.to_string()).ok();
                }
            }
        }

        self.topology.destroy_topology(&tracker, range_id)?;
        self.firewall.remove_range_rules(&tracker, range_id)?;

        self.store.update(range_id, |range| {
            range.status = RangeStatus::Destroyed;
        })?;
        info!(range_id, "range destroyed");
        Ok(())
    }

    /// Deletes the metadata entry and the on-disk directory. Refused for
    /// ranges that are not destroyed unless `force` is set, in which case
    /// the range is destroyed first.
    pub fn remove_range(&self, range_id: &str, force: bool) -> Result<(), RangeError> {
        let metadata = self
            .store
            .get(range_id)
            .ok_or_else(|| RangeError::NotFound(range_id.to_string()))?;

        if metadata.status != RangeStatus::Destroyed {
            if !force {
                return Err(RangeError::RemovalRefused(range_id.to_string()));
            }
            if metadata.status.is_destroyable() {
                self.destroy_range(range_id)?;
            }
        }

        let range_lock = self.range_lock(range_id);
        let _range_guard = range_lock.lock().expect("range lock");

        self.store.remove(range_id)?;
        self.status_cache.invalidate(range_id);
        DirectoryManagerFs.delete(&self.settings.range_dir(range_id))?;
        info!(range_id, "range removed");
        Ok(())
    }

    /// Metadata joined with live hypervisor state and reachability.
    pub fn get_range_status_detailed(
        &self,
        range_id: &str,
    ) -> Result<DetailedStatus, RangeError> {
        if let Some(cached) = self.status_cache.get(range_id) {
            return Ok(cached);
        }

        let metadata = self
            .store
            .get(range_id)
            .ok_or_else(|| RangeError::NotFound(range_id.to_string()))?;

        let mut guests = Vec::new();
        let mut guest_ids: Vec<&String> = metadata.vm_ips.keys().collect();
        guest_ids.sort();
        for guest_id in guest_ids {
            let domain_name = defaults::range_domain_name(range_id, guest_id);
            let state = self
                .hypervisor
                .get_domain_state(&domain_name)
                .ok();

            let mut ip_addresses: Vec<String> = state
                .as_ref()
                .map(|info| {
                    info.interfaces
                        .iter()
                        .flat_map(|iface| iface.ips.iter().cloned())
                        .collect()
                })
                .unwrap_or_default();
            if ip_addresses.is_empty() {
                if let Some(assigned) = metadata.vm_ips.get(guest_id) {
                    ip_addresses.push(assigned.clone());
                }
            }

            let ssh_reachable = ip_addresses
                .first()
                .map(|ip| probe_tcp(ip, defaults::SSH_PORT, defaults::SSH_PROBE_TIMEOUT))
                .unwrap_or(false);

            guests.push(GuestStatus {
                guest_id: guest_id.clone(),
                domain_name,
                state: state.map(|info| info.state),
                ip_addresses,
                ssh_reachable,
            });
        }

        let status = DetailedStatus { metadata, guests };
        self.status_cache.put(range_id, status.clone());
        Ok(status)
    }

    ////////////////////////////////////////////////////////////////////////////////
    // Create internals
    ////////////////////////////////////////////////////////////////////////////////

    fn allocate_range_id(
        &self,
        description: &RangeDescription,
        options: &CreateOptions,
    ) -> Result<RangeId, RangeError> {
        let explicit = options.range_id.clone().or_else(|| {
            description
                .clone_settings
                .first()
                .and_then(|clone| clone.range_id_string())
        });
        match explicit {
            Some(id) => {
                let id = RangeId::new(&id)?;
                if self.store.get(&id).is_some() {
                    return Err(RangeError::Store(StoreError::Collision(id.get())));
                }
                Ok(id)
            }
            None => Ok(RangeId::next_auto(&self.store.range_ids())),
        }
    }

    /// Validation-only pass: everything is checked and planned, nothing is
    /// touched.
    fn dry_run(
        &self,
        _description: &RangeDescription,
        range_id: &RangeId,
        topology_spec: &TopologySpec,
        guests: &[GuestConfig],
    ) -> Result<CreateOutcome, RangeError> {
        let outcome = self
            .topology
            .plan_topology(range_id, topology_spec, guests)?;
        self.compile_policy(range_id, topology_spec, &outcome)?;

        // Pre-existing domain definitions must at least be readable.
        for guest in guests {
            if guest.basevm_type == BaseVmType::Kvm {
                if let Some(config_file) = &guest.basevm_config_file {
                    LocalFile
                        .read(config_file)
                        .map_err(crate::config::description::DescriptionError::Read)?;
                }
            }
        }

        info!(range_id = %range_id, "dry run passed");
        let tracker = OperationTracker::new(range_id.get());
        Ok(CreateOutcome {
            range_id: range_id.get(),
            verdict: Verdict::Success,
            operations: Vec::new(),
            summary: tracker.get_comprehensive_status(),
            rollbacks: 0,
        })
    }

    fn create_body(
        &self,
        tracker: &OperationTracker,
        range_id: &RangeId,
        topology_spec: &TopologySpec,
        guests: &[GuestConfig],
        options: &CreateOptions,
    ) -> Result<Vec<String>, RangeError> {
        let mut warnings = Vec::new();

        // 1. Networks and address plan.
        self.check_cancelled()?;
        let topology_outcome =
            self.topology
                .create_topology(tracker, range_id, topology_spec, guests)?;

        // Assignments are persisted immediately: they are the topology
        // lookup source for IP discovery and must survive a crash.
        self.store.update(range_id, |range| {
            range.vm_ips = topology_outcome.ip_assignments.clone();
            range.networks = topology_outcome.networks.clone();
        })?;

        // 2. Layer-3 policy, compiled before guests boot so rule errors
        // fail fast. Application may overlap with task execution.
        let policy = self.compile_policy(range_id, topology_spec, &topology_outcome)?;

        // 3. Per-guest disks and domains, in parallel.
        let domains = self.provision_guests(
            tracker,
            range_id,
            guests,
            &topology_outcome,
            options.enable_ssh,
        )?;

        // 4. Wait for addresses, in parallel across guests.
        let discovered = self.discover_ips(tracker, range_id, guests, &topology_outcome);
        for (guest_id, result) in &discovered {
            if result.is_none() {
                warnings.push(format!(
                    "guest `{guest_id}`: no IP discovered within the timeout"
                ));
            }
        }

        // 5. Apply the policy.
        if let Some(mut policy) = policy {
            let operation_id = tracker.start_operation(
                OperationType::NetworkSetup,
                format!("Apply layer-3 policy {}", policy.policy_id),
                Some(Box::new({
                    let firewall = Arc::clone(&self.firewall);
                    let range_id = range_id.get();
                    move || {
                        let tracker = OperationTracker::new(range_id.clone());
                        firewall
                            .remove_range_rules(&tracker, &range_id)
                            .map(|_| ())
                            .map_err(|err| err.to_string())
                    }
                })),
            );
            self.firewall.initialize(tracker)?;
            match self.firewall.apply_policy(tracker, &mut policy) {
                Ok(()) => {
                    tracker.complete_operation(&operation_id, None).ok();
                    self.store.update(range_id, |range| {
                        range.resource_ids.policy_id = Some(policy.policy_id.clone());
                    })?;
                }
                Err(err) => {
                    tracker.fail_operation(&operation_id, err.to_string()).ok();
                    return Err(err.into());
                }
            }
        }

        // 6. Post-boot tasks for reachable guests.
        warnings.extend(self.run_guest_tasks(tracker, guests, &discovered)?);

        // 7. Final resource handles.
        self.store.update(range_id, |range| {
            range.resource_ids.domains = domains.clone();
        })?;

        Ok(warnings)
    }

    fn compile_policy(
        &self,
        range_id: &RangeId,
        topology_spec: &TopologySpec,
        outcome: &TopologyOutcome,
    ) -> Result<Option<NetworkPolicy>, RangeError> {
        let rules = topology_spec.forwarding_rule_strings();
        if rules.is_empty() {
            return Ok(None);
        }

        let mut policy = NetworkPolicy::new(range_id.get());
        for network in outcome.networks.values() {
            policy
                .add_ip_mapping(network.name.clone(), network.cidr.clone())
                .map_err(|err| RangeError::Policy(vec![err]))?;
        }
        policy
            .parse_forwarding_rules(&rules)
            .map_err(RangeError::Policy)?;
        policy.compile().map_err(RangeError::Policy)?;
        Ok(Some(policy))
    }

    fn provision_guests(
        &self,
        tracker: &OperationTracker,
        range_id: &RangeId,
        guests: &[GuestConfig],
        outcome: &TopologyOutcome,
        enable_ssh: bool,
    ) -> Result<Vec<String>, RangeError> {
        let results = self.for_each_guest(guests, |guest| {
            self.provision_one_guest(tracker, range_id, guest, outcome, enable_ssh)
        });

        let mut domains = Vec::new();
        let mut first_error = None;
        for (guest_id, result) in results {
            match result {
                Ok(domain_name) => domains.push(domain_name),
                Err(err) => {
                    error!(guest = %guest_id, %err, "guest provisioning failed");
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(domains),
        }
    }

    fn provision_one_guest(
        &self,
        tracker: &OperationTracker,
        range_id: &RangeId,
        guest: &GuestConfig,
        outcome: &TopologyOutcome,
        enable_ssh: bool,
    ) -> Result<String, RangeError> {
        self.check_cancelled()?;
        let domain_name = defaults::range_domain_name(range_id, &guest.guest_id);
        let disks_dir = self
            .settings
            .range_dir(range_id)
            .join(defaults::DISKS_DIR_NAME);

        let xml = match guest.basevm_type {
            BaseVmType::KvmAuto => {
                let request = BuildRequest {
                    guest_id: guest.guest_id.clone(),
                    image_name: guest.image_name.clone().unwrap_or_default(),
                    disk_size: guest.disk_size.clone().unwrap_or_default(),
                    output_dir: disks_dir,
                    tasks: guest
                        .parsed_tasks()
                        .unwrap_or_default()
                        .into_iter()
                        .filter(|task| task.is_build_time() || matches!(task, crate::tasks::kinds::TaskKind::Unknown { .. }))
                        .collect(),
                    enable_ssh,
                };
                let image_path = request.image_path();

                let operation_id = tracker.start_operation(
                    OperationType::VmCreate,
                    format!("Build disk for guest {}", guest.guest_id),
                    Some(Box::new({
                        let image_builder = Arc::clone(&self.image_builder);
                        let image_path = image_path.clone();
                        move || {
                            image_builder.cleanup_build_files(&image_path);
                            Ok(())
                        }
                    })),
                );
                let built = self.image_builder.build(tracker, &request);
                match built {
                    Ok(result) if result.success => {
                        tracker.complete_operation(&operation_id, None).ok();
                    }
                    Ok(result) => {
                        let message = result
                            .error_message
                            .unwrap_or_else(|| "unknown build failure".to_string());
                        tracker.fail_operation(&operation_id, &message).ok();
                        return Err(RangeError::Build {
                            guest_id: guest.guest_id.clone(),
                            message,
                        });
                    }
                    Err(err) => {
                        tracker.fail_operation(&operation_id, err.to_string()).ok();
                        return Err(err.into());
                    }
                }

                let mut builder = DomainXmlBuilder::new(&domain_name)
                    .vcpus(guest.vcpus.unwrap_or(1))
                    .memory_mib(guest.memory.unwrap_or(1024))
                    .disk(&image_path);
                for network in guest_networks(guest, outcome) {
                    builder = builder.interface(network);
                }
                builder.build()
            }
            BaseVmType::Kvm => {
                let config_file = guest
                    .basevm_config_file
                    .clone()
                    .unwrap_or_default();
                let base_xml = LocalFile
                    .read(&config_file)
                    .map_err(crate::config::description::DescriptionError::Read)?;
                rewrite_domain_name(&base_xml, &domain_name)
            }
            BaseVmType::Aws | BaseVmType::Docker => {
                // validate() refuses these before creation starts.
                return Err(RangeError::Description(
                    crate::config::description::DescriptionError::Validation(vec![format!(
                        "guest `{}`: unsupported provider",
                        guest.guest_id
                    )]),
                ));
            }
        };

        // Define, then start: separate ledger entries so rollback undoes a
        // defined-but-never-started domain too.
        let define_op = tracker.start_operation(
            OperationType::VmCreate,
            format!("Define domain {domain_name}"),
            Some(Box::new({
                let hypervisor = Arc::clone(&self.hypervisor);
                let domain_name = domain_name.clone();
                move || {
                    hypervisor
                        .destroy_domain(&domain_name, true, true)
                        .map(|_| ())
                        .map_err(|err| err.to_string())
                }
            })),
        );
        match self.hypervisor.define_domain(&xml, false) {
            Ok(_) => {
                tracker.complete_operation(&define_op, None).ok();
            }
            Err(err) => {
                tracker.fail_operation(&define_op, err.to_string()).ok();
                return Err(err.into());
            }
        }

        let start_op = tracker.start_operation(
            OperationType::VmStart,
            format!("Start domain {domain_name}"),
            None,
        );
        match self.hypervisor.start_domain(&domain_name) {
            Ok(_) => {
                tracker.complete_operation(&start_op, None).ok();
            }
            Err(err) => {
                tracker.fail_operation(&start_op, err.to_string()).ok();
                return Err(err.into());
            }
        }

        info!(guest = %guest.guest_id, domain = %domain_name, "guest provisioned");
        Ok(domain_name)
    }

    fn discover_ips(
        &self,
        tracker: &OperationTracker,
        range_id: &RangeId,
        guests: &[GuestConfig],
        outcome: &TopologyOutcome,
    ) -> Vec<(String, Option<String>)> {
        self.for_each_guest(guests, |guest| {
            let request = DiscoveryRequest {
                domain_name: defaults::range_domain_name(range_id, &guest.guest_id),
                range_id: Some(range_id.get()),
                guest_id: Some(guest.guest_id.clone()),
                force_refresh: false,
            };
            let discovered = self
                .discovery
                .wait_for_ip(
                    tracker,
                    &request,
                    defaults::IP_DISCOVERY_TIMEOUT,
                    std::time::Duration::from_secs(3),
                )
                .ok()
                .and_then(|info| info.primary_ip().map(str::to_string));
            // Fall back to the planned assignment for reporting purposes.
            Ok::<_, RangeError>(
                discovered.or_else(|| outcome.ip_assignments.get(&guest.guest_id).cloned()),
            )
        })
        .into_iter()
        .map(|(guest_id, result)| (guest_id, result.ok().flatten()))
        .collect()
    }

    fn run_guest_tasks(
        &self,
        tracker: &OperationTracker,
        guests: &[GuestConfig],
        discovered: &[(String, Option<String>)],
    ) -> Result<Vec<String>, RangeError> {
        let ips: HashMap<&str, &str> = discovered
            .iter()
            .filter_map(|(guest_id, ip)| {
                ip.as_deref().map(|ip| (guest_id.as_str(), ip))
            })
            .collect();

        let mut warnings = Vec::new();
        let results = self.for_each_guest(guests, |guest| {
            let tasks = guest.parsed_tasks().unwrap_or_default();
            let post_boot: Vec<_> = tasks
                .iter()
                .filter(|task| !task.is_build_time() || guest.basevm_type == BaseVmType::Kvm)
                .filter(|task| {
                    !matches!(task, crate::tasks::kinds::TaskKind::Unknown { .. })
                })
                .cloned()
                .collect();
            if post_boot.is_empty() {
                return Ok(None);
            }

            let Some(ip) = ips.get(guest.guest_id.as_str()) else {
                return Ok(Some(format!(
                    "guest `{}`: tasks skipped, no address",
                    guest.guest_id
                )));
            };
            let target = TaskTarget {
                guest_id: guest.guest_id.clone(),
                ip: (*ip).to_string(),
                ssh_user: "root".to_string(),
                windows: guest.basevm_os_type.is_windows(),
            };

            if !self
                .task_executor
                .wait_until_reachable(&target, std::time::Duration::from_secs(60))
            {
                return Ok(Some(format!(
                    "guest `{}`: tasks skipped, {} not reachable over SSH",
                    guest.guest_id, target.ip
                )));
            }

            // Post-boot account tasks on the kvm path run over SSH; on the
            // kvm-auto path they were already injected into the disk.
            let report = self.task_executor.execute_tasks(tracker, &target, &post_boot)?;
            if report.all_successful() {
                Ok(None)
            } else {
                Ok(Some(format!(
                    "guest `{}`: {} of {} tasks failed",
                    guest.guest_id,
                    report.failed_count(),
                    report.outcomes.len()
                )))
            }
        });

        for (_, result) in results {
            match result {
                Ok(Some(warning)) => warnings.push(warning),
                Ok(None) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(warnings)
    }

    fn finish_success(
        &self,
        range_id: &RangeId,
        tracker: &OperationTracker,
        warnings: Vec<String>,
    ) -> Result<CreateOutcome, RangeError> {
        self.store.update(range_id, |range| {
            range.status = RangeStatus::Active;
        })?;
        self.write_status_file(range_id, "SUCCESS");
        self.write_detailed_log(range_id, tracker);
        self.status_cache.invalidate(range_id);

        let verdict = if warnings.is_empty() {
            Verdict::Success
        } else {
            Verdict::SuccessWithWarnings(warnings)
        };
        info!(range_id = %range_id, "range active");
        Ok(CreateOutcome {
            range_id: range_id.get(),
            verdict,
            operations: tracker.get_operations(),
            summary: tracker.get_comprehensive_status(),
            rollbacks: 0,
        })
    }

    fn finish_failure(
        &self,
        range_id: &RangeId,
        tracker: &OperationTracker,
        err: RangeError,
        rollbacks: usize,
        options: &CreateOptions,
    ) -> Result<CreateOutcome, RangeError> {
        self.write_status_file(range_id, "FAILURE");
        self.write_detailed_log(range_id, tracker);
        self.status_cache.invalidate(range_id);

        if options.cleanup_on_failure {
            // Rollback already tore resources down; drop the claim too.
            if let Err(store_err) = self.store.remove(range_id) {
                warn!(range_id = %range_id, %store_err, "could not drop failed range entry");
            }
        } else {
            let update = self.store.update(range_id, |range| {
                range.status = RangeStatus::Error;
            });
            if let Err(store_err) = update {
                warn!(range_id = %range_id, %store_err, "could not mark range as errored");
            }
        }

        let hint = err.hint().or_else(|| {
            Some(format!(
                "see {} for details",
                self.settings
                    .range_dir(range_id)
                    .join(defaults::CREATION_LOG_FILENAME)
                    .display()
            ))
        });
        Ok(CreateOutcome {
            range_id: range_id.get(),
            verdict: Verdict::Failure {
                cause: err.to_string(),
                hint,
            },
            operations: tracker.get_operations(),
            summary: tracker.get_comprehensive_status(),
            rollbacks,
        })
    }

    fn write_status_file(&self, range_id: &RangeId, status: &str) {
        let path = self
            .settings
            .range_dir(range_id)
            .join(defaults::STATUS_FILENAME);
        if let Err(err) = LocalFile.write(&path, format!("{status}\n")) {
            warn!(path = %path.display(), %err, "could not write status file");
        }
    }

    /// One JSON line per ledger entry, alongside the legacy-format
    /// creation log.
    fn write_detailed_log(&self, range_id: &RangeId, tracker: &OperationTracker) {
        let path = self
            .settings
            .range_dir(range_id)
            .join(defaults::DETAILED_LOG_FILENAME);
        let mut lines = String::new();
        for operation in tracker.get_operations() {
            if let Ok(line) = serde_json::to_string(&operation) {
                lines.push_str(&line);
                lines.push('\n');
            }
        }
        if let Err(err) = LocalFile.write(&path, lines) {
            warn!(path = %path.display(), %err, "could not write detailed log");
        }
    }

    /// Runs `f` for every guest on a bounded pool of workers. Results keep
    /// guest association; panics are not expected from the closures.
    fn for_each_guest<T, F>(&self, guests: &[GuestConfig], f: F) -> Vec<(String, Result<T, RangeError>)>
    where
        T: Send,
        F: Fn(&GuestConfig) -> Result<T, RangeError> + Sync,
    {
        let workers = self.settings.max_workers.clamp(1, guests.len().max(1));
        let next = AtomicUsize::new(0);
        let results: Mutex<Vec<(String, Result<T, RangeError>)>> =
            Mutex::new(Vec::with_capacity(guests.len()));

        std::thread::scope(|scope| {
            for worker in 0..workers {
                let f = &f;
                let next = &next;
                let results = &results;
                let builder = std::thread::Builder::new().name(format!("guest-worker-{worker}"));
                builder
                    .spawn_scoped(scope, move || loop {
                        let index = next.fetch_add(1, Ordering::SeqCst);
                        let Some(guest) = guests.get(index) else {
                            break;
                        };
                        let result = f(guest);
                        results
                            .lock()
                            .expect("results lock")
                            .push((guest.guest_id.clone(), result));
                    })
                    .expect("thread config should be valid");
            }
        });

        results.into_inner().expect("results lock")
    }

    fn range_lock(&self, range_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.range_locks.lock().expect("range locks");
        Arc::clone(
            locks
                .entry(range_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    fn check_cancelled(&self) -> Result<(), RangeError> {
        if self.cancel.is_cancelled() {
            Err(RangeError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Networks a guest is a member of, in declaration order; guests outside
/// any network attach to the hypervisor's default network.
fn guest_networks(guest: &GuestConfig, outcome: &TopologyOutcome) -> Vec<String> {
    let mut networks: Vec<String> = outcome
        .networks
        .values()
        .filter(|network| {
            network
                .members
                .iter()
                .any(|(guest_id, _)| guest_id == &guest.guest_id)
        })
        .map(|network| network.full_name.clone())
        .collect();
    networks.sort();
    if networks.is_empty() {
        networks.push("default".to_string());
    }
    networks
}

fn empty_topology() -> TopologySpec {
    TopologySpec {
        kind: "custom".to_string(),
        networks: Vec::new(),
        forwarding_rules: Vec::new(),
    }
}

/// Replaces the `<name>` element of a pre-existing domain definition so
/// the clone gets a range-scoped identity.
fn rewrite_domain_name(xml: &str, domain_name: &str) -> String {
    let regex = regex::Regex::new(r"<name>[^<]*</name>").expect("name regex should be valid");
    if regex.is_match(xml) {
        regex
            .replace(xml, format!("<name>{domain_name}</name>").as_str())
            .into_owned()
    } else {
        // No name element; inject one right after the opening tag.
        xml.replacen('>', &format!(">\n  <name>{domain_name}</name>"), 1)
    }
}

////////////////////////////////////////////////////////////////////////////////////
// TESTS
////////////////////////////////////////////////////////////////////////////////////
#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::executor::testing::FakeRunner;
    use crate::command::CommandExecutor;
    use crate::hypervisor::client::mock::MockHypervisor;
    use crate::hypervisor::{DomainOpResult, HypervisorError};
    use crate::network::bridge::BridgeManager;
    use assert_matches::assert_matches;
    use std::path::Path;
    use std::time::Duration;

    const IMAGE_LIST: &str = "ubuntu-20.04             x86_64     Ubuntu 20.04 (focal)\n";

    fn ok_op(name: &str, operation: &str) -> DomainOpResult {
        DomainOpResult::succeeded(name, operation, "ok", Duration::ZERO)
    }

    fn harness(
        hypervisor: MockHypervisor,
        runner: FakeRunner,
        dir: &Path,
    ) -> RangeOrchestrator {
        let mut hypervisor = hypervisor;
        hypervisor
            .expect_uri()
            .return_const("qemu:///session".to_string());
        let hypervisor: Arc<dyn Hypervisor> = Arc::new(hypervisor);

        let executor = Arc::new(CommandExecutor::new(
            Arc::new(runner) as Arc<dyn crate::command::CommandRunner>
        ));
        let settings = Settings {
            cyber_range_dir: dir.join("cyber_range"),
            log_dir: dir.join("logs"),
            max_workers: 2,
            ..Settings::default()
        };
        let store = Arc::new(MetadataStore::open(settings.metadata_path()).unwrap());
        let bridges = Arc::new(BridgeManager::new(Arc::clone(&executor)));
        let topology = Arc::new(TopologyManager::new(Arc::clone(&hypervisor), bridges));
        let firewall = Arc::new(FirewallManager::new(
            Arc::clone(&executor),
            dir.join("backups"),
        ));
        let image_builder = Arc::new(ImageBuilder::new(Arc::clone(&executor)));
        let task_executor = Arc::new(TaskExecutor::new(Arc::clone(&executor)));
        let discovery = Arc::new(
            IpDiscovery::new(Arc::clone(&hypervisor), Arc::clone(&executor))
                .with_lease_dirs(Vec::new())
                .with_topology_source(Arc::clone(&store) as _),
        );

        RangeOrchestrator::new(
            settings,
            hypervisor,
            store,
            topology,
            firewall,
            image_builder,
            task_executor,
            discovery,
        )
    }

    fn kvm_description(dir: &Path, ip_addr: &str) -> RangeDescription {
        let config_file = dir.join("desktop.xml");
        std::fs::write(
            &config_file,
            "<domain type='kvm'>\n  <name>basevm-desktop</name>\n  <devices/>\n</domain>\n",
        )
        .unwrap();

        RangeDescription {
            host_settings: vec![crate::config::description::HostConfig {
                host_id: "host_1".to_string(),
                mgmt_addr: "localhost".to_string(),
                virbr_addr: "192.168.122.1".to_string(),
                account: "ubuntu".to_string(),
            }],
            guest_settings: vec![GuestConfig {
                basevm_config_file: Some(config_file),
                ip_addr: Some(ip_addr.to_string()),
                ..GuestConfig::test_kvm_guest("desktop")
            }],
            clone_settings: Vec::new(),
        }
    }

    #[test]
    fn test_single_guest_creation_reaches_active() {
        let tempdir = tempfile::tempdir().unwrap();
        let mut hypervisor = MockHypervisor::new();
        hypervisor
            .expect_define_domain()
            .once()
            .withf(|xml, start| xml.contains("<name>cyris-desktop-") && !*start)
            .returning(|_, _| Ok(ok_op("cyris-desktop-1", "define")));
        hypervisor
            .expect_start_domain()
            .once()
            .returning(|name| Ok(ok_op(name, "start")));

        let orchestrator = harness(hypervisor, FakeRunner::default(), tempdir.path());
        let description = kvm_description(tempdir.path(), "192.168.122.77");

        let outcome = orchestrator
            .create_range(&description, &CreateOptions::default())
            .unwrap();

        assert_matches!(outcome.verdict, Verdict::Success | Verdict::SuccessWithWarnings(_));
        let range = orchestrator.get_range(&outcome.range_id).unwrap();
        assert_eq!(range.status, RangeStatus::Active);
        assert_eq!(range.vm_ips["desktop"], "192.168.122.77");
        assert_eq!(range.resource_ids.domains.len(), 1);
        assert!(range.resource_ids.domains[0].starts_with("cyris-desktop-"));

        let status_file = orchestrator
            .settings
            .range_dir(&outcome.range_id)
            .join(defaults::STATUS_FILENAME);
        assert_eq!(
            std::fs::read_to_string(status_file).unwrap().trim(),
            "SUCCESS"
        );
    }

    #[test]
    fn test_dry_run_touches_nothing() {
        let tempdir = tempfile::tempdir().unwrap();
        // A mock with no expectations panics on any call: the dry run must
        // never reach the hypervisor.
        let orchestrator = harness(MockHypervisor::new(), FakeRunner::default(), tempdir.path());
        let description = kvm_description(tempdir.path(), "192.168.122.77");

        let outcome = orchestrator
            .create_range(
                &description,
                &CreateOptions {
                    dry_run: true,
                    range_id: Some("99".to_string()),
                    ..CreateOptions::default()
                },
            )
            .unwrap();

        assert_eq!(outcome.range_id, "99");
        assert!(outcome.verdict.is_success());
        assert!(orchestrator.list_ranges().is_empty());
        assert!(!orchestrator.settings.range_dir("99").exists());
    }

    #[test]
    fn test_dry_run_rejects_invalid_rule_naming_its_index() {
        let tempdir = tempfile::tempdir().unwrap();
        let orchestrator = harness(MockHypervisor::new(), FakeRunner::default(), tempdir.path());

        let mut description = kvm_description(tempdir.path(), "192.168.122.77");
        description.clone_settings = vec![crate::config::description::CloneSpec {
            range_id: None,
            hosts: vec![crate::config::description::CloneHost {
                host_id: "host_1".to_string(),
                instance_number: 1,
                guests: vec![crate::config::description::CloneGuest {
                    guest_id: "desktop".to_string(),
                    number: 1,
                    entry_point: true,
                }],
                topology: vec![TopologySpec {
                    kind: "custom".to_string(),
                    networks: Vec::new(),
                    forwarding_rules: vec![crate::config::description::ForwardingRuleSpec {
                        rule: "src=office".to_string(),
                    }],
                }],
            }],
        }];

        let err = orchestrator
            .create_range(
                &description,
                &CreateOptions {
                    dry_run: true,
                    ..CreateOptions::default()
                },
            )
            .unwrap_err();

        let message = err.to_string();
        assert!(message.contains("forwarding rule 0"), "{message}");
        assert!(orchestrator.list_ranges().is_empty());
    }

    #[test]
    fn test_explicit_range_id_collision_is_refused() {
        let tempdir = tempfile::tempdir().unwrap();
        let mut hypervisor = MockHypervisor::new();
        hypervisor
            .expect_define_domain()
            .returning(|_, _| Ok(ok_op("d", "define")));
        hypervisor
            .expect_start_domain()
            .returning(|name| Ok(ok_op(name, "start")));

        let orchestrator = harness(hypervisor, FakeRunner::default(), tempdir.path());
        let description = kvm_description(tempdir.path(), "192.168.122.77");
        let options = CreateOptions {
            range_id: Some("125".to_string()),
            ..CreateOptions::default()
        };

        orchestrator.create_range(&description, &options).unwrap();
        let err = orchestrator
            .create_range(&description, &options)
            .unwrap_err();
        assert_matches!(err, RangeError::Store(StoreError::Collision(id)) => {
            assert_eq!(id, "125");
        });
    }

    #[test]
    fn test_failed_guest_rolls_back_the_sibling() {
        let tempdir = tempfile::tempdir().unwrap();
        let mut hypervisor = MockHypervisor::new();
        // Only the guest with a listed image reaches define/start.
        hypervisor
            .expect_define_domain()
            .once()
            .withf(|xml, _| xml.contains("cyris-alpha-"))
            .returning(|_, _| Ok(ok_op("cyris-alpha-1", "define")));
        hypervisor
            .expect_start_domain()
            .once()
            .returning(|name| Ok(ok_op(name, "start")));
        // Rollback undoes the defined domain.
        hypervisor
            .expect_destroy_domain()
            .once()
            .withf(|name, undefine, _| name.contains("cyris-alpha-") && *undefine)
            .returning(|name, _, _| Ok(ok_op(name, "destroy")));

        let runner = FakeRunner::default().respond("virt-builder --list", 0, IMAGE_LIST);
        let orchestrator = harness(hypervisor, runner, tempdir.path());

        let description = RangeDescription {
            host_settings: Vec::new(),
            guest_settings: vec![
                GuestConfig {
                    basevm_host: None,
                    ..GuestConfig::test_kvm_auto_guest("alpha", "ubuntu-20.04")
                },
                GuestConfig {
                    basevm_host: None,
                    ..GuestConfig::test_kvm_auto_guest("beta", "no-such-image")
                },
            ],
            clone_settings: Vec::new(),
        };

        let outcome = orchestrator
            .create_range(&description, &CreateOptions::default())
            .unwrap();

        assert_matches!(&outcome.verdict, Verdict::Failure { cause, .. } => {
            assert!(cause.contains("no-such-image"), "{cause}");
        });
        // One failed operation (beta's disk build), at least one rollback.
        assert_eq!(outcome.summary.fail_count, 1);
        assert!(outcome.rollbacks >= 1);
        // Cleanup-on-failure dropped the claim entirely.
        assert!(orchestrator.get_range(&outcome.range_id).is_none());
    }

    #[test]
    fn test_failure_without_cleanup_keeps_error_entry() {
        let tempdir = tempfile::tempdir().unwrap();
        let hypervisor = MockHypervisor::new();
        let runner = FakeRunner::default().respond("virt-builder --list", 0, IMAGE_LIST);
        let orchestrator = harness(hypervisor, runner, tempdir.path());

        let description = RangeDescription {
            host_settings: Vec::new(),
            guest_settings: vec![GuestConfig {
                basevm_host: None,
                ..GuestConfig::test_kvm_auto_guest("beta", "no-such-image")
            }],
            clone_settings: Vec::new(),
        };

        let outcome = orchestrator
            .create_range(
                &description,
                &CreateOptions {
                    cleanup_on_failure: false,
                    ..CreateOptions::default()
                },
            )
            .unwrap();

        assert!(!outcome.verdict.is_success());
        let range = orchestrator.get_range(&outcome.range_id).unwrap();
        assert_eq!(range.status, RangeStatus::Error);
    }

    #[test]
    fn test_destroy_walks_domains_networks_and_rules() {
        let tempdir = tempfile::tempdir().unwrap();
        let mut hypervisor = MockHypervisor::new();
        hypervisor
            .expect_stop_domain()
            .once()
            .withf(|name, force, _| name == "cyris-desktop-125" && *force)
            .returning(|name, _, _| Ok(ok_op(name, "stop")));
        hypervisor
            .expect_destroy_domain()
            .once()
            .withf(|name, undefine, storage| {
                name == "cyris-desktop-125" && *undefine && *storage
            })
            .returning(|name, _, _| Ok(ok_op(name, "destroy")));
        hypervisor
            .expect_list_networks()
            .returning(|_| Ok(vec!["cyris-125-office".to_string(), "default".to_string()]));
        hypervisor
            .expect_destroy_network()
            .once()
            .withf(|name, _| name == "cyris-125-office")
            .returning(|name, _| Ok(ok_op(name, "destroy_network")));

        let orchestrator = harness(hypervisor, FakeRunner::default(), tempdir.path());

        let mut metadata = RangeMetadata::new("125");
        metadata.status = RangeStatus::Active;
        metadata
            .resource_ids
            .domains
            .push("cyris-desktop-125".to_string());
        orchestrator.store.insert(metadata).unwrap();

        orchestrator.destroy_range("125").unwrap();
        assert_eq!(
            orchestrator.get_range("125").unwrap().status,
            RangeStatus::Destroyed
        );

        // Second destroy reports not found.
        assert_matches!(
            orchestrator.destroy_range("125"),
            Err(RangeError::NotFound(_))
        );

        // Removal clears the metadata entirely.
        orchestrator.remove_range("125", false).unwrap();
        assert!(orchestrator.get_range("125").is_none());
    }

    #[test]
    fn test_destroy_unknown_range_is_not_found_and_mutates_nothing() {
        let tempdir = tempfile::tempdir().unwrap();
        let orchestrator = harness(MockHypervisor::new(), FakeRunner::default(), tempdir.path());

        assert_matches!(
            orchestrator.destroy_range("ghost"),
            Err(RangeError::NotFound(_))
        );
        assert!(orchestrator.list_ranges().is_empty());
    }

    #[test]
    fn test_remove_active_range_requires_force() {
        let tempdir = tempfile::tempdir().unwrap();
        let mut hypervisor = MockHypervisor::new();
        hypervisor.expect_list_networks().returning(|_| Ok(Vec::new()));

        let orchestrator = harness(hypervisor, FakeRunner::default(), tempdir.path());
        let mut metadata = RangeMetadata::new("125");
        metadata.status = RangeStatus::Active;
        orchestrator.store.insert(metadata).unwrap();

        assert_matches!(
            orchestrator.remove_range("125", false),
            Err(RangeError::RemovalRefused(_))
        );
        assert!(orchestrator.get_range("125").is_some());

        // With force, destroy-then-remove.
        orchestrator.remove_range("125", true).unwrap();
        assert!(orchestrator.get_range("125").is_none());
    }

    #[test]
    fn test_auto_assigned_ids_increment() {
        let tempdir = tempfile::tempdir().unwrap();
        let orchestrator = harness(MockHypervisor::new(), FakeRunner::default(), tempdir.path());
        orchestrator
            .store
            .insert(RangeMetadata::new("41"))
            .unwrap();

        let description = kvm_description(tempdir.path(), "192.168.122.77");
        let id = orchestrator
            .allocate_range_id(&description, &CreateOptions::default())
            .unwrap();
        assert_eq!(id.get(), "42");
    }

    #[test]
    fn test_rewrite_domain_name_replaces_existing() {
        let xml = "<domain><name>old</name><devices/></domain>";
        let rewritten = rewrite_domain_name(xml, "cyris-desktop-77");
        assert!(rewritten.contains("<name>cyris-desktop-77</name>"));
        assert!(!rewritten.contains("<name>old</name>"));
    }
}
