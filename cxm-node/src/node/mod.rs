//! Per-node VM and storage lifecycle
//!
//! A [`Node`] owns the execution channel, the hypervisor client and the result
//! cache of one cluster member. Methods that touch the cache or the LVM
//! refresh timestamp take `&mut self`: a node is driven by a single caller at
//! a time.
//!
//! The logical volumes of a VM must be active on at most one node. A node
//! refuses to deactivate the volumes of a VM it sees running and
//! [`Node::check_lvs`] reports stale activations, but nothing here serializes
//! activations issued by different nodes or processes.

use crate::execution::{open_channel, CommandOutput, ExecutionChannel};
use crate::hypervisor::HypervisorClient;
use crate::vm::{Vm, VmCatalog};
use cxm_core::caching::ResultCache;
use cxm_core::config::CxmConfig;
use cxm_core::error::{CxmError, CxmResult};
use cxm_core::messages::{Message, MessageContext};
use cxm_core::resolver::local_hostname;
use shell_words::{join, quote};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

mod inventory;
mod report;

pub use report::{AutostartReport, HostList, LvReport};

/// Cache slot of [`Node::get_vms`]
pub const VMS_CACHE_KEY: &str = "vms";
/// Cache slot of [`Node::get_vms_names`]
pub const VMS_NAMES_CACHE_KEY: &str = "vms_names";

const CONTROL_DOMAIN: &str = "Domain-0";
const MIGRATING_PREFIX: &str = "migrating-";

/// The two ways of reaching a node
struct Backends {
    channel: Box<dyn ExecutionChannel>,
    hypervisor: HypervisorClient,
    use_ssh: bool,
}

impl Backends {
    async fn run(&self, command: &str) -> CxmResult<CommandOutput> {
        self.channel.run(command).await
    }

    async fn list_vms(&self) -> CxmResult<Vec<Vm>> {
        if self.use_ssh {
            let output = self
                .run("xm list | awk '{print $1,$2,$3,$4;}' | tail -n +3")
                .await?;
            return Ok(output
                .trimmed_lines()
                .filter_map(inventory::xm_list_entry)
                .filter(|vm| !vm.name.starts_with(MIGRATING_PREFIX))
                .collect());
        }

        let session = self.hypervisor.session();
        let records = session.all_vm_records().await?;
        let metrics = session.all_vm_metrics().await?;

        Ok(records
            .into_iter()
            .filter(|record| is_guest(&record.name_label) && record.power_state.is_started())
            .map(|record| {
                let vm_metrics = metrics.get(&record.metrics).cloned().unwrap_or_default();
                Vm::with_metrics(record.name_label, record.domid, vm_metrics)
            })
            .collect())
    }

    async fn list_vm_names(&self) -> CxmResult<Vec<String>> {
        if self.use_ssh {
            let output = self.run("xm list | awk '{print $1}' | tail -n +3").await?;
            return Ok(output
                .trimmed_lines()
                .filter(|name| !name.starts_with(MIGRATING_PREFIX))
                .map(str::to_string)
                .collect());
        }

        let records = self.hypervisor.session().all_vm_records().await?;
        Ok(records
            .into_iter()
            .filter(|record| is_guest(&record.name_label) && record.power_state.is_started())
            .map(|record| record.name_label)
            .collect())
    }
}

fn quote_path(path: &Path) -> String {
    quote(&path.display().to_string()).into_owned()
}

/// Neither the control domain nor the placeholder of an ongoing migration
fn is_guest(name: &str) -> bool {
    name != CONTROL_DOMAIN && !name.starts_with(MIGRATING_PREFIX)
}

/// Management façade of one cluster member
pub struct Node {
    hostname: String,
    is_local: bool,
    config: Arc<CxmConfig>,
    backends: Backends,
    catalog: VmCatalog,
    cache: ResultCache,
    last_refresh: Option<Instant>,
}

impl Node {
    /// Connect to `hostname`: open the execution channel and log into the
    /// hypervisor. Either failure is returned to the caller.
    pub async fn connect(hostname: impl Into<String>, config: Arc<CxmConfig>) -> CxmResult<Self> {
        let hostname = hostname.into();
        let is_local = hostname == local_hostname();
        info!("Connecting to {}...", hostname);

        let channel = open_channel(&hostname, is_local, &config).await?;
        let hypervisor = match HypervisorClient::connect(&hostname, is_local, &config).await {
            Ok(hypervisor) => hypervisor,
            Err(e) => {
                let _ = channel.close().await;
                return Err(e);
            }
        };

        Ok(Self::from_parts(hostname, is_local, config, channel, hypervisor))
    }

    /// Connect to the host this process runs on
    pub async fn local(config: Arc<CxmConfig>) -> CxmResult<Self> {
        Self::connect(local_hostname(), config).await
    }

    /// Assemble a node from already opened backends
    pub fn from_parts(
        hostname: impl Into<String>,
        is_local: bool,
        config: Arc<CxmConfig>,
        channel: Box<dyn ExecutionChannel>,
        hypervisor: HypervisorClient,
    ) -> Self {
        let catalog = VmCatalog::new(&config.vmconf_dir);
        let use_ssh = config.use_ssh;

        Self {
            hostname: hostname.into(),
            is_local,
            config,
            backends: Backends {
                channel,
                hypervisor,
                use_ssh,
            },
            catalog,
            cache: ResultCache::new(),
            last_refresh: None,
        }
    }

    /// Close the execution channel and the hypervisor session. Failures are
    /// ignored.
    pub async fn disconnect(self) {
        if let Err(e) = self.backends.channel.close().await {
            debug!("[NODE] {} -> error closing channel: {}", self.hostname, e);
        }
        if let Err(e) = self.backends.hypervisor.close().await {
            debug!("[NODE] {} -> error closing session: {}", self.hostname, e);
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn is_local_node(&self) -> bool {
        self.is_local
    }

    pub fn config(&self) -> &CxmConfig {
        &self.config
    }

    pub fn hypervisor(&self) -> &HypervisorClient {
        &self.backends.hypervisor
    }

    /// Run a command on this node
    pub async fn run(&self, command: &str) -> CxmResult<CommandOutput> {
        self.backends.run(command).await
    }

    // VM lifecycle

    pub async fn is_vm_started(&self, name: &str) -> CxmResult<bool> {
        if self.config.use_ssh {
            let output = self.run("xm list | awk '{print $1;}'").await?;
            return Ok(inventory::contains_line(&output, name));
        }

        let session = self.backends.hypervisor.session();
        match session.vm_by_name(name).await? {
            Some(vm) => Ok(session.power_state(&vm).await?.is_started()),
            None => Ok(false),
        }
    }

    pub async fn is_vm_autostart_enabled(&self, name: &str) -> CxmResult<bool> {
        let output = self
            .run(&format!("ls {}", quote_path(&self.config.autostart_dir)))
            .await?;
        Ok(inventory::contains_line(&output, name))
    }

    /// The running VM named `name`
    pub async fn get_vm(&self, name: &str) -> CxmResult<Vm> {
        if self.config.use_ssh {
            let output = self
                .run(&format!(
                    "xm list | awk -v name={} '$1 == name {{print $1,$2,$3,$4;}}'",
                    quote(name)
                ))
                .await?;
            return output
                .trimmed_lines()
                .find_map(inventory::xm_list_entry)
                .ok_or_else(|| CxmError::not_running_vm(&self.hostname, name));
        }

        let session = self.backends.hypervisor.session();
        let vm = session
            .vm_by_name(name)
            .await?
            .ok_or_else(|| CxmError::not_running_vm(&self.hostname, name))?;
        let record = session.vm_record(&vm).await?;
        if !record.power_state.is_started() {
            return Err(CxmError::not_running_vm(&self.hostname, name));
        }
        let metrics = session.vm_metrics(&record.metrics).await?;
        Ok(Vm::with_metrics(record.name_label, record.domid, metrics))
    }

    /// Running guest VMs, cached unless `bypass_cache` is set
    pub async fn get_vms(&mut self, bypass_cache: bool) -> CxmResult<Vec<Vm>> {
        let ttl = self.config.vm.list_cache_ttl;
        let backends = &self.backends;
        self.cache
            .cache(VMS_CACHE_KEY, ttl, bypass_cache, || backends.list_vms())
            .await
    }

    /// Names of the running guest VMs, cached unless `bypass_cache` is set
    pub async fn get_vms_names(&mut self, bypass_cache: bool) -> CxmResult<Vec<String>> {
        let ttl = self.config.vm.list_cache_ttl;
        let backends = &self.backends;
        self.cache
            .cache(VMS_NAMES_CACHE_KEY, ttl, bypass_cache, || backends.list_vm_names())
            .await
    }

    /// Number of running guest VMs
    pub async fn get_vm_started(&mut self, bypass_cache: bool) -> CxmResult<usize> {
        if self.config.use_ssh {
            let command = "xenstore-list /local/domain | wc -l";
            let output = self.run(command).await?;
            let domains: usize = output.text().trim().parse().map_err(|_| {
                CxmError::unexpected_output(&self.hostname, command, output.text().trim())
            })?;
            // the control domain is listed too
            return Ok(domains.saturating_sub(1));
        }

        Ok(self.get_vms_names(bypass_cache).await?.len())
    }

    pub async fn start_vm(&self, name: &str) -> CxmResult<()> {
        info!("Starting {} on {}", name, self.hostname);

        if self.config.use_ssh {
            self.run(&format!("xm create {}", quote_path(&self.catalog.path_of(name))))
                .await?;
            return Ok(());
        }

        let config = self.catalog.load(name).await?;
        let description = config.to_sxp(name);
        let legacy = self.backends.hypervisor.legacy().await?;
        legacy.domain_create(&description).await?;
        legacy.domain_unpause(config.name().unwrap_or(name)).await
    }

    /// Live-migrate `name` to `destination`
    pub async fn migrate(&self, name: &str, destination: &Node) -> CxmResult<()> {
        info!("Migrating {} from {} to {}", name, self.hostname, destination.hostname());

        if self.config.use_ssh {
            self.run(&format!(
                "xm migrate -l {} {}",
                quote(name),
                quote(destination.hostname())
            ))
            .await?;
            return Ok(());
        }

        let session = self.backends.hypervisor.session();
        let vm = session
            .vm_by_name(name)
            .await?
            .ok_or_else(|| CxmError::not_running_vm(&self.hostname, name))?;
        session.migrate(&vm, destination.hostname()).await
    }

    /// Stop `name`, wait for it to go down, then deactivate its volumes.
    ///
    /// When the VM is still up after the last check, deactivation refuses and
    /// the call fails with [`CxmError::RunningVm`].
    pub async fn shutdown(&mut self, name: &str, clean: bool) -> CxmResult<()> {
        if !self.is_vm_started(name).await? {
            return Err(CxmError::not_running_vm(&self.hostname, name));
        }

        info!(
            "{} {} on {}",
            if clean { "Shutting down" } else { "Destroying" },
            name,
            self.hostname
        );

        if self.config.use_ssh {
            let verb = if clean { "shutdown" } else { "destroy" };
            self.run(&format!("xm {} {}", verb, quote(name))).await?;
        } else {
            let session = self.backends.hypervisor.session();
            let vm = session
                .vm_by_name(name)
                .await?
                .ok_or_else(|| CxmError::not_running_vm(&self.hostname, name))?;
            if clean {
                session.clean_shutdown(&vm).await?;
            } else {
                session.hard_shutdown(&vm).await?;
            }
        }

        let interval = self.config.vm.shutdown_poll_interval;
        let limit = self.config.vm.shutdown_poll_limit;

        sleep(interval).await;
        let mut polls = 0;
        while self.is_vm_started(name).await? && polls <= limit {
            debug!("[NODE] {} -> waiting for {} to stop", self.hostname, name);
            sleep(interval).await;
            polls += 1;
        }
        if polls > limit {
            warn!("{} did not stop on {} after {} checks", name, self.hostname, polls);
        }

        self.deactivate_lv(name).await
    }

    /// Create the boot-time autostart link of `name` if missing
    pub async fn enable_vm_autostart(&self, name: &str) -> CxmResult<()> {
        let autostart = &self.config.autostart_dir;
        self.run(&format!(
            "test -L {} || ln -s {} {}/",
            quote_path(&autostart.join(name)),
            quote_path(&self.catalog.path_of(name)),
            quote_path(autostart)
        ))
        .await?;
        Ok(())
    }

    pub async fn disable_vm_autostart(&self, name: &str) -> CxmResult<()> {
        self.run(&format!(
            "rm -f {}",
            quote_path(&self.config.autostart_dir.join(name))
        ))
        .await?;
        Ok(())
    }

    // Storage lifecycle

    /// Volume groups holding `lvs`, deduplicated
    pub async fn get_vgs(&self, lvs: &[String]) -> CxmResult<Vec<String>> {
        if lvs.is_empty() {
            return Ok(Vec::new());
        }
        let output = self.run(&format!("lvdisplay -c {}", join(lvs))).await?;
        Ok(inventory::volume_groups(&output))
    }

    /// Physical volumes of every volume group, without the `/dev/` prefix
    pub async fn get_vgs_map(&self) -> CxmResult<BTreeMap<String, Vec<String>>> {
        let output = self.run("pvs -o pv_name,vg_name --noheading").await?;
        Ok(inventory::volume_group_map(&output))
    }

    /// Refresh volume group metadata, at most once per grace window
    pub async fn refresh_lvm(&mut self, vgs: &[String]) -> CxmResult<()> {
        if self.config.no_refresh || vgs.is_empty() {
            return Ok(());
        }

        if let Some(last) = self.last_refresh {
            if last.elapsed() <= self.config.lvm.refresh_grace {
                debug!("[LVM] {} -> refresh skipped", self.hostname);
                return Ok(());
            }
        }

        self.run(&format!("lvchange --refresh {}", join(vgs))).await?;
        self.last_refresh = Some(Instant::now());
        Ok(())
    }

    /// Activate the logical volumes of `name` on this node
    pub async fn activate_lv(&mut self, name: &str) -> CxmResult<()> {
        let lvs = self.catalog.lvs(name).await?;
        if lvs.is_empty() {
            debug!("[LVM] {} -> {} has no logical volume", self.hostname, name);
            return Ok(());
        }

        let vgs = self.get_vgs(&lvs).await?;
        self.refresh_lvm(&vgs).await?;
        self.run(&format!("lvchange -aly {}", join(&lvs))).await?;
        Ok(())
    }

    /// Deactivate the logical volumes of `name` on this node.
    ///
    /// Fails with [`CxmError::RunningVm`], without touching any volume, when
    /// the VM runs here.
    pub async fn deactivate_lv(&mut self, name: &str) -> CxmResult<()> {
        if self.is_vm_started(name).await? {
            return Err(CxmError::running_vm(&self.hostname, name));
        }

        let lvs = self.catalog.lvs(name).await?;
        if lvs.is_empty() {
            debug!("[LVM] {} -> {} has no logical volume", self.hostname, name);
            return Ok(());
        }

        let vgs = self.get_vgs(&lvs).await?;
        self.refresh_lvm(&vgs).await?;
        self.run(&format!("lvchange -aln {}", join(&lvs))).await?;
        Ok(())
    }

    /// Deactivate the volumes of every configured VM not running here
    pub async fn deactivate_all_lv(&mut self) -> CxmResult<()> {
        for vm in self.configured_vms().await? {
            if !self.is_vm_started(&vm).await? {
                self.deactivate_lv(&vm).await?;
            }
        }
        Ok(())
    }

    /// Names of the VMs with a configuration file
    async fn configured_vms(&self) -> CxmResult<Vec<String>> {
        let output = self
            .run(&format!(
                "ls -F {} | grep -v '/'",
                quote_path(self.catalog.dir())
            ))
            .await?;
        Ok(inventory::listed_files(&output))
    }

    /// Compare active LVs with the LVs of running VMs
    pub async fn check_lvs_report(&mut self) -> CxmResult<LvReport> {
        info!("Checking LV activation on {}...", self.hostname);

        let output = self.run("lvs -o vg_name,name,attr --noheading").await?;
        let active = inventory::active_lvs(&output);

        let mut used = BTreeSet::new();
        for vm in self.configured_vms().await? {
            used.extend(self.catalog.lvs(&vm).await?);
        }

        let active_and_used: BTreeSet<String> = active.intersection(&used).cloned().collect();
        debug!("[NODE] {} active_and_used_lvs={:?}", self.hostname, active_and_used);

        let mut running_lvs = BTreeSet::new();
        let mut report = LvReport::default();
        for vm in self.get_vms(false).await? {
            let lvs = self.catalog.lvs(&vm.name).await?;
            let inactive: Vec<String> = lvs
                .iter()
                .filter(|lv| !active_and_used.contains(*lv))
                .cloned()
                .collect();
            if !inactive.is_empty() {
                report.vms_without_lv.push(vm.name.clone());
                report.inactive_lvs.extend(inactive);
            }
            running_lvs.extend(lvs);
        }
        debug!("[NODE] {} running_lvs={:?}", self.hostname, running_lvs);

        report.lvs_without_vm = active_and_used.difference(&running_lvs).cloned().collect();

        if !report.lvs_without_vm.is_empty() {
            warn!(
                "Found activated LV without running VM on {}: {}",
                self.hostname,
                report.lvs_without_vm.join(", ")
            );
        }
        if !report.vms_without_lv.is_empty() {
            warn!(
                "Found running VM without activated LV on {}: {} (inactive: {})",
                self.hostname,
                report.vms_without_lv.join(", "),
                report.inactive_lvs.join(", ")
            );
        }

        Ok(report)
    }

    /// True when LV activation matches the running VMs
    pub async fn check_lvs(&mut self) -> CxmResult<bool> {
        Ok(self.check_lvs_report().await?.is_safe())
    }

    /// Compare autostart links with running VMs
    pub async fn check_autostart_report(&mut self) -> CxmResult<AutostartReport> {
        info!("Checking autostart links on {}...", self.hostname);

        let output = self
            .run(&format!("ls {}", quote_path(&self.config.autostart_dir)))
            .await?;
        let links: BTreeSet<String> = output.trimmed_lines().map(str::to_string).collect();
        let running: BTreeSet<String> = self.get_vms_names(false).await?.into_iter().collect();
        debug!("[NODE] {} links={:?} running_vms={:?}", self.hostname, links, running);

        let report = AutostartReport {
            links_without_vm: links.difference(&running).cloned().collect(),
            vms_without_link: running.difference(&links).cloned().collect(),
        };

        if !report.links_without_vm.is_empty() {
            warn!(
                "Found autostart link without running VM on {}: {}",
                self.hostname,
                report.links_without_vm.join(", ")
            );
        }
        if !report.vms_without_link.is_empty() {
            warn!(
                "Found running VM without autostart link on {}: {}",
                self.hostname,
                report.vms_without_link.join(", ")
            );
        }

        Ok(report)
    }

    pub async fn check_autostart(&mut self) -> CxmResult<bool> {
        Ok(self.check_autostart_report().await?.is_safe())
    }

    // Cluster utilities

    pub async fn get_bridges(&self) -> CxmResult<Vec<String>> {
        let output = self.run("find /sys/class/net/ -maxdepth 2 -name bridge").await?;
        Ok(inventory::bridges(&output))
    }

    pub async fn get_vlans(&self) -> CxmResult<Vec<String>> {
        let output = self.run("cat /proc/net/vlan/config | tail -n +3").await?;
        Ok(inventory::vlans(&output))
    }

    /// VM names whose configuration file starts with `prefix`. Shell globbing
    /// applies; no match is a shell error.
    pub async fn get_possible_vm_names(&self, prefix: &str) -> CxmResult<Vec<String>> {
        let output = self
            .run(&format!("ls {}/{}*", quote_path(self.catalog.dir()), quote(prefix)))
            .await?;
        Ok(output
            .trimmed_lines()
            .filter_map(inventory::vm_name_of_file)
            .collect())
    }

    /// Power off this node through the configured fencing command
    pub async fn fence(&self) -> CxmResult<()> {
        if self.config.disable_fencing {
            return Err(CxmError::fence(&self.hostname, "Fencing disabled by configuration"));
        }

        if self.is_local {
            warn!("Node {} is self-fencing !", self.hostname);
        }

        match self
            .run(&format!("{} {}", self.config.fence_cmd, quote(&self.hostname)))
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.is_shell_error() => Err(CxmError::fence(
                &self.hostname,
                e.shell_message().unwrap_or_default(),
            )),
            Err(e) => Err(e),
        }
    }

    /// True when at least one of `hosts` answers. Failed pings count as
    /// unreachable.
    pub async fn ping(&self, hosts: impl Into<HostList>) -> bool {
        let hosts = hosts.into();
        if hosts.is_empty() {
            return false;
        }

        match self.run(&format!("fping -r1 {} || true", join(hosts.hosts()))).await {
            Ok(output) => output.text().contains("alive"),
            Err(e) => {
                debug!("[NODE] {} -> ping failed: {}", self.hostname, e);
                false
            }
        }
    }

    /// Heartbeat announcing the VMs running on this node
    pub async fn forge_slave_heartbeat(&mut self, ctx: &MessageContext) -> CxmResult<Message> {
        let vms = self.get_vms_names(false).await?;
        Ok(Message::forge_slave_heartbeat(ctx, vms))
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<Node Instance: {}>", self.hostname)
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("hostname", &self.hostname)
            .field("is_local", &self.is_local)
            .field("transport", &self.backends.channel.transport())
            .field("cache", &self.cache)
            .finish()
    }
}
