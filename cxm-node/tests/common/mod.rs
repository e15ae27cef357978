//! In-memory backends for driving a Node without hosts

#![allow(dead_code)]

use async_trait::async_trait;
use cxm_core::config::CxmConfig;
use cxm_core::error::{CxmError, CxmResult};
use cxm_node::execution::{CommandOutput, ExecutionChannel, LocalChannel, Transport};
use cxm_node::hypervisor::{
    DomainRecord, HypervisorClient, HypervisorSession, LegacyRpc, PowerState,
};
use cxm_node::vm::{Sxp, VmMetrics};
use cxm_node::Node;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

pub const HOST: &str = "xen1";

#[derive(Debug, Clone)]
enum Reply {
    Output(String),
    Failure(String, i32),
}

#[derive(Debug, Default)]
struct Script {
    replies: HashMap<String, Reply>,
    log: Vec<String>,
    close_fails: bool,
}

/// Execution channel answering commands from a script. Unscripted commands
/// succeed with no output.
#[derive(Debug, Clone, Default)]
pub struct ScriptedChannel {
    script: Arc<Mutex<Script>>,
}

impl ScriptedChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(&self, command: impl Into<String>, stdout: impl Into<String>) {
        let mut script = self.script.lock().unwrap();
        script.replies.insert(command.into(), Reply::Output(stdout.into()));
    }

    pub fn fail(&self, command: impl Into<String>, stderr: impl Into<String>, exitcode: i32) {
        let mut script = self.script.lock().unwrap();
        script
            .replies
            .insert(command.into(), Reply::Failure(stderr.into(), exitcode));
    }

    pub fn fail_on_close(&self) {
        self.script.lock().unwrap().close_fails = true;
    }

    /// Every command run so far, in order
    pub fn log(&self) -> Vec<String> {
        self.script.lock().unwrap().log.clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.log().iter().filter(|c| c.starts_with(prefix)).count()
    }
}

#[async_trait]
impl ExecutionChannel for ScriptedChannel {
    fn hostname(&self) -> &str {
        HOST
    }

    fn transport(&self) -> Transport {
        Transport::Local
    }

    async fn run(&self, command: &str) -> CxmResult<CommandOutput> {
        let mut script = self.script.lock().unwrap();
        script.log.push(command.to_string());
        match script.replies.get(command) {
            Some(Reply::Output(stdout)) => Ok(CommandOutput::new(stdout.clone())),
            Some(Reply::Failure(stderr, exitcode)) => {
                Err(CxmError::shell(HOST, stderr.clone(), *exitcode))
            }
            None => Ok(CommandOutput::default()),
        }
    }

    async fn close(&self) -> CxmResult<()> {
        if self.script.lock().unwrap().close_fails {
            return Err(CxmError::ssh(HOST, "broken pipe", 255));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Hypervisor {
    domains: Vec<DomainRecord>,
    metrics: HashMap<String, VmMetrics>,
    calls: Vec<String>,
    /// Power state queries each stopping VM survives, `None` for a VM that
    /// never stops
    halt_after: HashMap<String, Option<u32>>,
    shutdown_delay: Option<u32>,
    logout_fails: bool,
}

/// Xen-API session over an in-memory domain table
#[derive(Debug, Clone, Default)]
pub struct FakeSession {
    state: Arc<Mutex<Hypervisor>>,
}

impl FakeSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a domain. Its metrics report `ram_mb` megabytes and `vcpus` vCPUs.
    pub fn add_vm(&self, name: &str, domid: i64, power_state: PowerState, ram_mb: u64, vcpus: u32) {
        let mut state = self.state.lock().unwrap();
        let reference = format!("OpaqueRef:vm-{}", name);
        let metrics = format!("OpaqueRef:metrics-{}", name);
        state.metrics.insert(
            metrics.clone(),
            VmMetrics {
                memory_actual: ram_mb * 1024 * 1024,
                vcpus_number: vcpus,
            },
        );
        state.domains.push(DomainRecord {
            reference,
            name_label: name.to_string(),
            domid,
            power_state,
            metrics,
        });
    }

    pub fn running(&self, name: &str) {
        self.add_vm(name, 1, PowerState::Running, 512, 1);
    }

    /// VMs go down after answering `Running` to `polls` state queries.
    /// `None` makes them hang forever.
    pub fn set_shutdown_delay(&self, polls: Option<u32>) {
        self.state.lock().unwrap().shutdown_delay = polls;
    }

    pub fn fail_on_logout(&self) {
        self.state.lock().unwrap().logout_fails = true;
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn count(&self, method: &str) -> usize {
        self.calls().iter().filter(|c| c.as_str() == method).count()
    }

    fn record(&self, method: &str) {
        self.state.lock().unwrap().calls.push(method.to_string());
    }

    fn request_stop(&self, vm: &str) {
        let mut state = self.state.lock().unwrap();
        let delay = state.shutdown_delay;
        state.halt_after.insert(vm.to_string(), delay);
    }
}

fn unknown(operation: &str, reference: &str) -> CxmError {
    CxmError::Hypervisor {
        node: HOST.to_string(),
        operation: operation.to_string(),
        details: format!("HANDLE_INVALID, {}", reference),
    }
}

#[async_trait]
impl HypervisorSession for FakeSession {
    async fn vm_by_name(&self, name: &str) -> CxmResult<Option<String>> {
        self.record("VM.get_by_name_label");
        let state = self.state.lock().unwrap();
        Ok(state
            .domains
            .iter()
            .find(|d| d.name_label == name)
            .map(|d| d.reference.clone()))
    }

    async fn power_state(&self, vm: &str) -> CxmResult<PowerState> {
        self.record("VM.get_power_state");
        let mut state = self.state.lock().unwrap();

        let halt_now = match state.halt_after.get_mut(vm) {
            Some(Some(0)) => true,
            Some(Some(remaining)) => {
                *remaining -= 1;
                false
            }
            _ => false,
        };
        if halt_now {
            state.halt_after.remove(vm);
            if let Some(domain) = state.domains.iter_mut().find(|d| d.reference == vm) {
                domain.power_state = PowerState::Halted;
            }
        }

        state
            .domains
            .iter()
            .find(|d| d.reference == vm)
            .map(|d| d.power_state)
            .ok_or_else(|| unknown("VM.get_power_state", vm))
    }

    async fn vm_record(&self, vm: &str) -> CxmResult<DomainRecord> {
        self.record("VM.get_record");
        let state = self.state.lock().unwrap();
        state
            .domains
            .iter()
            .find(|d| d.reference == vm)
            .cloned()
            .ok_or_else(|| unknown("VM.get_record", vm))
    }

    async fn vm_metrics(&self, metrics: &str) -> CxmResult<VmMetrics> {
        self.record("VM_metrics.get_record");
        let state = self.state.lock().unwrap();
        state
            .metrics
            .get(metrics)
            .cloned()
            .ok_or_else(|| unknown("VM_metrics.get_record", metrics))
    }

    async fn all_vm_records(&self) -> CxmResult<Vec<DomainRecord>> {
        self.record("VM.get_all_records");
        Ok(self.state.lock().unwrap().domains.clone())
    }

    async fn all_vm_metrics(&self) -> CxmResult<HashMap<String, VmMetrics>> {
        self.record("VM_metrics.get_all_records");
        Ok(self.state.lock().unwrap().metrics.clone())
    }

    async fn clean_shutdown(&self, vm: &str) -> CxmResult<()> {
        self.record("VM.clean_shutdown");
        self.request_stop(vm);
        Ok(())
    }

    async fn hard_shutdown(&self, vm: &str) -> CxmResult<()> {
        self.record("VM.hard_shutdown");
        self.request_stop(vm);
        Ok(())
    }

    async fn migrate(&self, vm: &str, destination: &str) -> CxmResult<()> {
        self.record(&format!("VM.migrate {} {}", vm, destination));
        Ok(())
    }

    async fn logout(&self) -> CxmResult<()> {
        self.record("session.logout");
        if self.state.lock().unwrap().logout_fails {
            return Err(unknown("session.logout", "session"));
        }
        Ok(())
    }
}

/// Legacy interface recording the domains it creates
#[derive(Debug, Clone, Default)]
pub struct FakeLegacy {
    pub created: Arc<Mutex<Vec<Sxp>>>,
    pub unpaused: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl LegacyRpc for FakeLegacy {
    async fn domain_create(&self, description: &Sxp) -> CxmResult<()> {
        self.created.lock().unwrap().push(description.clone());
        Ok(())
    }

    async fn domain_unpause(&self, domain: &str) -> CxmResult<()> {
        self.unpaused.lock().unwrap().push(domain.to_string());
        Ok(())
    }
}

/// A node over scripted backends, with a scratch VM configuration directory
pub struct Fixture {
    pub dir: TempDir,
    pub channel: ScriptedChannel,
    pub session: FakeSession,
    pub legacy: FakeLegacy,
    pub legacy_created: Arc<AtomicU32>,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("vm")).unwrap();
        std::fs::create_dir_all(dir.path().join("auto")).unwrap();

        Self {
            dir,
            channel: ScriptedChannel::new(),
            session: FakeSession::new(),
            legacy: FakeLegacy::default(),
            legacy_created: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn config(&self) -> CxmConfig {
        CxmConfig::test(self.dir.path())
    }

    /// Write the configuration file of `name` with one `phy:` disk per LV
    pub fn configure_vm(&self, name: &str, lvs: &[&str]) {
        let disks: Vec<String> = lvs
            .iter()
            .enumerate()
            .map(|(i, lv)| format!("'phy:{},xvda{},w'", lv, i + 1))
            .collect();
        let content = format!(
            "name = \"{}\"\nmemory = 512\nvcpus = 1\ndisk = [ {} ]\n",
            name,
            disks.join(", ")
        );
        std::fs::write(self.dir.path().join("vm").join(name), content).unwrap();
    }

    pub fn vm_dir(&self) -> String {
        self.dir.path().join("vm").display().to_string()
    }

    pub fn auto_dir(&self) -> String {
        self.dir.path().join("auto").display().to_string()
    }

    /// Script the listing of configured VMs
    pub fn list_configured(&self, names: &[&str]) {
        self.channel.reply(
            format!("ls -F {} | grep -v '/'", self.vm_dir()),
            names.iter().map(|n| format!("{}\n", n)).collect::<String>(),
        );
    }

    pub fn node(&self) -> Node {
        self.node_with(self.config())
    }

    pub fn node_with(&self, config: CxmConfig) -> Node {
        self.assemble(config, Box::new(self.channel.clone()))
    }

    /// A node running its commands through the local shell
    pub fn local_node_with(&self, config: CxmConfig) -> Node {
        self.assemble(config, Box::new(LocalChannel::new(HOST, None)))
    }

    fn assemble(&self, config: CxmConfig, channel: Box<dyn ExecutionChannel>) -> Node {
        let legacy = self.legacy.clone();
        let created = self.legacy_created.clone();
        let hypervisor = HypervisorClient::new(
            HOST,
            Box::new(self.session.clone()),
            Box::new(move || -> CxmResult<Box<dyn LegacyRpc>> {
                created.fetch_add(1, Ordering::SeqCst);
                Ok(Box::new(legacy.clone()))
            }),
        );

        Node::from_parts(
            HOST,
            false,
            Arc::new(config),
            channel,
            hypervisor,
        )
    }
}
