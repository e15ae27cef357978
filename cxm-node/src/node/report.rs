use std::fmt;

/// Discrepancies between LV activation and running VMs on one node
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LvReport {
    /// Active LVs of configured VMs that are not running here
    pub lvs_without_vm: Vec<String>,
    /// Running VMs with at least one inactive LV
    pub vms_without_lv: Vec<String>,
    /// The inactive LVs of those VMs
    pub inactive_lvs: Vec<String>,
}

impl LvReport {
    pub fn is_safe(&self) -> bool {
        self.lvs_without_vm.is_empty() && self.vms_without_lv.is_empty()
    }
}

/// Discrepancies between autostart links and running VMs on one node
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AutostartReport {
    pub links_without_vm: Vec<String>,
    pub vms_without_link: Vec<String>,
}

impl AutostartReport {
    pub fn is_safe(&self) -> bool {
        self.links_without_vm.is_empty() && self.vms_without_link.is_empty()
    }
}

/// One or several hosts to ping
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostList(Vec<String>);

impl HostList {
    pub fn hosts(&self) -> &[String] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for HostList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join(" "))
    }
}

impl From<&str> for HostList {
    fn from(host: &str) -> Self {
        HostList(vec![host.to_string()])
    }
}

impl From<String> for HostList {
    fn from(host: String) -> Self {
        HostList(vec![host])
    }
}

impl From<Vec<String>> for HostList {
    fn from(hosts: Vec<String>) -> Self {
        HostList(hosts)
    }
}

impl From<Vec<&str>> for HostList {
    fn from(hosts: Vec<&str>) -> Self {
        HostList(hosts.into_iter().map(str::to_string).collect())
    }
}

impl From<&[&str]> for HostList {
    fn from(hosts: &[&str]) -> Self {
        HostList(hosts.iter().map(|h| h.to_string()).collect())
    }
}

impl From<&[String]> for HostList {
    fn from(hosts: &[String]) -> Self {
        HostList(hosts.to_vec())
    }
}
