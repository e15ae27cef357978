//! Parsers for the output of the inventory commands run on a node

use crate::execution::CommandOutput;
use crate::vm::Vm;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

/// Position of the state flag in `lvs` attributes (`-wi-a-----`)
const LV_STATE_FLAG: usize = 4;

/// True when one line of the output equals `name`
pub(crate) fn contains_line(output: &CommandOutput, name: &str) -> bool {
    output.trimmed_lines().any(|line| line == name)
}

/// Bridge names from `find /sys/class/net/ -maxdepth 2 -name bridge`
pub(crate) fn bridges(output: &CommandOutput) -> Vec<String> {
    output
        .trimmed_lines()
        .filter_map(|line| line.split('/').nth(4))
        .map(str::to_string)
        .collect()
}

/// VLAN interfaces from `/proc/net/vlan/config`, headers already skipped
pub(crate) fn vlans(output: &CommandOutput) -> Vec<String> {
    output
        .trimmed_lines()
        .filter_map(|line| line.split_whitespace().next())
        .map(str::to_string)
        .collect()
}

/// Volume groups from `lvdisplay -c`, deduplicated
pub(crate) fn volume_groups(output: &CommandOutput) -> Vec<String> {
    output
        .trimmed_lines()
        .filter_map(|line| line.split(':').nth(1))
        .map(str::to_string)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Physical volumes of each volume group from `pvs -o pv_name,vg_name`
pub(crate) fn volume_group_map(output: &CommandOutput) -> BTreeMap<String, Vec<String>> {
    let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for line in output.trimmed_lines() {
        let mut fields = line.split_whitespace();
        if let (Some(pv), Some(vg)) = (fields.next(), fields.next()) {
            let pv = pv.strip_prefix("/dev/").unwrap_or(pv);
            map.entry(vg.to_string()).or_default().push(pv.to_string());
        }
    }
    map
}

/// Active logical volumes, as `/dev/<vg>/<lv>`, from
/// `lvs -o vg_name,name,attr`
pub(crate) fn active_lvs(output: &CommandOutput) -> BTreeSet<String> {
    output
        .trimmed_lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let (vg, lv, attr) = (fields.next()?, fields.next()?, fields.next()?);
            (attr.chars().nth(LV_STATE_FLAG) == Some('a')).then(|| format!("/dev/{}/{}", vg, lv))
        })
        .collect()
}

/// One `name id ram vcpus` line of `xm list`
pub(crate) fn xm_list_entry(line: &str) -> Option<Vm> {
    let mut fields = line.split_whitespace();
    let name = fields.next()?;
    let id = fields.next()?.parse().ok()?;
    let ram = fields.next()?.parse().ok()?;
    let vcpu = fields.next()?.parse().ok()?;
    Some(Vm::new(name, id, ram, vcpu))
}

/// File names from `ls -F`, with the type markers removed
pub(crate) fn listed_files(output: &CommandOutput) -> Vec<String> {
    output
        .trimmed_lines()
        .map(|line| line.trim_end_matches(['*', '@', '=', '|']))
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

/// VM name of a configuration file path, without a `.cfg` extension
pub(crate) fn vm_name_of_file(path: &str) -> Option<String> {
    let file = Path::new(path).file_name()?.to_str()?;
    Some(file.strip_suffix(".cfg").unwrap_or(file).to_string())
}
