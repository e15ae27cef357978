mod common;

use common::{Fixture, HOST};
use cxm_core::error::CxmError;
use cxm_core::messages::{MessageContext, MessageHelper, Payload};
use cxm_core::resolver::StaticResolver;
use cxm_node::hypervisor::PowerState;
use cxm_node::vm::Vm;
use pretty_assertions::assert_eq;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

const LVDISPLAY_WEB1: &str = "  /dev/vgA/web1:vgA:3:1:1:0:20971520:2560:-1:0:-1:253:3\n";

fn web1_fixture() -> Fixture {
    let fixture = Fixture::new();
    fixture.configure_vm("web1", &["/dev/vgA/web1"]);
    fixture
        .channel
        .reply("lvdisplay -c /dev/vgA/web1", LVDISPLAY_WEB1);
    fixture
}

#[tokio::test]
async fn test_deactivate_refuses_running_vm() {
    let fixture = web1_fixture();
    fixture.session.running("web1");
    let mut node = fixture.node();

    let err = node.deactivate_lv("web1").await.unwrap_err();

    assert!(matches!(&err, CxmError::RunningVm { node, vm } if node == HOST && vm == "web1"));
    assert_eq!(fixture.channel.count("lvchange"), 0);
    assert_eq!(fixture.channel.count("lvdisplay"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_activate_then_deactivate_stopped_vm() {
    let fixture = web1_fixture();
    let mut node = fixture.node();

    node.activate_lv("web1").await.unwrap();
    assert!(!node.is_vm_started("web1").await.unwrap());
    node.deactivate_lv("web1").await.unwrap();

    // second refresh falls inside the grace window
    assert_eq!(
        fixture.channel.log(),
        vec![
            "lvdisplay -c /dev/vgA/web1",
            "lvchange --refresh vgA",
            "lvchange -aly /dev/vgA/web1",
            "lvdisplay -c /dev/vgA/web1",
            "lvchange -aln /dev/vgA/web1",
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_refresh_is_throttled() {
    let fixture = Fixture::new();
    let mut node = fixture.node();
    let vgs = vec!["vgA".to_string(), "vgB".to_string()];

    node.refresh_lvm(&vgs).await.unwrap();
    tokio::time::advance(Duration::from_secs(30)).await;
    node.refresh_lvm(&vgs).await.unwrap();
    assert_eq!(fixture.channel.count("lvchange --refresh vgA vgB"), 1);

    tokio::time::advance(Duration::from_secs(31)).await;
    node.refresh_lvm(&vgs).await.unwrap();
    assert_eq!(fixture.channel.count("lvchange --refresh vgA vgB"), 2);
}

#[tokio::test]
async fn test_refresh_disabled_by_configuration() {
    let fixture = Fixture::new();
    let mut config = fixture.config();
    config.no_refresh = true;
    let mut node = fixture.node_with(config);

    node.refresh_lvm(&["vgA".to_string()]).await.unwrap();
    node.refresh_lvm(&[]).await.unwrap();
    assert!(fixture.channel.log().is_empty());
}

#[tokio::test]
async fn test_failed_refresh_is_not_throttled() {
    let fixture = Fixture::new();
    fixture
        .channel
        .fail("lvchange --refresh vgA", "  Volume group \"vgA\" not found", 5);
    let mut node = fixture.node();
    let vgs = vec!["vgA".to_string()];

    let err = node.refresh_lvm(&vgs).await.unwrap_err();
    assert_eq!(err.exit_code(), Some(5));

    fixture.channel.reply("lvchange --refresh vgA", "");
    node.refresh_lvm(&vgs).await.unwrap();
    assert_eq!(fixture.channel.count("lvchange --refresh"), 2);
}

#[tokio::test]
async fn test_vm_without_volumes_skips_lvm() {
    let fixture = Fixture::new();
    fixture.configure_vm("pxe", &[]);
    let mut node = fixture.node();

    node.activate_lv("pxe").await.unwrap();
    node.deactivate_lv("pxe").await.unwrap();
    assert!(fixture.channel.log().is_empty());
}

#[tokio::test]
async fn test_check_lvs_reports_discrepancies() {
    let fixture = Fixture::new();
    fixture.configure_vm("web1", &["/dev/vgA/web1"]);
    fixture.configure_vm("db1", &["/dev/vgA/db1"]);
    fixture.configure_vm("mail", &["/dev/vgB/mail"]);
    fixture.list_configured(&["web1", "db1", "mail"]);
    fixture.channel.reply(
        "lvs -o vg_name,name,attr --noheading",
        "  vgA   web1 -wi-ao----\n  vgA   db1  -wi-a-----\n  vgB   mail -wi-------\n  vgSys root -wi-ao----\n",
    );
    fixture.session.running("web1");
    fixture.session.running("mail");
    let mut node = fixture.node();

    let report = node.check_lvs_report().await.unwrap();

    assert_eq!(report.lvs_without_vm, vec!["/dev/vgA/db1"]);
    assert_eq!(report.vms_without_lv, vec!["mail"]);
    assert_eq!(report.inactive_lvs, vec!["/dev/vgB/mail"]);
    assert!(!report.is_safe());
    assert!(!node.check_lvs().await.unwrap());
}

#[tokio::test]
async fn test_check_lvs_safe_node() {
    let fixture = Fixture::new();
    fixture.configure_vm("web1", &["/dev/vgA/web1"]);
    fixture.configure_vm("db1", &["/dev/vgA/db1"]);
    fixture.list_configured(&["web1", "db1"]);
    fixture.channel.reply(
        "lvs -o vg_name,name,attr --noheading",
        "  vgA web1 -wi-ao----\n  vgA db1 -wi-------\n",
    );
    fixture.session.running("web1");
    let mut node = fixture.node();

    assert!(node.check_lvs().await.unwrap());
}

#[tokio::test]
async fn test_check_autostart() {
    let fixture = Fixture::new();
    fixture
        .channel
        .reply(format!("ls {}", fixture.auto_dir()), "web1\nold\n");
    fixture.session.running("web1");
    fixture.session.running("mail");
    let mut node = fixture.node();

    let report = node.check_autostart_report().await.unwrap();
    assert_eq!(report.links_without_vm, vec!["old"]);
    assert_eq!(report.vms_without_link, vec!["mail"]);
    assert!(!node.check_autostart().await.unwrap());

    assert!(node.is_vm_autostart_enabled("web1").await.unwrap());
    assert!(!node.is_vm_autostart_enabled("mail").await.unwrap());
}

#[tokio::test]
async fn test_deactivate_all_lv_skips_running_vms() {
    let fixture = Fixture::new();
    fixture.configure_vm("web1", &["/dev/vgA/web1"]);
    fixture.configure_vm("db1", &["/dev/vgA/db1"]);
    fixture.list_configured(&["web1", "db1"]);
    fixture
        .channel
        .reply("lvdisplay -c /dev/vgA/db1", "  /dev/vgA/db1:vgA:3:1:1:0:2097152:256:-1:0:-1:253:4\n");
    fixture.session.running("web1");
    let mut node = fixture.node();

    node.deactivate_all_lv().await.unwrap();

    assert_eq!(fixture.channel.count("lvchange -aln /dev/vgA/db1"), 1);
    assert_eq!(fixture.channel.count("lvchange -aln /dev/vgA/web1"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_get_vms_is_cached() {
    let fixture = Fixture::new();
    fixture.session.add_vm("Domain-0", 0, PowerState::Running, 1024, 4);
    fixture.session.add_vm("web1", 3, PowerState::Running, 512, 2);
    fixture.session.add_vm("migrating-web2", 4, PowerState::Paused, 256, 1);
    fixture.session.add_vm("db1", -1, PowerState::Halted, 2048, 2);
    let mut node = fixture.node();

    let vms = node.get_vms(false).await.unwrap();
    assert_eq!(vms.len(), 1);
    assert_eq!(vms[0].name, "web1");
    assert_eq!(vms[0].id, 3);
    assert_eq!(vms[0].ram, 512);
    assert_eq!(vms[0].vcpu, 2);

    node.get_vms(false).await.unwrap();
    assert_eq!(fixture.session.count("VM.get_all_records"), 1);

    node.get_vms(true).await.unwrap();
    assert_eq!(fixture.session.count("VM.get_all_records"), 2);

    tokio::time::advance(Duration::from_secs(6)).await;
    node.get_vms(false).await.unwrap();
    assert_eq!(fixture.session.count("VM.get_all_records"), 3);
}

#[tokio::test(start_paused = true)]
async fn test_vm_names_and_count() {
    let fixture = Fixture::new();
    fixture.session.add_vm("Domain-0", 0, PowerState::Running, 1024, 4);
    fixture.session.running("web1");
    fixture.session.running("mail");
    let mut node = fixture.node();

    assert_eq!(node.get_vms_names(false).await.unwrap(), vec!["web1", "mail"]);
    assert_eq!(node.get_vm_started(false).await.unwrap(), 2);
    // names and count share one cached listing
    assert_eq!(fixture.session.count("VM.get_all_records"), 1);
}

#[tokio::test]
async fn test_get_vm() {
    let fixture = Fixture::new();
    fixture.session.add_vm("web1", 7, PowerState::Running, 1024, 2);
    fixture.session.add_vm("db1", -1, PowerState::Halted, 1024, 2);
    let node = fixture.node();

    let vm = node.get_vm("web1").await.unwrap();
    assert_eq!((vm.name.as_str(), vm.id, vm.ram, vm.vcpu), ("web1", 7, 1024, 2));
    assert!(vm.metrics.is_some());

    assert!(matches!(
        node.get_vm("db1").await,
        Err(CxmError::NotRunningVm { .. })
    ));
    assert!(matches!(
        node.get_vm("ghost").await,
        Err(CxmError::NotRunningVm { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_waits_then_deactivates() {
    let fixture = web1_fixture();
    fixture.session.running("web1");
    fixture.session.set_shutdown_delay(Some(3));
    let mut node = fixture.node();

    node.shutdown("web1", true).await.unwrap();

    assert_eq!(fixture.session.count("VM.clean_shutdown"), 1);
    assert_eq!(fixture.session.count("VM.hard_shutdown"), 0);
    assert_eq!(fixture.channel.count("lvchange -aln /dev/vgA/web1"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_of_stuck_vm_keeps_volumes() {
    let fixture = web1_fixture();
    fixture.session.running("web1");
    fixture.session.set_shutdown_delay(None);
    let mut node = fixture.node();

    let started = tokio::time::Instant::now();
    let err = node.shutdown("web1", false).await.unwrap_err();

    assert!(matches!(err, CxmError::RunningVm { .. }));
    assert_eq!(fixture.session.count("VM.hard_shutdown"), 1);
    assert_eq!(fixture.channel.count("lvchange"), 0);
    // one initial wait plus one per check
    assert!(started.elapsed() >= Duration::from_secs(51));
}

#[tokio::test]
async fn test_shutdown_of_stopped_vm() {
    let fixture = web1_fixture();
    let mut node = fixture.node();

    assert!(matches!(
        node.shutdown("web1", true).await,
        Err(CxmError::NotRunningVm { .. })
    ));
    assert_eq!(fixture.session.count("VM.clean_shutdown"), 0);
}

#[tokio::test]
async fn test_start_vm_uses_legacy_interface_once_created() {
    let fixture = web1_fixture();
    fixture.configure_vm("db1", &["/dev/vgA/db1"]);
    let node = fixture.node();

    assert_eq!(fixture.legacy_created.load(Ordering::SeqCst), 0);
    node.start_vm("web1").await.unwrap();
    node.start_vm("db1").await.unwrap();

    assert_eq!(fixture.legacy_created.load(Ordering::SeqCst), 1);
    let created = fixture.legacy.created.lock().unwrap().clone();
    assert_eq!(created.len(), 2);
    assert_eq!(created[0].child_value("name"), Some("web1"));
    assert_eq!(created[0].child_value("memory"), Some("512"));
    assert_eq!(
        *fixture.legacy.unpaused.lock().unwrap(),
        vec!["web1".to_string(), "db1".to_string()]
    );
    assert!(fixture.channel.log().is_empty());
}

#[tokio::test]
async fn test_migrate() {
    let fixture = Fixture::new();
    fixture.session.running("web1");
    let node = fixture.node();
    let other = Fixture::new();
    let destination = other.node();

    node.migrate("web1", &destination).await.unwrap();
    assert!(fixture
        .session
        .calls()
        .contains(&"VM.migrate OpaqueRef:vm-web1 xen1".to_string()));

    assert!(matches!(
        node.migrate("ghost", &destination).await,
        Err(CxmError::NotRunningVm { .. })
    ));
}

#[tokio::test]
async fn test_shell_mode_queries() {
    let fixture = Fixture::new();
    let mut config = fixture.config();
    config.use_ssh = true;
    fixture
        .channel
        .reply("xm list | awk '{print $1;}'", "Name\nDomain-0\nweb1\n");
    fixture.channel.reply(
        "xm list | awk '{print $1,$2,$3,$4;}' | tail -n +3",
        "web1 3 512 2\nmigrating-db1 4 256 1\n",
    );
    fixture
        .channel
        .reply("xenstore-list /local/domain | wc -l", "3\n");
    fixture
        .channel
        .reply("xm list | awk -v name=web1 '$1 == name {print $1,$2,$3,$4;}'", "web1 3 512 2\n");
    let mut node = fixture.node_with(config);

    assert!(node.is_vm_started("web1").await.unwrap());
    assert!(!node.is_vm_started("db1").await.unwrap());
    assert_eq!(node.get_vms(false).await.unwrap(), vec![Vm::new("web1", 3, 512, 2)]);
    assert_eq!(node.get_vm_started(false).await.unwrap(), 2);
    assert_eq!(node.get_vm("web1").await.unwrap(), Vm::new("web1", 3, 512, 2));
    assert!(matches!(
        node.get_vm("db1").await,
        Err(CxmError::NotRunningVm { .. })
    ));
    assert!(fixture.session.calls().is_empty());
}

#[tokio::test]
async fn test_shell_mode_lifecycle_commands() {
    let fixture = Fixture::new();
    let mut config = fixture.config();
    config.use_ssh = true;
    fixture
        .channel
        .reply("xm list | awk '{print $1;}'", "Name\nDomain-0\nweb1\n");
    let node = fixture.node_with(config);
    let destination = Fixture::new().node();

    node.start_vm("web1").await.unwrap();
    node.migrate("web1", &destination).await.unwrap();

    let log = fixture.channel.log();
    assert_eq!(log[0], format!("xm create {}/web1", fixture.vm_dir()));
    assert_eq!(log[1], "xm migrate -l web1 xen1");
    assert_eq!(fixture.legacy_created.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_shell_mode_unreadable_domain_count() {
    let fixture = Fixture::new();
    let mut config = fixture.config();
    config.use_ssh = true;
    fixture
        .channel
        .reply("xenstore-list /local/domain | wc -l", "xenstore: permission denied\n");
    let mut node = fixture.node_with(config);

    let err = node.get_vm_started(false).await.unwrap_err();
    match &err {
        CxmError::UnexpectedOutput { node, command, output } => {
            assert_eq!(node, HOST);
            assert_eq!(command, "xenstore-list /local/domain | wc -l");
            assert_eq!(output, "xenstore: permission denied");
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert_eq!(err.exit_code(), None);
}

#[tokio::test(start_paused = true)]
async fn test_shell_arguments_are_quoted() {
    let fixture = Fixture::new();
    let mut config = fixture.config();
    config.use_ssh = true;
    fixture
        .channel
        .reply("xm list | awk '{print $1;}'", "Name\nDomain-0\nit's web\n");
    let mut node = fixture.node_with(config);

    node.get_vm("it's web").await.unwrap_err();
    // stays up, so the volumes are kept
    node.shutdown("it's web", true).await.unwrap_err();
    node.disable_vm_autostart("a b").await.unwrap();

    let words = |command: &String| shell_words::split(command).unwrap();
    let log = fixture.channel.log();
    assert_eq!(
        words(&log[0]),
        vec!["xm", "list", "|", "awk", "-v", "name=it's web", "$1 == name {print $1,$2,$3,$4;}"]
    );
    assert!(log
        .iter()
        .any(|command| words(command) == vec!["xm", "shutdown", "it's web"]));
    assert_eq!(
        words(log.last().unwrap()),
        vec!["rm".to_string(), "-f".to_string(), format!("{}/a b", fixture.auto_dir())]
    );
}

#[tokio::test]
async fn test_local_shell_handles_unusual_names() {
    let fixture = Fixture::new();
    let mut config = fixture.config();
    config.autostart_dir = fixture.dir.path().join("auto links");
    std::fs::create_dir_all(&config.autostart_dir).unwrap();
    std::fs::write(fixture.dir.path().join("vm").join("it's web"), "memory = 256\n").unwrap();
    let node = fixture.local_node_with(config);

    assert_eq!(
        node.get_possible_vm_names("it's").await.unwrap(),
        vec!["it's web".to_string()]
    );

    node.enable_vm_autostart("it's web").await.unwrap();
    assert!(node.is_vm_autostart_enabled("it's web").await.unwrap());
    node.disable_vm_autostart("it's web").await.unwrap();
    assert!(!node.is_vm_autostart_enabled("it's web").await.unwrap());
}

#[tokio::test]
async fn test_autostart_links() {
    let fixture = Fixture::new();
    let node = fixture.node();

    node.enable_vm_autostart("web1").await.unwrap();
    node.disable_vm_autostart("web1").await.unwrap();

    let auto = fixture.auto_dir();
    assert_eq!(
        fixture.channel.log(),
        vec![
            format!(
                "test -L {}/web1 || ln -s {}/web1 {}/",
                auto,
                fixture.vm_dir(),
                auto
            ),
            format!("rm -f {}/web1", auto),
        ]
    );
}

#[tokio::test]
async fn test_fence_disabled() {
    let fixture = Fixture::new();
    let mut config = fixture.config();
    config.disable_fencing = true;
    let node = fixture.node_with(config);

    let err = node.fence().await.unwrap_err();
    assert!(matches!(err, CxmError::FenceNode { .. }));
    assert!(err.to_string().contains("Fencing disabled by configuration"));
    assert!(fixture.channel.log().is_empty());
}

#[tokio::test]
async fn test_fence_failure_is_wrapped() {
    let fixture = Fixture::new();
    let node = fixture.node();
    let command = format!("{} {}", node.config().fence_cmd, HOST);

    node.fence().await.unwrap();
    assert_eq!(fixture.channel.log(), vec![command.clone()]);

    fixture.channel.fail(command, "ipmi: timeout", 1);
    match node.fence().await {
        Err(CxmError::FenceNode { node, details }) => {
            assert_eq!(node, HOST);
            assert_eq!(details, "ipmi: timeout");
        }
        other => panic!("unexpected result {:?}", other),
    }
}

#[tokio::test]
async fn test_ping() {
    let fixture = Fixture::new();
    fixture.channel.reply(
        "fping -r1 xen2 xen3 || true",
        "xen2 is alive\nxen3 is unreachable\n",
    );
    fixture
        .channel
        .reply("fping -r1 xen3 || true", "xen3 is unreachable\n");
    fixture
        .channel
        .fail("fping -r1 xen4 || true", "fping: command not found", 127);
    let node = fixture.node();

    assert!(node.ping(vec!["xen2", "xen3"]).await);
    assert!(!node.ping("xen3").await);
    assert!(!node.ping("xen4".to_string()).await);
    assert!(!node.ping(Vec::<String>::new()).await);
}

#[tokio::test]
async fn test_inventory_queries() {
    let fixture = Fixture::new();
    fixture.channel.reply(
        "find /sys/class/net/ -maxdepth 2 -name bridge",
        "/sys/class/net/xenbr0/bridge\n/sys/class/net/xenbr1/bridge\n",
    );
    fixture.channel.reply(
        "cat /proc/net/vlan/config | tail -n +3",
        "eth0.10        | 10  | eth0\n",
    );
    fixture.channel.reply(
        "pvs -o pv_name,vg_name --noheading",
        "  /dev/sdb vgA\n  /dev/sdc vgA\n",
    );
    fixture.channel.reply(
        format!("ls {}/web*", fixture.vm_dir()),
        format!("{0}/web1\n{0}/web2.cfg\n", fixture.vm_dir()),
    );
    fixture.channel.fail(
        format!("ls {}/zz*", fixture.vm_dir()),
        "ls: cannot access: No such file or directory",
        2,
    );
    let node = fixture.node();

    assert_eq!(node.get_bridges().await.unwrap(), vec!["xenbr0", "xenbr1"]);
    assert_eq!(node.get_vlans().await.unwrap(), vec!["eth0.10"]);
    assert_eq!(node.get_vgs_map().await.unwrap()["vgA"], vec!["sdb", "sdc"]);
    assert_eq!(node.get_vgs(&[]).await.unwrap(), Vec::<String>::new());
    assert_eq!(
        node.get_possible_vm_names("web").await.unwrap(),
        vec!["web1", "web2"]
    );

    let err = node.get_possible_vm_names("zz").await.unwrap_err();
    assert!(err.is_shell_error());
    assert_eq!(err.exit_code(), Some(2));
}

#[tokio::test]
async fn test_forge_slave_heartbeat() {
    let fixture = Fixture::new();
    fixture.session.running("web1");
    fixture.session.running("db1");
    let mut node = fixture.node();
    let ctx = MessageContext::new("test", Arc::new(StaticResolver::new(HOST)));

    let message = node.forge_slave_heartbeat(&ctx).await.unwrap();
    assert_eq!(message.node, HOST);

    let parsed = MessageHelper::get(&ctx, &message.value(), Some("xen1"))
        .unwrap()
        .into_message()
        .unwrap();
    match parsed.payload {
        Payload::SlaveHeartbeat(hb) => assert_eq!(hb.vms, vec!["web1", "db1"]),
        other => panic!("unexpected payload {:?}", other),
    }

    let foreign = MessageContext::new("other", Arc::new(StaticResolver::new("xen9")));
    assert!(MessageHelper::get(&foreign, &message.value(), Some("xen1"))
        .unwrap()
        .into_message()
        .is_none());
}

#[tokio::test]
async fn test_disconnect_swallows_close_errors() {
    let fixture = Fixture::new();
    fixture.channel.fail_on_close();
    fixture.session.fail_on_logout();
    let node = fixture.node();

    node.disconnect().await;
    assert_eq!(fixture.session.count("session.logout"), 1);
}

#[tokio::test]
async fn test_node_display() {
    let fixture = Fixture::new();
    let node = fixture.node();
    assert_eq!(node.to_string(), "<Node Instance: xen1>");
    assert_eq!(node.hostname(), HOST);
    assert_eq!(node.hypervisor().hostname(), HOST);
    assert!(!node.is_local_node());
}
