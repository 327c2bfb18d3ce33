//! Guest configuration for create requests.

use crate::error::{LifecycleError, Result};
use crate::proxmox::{ProxmoxClient, ResourceKind, ResourceRef};
use serde_json::{json, Map, Value};

const PREFERRED_STORAGE: &str = "local-lvm";

fn str_arg<'a>(args: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    args.get(key).and_then(|v| v.as_str())
}

fn int_arg(args: &Map<String, Value>, key: &str, default: i64) -> i64 {
    args.get(key).and_then(|v| v.as_i64()).unwrap_or(default)
}

/// Content type a storage must offer to hold the guest's root disk.
fn disk_content(kind: ResourceKind) -> &'static str {
    match kind {
        ResourceKind::Vm => "images",
        ResourceKind::Container => "rootdir",
    }
}

fn offers(storage: &Value, content: &str) -> bool {
    storage
        .get("content")
        .and_then(|c| c.as_str())
        .map(|c| c.split(',').any(|t| t.trim() == content))
        .unwrap_or(false)
}

fn is_active(storage: &Value) -> bool {
    // Missing flags mean the node did not report them; treat as usable.
    let flag = |key: &str| storage.get(key).and_then(|v| v.as_i64()).unwrap_or(1) != 0;
    flag("active") && flag("enabled")
}

fn storage_name(storage: &Value) -> Option<&str> {
    storage.get("storage").and_then(|s| s.as_str())
}

/// Pick the storage for the root disk: the requested one if it fits, otherwise
/// `local-lvm`, otherwise the first active storage with the right content type.
pub fn pick_storage(
    storages: &[Value],
    kind: ResourceKind,
    requested: Option<&str>,
) -> std::result::Result<String, String> {
    let content = disk_content(kind);

    if let Some(name) = requested {
        let found = storages
            .iter()
            .find(|s| storage_name(s) == Some(name))
            .ok_or_else(|| format!("storage '{}' not found on node", name))?;
        if !offers(found, content) {
            return Err(format!("storage '{}' does not support '{}' content", name, content));
        }
        return Ok(name.to_string());
    }

    let usable: Vec<&Value> = storages
        .iter()
        .filter(|s| offers(s, content) && is_active(s))
        .collect();

    usable
        .iter()
        .find(|s| storage_name(s) == Some(PREFERRED_STORAGE))
        .or_else(|| usable.first())
        .and_then(|s| storage_name(s))
        .map(str::to_string)
        .ok_or_else(|| format!("no storage on node supports '{}' content", content))
}

pub async fn resolve_storage(
    client: &ProxmoxClient,
    target: &ResourceRef,
    requested: Option<&str>,
) -> Result<String> {
    let storages = client
        .get_storage_list(&target.node)
        .await
        .map_err(|e| LifecycleError::from(e).with_context("listing storage for create"))?;
    pick_storage(&storages, target.kind, requested).map_err(|message| {
        LifecycleError::Precondition {
            target: target.clone(),
            operation: super::Operation::Create,
            message,
        }
    })
}

pub fn vm_config(vmid: i64, storage: &str, args: &Map<String, Value>) -> Value {
    let bridge = str_arg(args, "bridge").unwrap_or("vmbr0");
    let mut config = json!({
        "vmid": vmid,
        "name": str_arg(args, "name").unwrap_or("vm"),
        "cores": int_arg(args, "cores", 1),
        "sockets": int_arg(args, "sockets", 1),
        "memory": int_arg(args, "memory", 2048),
        "ostype": str_arg(args, "ostype").unwrap_or("l26"),
        "scsihw": "virtio-scsi-pci",
        "scsi0": format!("{}:{}", storage, int_arg(args, "disk_size", 10)),
        "net0": format!("virtio,bridge={}", bridge),
        "boot": "order=scsi0",
    });
    if let Some(iso) = str_arg(args, "iso") {
        config["ide2"] = json!(format!("{},media=cdrom", iso));
        config["boot"] = json!("order=scsi0;ide2");
    }
    config
}

pub fn container_config(vmid: i64, storage: &str, args: &Map<String, Value>) -> Value {
    let bridge = str_arg(args, "bridge").unwrap_or("vmbr0");
    let ip = str_arg(args, "ip_address").unwrap_or("dhcp");
    let hostname = str_arg(args, "hostname")
        .map(str::to_string)
        .unwrap_or_else(|| format!("ct-{}", vmid));
    let unprivileged = args
        .get("unprivileged")
        .and_then(|v| v.as_bool())
        .unwrap_or(true);

    let mut config = json!({
        "vmid": vmid,
        "hostname": hostname,
        "ostemplate": str_arg(args, "template").unwrap_or_default(),
        "cores": int_arg(args, "cores", 1),
        "memory": int_arg(args, "memory", 512),
        "swap": int_arg(args, "swap", 512),
        "storage": storage,
        "rootfs": format!("{}:{}", storage, int_arg(args, "disk_size", 8)),
        "net0": format!("name=eth0,bridge={},ip={}", bridge, ip),
        "unprivileged": if unprivileged { 1 } else { 0 },
        "features": "nesting=1",
        "cmode": "tty",
    });
    if let Some(pw) = str_arg(args, "password") {
        config["password"] = json!(pw);
    }
    config
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storages() -> Vec<Value> {
        vec![
            json!({ "storage": "local", "content": "iso,vztmpl,backup", "active": 1 }),
            json!({ "storage": "nfs-slow", "content": "images,rootdir", "active": 0 }),
            json!({ "storage": "zfs", "content": "images,rootdir", "active": 1 }),
            json!({ "storage": "local-lvm", "content": "rootdir,images", "active": 1 }),
        ]
    }

    #[test]
    fn test_pick_storage_prefers_local_lvm() {
        assert_eq!(pick_storage(&storages(), ResourceKind::Vm, None).unwrap(), "local-lvm");
    }

    #[test]
    fn test_pick_storage_falls_back_to_first_active() {
        let s: Vec<Value> = storages().into_iter().filter(|s| s["storage"] != "local-lvm").collect();
        assert_eq!(pick_storage(&s, ResourceKind::Container, None).unwrap(), "zfs");
        assert!(pick_storage(&s[..1], ResourceKind::Container, None).is_err());
    }

    #[test]
    fn test_pick_storage_checks_requested() {
        assert_eq!(pick_storage(&storages(), ResourceKind::Vm, Some("zfs")).unwrap(), "zfs");
        let err = pick_storage(&storages(), ResourceKind::Container, Some("local")).unwrap_err();
        assert!(err.contains("does not support 'rootdir'"));
        assert!(pick_storage(&storages(), ResourceKind::Vm, Some("ceph")).is_err());
    }

    #[test]
    fn test_container_config() {
        let mut args = Map::new();
        args.insert("template".into(), json!("local:vztmpl/debian-12.tar.zst"));
        args.insert("hostname".into(), json!("web"));
        args.insert("ip_address".into(), json!("10.0.0.5/24"));
        let c = container_config(200, "local-lvm", &args);
        assert_eq!(c["ostemplate"], "local:vztmpl/debian-12.tar.zst");
        assert_eq!(c["rootfs"], "local-lvm:8");
        assert_eq!(c["net0"], "name=eth0,bridge=vmbr0,ip=10.0.0.5/24");
        assert_eq!(c["unprivileged"], 1);
        assert!(c.get("password").is_none());
    }

    #[test]
    fn test_vm_config_with_iso() {
        let mut args = Map::new();
        args.insert("name".into(), json!("web-server"));
        args.insert("memory".into(), json!(4096));
        args.insert("iso".into(), json!("local:iso/debian.iso"));
        let c = vm_config(300, "zfs", &args);
        assert_eq!(c["scsi0"], "zfs:10");
        assert_eq!(c["memory"], 4096);
        assert_eq!(c["ide2"], "local:iso/debian.iso,media=cdrom");
    }
}
