//! Tool registry.
//!
//! A static table maps each tool name to its arguments and a [`Handler`] the
//! dispatcher matches on. `tools/list` is rendered from the same table.

pub mod dispatch;
pub mod schema;

pub use dispatch::{Dispatcher, ToolOutput};
pub use schema::{ArgKind, ArgSpec};

use crate::lifecycle::Operation;
use crate::proxmox::ResourceKind;
use schema::ArgKind::{Boolean, Integer, String as Str};
use serde_json::{json, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Query {
    ListVms,
    GetVm,
    ListContainers,
    ListNodes,
    NodeStatus,
    ListStorage,
    ClusterStatus,
    ListTemplates,
    AvailableTemplates,
    TaskStatus,
    WaitForTask,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    DownloadTemplate,
    ExecCommand,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handler {
    /// One guest addressed by `node` and `vmid`.
    Lifecycle(ResourceKind, Operation),
    /// Containers addressed by `node`+`vmid` or a `selector`.
    Selector(Operation),
    Query(Query),
    /// Tracked work outside the power lifecycle.
    Action(Action),
}

#[derive(Debug)]
pub struct ToolSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub args: &'static [ArgSpec],
    pub handler: Handler,
}

impl ToolSpec {
    pub fn definition(&self) -> Value {
        json!({
            "name": self.name,
            "description": self.description,
            "inputSchema": schema::input_schema(self.args),
        })
    }
}

const NODE: ArgSpec = ArgSpec::required("node", Str, "The node name");
const NODE_FILTER: ArgSpec = ArgSpec::optional("node", Str, "Only list guests on this node");
const VMID: ArgSpec = ArgSpec::required("vmid", Integer, "The guest ID");
const TIMEOUT: ArgSpec = ArgSpec::optional(
    "timeout",
    Integer,
    "Seconds to wait for the task before reporting a timeout",
);
const SELECTOR: ArgSpec = ArgSpec::optional(
    "selector",
    Str,
    "Container selector: '123' | 'pve1:123' | 'pve1/name' | 'name' | comma list. Alternative to node+vmid",
);
const CT_NODE: ArgSpec = ArgSpec::optional("node", Str, "The node name (with vmid, instead of selector)");
const CT_VMID: ArgSpec = ArgSpec::optional("vmid", Integer, "The container ID (with node, instead of selector)");

const POWER_ARGS: &[ArgSpec] = &[NODE, VMID, TIMEOUT];
const SELECTOR_ARGS: &[ArgSpec] = &[SELECTOR, CT_NODE, CT_VMID, TIMEOUT];

pub static TOOLS: &[ToolSpec] = &[
    ToolSpec {
        name: "list_vms",
        description: "List QEMU virtual machines across the cluster",
        args: &[NODE_FILTER],
        handler: Handler::Query(Query::ListVms),
    },
    ToolSpec {
        name: "get_vm",
        description: "Show the current state and configuration of a VM",
        args: &[NODE, VMID],
        handler: Handler::Query(Query::GetVm),
    },
    ToolSpec {
        name: "create_vm",
        description: "Create a QEMU virtual machine and wait for the task to finish",
        args: &[
            NODE,
            ArgSpec::optional("vmid", Integer, "Guest ID; the next free ID when omitted"),
            ArgSpec::required("name", Str, "VM name"),
            ArgSpec::optional("cores", Integer, "CPU cores (default 1)"),
            ArgSpec::optional("sockets", Integer, "CPU sockets (default 1)"),
            ArgSpec::optional("memory", Integer, "Memory in MiB (default 2048)"),
            ArgSpec::optional("disk_size", Integer, "Disk size in GiB (default 10)"),
            ArgSpec::optional("storage", Str, "Disk storage; auto-detected when omitted"),
            ArgSpec::optional("bridge", Str, "Network bridge (default vmbr0)"),
            ArgSpec::optional("iso", Str, "Installer ISO volume, e.g. local:iso/debian.iso"),
            ArgSpec::optional("ostype", Str, "Guest OS type (default l26)"),
            TIMEOUT,
        ],
        handler: Handler::Lifecycle(ResourceKind::Vm, Operation::Create),
    },
    ToolSpec {
        name: "start_vm",
        description: "Start a VM",
        args: POWER_ARGS,
        handler: Handler::Lifecycle(ResourceKind::Vm, Operation::Start),
    },
    ToolSpec {
        name: "stop_vm",
        description: "Stop (power off) a VM",
        args: POWER_ARGS,
        handler: Handler::Lifecycle(ResourceKind::Vm, Operation::Stop),
    },
    ToolSpec {
        name: "shutdown_vm",
        description: "Gracefully shut down a VM through ACPI",
        args: POWER_ARGS,
        handler: Handler::Lifecycle(ResourceKind::Vm, Operation::Shutdown),
    },
    ToolSpec {
        name: "reset_vm",
        description: "Hard-reset a running VM",
        args: POWER_ARGS,
        handler: Handler::Lifecycle(ResourceKind::Vm, Operation::Reset),
    },
    ToolSpec {
        name: "delete_vm",
        description: "Delete a VM and its disks",
        args: &[
            NODE,
            VMID,
            ArgSpec::optional("force", Boolean, "Stop the VM first if it is running"),
            ArgSpec::optional("purge", Boolean, "Also remove it from backup jobs and HA"),
            TIMEOUT,
        ],
        handler: Handler::Lifecycle(ResourceKind::Vm, Operation::Delete),
    },
    ToolSpec {
        name: "list_containers",
        description: "List LXC containers across the cluster",
        args: &[NODE_FILTER],
        handler: Handler::Query(Query::ListContainers),
    },
    ToolSpec {
        name: "create_container",
        description: "Create an LXC container from a template and wait for the task to finish",
        args: &[
            NODE,
            ArgSpec::required("template", Str, "OS template volume, e.g. local:vztmpl/debian-12.tar.zst"),
            ArgSpec::optional("vmid", Integer, "Guest ID; the next free ID when omitted"),
            ArgSpec::optional("hostname", Str, "Container hostname"),
            ArgSpec::optional("cores", Integer, "CPU cores (default 1)"),
            ArgSpec::optional("memory", Integer, "Memory in MiB (default 512)"),
            ArgSpec::optional("swap", Integer, "Swap in MiB (default 512)"),
            ArgSpec::optional("disk_size", Integer, "Root disk size in GiB (default 8)"),
            ArgSpec::optional("storage", Str, "Root disk storage; auto-detected when omitted"),
            ArgSpec::optional("bridge", Str, "Network bridge (default vmbr0)"),
            ArgSpec::optional("ip_address", Str, "IPv4 in CIDR notation or 'dhcp' (default)"),
            ArgSpec::optional("password", Str, "Root password"),
            ArgSpec::optional("unprivileged", Boolean, "Unprivileged container (default true)"),
            TIMEOUT,
        ],
        handler: Handler::Lifecycle(ResourceKind::Container, Operation::Create),
    },
    ToolSpec {
        name: "start_container",
        description: "Start one or more LXC containers",
        args: SELECTOR_ARGS,
        handler: Handler::Selector(Operation::Start),
    },
    ToolSpec {
        name: "stop_container",
        description: "Stop one or more LXC containers, with a clean shutdown by default",
        args: &[
            SELECTOR,
            CT_NODE,
            CT_VMID,
            ArgSpec::optional("graceful", Boolean, "Shut down cleanly (default true); false forces a hard stop"),
            ArgSpec::optional("shutdown_timeout", Integer, "Seconds a graceful shutdown may take (default 10)"),
            TIMEOUT,
        ],
        handler: Handler::Selector(Operation::Stop),
    },
    ToolSpec {
        name: "restart_container",
        description: "Reboot one or more running LXC containers",
        args: SELECTOR_ARGS,
        handler: Handler::Selector(Operation::Restart),
    },
    ToolSpec {
        name: "update_container_resources",
        description: "Change CPU, memory or swap of containers and optionally grow a disk",
        args: &[
            SELECTOR,
            CT_NODE,
            CT_VMID,
            ArgSpec::optional("cores", Integer, "New CPU core count"),
            ArgSpec::optional("memory", Integer, "New memory in MiB"),
            ArgSpec::optional("swap", Integer, "New swap in MiB"),
            ArgSpec::optional("disk_gb", Integer, "Grow the disk by this many GiB"),
            ArgSpec::optional("disk", Str, "Disk to grow, e.g. mp0 (default rootfs)"),
            TIMEOUT,
        ],
        handler: Handler::Selector(Operation::UpdateResources),
    },
    ToolSpec {
        name: "delete_container",
        description: "Delete an LXC container",
        args: &[
            NODE,
            VMID,
            ArgSpec::optional("force", Boolean, "Stop the container first if it is running"),
            ArgSpec::optional("purge", Boolean, "Also remove it from backup jobs and HA"),
            TIMEOUT,
        ],
        handler: Handler::Lifecycle(ResourceKind::Container, Operation::Delete),
    },
    ToolSpec {
        name: "list_nodes",
        description: "List all nodes in the cluster",
        args: &[],
        handler: Handler::Query(Query::ListNodes),
    },
    ToolSpec {
        name: "get_node_status",
        description: "Show CPU, memory and uptime of a node",
        args: &[NODE],
        handler: Handler::Query(Query::NodeStatus),
    },
    ToolSpec {
        name: "list_storage",
        description: "List storage, cluster-wide or for one node",
        args: &[ArgSpec::optional("node", Str, "Only storage available on this node")],
        handler: Handler::Query(Query::ListStorage),
    },
    ToolSpec {
        name: "get_cluster_status",
        description: "Show cluster membership and quorum",
        args: &[],
        handler: Handler::Query(Query::ClusterStatus),
    },
    ToolSpec {
        name: "list_templates",
        description: "List container templates (or other content) on a storage",
        args: &[
            NODE,
            ArgSpec::optional("storage", Str, "Storage name (default local)"),
            ArgSpec::optional(
                "content",
                ArgKind::Enum(&["vztmpl", "iso", "backup", "images", "rootdir"]),
                "Content type (default vztmpl)",
            ),
        ],
        handler: Handler::Query(Query::ListTemplates),
    },
    ToolSpec {
        name: "list_available_templates",
        description: "List container templates the node can download from the appliance index",
        args: &[NODE],
        handler: Handler::Query(Query::AvailableTemplates),
    },
    ToolSpec {
        name: "download_template",
        description: "Download a container template to a storage and wait for the task to finish",
        args: &[
            NODE,
            ArgSpec::required(
                "template",
                Str,
                "Package name from list_available_templates, e.g. debian-12-standard_12.7-1_amd64.tar.zst",
            ),
            ArgSpec::optional("storage", Str, "Target storage (default local)"),
            TIMEOUT,
        ],
        handler: Handler::Action(Action::DownloadTemplate),
    },
    ToolSpec {
        name: "execute_vm_command",
        description: "Run a command in a running VM through the QEMU guest agent and return its output",
        args: &[
            NODE,
            VMID,
            ArgSpec::required("command", Str, "Program and arguments, split on whitespace; no shell"),
            ArgSpec::optional("input_data", Str, "Data passed to the command on stdin"),
            TIMEOUT,
        ],
        handler: Handler::Action(Action::ExecCommand),
    },
    ToolSpec {
        name: "get_task_status",
        description: "Show the current status of a cluster task",
        args: &[
            ArgSpec::required("upid", Str, "The task UPID"),
            ArgSpec::optional("node", Str, "Node that runs the task; taken from the UPID when omitted"),
        ],
        handler: Handler::Query(Query::TaskStatus),
    },
    ToolSpec {
        name: "wait_for_task",
        description: "Wait until a cluster task finishes",
        args: &[
            ArgSpec::required("upid", Str, "The task UPID"),
            ArgSpec::optional("node", Str, "Node that runs the task; taken from the UPID when omitted"),
            TIMEOUT,
            ArgSpec::optional("poll_interval_ms", Integer, "Milliseconds between status checks"),
        ],
        handler: Handler::Query(Query::WaitForTask),
    },
];

pub fn find(name: &str) -> Option<&'static ToolSpec> {
    TOOLS.iter().find(|t| t.name == name)
}

pub fn definitions() -> Vec<Value> {
    TOOLS.iter().map(ToolSpec::definition).collect()
}
