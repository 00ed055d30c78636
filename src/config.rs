//! VM configuration with builder pattern

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Disk backing kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskKind {
    File,
    Block,
    Network,
}

impl DiskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiskKind::File => "file",
            DiskKind::Block => "block",
            DiskKind::Network => "network",
        }
    }
}

/// Guest-visible disk device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskDevice {
    Disk,
    Cdrom,
    Floppy,
}

impl DiskDevice {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiskDevice::Disk => "disk",
            DiskDevice::Cdrom => "cdrom",
            DiskDevice::Floppy => "floppy",
        }
    }
}

/// One virtual disk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskSpec {
    pub kind: DiskKind,
    pub device: DiskDevice,
    /// Source path (image file or block device)
    pub source: String,
    /// Target device name inside the guest (vda, vdb, ...)
    pub target: String,
    /// Driver format: qcow2, raw, ...
    pub format: String,
    pub capacity_kb: u64,
    pub read_only: bool,
}

impl DiskSpec {
    /// File-backed qcow2 disk, the common case.
    pub fn file(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            kind: DiskKind::File,
            device: DiskDevice::Disk,
            source: source.into(),
            target: target.into(),
            format: "qcow2".to_string(),
            capacity_kb: 0,
            read_only: false,
        }
    }
}

/// NIC attachment kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NicKind {
    Network,
    Bridge,
    Direct,
    User,
}

impl NicKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NicKind::Network => "network",
            NicKind::Bridge => "bridge",
            NicKind::Direct => "direct",
            NicKind::User => "user",
        }
    }
}

/// One virtual network interface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NicSpec {
    pub kind: NicKind,
    /// Network name or bridge device, depending on kind
    pub source: String,
    /// Device model: virtio, e1000, ...
    pub model: String,
    /// Generated at build time when absent
    pub mac: Option<String>,
}

impl NicSpec {
    pub fn network(source: impl Into<String>) -> Self {
        Self {
            kind: NicKind::Network,
            source: source.into(),
            model: "virtio".to_string(),
            mac: None,
        }
    }
}

fn default_virt_type() -> String {
    "kvm".to_string()
}

/// SPICE graphics listener
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphicsSpec {
    pub listen_addr: String,
}

impl Default for GraphicsSpec {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1".to_string(),
        }
    }
}

/// Resource axis a limit or scaling decision applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    Cpu,
    Memory,
    Io,
    Network,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceKind::Cpu => write!(f, "CPU"),
            ResourceKind::Memory => write!(f, "Memory"),
            ResourceKind::Io => write!(f, "IO"),
            ResourceKind::Network => write!(f, "Network"),
        }
    }
}

/// Bounded resource limit. The cgroup always reflects `current`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceLimit {
    pub kind: ResourceKind,
    pub min: u64,
    pub max: u64,
    pub current: u64,
    /// Display unit: "vcpus", "bytes", "bps"
    pub unit: String,
}

impl ResourceLimit {
    pub fn new(kind: ResourceKind, min: u64, max: u64, current: u64, unit: impl Into<String>) -> Self {
        Self {
            kind,
            min,
            max,
            current,
            unit: unit.into(),
        }
    }

    /// Whether `value` is inside [min, max].
    pub fn contains(&self, value: u64) -> bool {
        value >= self.min && value <= self.max
    }

    pub fn validate(&self) -> Result<()> {
        if self.min > self.max || !self.contains(self.current) {
            return Err(Error::Configuration(format!(
                "{} limit violates min <= current <= max ({} <= {} <= {})",
                self.kind, self.min, self.current, self.max
            )));
        }
        Ok(())
    }
}

/// Declarative VM specification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmConfig {
    pub name: String,
    pub uuid: Option<String>,
    /// Libvirt domain type: kvm, qemu, or test (for the built-in test driver)
    #[serde(default = "default_virt_type")]
    pub virt_type: String,
    pub vcpus: u16,
    pub memory_mib: u64,
    pub arch: String,
    pub os_type: String,
    pub disks: Vec<DiskSpec>,
    pub nics: Vec<NicSpec>,
    pub graphics: Option<GraphicsSpec>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// Explicit limits; defaults derived from vcpus/memory when empty
    #[serde(default)]
    pub limits: Vec<ResourceLimit>,
}

impl VmConfig {
    pub fn builder(name: impl Into<String>) -> VmConfigBuilder {
        VmConfigBuilder::new(name)
    }

    pub fn memory_bytes(&self) -> u64 {
        self.memory_mib * 1024 * 1024
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Configuration("name cannot be empty".into()));
        }
        if self.vcpus < 1 {
            return Err(Error::Configuration("vcpus must be at least 1".into()));
        }
        if self.memory_mib == 0 {
            return Err(Error::Configuration("memory must be greater than zero".into()));
        }
        if self.disks.is_empty() {
            return Err(Error::Configuration("at least one disk is required".into()));
        }
        for limit in &self.limits {
            limit.validate()?;
        }
        Ok(())
    }

    /// Limits to manage this VM under, deriving CPU and memory defaults
    /// when the config does not carry them.
    pub fn effective_limits(&self) -> Vec<ResourceLimit> {
        let mut limits = self.limits.clone();
        if !limits.iter().any(|l| l.kind == ResourceKind::Cpu) {
            let vcpus = self.vcpus as u64;
            limits.push(ResourceLimit::new(
                ResourceKind::Cpu,
                1,
                (vcpus * 4).max(vcpus),
                vcpus,
                "vcpus",
            ));
        }
        if !limits.iter().any(|l| l.kind == ResourceKind::Memory) {
            let bytes = self.memory_bytes();
            limits.push(ResourceLimit::new(
                ResourceKind::Memory,
                bytes.min(512 * 1024 * 1024),
                bytes * 4,
                bytes,
                "bytes",
            ));
        }
        limits
    }

    /// Stable digest of the config used to detect drift in persisted records.
    pub fn digest(&self) -> String {
        // DefaultHasher over the canonical JSON form is enough for drift
        // detection; this is not a security boundary.
        use std::hash::{Hash, Hasher};
        let json = serde_json::to_string(self).unwrap_or_default();
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        json.hash(&mut hasher);
        format!("{:016x}", hasher.finish())
    }
}

/// Builder for VM configuration
#[derive(Debug, Clone)]
pub struct VmConfigBuilder {
    config: VmConfig,
}

impl VmConfigBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            config: VmConfig {
                name: name.into(),
                uuid: None,
                virt_type: default_virt_type(),
                vcpus: 2,
                memory_mib: 2048,
                arch: "x86_64".to_string(),
                os_type: "hvm".to_string(),
                disks: Vec::new(),
                nics: Vec::new(),
                graphics: Some(GraphicsSpec::default()),
                metadata: BTreeMap::new(),
                limits: Vec::new(),
            },
        }
    }

    pub fn uuid(mut self, uuid: impl Into<String>) -> Self {
        self.config.uuid = Some(uuid.into());
        self
    }

    pub fn virt_type(mut self, virt_type: impl Into<String>) -> Self {
        self.config.virt_type = virt_type.into();
        self
    }

    pub fn vcpus(mut self, n: u16) -> Self {
        self.config.vcpus = n;
        self
    }

    pub fn memory_mib(mut self, mib: u64) -> Self {
        self.config.memory_mib = mib;
        self
    }

    pub fn arch(mut self, arch: impl Into<String>) -> Self {
        self.config.arch = arch.into();
        self
    }

    pub fn os_type(mut self, os_type: impl Into<String>) -> Self {
        self.config.os_type = os_type.into();
        self
    }

    pub fn disk(mut self, disk: DiskSpec) -> Self {
        self.config.disks.push(disk);
        self
    }

    pub fn nic(mut self, nic: NicSpec) -> Self {
        self.config.nics.push(nic);
        self
    }

    pub fn graphics(mut self, graphics: Option<GraphicsSpec>) -> Self {
        self.config.graphics = graphics;
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.metadata.insert(key.into(), value.into());
        self
    }

    pub fn limit(mut self, limit: ResourceLimit) -> Self {
        self.config.limits.push(limit);
        self
    }

    pub fn build(self) -> VmConfig {
        self.config
    }
}
