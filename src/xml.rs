//! Libvirt domain XML generation and recovery parsing
//!
//! The builder is a pure function from a validated `VmConfig` to a domain
//! descriptor string: deterministic output for a given input, and the only
//! failure mode is input validation. The parser extracts just enough of a
//! descriptor (name, vcpus, memory, first disk) to rebuild a config for
//! domains discovered at startup.

use uuid::Uuid;

use crate::config::{DiskDevice, DiskKind, DiskSpec, GraphicsSpec, NicKind, NicSpec, VmConfig};
use crate::{Error, Result};

const DEFAULT_EMULATOR: &str = "/usr/bin/qemu-system-x86_64";

/// Render a VM configuration into a libvirt domain descriptor.
pub fn build_domain_xml(cfg: &VmConfig) -> Result<String> {
    cfg.validate()?;

    let mut xml = String::with_capacity(1024);
    xml.push_str(&format!("<domain type='{}'>", escape(&cfg.virt_type)));
    xml.push_str(&format!("<name>{}</name>", escape(&cfg.name)));
    if let Some(uuid) = &cfg.uuid {
        xml.push_str(&format!("<uuid>{}</uuid>", escape(uuid)));
    }
    xml.push_str(&format!("<memory unit='KiB'>{}</memory>", cfg.memory_mib * 1024));
    xml.push_str(&format!("<vcpu>{}</vcpu>", cfg.vcpus));
    xml.push_str(&format!(
        "<os><type arch='{}'>{}</type><boot dev='hd'/></os>",
        escape(&cfg.arch),
        escape(&cfg.os_type)
    ));

    xml.push_str("<devices>");
    xml.push_str(&format!("<emulator>{}</emulator>", DEFAULT_EMULATOR));

    for disk in &cfg.disks {
        xml.push_str(&disk_element(disk));
    }

    if cfg.nics.is_empty() {
        // Every guest gets at least a default virtio NIC.
        xml.push_str(&nic_fragment(&NicSpec::network("default")));
    } else {
        for nic in &cfg.nics {
            xml.push_str(&nic_fragment(nic));
        }
    }

    let graphics = cfg.graphics.clone().unwrap_or_default();
    xml.push_str(&graphics_element(&graphics));
    xml.push_str("<video><model type='virtio'/></video>");
    xml.push_str("<memballoon model='virtio'/>");
    xml.push_str("</devices></domain>");

    Ok(xml)
}

fn disk_element(disk: &DiskSpec) -> String {
    let mut xml = format!(
        "<disk type='{}' device='{}'>",
        disk.kind.as_str(),
        disk.device.as_str()
    );
    xml.push_str(&format!("<driver name='qemu' type='{}'/>", escape(&disk.format)));
    let source_attr = match disk.kind {
        DiskKind::File => "file",
        DiskKind::Block => "dev",
        DiskKind::Network => "name",
    };
    xml.push_str(&format!("<source {}='{}'/>", source_attr, escape(&disk.source)));
    xml.push_str(&format!("<target dev='{}'/>", escape(&disk.target)));
    if disk.read_only {
        xml.push_str("<readonly/>");
    }
    xml.push_str("</disk>");
    xml
}

/// Interface-only fragment, also used for live attach/detach.
pub fn nic_fragment(nic: &NicSpec) -> String {
    let mut xml = format!("<interface type='{}'>", nic.kind.as_str());
    let mac = nic.mac.clone().unwrap_or_else(generate_mac);
    xml.push_str(&format!("<mac address='{}'/>", escape(&mac)));
    match nic.kind {
        NicKind::Network => xml.push_str(&format!("<source network='{}'/>", escape(&nic.source))),
        NicKind::Bridge => xml.push_str(&format!("<source bridge='{}'/>", escape(&nic.source))),
        NicKind::Direct => {
            xml.push_str(&format!("<source dev='{}' mode='passthrough'/>", escape(&nic.source)))
        }
        NicKind::User => {}
    }
    xml.push_str(&format!("<model type='{}'/>", escape(&nic.model)));
    xml.push_str("</interface>");
    xml
}

fn graphics_element(graphics: &GraphicsSpec) -> String {
    format!(
        "<graphics type='spice' autoport='yes' listen='{addr}'>\
         <listen type='address' address='{addr}'/></graphics>",
        addr = escape(&graphics.listen_addr)
    )
}

/// QEMU/KVM locally-administered MAC: 52:54:00 prefix, random tail, with the
/// first random octet forced to unicast + locally administered bits.
pub fn generate_mac() -> String {
    let bytes = *Uuid::new_v4().as_bytes();
    let b3 = (bytes[0] & 0xFC) | 0x02;
    format!("52:54:00:{:02x}:{:02x}:{:02x}", b3, bytes[1], bytes[2])
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('\'', "&apos;")
        .replace('"', "&quot;")
}

fn unescape(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&apos;", "'")
        .replace("&quot;", "\"")
        .replace("&amp;", "&")
}

// ===== Recovery parsing =====

/// Extract a minimal `VmConfig` from a domain descriptor: name, vcpus,
/// memory, and the first disk. Enough for startup recovery and for the
/// round-trip property on configs we generated ourselves.
pub fn parse_domain_xml(xml: &str) -> Result<VmConfig> {
    let name = element_text(xml, "name")
        .ok_or_else(|| Error::Configuration("domain XML missing <name>".into()))?;
    let vcpus: u16 = element_text(xml, "vcpu")
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(1);

    let memory_raw: u64 = element_text(xml, "memory")
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(0);
    let unit = element_attr(xml, "memory", "unit").unwrap_or_else(|| "KiB".to_string());
    let memory_mib = match unit.as_str() {
        "KiB" => memory_raw / 1024,
        "MiB" => memory_raw,
        "GiB" => memory_raw * 1024,
        "bytes" | "b" => memory_raw / (1024 * 1024),
        _ => memory_raw / 1024,
    };

    let uuid = element_text(xml, "uuid");
    let virt_type = element_attr(xml, "domain", "type").unwrap_or_else(|| "kvm".to_string());
    let arch = element_attr(xml, "type", "arch").unwrap_or_else(|| "x86_64".to_string());
    let os_type = element_text(xml, "type").unwrap_or_else(|| "hvm".to_string());

    let mut builder = VmConfig::builder(name)
        .virt_type(virt_type)
        .vcpus(vcpus.max(1))
        .memory_mib(memory_mib.max(1))
        .arch(arch)
        .os_type(os_type);
    if let Some(uuid) = uuid {
        builder = builder.uuid(uuid);
    }

    if let Some(disk_xml) = element_block(xml, "disk") {
        let kind = match element_attr(&disk_xml, "disk", "type").as_deref() {
            Some("block") => DiskKind::Block,
            Some("network") => DiskKind::Network,
            _ => DiskKind::File,
        };
        let device = match element_attr(&disk_xml, "disk", "device").as_deref() {
            Some("cdrom") => DiskDevice::Cdrom,
            Some("floppy") => DiskDevice::Floppy,
            _ => DiskDevice::Disk,
        };
        let source = element_attr(&disk_xml, "source", "file")
            .or_else(|| element_attr(&disk_xml, "source", "dev"))
            .or_else(|| element_attr(&disk_xml, "source", "name"))
            .unwrap_or_default();
        let target = element_attr(&disk_xml, "target", "dev").unwrap_or_default();
        let format = element_attr(&disk_xml, "driver", "type").unwrap_or_else(|| "raw".to_string());
        builder = builder.disk(DiskSpec {
            kind,
            device,
            source,
            target,
            format,
            capacity_kb: 0,
            read_only: disk_xml.contains("<readonly/>"),
        });
    }

    Ok(builder.build())
}

/// Text content of the first `<tag ...>text</tag>` occurrence.
fn element_text(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{tag}");
    let close = format!("</{tag}>");
    let start = xml.find(&open)?;
    let content_start = xml[start..].find('>')? + start + 1;
    let content_end = xml[content_start..].find(&close)? + content_start;
    Some(unescape(xml[content_start..content_end].trim()))
}

/// Value of `attr` on the first `<tag ...>` occurrence.
fn element_attr(xml: &str, tag: &str, attr: &str) -> Option<String> {
    let open = format!("<{tag}");
    let start = xml.find(&open)?;
    let tag_end = xml[start..].find('>')? + start;
    let tag_body = &xml[start..tag_end];
    let needle = format!("{attr}='");
    let attr_start = tag_body.find(&needle)? + needle.len();
    let attr_end = tag_body[attr_start..].find('\'')? + attr_start;
    Some(unescape(&tag_body[attr_start..attr_end]))
}

/// The whole first `<tag ...>...</tag>` block.
fn element_block(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{tag}");
    let close = format!("</{tag}>");
    let start = xml.find(&open)?;
    let end = xml[start..].find(&close)? + start + close.len();
    Some(xml[start..end].to_string())
}
