//! XML generation and parsing for libvirt domain and network descriptors.
//!
//! Rendering is pure string building: the same guest always yields the same
//! bytes, and optional elements (MAC, model, metadata) are left out entirely
//! when absent. Parsing reads back the subset of a live descriptor the
//! lifecycle manager needs (interface target devices and aliases).

use std::borrow::Cow;

use quick_xml::escape::escape;
use serde::Deserialize;

use crate::error::{HypervisorError, Result};
use crate::types::*;

/// Namespace of the guest metadata block inside `<metadata>`.
pub const METADATA_NAMESPACE: &str = "http://limiquantix.io/xml/guest-metadata/1";

/// Portgroup every per-NIC network carries its VLAN tags on.
pub const PORTGROUP_NAME: &str = "default";

/// Default directory that bare volume references resolve under.
pub const DEFAULT_VOLUME_ROOT: &str = "/dev/zvol/guests/images";

/// Highest VLAN id usable on a portgroup.
const MAX_VLAN_ID: u16 = 4094;

/// Settings that shape rendering but are not part of the guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderOptions {
    /// Directory that non-absolute disk sources resolve under.
    pub volume_root: String,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            volume_root: DEFAULT_VOLUME_ROOT.to_string(),
        }
    }
}

fn esc(value: &str) -> Cow<'_, str> {
    escape(value)
}

fn invalid(message: impl Into<String>) -> HypervisorError {
    HypervisorError::XmlError(message.into())
}

/// Render the domain descriptor for a guest.
pub fn render_domain(guest: &Guest, options: &RenderOptions) -> Result<String> {
    DomainXmlBuilder::new(guest, options).build()
}

/// Render the per-NIC network descriptor.
pub fn render_network(nic: &Nic) -> Result<String> {
    NetworkXmlBuilder::new(nic).build()
}

// =============================================================================
// DOMAIN
// =============================================================================

/// Builder for libvirt domain XML.
pub struct DomainXmlBuilder<'a> {
    guest: &'a Guest,
    options: &'a RenderOptions,
}

impl<'a> DomainXmlBuilder<'a> {
    pub fn new(guest: &'a Guest, options: &'a RenderOptions) -> Self {
        Self { guest, options }
    }

    /// Build the domain XML string.
    pub fn build(&self) -> Result<String> {
        let guest = self.guest;

        if guest.id.trim().is_empty() {
            return Err(invalid("domain name (guest id) is empty"));
        }
        if guest.kind.is_empty() {
            return Err(invalid(format!("guest {} has no domain type", guest.id)));
        }

        let mut xml = format!(
            r#"<domain type='{}'>
  <name>{}</name>
  <memory unit='MiB'>{}</memory>
  <vcpu>{}</vcpu>
"#,
            esc(&guest.kind),
            esc(&guest.id),
            guest.memory,
            guest.cpu
        );

        xml.push_str(&self.build_metadata());
        xml.push_str(&self.build_os_section());

        xml.push_str("  <devices>\n");
        xml.push_str(&self.build_nics()?);
        xml.push_str(&self.build_disks()?);
        xml.push_str("  </devices>\n");

        xml.push_str("</domain>\n");
        Ok(xml)
    }

    fn build_metadata(&self) -> String {
        if self.guest.metadata.is_empty() {
            return String::new();
        }

        let mut xml = format!(
            "  <metadata>\n    <guest:metadata xmlns:guest='{}'>\n",
            METADATA_NAMESPACE
        );
        // BTreeMap iteration keeps the output stable.
        for (name, value) in &self.guest.metadata {
            xml.push_str(&format!(
                "      <guest:parameter name='{}' value='{}'/>\n",
                esc(name),
                esc(value)
            ));
        }
        xml.push_str("    </guest:metadata>\n  </metadata>\n");
        xml
    }

    fn build_os_section(&self) -> String {
        "  <os>\n    <type>hvm</type>\n    <boot dev='hd'/>\n  </os>\n".to_string()
    }

    fn build_nics(&self) -> Result<String> {
        let mut xml = String::new();

        for (i, nic) in self.guest.nics.iter().enumerate() {
            let mac = nic
                .mac_address()
                .map(|m| format!("      <mac address='{}'/>\n", esc(m)))
                .unwrap_or_default();

            let (interface_type, source) = if nic.is_network_backed() {
                let name = nic.mac_address().ok_or_else(|| {
                    invalid(format!("nic {} carries VLANs but has no MAC to name its network", i))
                })?;
                (
                    "network",
                    format!(
                        "      <source network='{}' portgroup='{}'/>\n",
                        esc(name),
                        PORTGROUP_NAME
                    ),
                )
            } else {
                if nic.network.is_empty() {
                    return Err(invalid(format!("nic {} has no bridge", i)));
                }
                ("bridge", format!("      <source bridge='{}'/>\n", esc(&nic.network)))
            };

            let model = nic
                .model
                .map(|m| format!("      <model type='{}'/>\n", m.as_str()))
                .unwrap_or_default();

            xml.push_str(&format!(
                "    <interface type='{}'>\n{}{}{}    </interface>\n",
                interface_type, mac, source, model
            ));
        }

        Ok(xml)
    }

    fn build_disks(&self) -> Result<String> {
        let mut xml = String::new();

        for (i, disk) in self.guest.disks.iter().enumerate() {
            if disk.device.is_empty() {
                return Err(invalid(format!("disk {} has no target device", i)));
            }

            let source = match self.resolve_source(&disk.source) {
                Some(source) => source,
                None => return Err(invalid(format!("disk {} has no source", i))),
            };

            let (disk_type, source_attr) = match source {
                DiskSource::Block(_) => ("block", "dev"),
                DiskSource::File(_) => ("file", "file"),
            };

            xml.push_str(&format!(
                r#"    <disk type='{}' device='disk'>
      <driver name='qemu' type='raw'/>
      <source {}='{}'/>
      <target dev='{}' bus='{}'/>
    </disk>
"#,
                disk_type,
                source_attr,
                esc(source.path()),
                esc(&disk.device),
                disk.bus.as_str()
            ));
        }

        Ok(xml)
    }

    fn resolve_source(&self, source: &str) -> Option<DiskSource> {
        if source.is_empty() {
            None
        } else if source.starts_with("/dev/") {
            Some(DiskSource::Block(source.to_string()))
        } else if source.starts_with('/') {
            Some(DiskSource::File(source.to_string()))
        } else {
            Some(DiskSource::Block(format!(
                "{}/{}",
                self.options.volume_root.trim_end_matches('/'),
                source
            )))
        }
    }
}

enum DiskSource {
    Block(String),
    File(String),
}

impl DiskSource {
    fn path(&self) -> &str {
        match self {
            DiskSource::Block(path) | DiskSource::File(path) => path,
        }
    }
}

// =============================================================================
// NETWORK
// =============================================================================

/// Builder for the backend network that carries one NIC's VLANs.
pub struct NetworkXmlBuilder<'a> {
    nic: &'a Nic,
}

impl<'a> NetworkXmlBuilder<'a> {
    pub fn new(nic: &'a Nic) -> Self {
        Self { nic }
    }

    /// Build the network XML string. The network is named by the NIC's MAC.
    pub fn build(&self) -> Result<String> {
        let name = self
            .nic
            .mac_address()
            .ok_or_else(|| invalid("network name requires a NIC MAC address"))?;

        if self.nic.network.is_empty() {
            return Err(invalid(format!("nic {} has no bridge", name)));
        }

        if let Some(tag) = self.nic.vlans.iter().find(|&&t| t == 0 || t > MAX_VLAN_ID) {
            return Err(invalid(format!("nic {} has out-of-range VLAN tag {}", name, tag)));
        }

        let mut xml = format!(
            r#"<network>
  <name>{}</name>
  <forward mode='bridge'/>
  <bridge name='{}'/>
  <virtualport type='openvswitch'/>
"#,
            esc(name),
            esc(&self.nic.network)
        );

        xml.push_str(&format!("  <portgroup name='{}' default='yes'>\n", PORTGROUP_NAME));
        if !self.nic.vlans.is_empty() {
            let trunk = if self.nic.vlans.len() > 1 { " trunk='yes'" } else { "" };
            xml.push_str(&format!("    <vlan{}>\n", trunk));
            for tag in &self.nic.vlans {
                xml.push_str(&format!("      <tag id='{}'/>\n", tag));
            }
            xml.push_str("    </vlan>\n");
        }
        xml.push_str("  </portgroup>\n");

        xml.push_str("</network>\n");
        Ok(xml)
    }
}

// =============================================================================
// PARSING
// =============================================================================

/// The parts of a domain descriptor this crate reads back.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DomainDescription {
    #[serde(rename = "@type", default)]
    pub kind: String,
    #[serde(default)]
    pub name: String,
    pub memory: Option<Memory>,
    pub vcpu: Option<Vcpu>,
    #[serde(default)]
    pub devices: Devices,
}

impl DomainDescription {
    /// vCPU count, defaulting to one like libvirt does.
    pub fn vcpus(&self) -> u32 {
        self.vcpu.as_ref().map(|v| v.count).unwrap_or(1)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Memory {
    #[serde(rename = "@unit")]
    pub unit: Option<String>,
    #[serde(rename = "$text")]
    pub value: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Vcpu {
    #[serde(rename = "$text")]
    pub count: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Devices {
    #[serde(rename = "interface", default)]
    pub interfaces: Vec<InterfaceDescription>,
    #[serde(rename = "disk", default)]
    pub disks: Vec<DiskDescription>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InterfaceDescription {
    #[serde(rename = "@type", default)]
    pub kind: String,
    pub mac: Option<AddressAttr>,
    pub source: Option<InterfaceSource>,
    pub target: Option<DevAttr>,
    pub alias: Option<NameAttr>,
    pub model: Option<TypeAttr>,
}

impl InterfaceDescription {
    pub fn target_dev(&self) -> Option<&str> {
        self.target.as_ref().and_then(|t| t.dev.as_deref())
    }

    pub fn alias_name(&self) -> Option<&str> {
        self.alias.as_ref().and_then(|a| a.name.as_deref())
    }

    pub fn mac_address(&self) -> Option<&str> {
        self.mac.as_ref().and_then(|m| m.address.as_deref())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InterfaceSource {
    #[serde(rename = "@bridge")]
    pub bridge: Option<String>,
    #[serde(rename = "@network")]
    pub network: Option<String>,
    #[serde(rename = "@portgroup")]
    pub portgroup: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DiskDescription {
    #[serde(rename = "@type", default)]
    pub kind: String,
    #[serde(rename = "@device", default)]
    pub device: String,
    pub source: Option<DiskSourceDescription>,
    pub target: Option<DiskTargetDescription>,
}

impl DiskDescription {
    pub fn target_dev(&self) -> Option<&str> {
        self.target.as_ref().map(|t| t.dev.as_str())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DiskSourceDescription {
    #[serde(rename = "@dev")]
    pub dev: Option<String>,
    #[serde(rename = "@file")]
    pub file: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DiskTargetDescription {
    #[serde(rename = "@dev")]
    pub dev: String,
    #[serde(rename = "@bus")]
    pub bus: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AddressAttr {
    #[serde(rename = "@address")]
    pub address: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DevAttr {
    #[serde(rename = "@dev")]
    pub dev: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NameAttr {
    #[serde(rename = "@name")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TypeAttr {
    #[serde(rename = "@type")]
    pub kind: Option<String>,
}

/// The parts of a network descriptor this crate reads back.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NetworkDescription {
    #[serde(default)]
    pub name: String,
    pub bridge: Option<NameAttr>,
    #[serde(default)]
    pub portgroup: Vec<Portgroup>,
}

impl NetworkDescription {
    pub fn bridge_name(&self) -> Option<&str> {
        self.bridge.as_ref().and_then(|b| b.name.as_deref())
    }

    /// VLAN tags of the default portgroup.
    pub fn vlan_tags(&self) -> Vec<u16> {
        self.portgroup
            .iter()
            .filter(|p| p.name == PORTGROUP_NAME)
            .flat_map(|p| p.vlan.iter())
            .flat_map(|v| v.tag.iter().map(|t| t.id))
            .collect()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Portgroup {
    #[serde(rename = "@name", default)]
    pub name: String,
    #[serde(rename = "@default")]
    pub default: Option<String>,
    pub vlan: Option<Vlan>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Vlan {
    #[serde(rename = "@trunk")]
    pub trunk: Option<String>,
    #[serde(default)]
    pub tag: Vec<VlanTag>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VlanTag {
    #[serde(rename = "@id")]
    pub id: u16,
}

/// Parse a domain descriptor.
pub fn parse_domain(xml: &str) -> Result<DomainDescription> {
    quick_xml::de::from_str(xml)
        .map_err(|e| HypervisorError::XmlError(format!("invalid domain descriptor: {}", e)))
}

/// Parse a network descriptor.
pub fn parse_network(xml: &str) -> Result<NetworkDescription> {
    quick_xml::de::from_str(xml)
        .map_err(|e| HypervisorError::XmlError(format!("invalid network descriptor: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_guest() -> Guest {
        Guest::new("web-01")
            .with_type("kvm")
            .with_memory(1024)
            .with_cpu(2)
            .with_disk(Disk::new("web-01-root").with_target("vda", DiskBus::Virtio))
            .with_nic(Nic::new("br0"))
    }

    #[test]
    fn test_basic_xml_generation() {
        let xml = render_domain(&sample_guest(), &RenderOptions::default()).unwrap();

        assert!(xml.starts_with("<domain type='kvm'>"));
        assert!(xml.contains("<name>web-01</name>"));
        assert!(xml.contains("<memory unit='MiB'>1024</memory>"));
        assert!(xml.contains("<vcpu>2</vcpu>"));
        assert!(xml.contains("<type>hvm</type>"));
        assert!(xml.contains("<source dev='/dev/zvol/guests/images/web-01-root'/>"));
        assert!(xml.contains("<target dev='vda' bus='virtio'/>"));
        assert!(xml.contains("<source bridge='br0'/>"));
    }

    #[test]
    fn test_rendering_is_deterministic() {
        let guest = sample_guest()
            .with_metadata("owner", "ops")
            .with_metadata("env", "prod")
            .with_nic(Nic::new("br1").with_mac("52:54:00:00:00:02").with_vlans(vec![10, 20]));
        let options = RenderOptions::default();

        assert_eq!(
            render_domain(&guest, &options).unwrap(),
            render_domain(&guest.clone(), &options).unwrap()
        );
        assert_eq!(
            render_network(&guest.nics[1]).unwrap(),
            render_network(&guest.nics[1].clone()).unwrap()
        );
    }

    #[test]
    fn test_optional_elements_are_omitted() {
        let xml = render_domain(&sample_guest(), &RenderOptions::default()).unwrap();

        assert!(!xml.contains("<mac"));
        assert!(!xml.contains("<model"));
        assert!(!xml.contains("<metadata"));
    }

    #[test]
    fn test_optional_elements_are_emitted_when_present() {
        let mut guest = sample_guest().with_metadata("owner", "o'brien & co");
        guest.nics[0] = Nic::new("br0")
            .with_mac("52:54:00:aa:bb:cc")
            .with_model(NicModel::E1000);

        let xml = render_domain(&guest, &RenderOptions::default()).unwrap();

        assert!(xml.contains("<mac address='52:54:00:aa:bb:cc'/>"));
        assert!(xml.contains("<model type='e1000'/>"));
        assert!(xml.contains(&format!("xmlns:guest='{}'", METADATA_NAMESPACE)));
        assert!(xml.contains("<guest:parameter name='owner' value='o&apos;brien &amp; co'/>"));
    }

    #[test]
    fn test_metadata_order_is_stable() {
        let guest = sample_guest()
            .with_metadata("zeta", "1")
            .with_metadata("alpha", "2");
        let xml = render_domain(&guest, &RenderOptions::default()).unwrap();

        let alpha = xml.find("name='alpha'").unwrap();
        let zeta = xml.find("name='zeta'").unwrap();
        assert!(alpha < zeta);
    }

    #[test]
    fn test_disk_source_resolution() {
        let guest = Guest::new("g")
            .with_type("kvm")
            .with_disk(Disk::new("/dev/sdb").with_target("vda", DiskBus::Virtio))
            .with_disk(Disk::new("/var/lib/images/g.img").with_target("hdb", DiskBus::Ide))
            .with_disk(Disk::new("data").with_target("vdc", DiskBus::Virtio));
        let options = RenderOptions {
            volume_root: "/dev/zvol/tank/images/".to_string(),
        };

        let xml = render_domain(&guest, &options).unwrap();

        assert!(xml.contains("<disk type='block' device='disk'>\n      <driver name='qemu' type='raw'/>\n      <source dev='/dev/sdb'/>"));
        assert!(xml.contains("<disk type='file' device='disk'>\n      <driver name='qemu' type='raw'/>\n      <source file='/var/lib/images/g.img'/>"));
        assert!(xml.contains("<target dev='hdb' bus='ide'/>"));
        assert!(xml.contains("<source dev='/dev/zvol/tank/images/data'/>"));
    }

    #[test]
    fn test_vlan_nic_uses_its_network() {
        let guest = Guest::new("g")
            .with_type("kvm")
            .with_nic(Nic::new("br0").with_mac("02:00:00:00:00:01").with_vlans(vec![7]));

        let xml = render_domain(&guest, &RenderOptions::default()).unwrap();

        assert!(xml.contains("<interface type='network'>"));
        assert!(xml.contains("<source network='02:00:00:00:00:01' portgroup='default'/>"));
        assert!(!xml.contains("source bridge"));
    }

    #[test]
    fn test_render_errors_instead_of_panicking() {
        let options = RenderOptions::default();

        let mut guest = sample_guest();
        guest.id.clear();
        assert!(matches!(render_domain(&guest, &options), Err(HypervisorError::XmlError(_))));

        let mut guest = sample_guest();
        guest.kind.clear();
        assert!(render_domain(&guest, &options).is_err());

        let guest = sample_guest().with_disk(Disk::new("x"));
        assert!(render_domain(&guest, &options).is_err());

        let guest = sample_guest().with_nic(Nic::default());
        assert!(render_domain(&guest, &options).is_err());

        let guest = sample_guest().with_nic(Nic::new("br0").with_vlans(vec![5]));
        assert!(render_domain(&guest, &options).is_err());
    }

    #[test]
    fn test_network_xml_generation() {
        let nic = Nic::new("mistify0")
            .with_mac("02:aa:bb:cc:dd:ee")
            .with_vlans(vec![1, 100, 4094]);

        let xml = render_network(&nic).unwrap();

        assert!(xml.contains("<name>02:aa:bb:cc:dd:ee</name>"));
        assert!(xml.contains("<bridge name='mistify0'/>"));
        assert!(xml.contains("<virtualport type='openvswitch'/>"));
        assert!(xml.contains("<vlan trunk='yes'>"));

        let parsed = parse_network(&xml).unwrap();
        assert_eq!(parsed.name, "02:aa:bb:cc:dd:ee");
        assert_eq!(parsed.bridge_name(), Some("mistify0"));
        assert_eq!(parsed.vlan_tags(), vec![1, 100, 4094]);
    }

    #[test]
    fn test_network_single_tag_and_no_tags() {
        let single = render_network(&Nic::new("br0").with_mac("02:00:00:00:00:01").with_vlans(vec![9])).unwrap();
        assert!(single.contains("<vlan>\n      <tag id='9'/>"));

        let untagged = render_network(&Nic::new("br0").with_mac("02:00:00:00:00:01")).unwrap();
        assert!(untagged.contains("<portgroup name='default' default='yes'>\n  </portgroup>"));
        assert!(!untagged.contains("<vlan"));
    }

    #[test]
    fn test_network_render_errors() {
        assert!(render_network(&Nic::new("br0")).is_err());
        assert!(render_network(&Nic::default().with_mac("02:00:00:00:00:01")).is_err());
        assert!(render_network(&Nic::new("br0").with_mac("m").with_vlans(vec![0])).is_err());
        assert!(render_network(&Nic::new("br0").with_mac("m").with_vlans(vec![4095])).is_err());
    }

    #[test]
    fn test_rendered_domain_parses_back() {
        let guest = sample_guest()
            .with_metadata("owner", "ops")
            .with_nic(Nic::new("br1").with_mac("52:54:00:00:00:02").with_vlans(vec![3]));

        let xml = render_domain(&guest, &RenderOptions::default()).unwrap();
        let parsed = parse_domain(&xml).unwrap();

        assert_eq!(parsed.kind, "kvm");
        assert_eq!(parsed.name, "web-01");
        assert_eq!(parsed.vcpus(), 2);
        assert_eq!(parsed.memory.as_ref().map(|m| m.value), Some(1024));
        assert_eq!(parsed.devices.interfaces.len(), 2);
        assert_eq!(parsed.devices.interfaces[1].mac_address(), Some("52:54:00:00:00:02"));
        assert_eq!(parsed.devices.disks[0].target_dev(), Some("vda"));
    }

    #[test]
    fn test_parse_live_descriptor() {
        let live = r#"<domain type='kvm' id='3'>
  <name>web-01</name>
  <vcpu placement='static'>4</vcpu>
  <devices>
    <emulator>/usr/bin/qemu-system-x86_64</emulator>
    <disk type='block' device='disk'>
      <source dev='/dev/zvol/guests/images/root'/>
      <target dev='vda' bus='virtio'/>
      <alias name='virtio-disk0'/>
    </disk>
    <interface type='bridge'>
      <mac address='52:54:00:12:34:56'/>
      <source bridge='br0'/>
      <target dev='vnet7'/>
      <model type='virtio'/>
      <alias name='net0'/>
    </interface>
    <serial type='pty'/>
    <interface type='network'>
      <source network='default'/>
      <target dev='vnet8'/>
      <alias name='net1'/>
    </interface>
  </devices>
</domain>"#;

        let parsed = parse_domain(live).unwrap();

        assert_eq!(parsed.vcpus(), 4);
        let devices: Vec<_> = parsed
            .devices
            .interfaces
            .iter()
            .map(|i| (i.target_dev(), i.alias_name()))
            .collect();
        assert_eq!(devices, vec![(Some("vnet7"), Some("net0")), (Some("vnet8"), Some("net1"))]);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_domain("<domain><vcpu>many</vcpu></domain>").is_err());
    }
}
