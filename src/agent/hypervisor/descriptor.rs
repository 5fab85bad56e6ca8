use uuid::Uuid;

/// Thinly provisioned file volume: nothing is allocated up front, the
/// declared capacity is what the guest sees.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeDescriptor {
    pub name: String,
    pub format: String,
    pub capacity_bytes: u64,
}

impl VolumeDescriptor {
    pub fn new(name: impl Into<String>, format: impl Into<String>, capacity_bytes: u64) -> Self {
        Self {
            name: name.into(),
            format: format.into(),
            capacity_bytes,
        }
    }

    pub fn to_xml(&self) -> String {
        let mut xml = String::new();
        xml.push_str("<volume type=\"file\">\n");
        xml.push_str(&format!("  <name>{}</name>\n", escape(&self.name)));
        xml.push_str("  <allocation unit=\"bytes\">0</allocation>\n");
        xml.push_str(&format!(
            "  <capacity unit=\"bytes\">{}</capacity>\n",
            self.capacity_bytes
        ));
        xml.push_str("  <target>\n");
        xml.push_str(&format!(
            "    <format type=\"{}\"/>\n",
            escape(&self.format)
        ));
        xml.push_str("  </target>\n");
        xml.push_str("</volume>\n");
        xml
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskDevice {
    Disk,
    Cdrom,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainDisk {
    pub device: DiskDevice,
    pub format: String,
    pub pool: String,
    pub volume: String,
    pub target_dev: String,
    pub target_bus: String,
    pub serial: Option<String>,
    pub read_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainInterface {
    pub model: String,
    pub network: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainDescriptor {
    pub name: String,
    pub uuid: Uuid,
    pub memory_mib: u64,
    pub vcpus: u32,
    pub disks: Vec<DomainDisk>,
    pub interfaces: Vec<DomainInterface>,
}

impl DomainDescriptor {
    pub fn to_xml(&self) -> String {
        let mut xml = String::new();
        xml.push_str("<domain type=\"kvm\">\n");
        xml.push_str(&format!("  <name>{}</name>\n", escape(&self.name)));
        xml.push_str(&format!("  <uuid>{}</uuid>\n", self.uuid));
        xml.push_str(&format!(
            "  <memory unit=\"MiB\">{}</memory>\n",
            self.memory_mib
        ));
        xml.push_str(&format!(
            "  <vcpu placement=\"static\">{}</vcpu>\n",
            self.vcpus
        ));
        xml.push_str("  <os>\n");
        xml.push_str("    <type arch=\"x86_64\" machine=\"q35\">hvm</type>\n");
        xml.push_str("    <boot dev=\"hd\"/>\n");
        xml.push_str("  </os>\n");
        xml.push_str("  <features>\n    <acpi/>\n    <apic/>\n  </features>\n");
        xml.push_str("  <cpu mode=\"host-passthrough\"/>\n");
        xml.push_str("  <devices>\n");

        for disk in &self.disks {
            render_disk(&mut xml, disk);
        }

        for iface in &self.interfaces {
            xml.push_str("    <interface type=\"network\">\n");
            xml.push_str(&format!(
                "      <source network=\"{}\"/>\n",
                escape(&iface.network)
            ));
            xml.push_str(&format!(
                "      <model type=\"{}\"/>\n",
                escape(&iface.model)
            ));
            xml.push_str("    </interface>\n");
        }

        xml.push_str("    <channel type=\"unix\">\n");
        xml.push_str("      <source mode=\"bind\"/>\n");
        xml.push_str("      <target type=\"virtio\" name=\"org.qemu.guest_agent.0\"/>\n");
        xml.push_str("    </channel>\n");
        xml.push_str("    <console type=\"pty\">\n");
        xml.push_str("      <target type=\"serial\"/>\n");
        xml.push_str("    </console>\n");
        xml.push_str("    <graphics type=\"spice\" autoport=\"yes\"/>\n");
        xml.push_str("    <video>\n");
        xml.push_str("      <model type=\"virtio\">\n");
        xml.push_str("        <resolution x=\"1920\" y=\"1080\"/>\n");
        xml.push_str("      </model>\n");
        xml.push_str("    </video>\n");
        xml.push_str("    <memballoon model=\"virtio\"/>\n");
        xml.push_str("  </devices>\n");
        xml.push_str("</domain>\n");
        xml
    }
}

fn render_disk(xml: &mut String, disk: &DomainDisk) {
    let device = match disk.device {
        DiskDevice::Disk => "disk",
        DiskDevice::Cdrom => "cdrom",
    };

    xml.push_str(&format!("    <disk type=\"volume\" device=\"{device}\">\n"));
    match disk.device {
        DiskDevice::Disk => xml.push_str(&format!(
            "      <driver name=\"qemu\" type=\"{}\" cache=\"none\" io=\"native\"/>\n",
            escape(&disk.format)
        )),
        DiskDevice::Cdrom => xml.push_str(&format!(
            "      <driver name=\"qemu\" type=\"{}\"/>\n",
            escape(&disk.format)
        )),
    }
    xml.push_str(&format!(
        "      <source pool=\"{}\" volume=\"{}\"/>\n",
        escape(&disk.pool),
        escape(&disk.volume)
    ));
    xml.push_str(&format!(
        "      <target dev=\"{}\" bus=\"{}\"/>\n",
        escape(&disk.target_dev),
        escape(&disk.target_bus)
    ));
    if let Some(serial) = &disk.serial {
        xml.push_str(&format!("      <serial>{}</serial>\n", escape(serial)));
    }
    if disk.read_only {
        xml.push_str("      <readonly/>\n");
    }
    xml.push_str("    </disk>\n");
}

fn escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            c => escaped.push(c),
        }
    }
    escaped
}
