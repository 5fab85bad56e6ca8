use crate::resources::machine::DiskType;

pub const PRIMARY_DISK_DEV: &str = "vda";
pub const PRIMARY_DISK_BUS: &str = "virtio";

/// Slot of the bootstrap cdrom; it is the letter the sd counter skips.
pub const CIDATA_DISK_DEV: &str = "sda";
pub const CIDATA_DISK_BUS: &str = "sata";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskSlot {
    pub dev: String,
    pub bus: &'static str,
}

/// Hands out target devices for additional disks in declaration order.
///
/// nvme disks are numbered on their own (`nvme0n1`, `nvme1n1`, ...). sata
/// and scsi disks share one `sd` letter sequence whose counter starts at 1,
/// so the first one is `sdb` and `sda` stays reserved.
#[derive(Debug)]
pub struct SlotAllocator {
    nvme: usize,
    sd: usize,
}

impl Default for SlotAllocator {
    fn default() -> Self {
        Self { nvme: 0, sd: 1 }
    }
}

impl SlotAllocator {
    pub fn next(&mut self, disk_type: DiskType) -> DiskSlot {
        match disk_type {
            DiskType::Nvme => {
                let dev = format!("nvme{}n1", self.nvme);
                self.nvme += 1;
                DiskSlot { dev, bus: "nvme" }
            }
            DiskType::Sata | DiskType::Scsi => {
                let dev = format!("sd{}", letters(self.sd));
                self.sd += 1;
                DiskSlot {
                    dev,
                    bus: disk_type.as_str(),
                }
            }
        }
    }
}

/// 0 -> a, 25 -> z, 26 -> aa, 27 -> ab, ...
pub fn letters(mut idx: usize) -> String {
    let mut out = Vec::new();
    loop {
        out.push(b'a' + (idx % 26) as u8);
        if idx < 26 {
            break;
        }
        idx = idx / 26 - 1;
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}
