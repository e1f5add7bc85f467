//! Mount table parsing
//!
//! Linux `/proc/self/mounts` and FreeBSD `mount -p` both print fstab-shaped
//! rows: `device mountpoint fstype options [dump pass]`.

/// One row of the mount table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub device: String,
    pub mount_point: String,
    pub fstype: String,
    pub options: String,
}

impl MountEntry {
    /// Whether the source names a device node rather than a pseudo filesystem
    pub fn is_device_backed(&self) -> bool {
        self.device.starts_with('/')
    }
}

/// Parse mount table text, skipping blank, comment and short lines
pub fn parse_mount_table(text: &str) -> Vec<MountEntry> {
    text.lines()
        .filter(|line| !line.trim_start().starts_with('#'))
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let device = fields.next()?;
            let mount_point = fields.next()?;
            let fstype = fields.next()?;
            let options = fields.next().unwrap_or("");
            Some(MountEntry {
                device: unescape(device),
                mount_point: unescape(mount_point),
                fstype: fstype.to_string(),
                options: options.to_string(),
            })
        })
        .collect()
}

/// Decode the `\040`-style octal escapes the kernel uses for whitespace
fn unescape(field: &str) -> String {
    if !field.contains('\\') {
        return field.to_string();
    }

    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 4 <= bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|b| (b'0'..=b'7').contains(b)) {
                let value = digits.iter().fold(0u32, |acc, b| acc * 8 + (b - b'0') as u32);
                if let Ok(value) = u8::try_from(value) {
                    out.push(value);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROC_MOUNTS: &str = "\
rootfs / rootfs rw 0 0
sysfs /sys sysfs rw,nosuid,nodev,noexec,relatime 0 0
proc /proc proc rw,nosuid,nodev,noexec,relatime 0 0
/dev/sda1 / ext4 rw,relatime,errors=remount-ro 0 0
/dev/sdb1 /mnt/my\\040data xfs rw 0 0
";

    #[test]
    fn test_parse_proc_mounts() {
        let entries = parse_mount_table(PROC_MOUNTS);
        assert_eq!(entries.len(), 5);
        assert_eq!(entries[3].device, "/dev/sda1");
        assert_eq!(entries[3].mount_point, "/");
        assert_eq!(entries[3].fstype, "ext4");
        assert!(entries[3].is_device_backed());
        assert!(!entries[0].is_device_backed());
    }

    #[test]
    fn test_unescape_space() {
        let entries = parse_mount_table(PROC_MOUNTS);
        assert_eq!(entries[4].mount_point, "/mnt/my data");
    }

    #[test]
    fn test_parse_freebsd_mount_p() {
        let text = "/dev/da0s1a\t\t/\t\tufs\trw\t\t1 1\n";
        let entries = parse_mount_table(text);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].device, "/dev/da0s1a");
        assert_eq!(entries[0].fstype, "ufs");
    }

    #[test]
    fn test_skips_short_and_comment_lines() {
        let entries = parse_mount_table("# comment\n/dev/sda1 /\n\n");
        assert!(entries.is_empty());
    }
}
