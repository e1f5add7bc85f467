//! Partition table listing and parsing
//!
//! Two listing formats are understood, each with a fixed column contract.
//!
//! `fdisk -l -u <disk>` rows for the disk, left to right:
//!
//! ```text
//! dos (util-linux >= 2.26):  device [*] start end sectors size id type-name...
//! dos (older):               device [*] start end blocks id type-name...
//! gpt:                       device start end sectors size type-name...
//! ```
//!
//! The boot marker `*` is detected per row and shifts every later column by
//! one. The size column is recognised by its unit suffix (`20G`, `511.9M`);
//! ids are lower-case hex, so the two never collide.
//!
//! `gpart show <disk>` (FreeBSD):
//!
//! ```text
//! =>  start  size  provider  scheme  (human-size)
//!     start  size  index     type    [flags]  (human-size)
//!     start  size  -  free  -        (human-size)
//! ```

use crate::device::BlockDevice;
use crate::error::{Error, Result};
use crate::system::{Invocation, ToolRunner};
use std::fmt;
use std::path::Path;
use tracing::debug;

/// Partition table scheme of a disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiskLabel {
    /// MBR / DOS label, optionally with an extended container
    Dos,
    Gpt,
    Other(String),
}

impl DiskLabel {
    fn from_name(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "dos" | "mbr" => DiskLabel::Dos,
            "gpt" => DiskLabel::Gpt,
            other => DiskLabel::Other(other.to_string()),
        }
    }
}

impl fmt::Display for DiskLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiskLabel::Dos => write!(f, "dos"),
            DiskLabel::Gpt => write!(f, "gpt"),
            DiskLabel::Other(name) => write!(f, "{}", name),
        }
    }
}

/// One row of the partition table as currently on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionRecord {
    pub number: u32,
    pub start_sector: u64,
    pub end_sector: u64,
    pub sector_count: u64,
    /// Id as the editing tool expects it back (`83`, `Linux filesystem`, `freebsd`)
    pub type_code: String,
    /// Human readable type name, empty when the listing has none
    pub type_name: String,
    pub bootable: bool,
    /// Part of the extended scheme: the container itself or a logical
    /// partition inside it
    pub is_extended: bool,
}

impl PartitionRecord {
    /// Whether this row is the extended container rather than a data partition
    pub fn is_container(&self) -> bool {
        matches!(self.type_code.as_str(), "5" | "f" | "85")
            || self.type_name.contains("Extended")
            || self.type_name.contains("Ext'd")
    }

    pub fn is_logical(&self) -> bool {
        self.is_extended && !self.is_container()
    }
}

/// Snapshot of a disk's partition table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionTable {
    pub device: BlockDevice,
    pub label: DiskLabel,
    pub records: Vec<PartitionRecord>,
    /// Size of the whole disk in sectors, when the listing reports it
    pub disk_sectors: Option<u64>,
}

impl PartitionTable {
    /// The unique record with `number`
    pub fn find(&self, number: u32) -> Result<&PartitionRecord> {
        let mut matches = self.records.iter().filter(|r| r.number == number);
        let record = matches.next().ok_or_else(|| Error::PartitionNotFound {
            disk: self.device.path_str(),
            number,
        })?;
        if matches.next().is_some() {
            return Err(Error::DuplicatePartition {
                disk: self.device.path_str(),
                number,
            });
        }
        Ok(record)
    }

    /// Primary slots in use, counting the extended container
    pub fn primary_count(&self) -> usize {
        self.records.iter().filter(|r| !r.is_logical()).count()
    }

    pub fn extended_container(&self) -> Option<&PartitionRecord> {
        self.records.iter().find(|r| r.is_container())
    }
}

/// Which tool lists the table and how its output is shaped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListingFormat {
    Fdisk,
    Gpart,
}

impl ListingFormat {
    pub fn invocation(self, disk: &BlockDevice) -> Invocation {
        match self {
            ListingFormat::Fdisk => Invocation::new("fdisk").args(["-l", "-u"]).arg(disk.path_str()),
            ListingFormat::Gpart => Invocation::new("gpart").arg("show").arg(geom_name(&disk.path)),
        }
    }
}

/// GEOM provider name (`da0`) for a `/dev` path
pub fn geom_name(path: &Path) -> String {
    let s = path.display().to_string();
    s.strip_prefix("/dev/").unwrap_or(&s).to_string()
}

/// Parsed content of a listing, before it is tied to a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listing {
    pub label: DiskLabel,
    pub records: Vec<PartitionRecord>,
    pub disk_sectors: Option<u64>,
}

/// List the partition table of `disk` and parse it
pub fn inspect(
    tools: &dyn ToolRunner,
    disk: &BlockDevice,
    format: ListingFormat,
) -> Result<PartitionTable> {
    let invocation = format.invocation(disk);
    let output = tools.run_checked(&invocation)?;

    let listing = match format {
        ListingFormat::Fdisk => parse_fdisk_listing(&output.stdout, &disk.path_str())?,
        ListingFormat::Gpart => parse_gpart_show(&output.stdout, &geom_name(&disk.path))?,
    };
    for record in &listing.records {
        debug!("{}: {:?}", disk.path_str(), record);
    }

    Ok(PartitionTable {
        device: disk.clone(),
        label: listing.label,
        records: listing.records,
        disk_sectors: listing.disk_sectors,
    })
}

/// Parse `fdisk -l -u` output, keeping only rows for partitions of `disk`
pub fn parse_fdisk_listing(output: &str, disk: &str) -> Result<Listing> {
    let parse_error = |reason: String| Error::Parse {
        disk: disk.to_string(),
        reason,
    };

    let mut label = None;
    let mut disk_sectors = None;
    let mut records = Vec::new();

    for line in output.lines() {
        if let Some(name) = line.strip_prefix("Disklabel type:") {
            label = Some(DiskLabel::from_name(name.trim()));
            continue;
        }
        if line.starts_with(&format!("Disk {}:", disk)) {
            disk_sectors = header_sectors(line);
            continue;
        }

        let fields: Vec<&str> = line.split_whitespace().collect();
        let Some(suffix) = fields.first().and_then(|dev| partition_suffix(dev, disk)) else {
            continue;
        };
        let position = records.len() as u32 + 1;
        let number = suffix.unwrap_or(position);
        let gpt = label == Some(DiskLabel::Gpt);

        let bootable = fields.get(1) == Some(&"*");
        let col = if bootable { 2 } else { 1 };

        let start_sector = parse_sector(fields.get(col), "start")
            .map_err(|reason| parse_error(format!("row '{}': {}", line.trim(), reason)))?;
        let end_sector = parse_sector(fields.get(col + 1), "end")
            .map_err(|reason| parse_error(format!("row '{}': {}", line.trim(), reason)))?;
        if end_sector < start_sector {
            return Err(parse_error(format!(
                "row '{}': end sector before start sector",
                line.trim()
            )));
        }

        // col + 2 is the sectors (or blocks) count, then an optional size
        let mut next = col + 3;
        if fields.get(next).is_some_and(|f| is_size_column(f)) {
            next += 1;
        }

        let (type_code, type_name) = if gpt {
            let name = fields.get(next..).unwrap_or_default().join(" ");
            (name.clone(), name)
        } else {
            let code = fields
                .get(next)
                .ok_or_else(|| parse_error(format!("row '{}': missing type id", line.trim())))?;
            let name = fields.get(next + 1..).unwrap_or_default().join(" ");
            (code.to_string(), name)
        };
        if type_code.is_empty() {
            return Err(parse_error(format!("row '{}': missing type", line.trim())));
        }

        let mut record = PartitionRecord {
            number,
            start_sector,
            end_sector,
            sector_count: end_sector - start_sector + 1,
            type_code,
            type_name,
            bootable,
            is_extended: false,
        };
        record.is_extended = !gpt && (record.is_container() || record.number > 4);
        records.push(record);
    }

    if records.is_empty() {
        return Err(Error::NoPartitions(disk.to_string()));
    }

    Ok(Listing {
        label: label.unwrap_or(DiskLabel::Dos),
        records,
        disk_sectors,
    })
}

/// `None` when `device` is not a partition of `disk`, otherwise the number
/// its name carries (`Some(None)` when the suffix is not numeric)
fn partition_suffix(device: &str, disk: &str) -> Option<Option<u32>> {
    let rest = device.strip_prefix(disk)?;
    let rest = rest.strip_prefix('p').unwrap_or(rest);
    if rest.is_empty() || !rest.starts_with(|c: char| c.is_ascii_digit()) {
        return None;
    }
    Some(rest.parse().ok())
}

/// `Disk /dev/sda: 20 GiB, 21474836480 bytes, 41943040 sectors`
fn header_sectors(line: &str) -> Option<u64> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    let at = fields
        .iter()
        .position(|f| f.trim_end_matches(',') == "sectors")?;
    fields.get(at.checked_sub(1)?)?.parse().ok()
}

fn parse_sector(field: Option<&&str>, what: &str) -> std::result::Result<u64, String> {
    let field = field.ok_or_else(|| format!("missing {} sector", what))?;
    field
        .parse::<u64>()
        .map_err(|_| format!("{} sector '{}' is not a non-negative integer", what, field))
}

/// `20G`, `511.9M`, `1K`: digits with an upper-case unit
fn is_size_column(field: &str) -> bool {
    let Some(unit) = field.chars().last() else {
        return false;
    };
    let number = &field[..field.len() - unit.len_utf8()];
    "BKMGTPEZY".contains(unit)
        && !number.is_empty()
        && number.chars().all(|c| c.is_ascii_digit() || c == '.')
}

/// Parse `gpart show <disk>` output
pub fn parse_gpart_show(output: &str, disk: &str) -> Result<Listing> {
    let parse_error = |reason: String| Error::Parse {
        disk: disk.to_string(),
        reason,
    };

    let mut label = None;
    let mut disk_sectors = None;
    let mut records = Vec::new();

    for line in output.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        match fields.as_slice() {
            ["=>", start, size, provider, scheme, ..] => {
                // Only the first table belongs to the disk itself
                if label.is_some() || *provider != disk {
                    if label.is_some() {
                        break;
                    }
                    continue;
                }
                label = Some(DiskLabel::from_name(scheme));
                if let (Ok(start), Ok(size)) = (start.parse::<u64>(), size.parse::<u64>()) {
                    disk_sectors = Some(start + size);
                }
            }
            [start, size, index, type_code, rest @ ..] if label.is_some() => {
                if *index == "-" {
                    continue;
                }
                let start_sector = start
                    .parse::<u64>()
                    .map_err(|_| parse_error(format!("start sector '{}' is not a non-negative integer", start)))?;
                let sector_count = size
                    .parse::<u64>()
                    .map_err(|_| parse_error(format!("size '{}' is not a non-negative integer", size)))?;
                let number = index
                    .parse::<u32>()
                    .map_err(|_| parse_error(format!("index '{}' is not a number", index)))?;
                let bootable = rest
                    .iter()
                    .any(|f| f.starts_with('[') && (f.contains("active") || f.contains("bootme")));

                records.push(PartitionRecord {
                    number,
                    start_sector,
                    end_sector: (start_sector + sector_count).saturating_sub(1),
                    sector_count,
                    type_code: type_code.to_string(),
                    type_name: type_code.to_string(),
                    bootable,
                    is_extended: *type_code == "ebr",
                });
            }
            _ => {}
        }
    }

    let label = label.ok_or_else(|| Error::NoPartitions(disk.to_string()))?;
    if records.is_empty() {
        return Err(Error::NoPartitions(disk.to_string()));
    }

    Ok(Listing {
        label,
        records,
        disk_sectors,
    })
}
