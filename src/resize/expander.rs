use crate::error::{Error, Result};
use crate::resize::inspector::{geom_name, DiskLabel, PartitionTable};
use crate::system::{Invocation, ToolOutput, ToolRunner};
use tracing::{info, warn};

/// The single partition to rewrite
///
/// `start_sector` is copied verbatim from the on-disk record and is never
/// recomputed: the partition's data begins there. The new end is left to
/// the editing tool's "rest of disk" default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResizePlan {
    pub target_partition_number: u32,
    pub start_sector: u64,
    pub type_code: String,
    pub bootable: bool,
    pub is_extended: bool,
    /// Current last sector, kept for reporting
    pub current_end_sector: u64,
}

impl ResizePlan {
    /// Sectors between the current end and the disk end, when known
    pub fn growth_sectors(&self, table: &PartitionTable) -> Option<u64> {
        let last = table.disk_sectors?.checked_sub(1)?;
        Some(last.saturating_sub(self.current_end_sector))
    }
}

/// Build the plan for partition `target_number` of `table`
pub fn plan(table: &PartitionTable, target_number: u32) -> Result<ResizePlan> {
    let record = table.find(target_number)?;

    if record.is_container() {
        return Err(Error::Discovery {
            device: table.device.path_str(),
            reason: format!(
                "partition {} is an extended container, not a filesystem",
                target_number
            ),
        });
    }

    // Growing to the disk end would overlap a later partition, and fdisk
    // renumbers logical partitions when a middle one is recreated
    let blocking = table.records.iter().find(|other| {
        other.number != record.number
            && !(record.is_logical() && other.is_container())
            && (other.start_sector > record.start_sector
                || (record.is_logical() && other.is_logical() && other.number > record.number))
    });
    if let Some(next) = blocking {
        return Err(Error::NotLastPartition {
            disk: table.device.path_str(),
            number: record.number,
            next: next.number,
        });
    }

    if record.is_logical() {
        if let (Some(container), Some(disk_sectors)) =
            (table.extended_container(), table.disk_sectors)
        {
            if container.end_sector + 1 < disk_sectors {
                warn!(
                    "extended partition {} ends at sector {} of {}; logical partition {} can only grow inside it",
                    container.number, container.end_sector, disk_sectors, target_number
                );
            }
        }
    }

    Ok(ResizePlan {
        target_partition_number: record.number,
        start_sector: record.start_sector,
        type_code: record.type_code.clone(),
        bootable: record.bootable,
        is_extended: record.is_extended,
        current_end_sector: record.end_sector,
    })
}

/// Translates a plan into the command protocol of one partition editor
pub trait PartitionEditor {
    fn name(&self) -> &'static str;

    /// Invocations that perform the edit, in order
    fn script(&self, table: &PartitionTable, plan: &ResizePlan) -> Result<Vec<Invocation>>;

    /// Reject output that signals a failed edit despite a zero exit
    fn check_output(&self, _invocation: &Invocation, _output: &ToolOutput) -> Result<()> {
        Ok(())
    }
}

/// Run the editor's script; the first failing invocation aborts the edit
pub fn apply(
    tools: &dyn ToolRunner,
    editor: &dyn PartitionEditor,
    table: &PartitionTable,
    plan: &ResizePlan,
) -> Result<()> {
    let script = editor.script(table, plan)?;
    for invocation in &script {
        info!("{}: {}", editor.name(), invocation);
        let output = tools.run_checked(invocation)?;
        editor.check_output(invocation, &output)?;
    }
    Ok(())
}

/// fdisk on a DOS label, driven by a piped command script
///
/// The script deletes the partition, recreates it with the same number and
/// start sector (as logical when it lived in the extended container),
/// accepts the default end, restores the boot flag and type id, and writes.
/// fdisk skips the partition-number prompt when only one candidate exists,
/// so the number is only sent when it will be asked for.
#[derive(Debug, Default, Clone, Copy)]
pub struct FdiskEditor;

/// fdisk messages that mean the script went out of step with its prompts
const FDISK_SCRIPT_ERRORS: &[&str] = &[
    "Value out of range",
    "unknown command",
    "Invalid partition number",
    "No partition is defined yet",
    "is already defined",
    "No free sectors available",
    "Failed to add",
];

const FDISK_WRITE_CONFIRMATION: &str = "The partition table has been altered";

impl FdiskEditor {
    pub fn session(&self, table: &PartitionTable, plan: &ResizePlan) -> String {
        let n = plan.target_partition_number;
        let only_one = table.records.len() == 1;
        let select = |cmd: &str| {
            if only_one {
                format!("{}\n", cmd)
            } else {
                format!("{}\n{}\n", cmd, n)
            }
        };

        let mut script = select("d");

        script.push_str("n\n");
        let primaries = table.primary_count();
        if plan.is_extended {
            // The type prompt only appears while a primary slot is free
            if primaries < 4 {
                script.push_str("l\n");
            }
        } else {
            script.push_str("p\n");
            // Free primary slots once the target is deleted
            let free = 4 - primaries.saturating_sub(1).min(3);
            if free > 1 {
                script.push_str(&format!("{}\n", n));
            }
        }
        script.push_str(&format!("{}\n\n", plan.start_sector));

        if plan.bootable {
            script.push_str(&select("a"));
        }
        script.push_str(&select("t"));
        script.push_str(&format!("{}\n", plan.type_code));
        script.push_str("w\n");
        script
    }
}

impl PartitionEditor for FdiskEditor {
    fn name(&self) -> &'static str {
        "fdisk"
    }

    fn script(&self, table: &PartitionTable, plan: &ResizePlan) -> Result<Vec<Invocation>> {
        if table.label != DiskLabel::Dos {
            return Err(Error::UnsupportedLabel(table.label.to_string()));
        }
        Ok(vec![Invocation::new("fdisk")
            .args(["-u", "--wipe-partitions", "never"])
            .arg(table.device.path_str())
            .stdin(self.session(table, plan))])
    }

    fn check_output(&self, invocation: &Invocation, output: &ToolOutput) -> Result<()> {
        let combined = output.combined();
        let unexpected = FDISK_SCRIPT_ERRORS
            .iter()
            .find(|marker| combined.contains(*marker))
            .map(|marker| format!("fdisk reported '{}'", marker))
            .or_else(|| {
                (!combined.contains(FDISK_WRITE_CONFIRMATION))
                    .then(|| "fdisk did not confirm the write".to_string())
            });

        match unexpected {
            Some(status) => Err(Error::ToolInvocation {
                tool: invocation.to_string(),
                status,
                output: combined,
            }),
            None => Ok(()),
        }
    }
}

/// sfdisk on a GPT label: rewrites one partition in place with `-N`
///
/// Fields left empty in the script line keep their current value, so only
/// the size changes to `+` (all available space).
#[derive(Debug, Default, Clone, Copy)]
pub struct SfdiskEditor;

impl PartitionEditor for SfdiskEditor {
    fn name(&self) -> &'static str {
        "sfdisk"
    }

    fn script(&self, table: &PartitionTable, plan: &ResizePlan) -> Result<Vec<Invocation>> {
        if table.label != DiskLabel::Gpt {
            return Err(Error::UnsupportedLabel(table.label.to_string()));
        }
        Ok(vec![Invocation::new("sfdisk")
            .args(["--force", "--no-reread", "-N"])
            .arg(plan.target_partition_number.to_string())
            .arg(table.device.path_str())
            .stdin(format!("{}, +\n", plan.start_sector))])
    }
}

/// FreeBSD `gpart resize`, on the slice and then on the BSD label inside it
///
/// `gpart resize` keeps the start, type and attributes of the entry and
/// grows it to the largest size available.
#[derive(Debug, Clone, Copy)]
pub struct GpartEditor {
    /// Letter of the BSD partition holding the root (`a` in `da0s1a`)
    pub inner_label: Option<char>,
}

impl PartitionEditor for GpartEditor {
    fn name(&self) -> &'static str {
        "gpart"
    }

    fn script(&self, table: &PartitionTable, plan: &ResizePlan) -> Result<Vec<Invocation>> {
        let disk = geom_name(&table.device.path);
        let n = plan.target_partition_number.to_string();

        // Allow writing to the disk holding the mounted root
        let mut script = vec![Invocation::new("sysctl").arg("kern.geom.debugflags=16")];

        match table.label {
            DiskLabel::Gpt => script.push(Invocation::new("gpart").args(["recover", disk.as_str()])),
            DiskLabel::Dos => {}
            ref other => return Err(Error::UnsupportedLabel(other.to_string())),
        }
        script.push(Invocation::new("gpart").args(["resize", "-i", n.as_str(), disk.as_str()]));

        if let Some(letter) = self.inner_label {
            let index = (letter as u32) - ('a' as u32) + 1;
            script.push(
                Invocation::new("gpart")
                    .args(["resize", "-i"])
                    .arg(index.to_string())
                    .arg(format!("{}s{}", disk, n)),
            );
        }
        Ok(script)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{BlockDevice, DevNumbers};
    use crate::resize::inspector::{parse_fdisk_listing, parse_gpart_show};
    use crate::system::testing::FakeTools;

    fn table(listing: &str, disk: &str) -> PartitionTable {
        let parsed = parse_fdisk_listing(listing, disk).unwrap();
        PartitionTable {
            device: BlockDevice::new(disk, DevNumbers::new(8, 0)),
            label: parsed.label,
            records: parsed.records,
            disk_sectors: parsed.disk_sectors,
        }
    }

    const SINGLE: &str = "\
Disk /dev/sda: 40 GiB, 42949672960 bytes, 83886080 sectors
Disklabel type: dos
/dev/sda1  *     2048 41943039 41940992  20G 83 Linux
";

    const TWO_PRIMARY: &str = "\
Disklabel type: dos
/dev/vda1        2048  1050623  1048576  512M 82 Linux swap / Solaris
/dev/vda2  *  1050624 20971519 19920896  9.5G 83 Linux
";

    const LOGICAL: &str = "\
Disk /dev/sda: 40 GiB, 42949672960 bytes, 83886080 sectors
Disklabel type: dos
/dev/sda1  *     2048   999423   997376  487M 83 Linux
/dev/sda2     1001470 83886079 82884610 39.5G  5 Extended
/dev/sda5     1001472 83886079 82884608 39.5G 83 Linux
";

    #[test]
    fn test_plan_copies_start_type_and_flags() {
        let t = table(SINGLE, "/dev/sda");
        let plan = plan(&t, 1).unwrap();
        assert_eq!(plan.target_partition_number, 1);
        assert_eq!(plan.start_sector, 2048);
        assert_eq!(plan.type_code, "83");
        assert!(plan.bootable);
        assert!(!plan.is_extended);
        assert_eq!(plan.growth_sectors(&t), Some(83886079 - 41943039));
    }

    #[test]
    fn test_plan_start_sector_never_altered() {
        for start in [1u64, 63, 2048, 4096, 1_000_000_007, u64::MAX / 2] {
            let text = format!(
                "/dev/sdb1 {} {} 1 1M 83 Linux\n",
                start,
                start.saturating_add(10)
            );
            let t = table(&text, "/dev/sdb");
            assert_eq!(plan(&t, 1).unwrap().start_sector, t.records[0].start_sector);
        }
    }

    #[test]
    fn test_plan_rejects_container_and_missing() {
        let t = table(LOGICAL, "/dev/sda");
        assert!(matches!(plan(&t, 2), Err(Error::Discovery { .. })));
        assert!(matches!(
            plan(&t, 3),
            Err(Error::PartitionNotFound { number: 3, .. })
        ));
    }

    #[test]
    fn test_plan_rejects_partition_followed_by_another() {
        let text = "\
Disklabel type: dos
/dev/sda1  *     2048   999423   997376  487M 83 Linux
/dev/sda2     1001470 83886079 82884610 39.5G  5 Extended
/dev/sda5     1001472 81788927 80787456 38.5G 83 Linux
/dev/sda6    81790976 83886079  2095104    1G 82 Linux swap / Solaris
";
        let t = table(text, "/dev/sda");
        match plan(&t, 5) {
            Err(Error::NotLastPartition { disk, number, next }) => {
                assert_eq!(disk, "/dev/sda");
                assert_eq!(number, 5);
                assert_eq!(next, 6);
            }
            other => panic!("unexpected plan: {:?}", other),
        }
        // The primary ahead of the extended container is boxed in as well
        assert!(matches!(
            plan(&t, 1),
            Err(Error::NotLastPartition { number: 1, next: 2, .. })
        ));
        assert_eq!(plan(&t, 6).unwrap().start_sector, 81790976);

        let t = table(TWO_PRIMARY, "/dev/vda");
        assert!(matches!(
            plan(&t, 1),
            Err(Error::NotLastPartition { number: 1, next: 2, .. })
        ));
    }

    #[test]
    fn test_fdisk_session_single_partition() {
        let t = table(SINGLE, "/dev/sda");
        let p = plan(&t, 1).unwrap();
        assert_eq!(
            FdiskEditor.session(&t, &p),
            "d\nn\np\n1\n2048\n\na\nt\n83\nw\n"
        );
    }

    #[test]
    fn test_fdisk_session_second_primary() {
        let t = table(TWO_PRIMARY, "/dev/vda");
        let p = plan(&t, 2).unwrap();
        assert_eq!(
            FdiskEditor.session(&t, &p),
            "d\n2\nn\np\n2\n1050624\n\na\n2\nt\n2\n83\nw\n"
        );
    }

    #[test]
    fn test_fdisk_session_logical() {
        let t = table(LOGICAL, "/dev/sda");
        let p = plan(&t, 5).unwrap();
        assert!(p.is_extended);
        assert!(!p.bootable);
        assert_eq!(
            FdiskEditor.session(&t, &p),
            "d\n5\nn\nl\n1001472\n\nt\n5\n83\nw\n"
        );
    }

    #[test]
    fn test_fdisk_session_all_primaries_used() {
        let text = "\
/dev/sdc1 2048 4095 2048 1M 83 Linux
/dev/sdc2 4096 6143 2048 1M 83 Linux
/dev/sdc3 6144 8191 2048 1M 83 Linux
/dev/sdc4 8192 10239 2048 1M 83 Linux
";
        let t = table(text, "/dev/sdc");
        let p = plan(&t, 4).unwrap();
        // Deleting 4 leaves exactly one free slot, which fdisk selects itself
        assert_eq!(
            FdiskEditor.session(&t, &p),
            "d\n4\nn\np\n8192\n\nt\n4\n83\nw\n"
        );
    }

    #[test]
    fn test_fdisk_invocation_and_label_check() {
        let t = table(SINGLE, "/dev/sda");
        let p = plan(&t, 1).unwrap();
        let script = FdiskEditor.script(&t, &p).unwrap();
        assert_eq!(script.len(), 1);
        assert_eq!(script[0].program, "fdisk");
        assert_eq!(script[0].args.last().unwrap(), "/dev/sda");
        assert!(script[0].stdin.is_some());

        let mut gpt = t.clone();
        gpt.label = DiskLabel::Gpt;
        assert!(matches!(
            FdiskEditor.script(&gpt, &p),
            Err(Error::UnsupportedLabel(_))
        ));
    }

    #[test]
    fn test_fdisk_output_checks() {
        let inv = Invocation::new("fdisk");
        let ok = ToolOutput {
            code: Some(0),
            stdout: "The partition table has been altered.\nSyncing disks.\n".to_string(),
            stderr: String::new(),
        };
        assert!(FdiskEditor.check_output(&inv, &ok).is_ok());

        let out_of_range = ToolOutput {
            code: Some(0),
            stdout: "Value out of range.\nThe partition table has been altered.\n".to_string(),
            stderr: String::new(),
        };
        assert!(FdiskEditor.check_output(&inv, &out_of_range).is_err());

        let no_write = ToolOutput {
            code: Some(0),
            stdout: "Command (m for help): ".to_string(),
            stderr: String::new(),
        };
        assert!(matches!(
            FdiskEditor.check_output(&inv, &no_write),
            Err(Error::ToolInvocation { .. })
        ));
    }

    #[test]
    fn test_sfdisk_script_keeps_start() {
        let text = "\
Disklabel type: gpt
/dev/vda1   2048    4095    2048   1M BIOS boot
/dev/vda2   4096 20971486 20967391  10G Linux filesystem
";
        let t = table(text, "/dev/vda");
        let p = plan(&t, 2).unwrap();
        assert_eq!(p.type_code, "Linux filesystem");
        let script = SfdiskEditor.script(&t, &p).unwrap();
        assert_eq!(
            script[0].args,
            vec!["--force", "--no-reread", "-N", "2", "/dev/vda"]
        );
        assert_eq!(script[0].stdin.as_deref(), Some("4096, +\n"));
    }

    #[test]
    fn test_gpart_script_with_inner_label() {
        let mut t = table(&SINGLE.replace("/dev/sda", "/dev/da0"), "/dev/da0");
        t.records[0].start_sector = 63;
        let p = plan(&t, 1).unwrap();
        let script = GpartEditor {
            inner_label: Some('a'),
        }
        .script(&t, &p)
        .unwrap();
        let lines: Vec<String> = script.iter().map(|i| i.to_string()).collect();
        assert_eq!(
            lines,
            vec![
                "sysctl kern.geom.debugflags=16",
                "gpart resize -i 1 da0",
                "gpart resize -i 1 da0s1",
            ]
        );
    }

    #[test]
    fn test_gpart_script_on_gpt_recovers_first() {
        let text = "\
=>      40  83886000  ada0  GPT  (40G)
        40      1024     1  freebsd-boot  (512K)
      1064   4194304     2  freebsd-swap  (2.0G)
   4195368  16775168     3  freebsd-zfs  (8.0G)
  20970536  62915504        - free -  (30G)
";
        let parsed = parse_gpart_show(text, "ada0").unwrap();
        let t = PartitionTable {
            device: BlockDevice::new("/dev/ada0", None),
            label: parsed.label,
            records: parsed.records,
            disk_sectors: parsed.disk_sectors,
        };
        let p = plan(&t, 3).unwrap();
        assert_eq!(p.start_sector, 4195368);
        let script = GpartEditor { inner_label: None }.script(&t, &p).unwrap();
        let lines: Vec<String> = script.iter().map(|i| i.to_string()).collect();
        assert_eq!(
            lines,
            vec![
                "sysctl kern.geom.debugflags=16",
                "gpart recover ada0",
                "gpart resize -i 3 ada0",
            ]
        );

        let mut other = t.clone();
        other.label = DiskLabel::Other("apm".to_string());
        assert!(matches!(
            GpartEditor { inner_label: None }.script(&other, &p),
            Err(Error::UnsupportedLabel(_))
        ));
    }

    #[test]
    fn test_apply_stops_at_first_failure() {
        let t = table(SINGLE, "/dev/sda");
        let p = plan(&t, 1).unwrap();
        let tools = FakeTools::default().with("fdisk", 1, "fdisk: cannot open /dev/sda");
        let err = apply(&tools, &FdiskEditor, &t, &p).unwrap_err();
        assert!(matches!(err, Error::ToolInvocation { .. }));
        assert_eq!(tools.programs(), vec!["fdisk".to_string()]);
    }
}
