use crate::error::Error;
use crate::resize::expander::{apply, plan, ResizePlan};
use crate::resize::grower::grow;
use crate::resize::inspector::PartitionTable;
use crate::resize::platform::{select_resizer, PlatformConfig, RootResizer};
use crate::resize::reread::RereadOutcome;
use crate::system::Invocation;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{error, info, warn};

/// Progress of a single resize run
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ResizeState {
    Idle,
    Located,
    Inspected,
    Planned,
    TableWritten,
    RereadAttempted,
    Grown,
    Failed,
}

impl fmt::Display for ResizeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResizeState::Idle => "idle",
            ResizeState::Located => "located",
            ResizeState::Inspected => "inspected",
            ResizeState::Planned => "planned",
            ResizeState::TableWritten => "table written",
            ResizeState::RereadAttempted => "reread attempted",
            ResizeState::Grown => "grown",
            ResizeState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Options for the resize operation
#[derive(Debug, Clone, Default)]
pub struct ResizeOptions {
    /// Stop after planning; nothing is written
    pub dry_run: bool,
    pub platform: PlatformConfig,
}

impl ResizeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn device_nodes(mut self, device_nodes: bool) -> Self {
        self.platform.device_nodes = device_nodes;
        self
    }

    pub fn mount_table(mut self, path: Option<PathBuf>) -> Self {
        self.platform.mount_table = path;
        self
    }

    pub fn sysfs(mut self, path: Option<PathBuf>) -> Self {
        self.platform.sysfs = path;
        self
    }
}

/// Result of a resize run
#[derive(Debug)]
pub struct ResizeReport {
    pub final_state: ResizeState,
    /// Mount table device of the root filesystem
    pub root_source: String,
    pub disk: String,
    pub fstype: String,
    pub table: PartitionTable,
    pub plan: ResizePlan,
    /// Editor invocations, including the piped script
    pub script: Vec<Invocation>,
    pub reread: Option<RereadOutcome>,
    pub grow_command: Invocation,
    /// List of operations performed (for logging)
    pub operations: Vec<String>,
}

/// A failed run: the error, and how far the run got before it
#[derive(Debug, Error)]
#[error("resize failed after reaching state '{reached}': {source}")]
pub struct ResizeFailure {
    /// Last state entered successfully
    pub reached: ResizeState,
    #[source]
    pub source: Error,
    pub operations: Vec<String>,
}

/// Drives one resizer through Locate, Inspect, Expand, Reread and Grow
///
/// Each stage consumes the previous stage's output; the first fatal error
/// ends the run. A failed kernel reread is not fatal: growth proceeds even
/// when the kernel may still hold the old partition size.
pub struct ResizeRun<'a> {
    resizer: &'a dyn RootResizer,
    dry_run: bool,
    state: ResizeState,
    operations: Vec<String>,
}

impl<'a> ResizeRun<'a> {
    pub fn new(resizer: &'a dyn RootResizer, dry_run: bool) -> Self {
        Self {
            resizer,
            dry_run,
            state: ResizeState::Idle,
            operations: Vec::new(),
        }
    }

    /// Run to completion. Consumes the run so it executes at most once.
    pub fn run(mut self) -> std::result::Result<ResizeReport, ResizeFailure> {
        match self.execute() {
            Ok(report) => Ok(report),
            Err(source) => {
                let reached = self.state;
                error!("{} -> {}: {}", reached, ResizeState::Failed, source);
                Err(ResizeFailure {
                    reached,
                    source,
                    operations: self.operations,
                })
            }
        }
    }

    fn enter(&mut self, state: ResizeState, operation: String) {
        info!("{} -> {}: {}", self.state, state, operation);
        self.state = state;
        self.operations.push(operation);
    }

    fn execute(&mut self) -> crate::error::Result<ResizeReport> {
        let resizer = self.resizer;
        let tools = resizer.tools();

        // The location owns any private device nodes; they are removed when
        // it drops at the end of this function, whichever way it returns
        let location = resizer.locate()?;
        self.enter(
            ResizeState::Located,
            format!(
                "Located root ({}, {}) on partition {} of {}",
                location.source,
                location.fstype,
                location.designator,
                location.disk
            ),
        );
        // Unsupported filesystems are rejected before the table is touched
        let grow_command = resizer.grow_invocation(&location)?;

        let table = resizer.inspect(&location)?;
        self.enter(
            ResizeState::Inspected,
            format!(
                "Read {} partition table of {} ({} partitions)",
                table.label,
                location.disk.path_str(),
                table.records.len()
            ),
        );

        let plan = plan(&table, location.designator.number)?;
        let editor = resizer.editor(&location, &table)?;
        let script = editor.script(&table, &plan)?;
        self.enter(
            ResizeState::Planned,
            format!(
                "Planned {} resize of partition {} from start sector {} to the end of the disk{}",
                editor.name(),
                plan.target_partition_number,
                plan.start_sector,
                match plan.growth_sectors(&table) {
                    Some(sectors) => format!(" (+{} sectors)", sectors),
                    None => String::new(),
                }
            ),
        );

        let mut report = ResizeReport {
            final_state: ResizeState::Planned,
            root_source: location.source.clone(),
            disk: location.disk.path_str(),
            fstype: location.fstype.clone(),
            table,
            plan,
            script,
            reread: None,
            grow_command,
            operations: Vec::new(),
        };

        if self.dry_run {
            self.operations
                .push("Dry run: partition table and filesystem left unchanged".to_string());
            report.operations = std::mem::take(&mut self.operations);
            return Ok(report);
        }

        apply(tools, editor.as_ref(), &report.table, &report.plan)?;
        self.enter(
            ResizeState::TableWritten,
            format!(
                "Rewrote partition {} on {}",
                report.plan.target_partition_number, report.disk
            ),
        );

        let outcome = resizer.reread(&location);
        if outcome == RereadOutcome::None {
            warn!("growing the filesystem without a confirmed partition table reread");
        }
        self.enter(
            ResizeState::RereadAttempted,
            format!("Partition table reread: {}", outcome),
        );
        report.reread = Some(outcome);

        grow(tools, &report.grow_command)?;
        self.enter(
            ResizeState::Grown,
            format!("Grew filesystem via {}", report.grow_command),
        );

        report.final_state = ResizeState::Grown;
        report.operations = std::mem::take(&mut self.operations);
        Ok(report)
    }
}

/// Grow the root filesystem of this machine
pub fn resize_root(options: &ResizeOptions) -> std::result::Result<ResizeReport, ResizeFailure> {
    let resizer = select_resizer(&options.platform).map_err(|source| ResizeFailure {
        reached: ResizeState::Idle,
        source,
        operations: Vec::new(),
    })?;
    info!("using {} resizer", resizer.name());
    ResizeRun::new(resizer.as_ref(), options.dry_run).run()
}

/// Locate, inspect and plan without changing anything
pub fn inspect_root(options: &ResizeOptions) -> std::result::Result<ResizeReport, ResizeFailure> {
    resize_root(&options.clone().dry_run(true))
}

impl fmt::Display for ResizeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Root filesystem: {} ({})", self.root_source, self.fstype)?;
        writeln!(f, "Disk: {} ({} label)", self.disk, self.table.label)?;
        if let Some(sectors) = self.table.disk_sectors {
            writeln!(f, "Disk sectors: {}", sectors)?;
        }
        writeln!(f)?;
        writeln!(f, "Partitions:")?;
        for record in &self.table.records {
            writeln!(
                f,
                "  {:>3}{} start {:>12} end {:>12} type {}{}",
                record.number,
                if record.bootable { "*" } else { " " },
                record.start_sector,
                record.end_sector,
                record.type_code,
                if record.is_logical() {
                    " (logical)"
                } else if record.is_container() {
                    " (extended)"
                } else {
                    ""
                }
            )?;
        }
        writeln!(f)?;
        writeln!(f, "Plan:")?;
        writeln!(f, "  Partition: {}", self.plan.target_partition_number)?;
        writeln!(f, "  Start sector: {} (unchanged)", self.plan.start_sector)?;
        writeln!(f, "  Current end sector: {}", self.plan.current_end_sector)?;
        if let Some(growth) = self.plan.growth_sectors(&self.table) {
            writeln!(f, "  Available growth: {} sectors", growth)?;
        }
        writeln!(f, "  Type: {}", self.plan.type_code)?;
        writeln!(f, "  Bootable: {}", if self.plan.bootable { "Yes" } else { "No" })?;
        writeln!(f)?;
        writeln!(f, "Commands:")?;
        for invocation in &self.script {
            writeln!(f, "  {}", invocation)?;
            if let Some(input) = &invocation.stdin {
                for line in input.lines() {
                    writeln!(f, "    | {}", line)?;
                }
            }
        }
        writeln!(f, "  {}", self.grow_command)?;
        if let Some(outcome) = &self.reread {
            writeln!(f)?;
            writeln!(f, "Reread: {}", outcome)?;
        }
        Ok(())
    }
}
