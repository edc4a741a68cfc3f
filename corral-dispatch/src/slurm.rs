//! Batch scheduler adapter
//!
//! [`BatchScheduler`] is the seam between the dispatcher and the cluster's
//! scheduler. [`SlurmCli`] drives Slurm through its command-line tools:
//! - `sbatch` to submit, with the job script piped on stdin
//! - `scancel --name` to cancel
//! - `scontrol update` to renice
//! - `squeue` to list the queue

use anyhow::{Context, Result};
use async_trait::async_trait;
use corral_core::domain::WorkItem;
use corral_core::priority::niceness;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

const MIB: u64 = 1 << 20;

/// Everything the scheduler needs to know to queue one Work Item
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSubmission {
    /// Job name; the Work Item id
    pub name: String,
    pub mem_mib: u64,
    pub cpus: u32,
    pub scratch_mib: u64,
    pub niceness: i64,
    pub partitions: Vec<String>,
    /// Wall-clock limit in whole minutes
    pub time_limit_minutes: Option<u64>,
}

impl JobSubmission {
    /// Derives the submission from a Work Item's constraints and priority
    pub fn for_work_item(item: &WorkItem) -> Self {
        let constraints = &item.runtime_constraints;
        Self {
            name: item.id.to_string(),
            mem_mib: constraints.ram_bytes.div_ceil(MIB),
            cpus: constraints.vcpus,
            scratch_mib: constraints.scratch_bytes.div_ceil(MIB),
            niceness: niceness(item.priority),
            partitions: item.scheduling.partitions.clone(),
            time_limit_minutes: item.scheduling.max_run_time_secs.map(|s| s.div_ceil(60)),
        }
    }

    /// `sbatch` flags for this job, without any site-wide arguments
    pub fn sbatch_args(&self) -> Vec<String> {
        let mut args = vec![
            format!("--job-name={}", self.name),
            format!("--mem={}", self.mem_mib),
            format!("--cpus-per-task={}", self.cpus),
            format!("--tmp={}", self.scratch_mib),
            format!("--nice={}", self.niceness),
        ];
        if !self.partitions.is_empty() {
            args.push(format!("--partition={}", self.partitions.join(",")));
        }
        if let Some(minutes) = self.time_limit_minutes {
            args.push(format!("--time={}", minutes));
        }
        args
    }
}

#[async_trait]
pub trait BatchScheduler: Send + Sync {
    async fn submit(&self, job: &JobSubmission) -> Result<()>;

    /// Cancels every job with this name
    async fn cancel(&self, name: &str) -> Result<()>;

    async fn renice(&self, name: &str, niceness: i64) -> Result<()>;

    /// Raw queue listing, one `name niceness priority` line per job
    async fn list_queue(&self) -> Result<String>;
}

/// Slurm driven through its CLI tools
#[derive(Debug, Clone)]
pub struct SlurmCli {
    /// Site-wide arguments placed before the per-job flags
    sbatch_arguments: Vec<String>,
    /// Program the batch job execs with the Work Item id
    runner_command: String,
}

impl SlurmCli {
    pub fn new(sbatch_arguments: Vec<String>, runner_command: impl Into<String>) -> Self {
        Self {
            sbatch_arguments,
            runner_command: runner_command.into(),
        }
    }

    /// Full `sbatch` argument list for a submission
    pub fn sbatch_command_line(&self, job: &JobSubmission) -> Vec<String> {
        let mut args = self.sbatch_arguments.clone();
        args.extend(job.sbatch_args());
        args
    }

    /// Batch script that hands the node over to the runner
    pub fn batch_script(&self, job: &JobSubmission) -> String {
        format!("#!/bin/sh\nexec {} {}\n", self.runner_command, job.name)
    }
}

/// Runs a scheduler command, failing on non-zero exit with its stderr
async fn run(program: &str, args: &[String], stdin: Option<&str>) -> Result<String> {
    debug!("Running {} {:?}", program, args);

    let mut child = Command::new(program)
        .args(args)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("Failed to execute {}", program))?;

    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        pipe.write_all(input.as_bytes())
            .await
            .with_context(|| format!("Failed to write script to {}", program))?;
    }

    let output = child
        .wait_with_output()
        .await
        .with_context(|| format!("Failed to wait for {}", program))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("{} {:?} failed ({}): {}", program, args, output.status, stderr.trim());
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[async_trait]
impl BatchScheduler for SlurmCli {
    async fn submit(&self, job: &JobSubmission) -> Result<()> {
        let args = self.sbatch_command_line(job);
        run("sbatch", &args, Some(&self.batch_script(job))).await?;
        info!("Submitted batch job {} (nice {})", job.name, job.niceness);
        Ok(())
    }

    async fn cancel(&self, name: &str) -> Result<()> {
        run("scancel", &[format!("--name={}", name)], None).await?;
        info!("Cancelled batch job {}", name);
        Ok(())
    }

    async fn renice(&self, name: &str, niceness: i64) -> Result<()> {
        let args = vec![
            "update".to_string(),
            format!("JobName={}", name),
            format!("Nice={}", niceness),
        ];
        run("scontrol", &args, None).await?;
        info!("Reniced batch job {} to {}", name, niceness);
        Ok(())
    }

    async fn list_queue(&self) -> Result<String> {
        let args = vec!["--all".to_string(), "--format=%j %y %Q".to_string()];
        run("squeue", &args, None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corral_core::domain::{
        ExecutionSpec, ResourceConstraints, SchedulingHints, WorkItem,
    };
    use std::collections::BTreeMap;

    fn work_item(ram_bytes: u64, vcpus: u32, partitions: &[&str]) -> WorkItem {
        let mut item = WorkItem::new(
            ExecutionSpec {
                command: vec!["true".to_string()],
                container_image: "img".to_string(),
                cwd: "/".to_string(),
                environment: BTreeMap::new(),
                mounts: BTreeMap::new(),
                output_path: "/out".to_string(),
            },
            ResourceConstraints {
                vcpus,
                ram_bytes,
                scratch_bytes: 0,
                gpus: None,
            },
            SchedulingHints {
                partitions: partitions.iter().map(|p| p.to_string()).collect(),
                ..SchedulingHints::default()
            },
        );
        item.priority = 1;
        item
    }

    #[test]
    fn test_sbatch_args_round_memory_up() {
        let item = work_item(250_000_000, 2, &[]);
        let job = JobSubmission::for_work_item(&item);
        assert_eq!(
            job.sbatch_args(),
            vec![
                format!("--job-name={}", item.id),
                "--mem=239".to_string(),
                "--cpus-per-task=2".to_string(),
                "--tmp=0".to_string(),
                "--nice=999000".to_string(),
            ]
        );
    }

    #[test]
    fn test_sbatch_args_with_partitions_and_site_arguments() {
        let item = work_item(250_000_000, 1, &["blurb", "b2"]);
        let slurm = SlurmCli::new(vec!["--export=ALL".to_string()], "corral-runner");
        let job = JobSubmission::for_work_item(&item);

        let args = slurm.sbatch_command_line(&job);
        assert_eq!(args.first().map(String::as_str), Some("--export=ALL"));
        assert_eq!(args.last().map(String::as_str), Some("--partition=blurb,b2"));
    }

    #[test]
    fn test_time_limit_rounds_up_to_minutes() {
        let mut item = work_item(MIB, 1, &[]);
        item.scheduling.max_run_time_secs = Some(61);
        let job = JobSubmission::for_work_item(&item);
        assert_eq!(job.time_limit_minutes, Some(2));
        assert!(job.sbatch_args().contains(&"--time=2".to_string()));
    }

    #[test]
    fn test_batch_script_execs_runner() {
        let item = work_item(MIB, 1, &[]);
        let slurm = SlurmCli::new(Vec::new(), "/usr/bin/corral-runner");
        let job = JobSubmission::for_work_item(&item);
        assert_eq!(
            slurm.batch_script(&job),
            format!("#!/bin/sh\nexec /usr/bin/corral-runner {}\n", item.id)
        );
    }
}
