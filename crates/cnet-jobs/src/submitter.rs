//! Cluster submitter: launches queue-draining workers through Slurm.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, error, info, instrument};

use cnet_core::defaults::{DRAIN_EXECUTABLE, SBATCH_BIN, SCHEDULER_CMD_TIMEOUT_SECS, SRUN_BIN};
use cnet_core::{ArraySpec, BatchScript, ClusterScheduler, Error, Result, RunConfig};
use cnet_queue::QueueNames;

use crate::options::ApplyOptions;

/// Outcome of a submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submission {
    /// The queue is populated; the command was not handed to the scheduler.
    Staged { command: String, job_count: usize },
    /// One scheduler handle per batch submission.
    Submitted {
        job_ids: Vec<String>,
        job_count: usize,
    },
}

impl Submission {
    pub fn job_count(&self) -> usize {
        match self {
            Submission::Staged { job_count, .. } | Submission::Submitted { job_count, .. } => {
                *job_count
            }
        }
    }
}

/// Builds worker commands and batch scripts from the run configuration.
pub struct ClusterSubmitter {
    config: RunConfig,
    names: QueueNames,
    scheduler: Arc<dyn ClusterScheduler>,
}

impl ClusterSubmitter {
    pub fn new(config: RunConfig, scheduler: Arc<dyn ClusterScheduler>) -> Self {
        let names = QueueNames::new(&config.redis.basename);
        Self {
            config,
            names,
            scheduler,
        }
    }

    /// Environment activation followed by the drain executable.
    ///
    /// Fixed-task workers get `--queue` so each keeps popping until the queue is empty.
    pub fn drain_command(&self, drain_queue: &str, fixed_task: bool) -> String {
        let env = &self.config.env;
        let redis = &self.config.redis;
        let mut job = format!(
            "{} -r={} -p={} {} {}",
            DRAIN_EXECUTABLE, redis.host, redis.port, drain_queue, self.names.working
        );
        if fixed_task {
            job.push_str(" --queue");
        }
        format!(
            "conda activate {} && export ISISROOT={} && export ISISDATA={} && {} {}",
            env.conda, env.isisroot, env.isisdata, SRUN_BIN, job
        )
    }

    /// Scheduler submissions covering `job_count` queued messages.
    ///
    /// Array mode splits the count into arrays of at most `chunksize`
    /// elements; fixed-task mode is a single submission.
    pub fn scripts(
        &self,
        job_count: usize,
        function_name: &str,
        opts: &ApplyOptions,
    ) -> Result<Vec<BatchScript>> {
        opts.validate()?;
        let drain_queue = self.names.drainable(&opts.target_queue)?;
        let command = self.drain_command(drain_queue, opts.fixed_task_mode());
        let log_dir = opts
            .log_dir
            .as_deref()
            .unwrap_or(&self.config.cluster.cluster_log_dir)
            .trim_end_matches('/');

        let base = BatchScript {
            job_name: opts.job_name.clone(),
            partition: opts
                .partition
                .clone()
                .unwrap_or_else(|| self.config.cluster.queue.clone()),
            mem_per_cpu: self.config.cluster.processing_memory,
            time: opts.walltime.clone(),
            output: format!("{}/cnet.{}-%j", log_dir, function_name),
            ntasks: None,
            array: None,
            exclude: opts.exclude.clone(),
            command,
        };

        if opts.fixed_task_mode() {
            return Ok(vec![BatchScript {
                ntasks: Some(opts.ntasks),
                ..base
            }]);
        }

        let mut scripts = Vec::new();
        let mut remaining = job_count;
        while remaining > 0 {
            let size = remaining.min(opts.chunksize);
            scripts.push(BatchScript {
                array: Some(ArraySpec {
                    size,
                    concurrency: opts.arraychunk,
                }),
                ..base.clone()
            });
            remaining -= size;
        }
        Ok(scripts)
    }

    /// Stage or submit workers for `job_count` queued messages.
    ///
    /// Scheduler errors are returned as-is; the queue stays populated so the
    /// caller can resubmit with `reapply`.
    #[instrument(skip(self, opts), fields(subsystem = "submit"))]
    pub async fn submit(
        &self,
        job_count: usize,
        function_name: &str,
        opts: &ApplyOptions,
    ) -> Result<Submission> {
        let drain_queue = self.names.drainable(&opts.target_queue)?;
        let command = self.drain_command(drain_queue, opts.fixed_task_mode());

        if opts.just_stage {
            info!(job_count, "Staged jobs without submitting");
            return Ok(Submission::Staged { command, job_count });
        }

        if job_count == 0 && !opts.fixed_task_mode() {
            return Err(Error::EmptyTarget(
                "no queued jobs to size the job array".into(),
            ));
        }

        let scripts = self.scripts(job_count, function_name, opts)?;
        let mut job_ids = Vec::with_capacity(scripts.len());
        for script in &scripts {
            match self.scheduler.submit(script).await {
                Ok(id) => {
                    debug!(scheduler_job_id = %id, array = ?script.array, "Submitted batch");
                    job_ids.push(id);
                }
                Err(e) => {
                    error!(
                        error = %e,
                        submitted = ?job_ids,
                        "Scheduler submission failed"
                    );
                    return Err(e);
                }
            }
        }

        info!(
            job_count,
            submissions = job_ids.len(),
            partition = %scripts.first().map(|s| s.partition.as_str()).unwrap_or_default(),
            "Submitted cluster jobs"
        );
        Ok(Submission::Submitted { job_ids, job_count })
    }
}

/// [`ClusterScheduler`] that shells out to `sbatch`.
#[derive(Debug, Clone)]
pub struct SlurmScheduler {
    sbatch: String,
    timeout: Duration,
}

impl Default for SlurmScheduler {
    fn default() -> Self {
        Self {
            sbatch: SBATCH_BIN.to_string(),
            timeout: Duration::from_secs(SCHEDULER_CMD_TIMEOUT_SECS),
        }
    }
}

impl SlurmScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_binary(mut self, path: impl Into<String>) -> Self {
        self.sbatch = path.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// `sbatch` arguments for a script; the command is passed with `--wrap`.
    pub fn sbatch_args(script: &BatchScript) -> Vec<String> {
        let mut args = vec![
            "--parsable".to_string(),
            format!("--job-name={}", script.job_name),
            format!("--partition={}", script.partition),
            format!("--mem-per-cpu={}", script.mem_per_cpu),
            format!("--time={}", script.time),
            format!("--output={}", script.output),
        ];
        if let Some(ntasks) = script.ntasks {
            args.push(format!("--ntasks={}", ntasks));
        }
        if let Some(array) = script.array {
            args.push(format!("--array=1-{}%{}", array.size, array.concurrency));
        }
        if let Some(exclude) = &script.exclude {
            args.push(format!("--exclude={}", exclude));
        }
        args.push(format!("--wrap={}", script.command));
        args
    }
}

/// Job id from `sbatch --parsable` output (`<id>` or `<id>;<cluster>`).
pub fn parse_job_id(stdout: &str) -> Result<String> {
    let line = stdout.lines().map(str::trim).find(|l| !l.is_empty());
    let id = line
        .and_then(|l| l.split(';').next())
        .map(|id| id.trim_start_matches("Submitted batch job ").trim())
        .filter(|id| !id.is_empty() && id.chars().all(|c| c.is_ascii_digit()));
    id.map(str::to_string).ok_or_else(|| {
        Error::Scheduler(format!("unexpected sbatch output: {:?}", stdout.trim()))
    })
}

async fn run_cmd_with_timeout(cmd: &mut Command, timeout: Duration) -> Result<String> {
    let output = tokio::time::timeout(timeout, cmd.output())
        .await
        .map_err(|_| {
            Error::Scheduler(format!(
                "Scheduler command timed out after {}s",
                timeout.as_secs()
            ))
        })?
        .map_err(|e| Error::Scheduler(format!("Failed to execute scheduler command: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::Scheduler(format!(
            "Command failed ({}): {}",
            output.status,
            stderr.trim()
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[async_trait]
impl ClusterScheduler for SlurmScheduler {
    async fn submit(&self, script: &BatchScript) -> Result<String> {
        let args = Self::sbatch_args(script);
        debug!(sbatch = %self.sbatch, ?args, "Invoking sbatch");
        let mut cmd = Command::new(&self.sbatch);
        cmd.args(&args).kill_on_drop(true);
        let stdout = run_cmd_with_timeout(&mut cmd, self.timeout).await?;
        parse_job_id(&stdout)
    }
}
