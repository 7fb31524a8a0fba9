//! Job types shipped with the daemon binary.
//!
//! `shell` runs in parallel with anything else, `shell_serial` never overlaps
//! another serial job. Both take the same payload:
//!
//! ```json
//! { "command": "backup.sh --full", "timeout_secs": 600, "retry": true, "every_secs": 3600 }
//! ```

use std::fmt::Write;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use txnd_engine::{BackoffUnit, EngineError, Job, JobContext, Registry};

/// Give-up threshold for shell jobs that retry.
const SHELL_MAX_ATTEMPTS: u32 = 5;

#[derive(Debug, Deserialize)]
struct ShellPayload {
    command: String,
    /// Reschedule a recurring transaction this long after a successful run.
    #[serde(default)]
    every_secs: Option<i64>,
    #[serde(default)]
    timeout_secs: Option<u64>,
    /// Retry with backoff instead of failing on a non-zero exit.
    #[serde(default)]
    retry: bool,
}

/// Runs `data.command` through `sh -c`.
pub struct Shell {
    serial: bool,
}

#[async_trait]
impl Job for Shell {
    async fn run(&self, ctx: &mut JobContext<'_>) -> anyhow::Result<()> {
        let payload: ShellPayload = ctx
            .transaction()
            .data()
            .context("payload needs a \"command\" string")?;
        if payload.command.trim().is_empty() {
            bail!("empty command");
        }

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&payload.command)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let output = match payload.timeout_secs {
            Some(secs) => tokio::time::timeout(Duration::from_secs(secs), cmd.output())
                .await
                .map_err(|_| anyhow::anyhow!("command timed out after {secs}s"))??,
            None => cmd.output().await?,
        };

        ctx.write_str(&String::from_utf8_lossy(&output.stdout))?;
        if !output.stderr.is_empty() {
            writeln!(ctx, "--- stderr ---")?;
            ctx.write_str(&String::from_utf8_lossy(&output.stderr))?;
        }

        if !output.status.success() {
            if !payload.retry {
                bail!("command exited with {}", output.status);
            }
            writeln!(ctx, "command exited with {}", output.status)?;
            let captured = ctx.output().to_string();
            return match ctx
                .transaction()
                .retry_incremental(&captured, 2, BackoffUnit::Minutes)
            {
                Ok(()) => Ok(()),
                Err(e @ EngineError::RetriesExhausted { .. }) => Err(e.into()),
                Err(e) => Err(e).context("rescheduling retry"),
            };
        }

        if let Some(every) = payload.every_secs {
            let transaction = ctx.transaction();
            if transaction.is_recurring() {
                let every = chrono::Duration::try_seconds(every)
                    .with_context(|| format!("every_secs {every} out of range"))?;
                transaction.schedule(Some(every))?;
            }
        }
        Ok(())
    }

    fn parallel(&self) -> bool {
        !self.serial
    }

    fn max_attempts(&self) -> Option<u32> {
        Some(SHELL_MAX_ATTEMPTS)
    }
}

/// Every job type the binary can execute.
pub fn registry() -> Registry {
    let mut registry = Registry::new();
    registry
        .register("shell", Shell { serial: false })
        .register("shell_serial", Shell { serial: true });
    registry
}
