use std::any::Any;
use std::panic::AssertUnwindSafe;

use chrono::Utc;
use futures_util::FutureExt;
use tracing::{info, info_span, warn, Instrument};
use txnd_store::Store;

use crate::error::Result;
use crate::job::{Job, JobContext, Registry};
use crate::transaction::Transaction;

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Failed,
}

/// Run one claimed transaction and record its outcome.
///
/// The output is framed by start and finish markers, whatever the result.
/// A job error or panic
/// marks the transaction failed with the output captured up to that point;
/// otherwise it is marked completed.
pub async fn run(job: &dyn Job, transaction: &mut Transaction) -> Result<Outcome> {
    let id = transaction.id();
    let classname = transaction.classname().to_string();
    let span = info_span!("job", job.id = id, job.classname = %classname);

    async move {
        info!("running transaction");
        let mut ctx = JobContext::new(transaction);
        ctx.push_marker(&format!("Running {classname} - {id}"));

        let result = AssertUnwindSafe(job.run(&mut ctx))
            .catch_unwind()
            .await
            .map_err(|panic| anyhow::anyhow!("job panicked: {}", panic_message(&*panic)))
            .and_then(std::convert::identity);
        ctx.push_marker(&format!("Finished {classname} - {id}"));

        match result {
            Ok(()) => {
                let output = ctx.into_output();
                transaction.mark_completed(&output, None)?;
                info!("transaction completed");
                Ok(Outcome::Completed)
            }
            Err(error) => {
                let output = ctx.into_output();
                warn!(error = %error, "transaction run failed");
                transaction.mark_failed(&output, &format!("{error:#}"), None)?;
                Ok(Outcome::Failed)
            }
        }
    }
    .instrument(span)
    .await
}

/// Worker entry point: load transaction `id`, run it with the registered
/// job type and release the claim afterwards, even when recording the outcome
/// failed. An unregistered classname is marked failed.
pub async fn execute(store: &Store, registry: &Registry, id: i64) -> Result<Outcome> {
    let mut transaction = registry.load(store, id)?;

    let outcome = match registry.get(transaction.classname()) {
        Ok(job) => run(job.as_ref(), &mut transaction).await,
        Err(e) => {
            warn!(job_id = id, error = %e, "no job type for transaction");
            transaction
                .mark_failed("", &e.to_string(), None)
                .map(|()| Outcome::Failed)
        }
    };

    let unlocked = transaction.unlock();
    let outcome = outcome?;
    unlocked?;
    Ok(outcome)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

impl JobContext<'_> {
    fn push_marker(&mut self, text: &str) {
        use std::fmt::Write;
        // writing to a String buffer cannot fail
        let _ = writeln!(self, "[{}] {text}", Utc::now().to_rfc2822());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Enqueue;
    use async_trait::async_trait;
    use chrono::Duration;
    use std::fmt::Write;

    struct Echo;

    #[async_trait]
    impl Job for Echo {
        async fn run(&self, ctx: &mut JobContext<'_>) -> anyhow::Result<()> {
            let payload = ctx.transaction().payload()?;
            writeln!(ctx, "payload {}", serde_json::Value::Object(payload))?;
            Ok(())
        }
    }

    struct Fails;

    #[async_trait]
    impl Job for Fails {
        async fn run(&self, ctx: &mut JobContext<'_>) -> anyhow::Result<()> {
            writeln!(ctx, "about to fail")?;
            anyhow::bail!("backend unavailable")
        }
    }

    struct Panics;

    #[async_trait]
    impl Job for Panics {
        async fn run(&self, ctx: &mut JobContext<'_>) -> anyhow::Result<()> {
            writeln!(ctx, "before panic")?;
            panic!("index out of range");
        }
    }

    struct Later;

    #[async_trait]
    impl Job for Later {
        async fn run(&self, ctx: &mut JobContext<'_>) -> anyhow::Result<()> {
            ctx.transaction().schedule(Some(Duration::hours(1)))?;
            Ok(())
        }
    }

    fn registry() -> Registry {
        let mut registry = Registry::new();
        registry
            .register("echo", Echo)
            .register("fails", Fails)
            .register("panics", Panics)
            .register("later", Later);
        registry
    }

    fn claimed(store: &Store, registry: &Registry, classname: &str) -> i64 {
        let mut tx = registry
            .enqueue(
                store,
                classname,
                Enqueue::now().payload(serde_json::json!({"n": 7})),
            )
            .unwrap();
        tx.lock("test").unwrap();
        tx.id()
    }

    #[tokio::test]
    async fn successful_run_is_framed_and_completed() {
        let store = Store::open_in_memory().unwrap();
        let registry = registry();
        let id = claimed(&store, &registry, "echo");

        let outcome = execute(&store, &registry, id).await.unwrap();
        assert_eq!(outcome, Outcome::Completed);

        let rec = store.get(id).unwrap();
        assert!(rec.completed);
        assert!(!rec.failed);
        assert!(!rec.locked);

        let log = store.last_log_for(id).unwrap().unwrap();
        let lines: Vec<&str> = log.output.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].ends_with(&format!("Running echo - {id}")));
        assert_eq!(lines[1], r#"payload {"n":7}"#);
        assert!(lines[2].ends_with(&format!("Finished echo - {id}")));
    }

    #[tokio::test]
    async fn job_error_marks_failed_with_partial_output() {
        let store = Store::open_in_memory().unwrap();
        let registry = registry();
        let id = claimed(&store, &registry, "fails");

        let outcome = execute(&store, &registry, id).await.unwrap();
        assert_eq!(outcome, Outcome::Failed);

        let rec = store.get(id).unwrap();
        assert!(rec.failed && rec.completed && !rec.locked);
        let log = store.last_log_for(id).unwrap().unwrap();
        assert!(log.failed);
        let lines: Vec<&str> = log.output.lines().collect();
        assert!(lines[0].ends_with(&format!("Running fails - {id}")));
        assert_eq!(lines[1], "about to fail");
        assert!(lines[2].ends_with(&format!("Finished fails - {id}")));
        assert_eq!(log.exception.as_deref(), Some("backend unavailable"));
    }

    #[tokio::test]
    async fn panic_is_contained_and_marked_failed() {
        let store = Store::open_in_memory().unwrap();
        let registry = registry();
        let id = claimed(&store, &registry, "panics");

        let outcome = execute(&store, &registry, id).await.unwrap();
        assert_eq!(outcome, Outcome::Failed);

        let log = store.last_log_for(id).unwrap().unwrap();
        assert!(log.output.contains("before panic"));
        assert!(log
            .output
            .trim_end()
            .ends_with(&format!("Finished panics - {id}")));
        assert!(log
            .exception
            .as_deref()
            .unwrap()
            .contains("index out of range"));
        assert!(!store.get(id).unwrap().locked);
    }

    #[tokio::test]
    async fn self_rescheduling_job_stays_open() {
        let store = Store::open_in_memory().unwrap();
        let registry = registry();
        let id = claimed(&store, &registry, "later");

        execute(&store, &registry, id).await.unwrap();
        let rec = store.get(id).unwrap();
        assert!(!rec.completed);
        assert!(!rec.locked);
        assert!(rec.scheduled_at.unwrap() > Utc::now() + Duration::minutes(59));
    }

    #[tokio::test]
    async fn unknown_classname_is_marked_failed() {
        let store = Store::open_in_memory().unwrap();
        let registry = registry();
        let id = store
            .insert(&txnd_store::NewTransaction::new("vanished"))
            .unwrap()
            .id;

        let outcome = execute(&store, &registry, id).await.unwrap();
        assert_eq!(outcome, Outcome::Failed);
        let log = store.last_log_for(id).unwrap().unwrap();
        assert_eq!(log.exception.as_deref(), Some("unknown job type: vanished"));
    }
}
