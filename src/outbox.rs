use crate::db;
use crate::email::{EmailMessage, EmailSender};
use crate::model::OutboxKind;
use anyhow::Result;
use sqlx::SqlitePool;
use std::time::Duration;
use tracing::{error, info, instrument, warn};

/// Deliver the next due outbox task, if any. Returns whether one was found.
///
/// A failed delivery is rescheduled with exponential backoff; a payload that
/// cannot be decoded is dropped since retrying would never succeed.
#[instrument(skip_all)]
pub async fn process_next_task(
    pool: &SqlitePool,
    sender: &dyn EmailSender,
    max_backoff_secs: i64,
) -> Result<bool> {
    let Some(task) = db::outbox::next_due(pool).await? else {
        return Ok(false);
    };
    match task.kind {
        OutboxKind::SendEmail => {
            let msg: EmailMessage = match serde_json::from_value(task.payload.clone()) {
                Ok(msg) => msg,
                Err(err) => {
                    error!(?err, id = task.id, "undecodable email payload; dropping task");
                    db::outbox::delete(pool, task.id).await?;
                    return Ok(true);
                }
            };
            match sender.send(&msg).await {
                Ok(()) => {
                    db::outbox::delete(pool, task.id).await?;
                    info!(id = task.id, to = %msg.to, "outbox task succeeded");
                }
                Err(err) => {
                    warn!(?err, id = task.id, attempt = task.attempt, "outbox task failed; backoff");
                    db::outbox::backoff_with_cap(pool, task.id, task.attempt, max_backoff_secs).await?;
                }
            }
        }
    }
    Ok(true)
}

/// Deliver everything currently due. Returns the number of tasks handled.
pub async fn drain(pool: &SqlitePool, sender: &dyn EmailSender, max_backoff_secs: i64) -> Result<usize> {
    let mut handled = 0;
    let limit = db::outbox::count_remaining(pool).await?;
    // Failed tasks are pushed into the future, so each is seen at most once.
    while (handled as i64) < limit && process_next_task(pool, sender, max_backoff_secs).await? {
        handled += 1;
    }
    Ok(handled)
}

/// Poll loop for the server: drains due tasks, then sleeps.
pub async fn run_worker(
    pool: SqlitePool,
    sender: std::sync::Arc<dyn EmailSender>,
    poll_interval: Duration,
    max_backoff_secs: i64,
) {
    info!(?poll_interval, "outbox worker started");
    loop {
        match process_next_task(&pool, sender.as_ref(), max_backoff_secs).await {
            Ok(true) => continue,
            Ok(false) => {}
            Err(err) => error!(?err, "outbox worker error"),
        }
        tokio::time::sleep(poll_interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recording {
        sent: Mutex<Vec<EmailMessage>>,
        fail: bool,
    }

    #[async_trait]
    impl EmailSender for Recording {
        async fn send(&self, msg: &EmailMessage) -> Result<()> {
            if self.fail {
                return Err(anyhow!("provider down"));
            }
            self.sent.lock().unwrap().push(msg.clone());
            Ok(())
        }
    }

    fn message() -> EmailMessage {
        EmailMessage {
            to: "c@acme.test".into(),
            subject: "Hello".into(),
            html: "<p>Hello</p>".into(),
            text: "Hello".into(),
        }
    }

    #[tokio::test]
    async fn delivers_and_deletes() {
        let pool = db::memory_pool().await.unwrap();
        crate::email::enqueue(&pool, &message()).await.unwrap();
        let sender = Recording::default();

        assert!(process_next_task(&pool, &sender, 60).await.unwrap());
        assert!(!process_next_task(&pool, &sender, 60).await.unwrap());
        assert_eq!(sender.sent.lock().unwrap().as_slice(), &[message()]);
        assert_eq!(db::outbox::count_remaining(&pool).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn failures_back_off_instead_of_spinning() {
        let pool = db::memory_pool().await.unwrap();
        crate::email::enqueue(&pool, &message()).await.unwrap();
        db::outbox::enqueue(&pool, OutboxKind::SendEmail, &json!({"bogus": true}), Utc::now())
            .await
            .unwrap();
        let sender = Recording {
            fail: true,
            ..Default::default()
        };

        assert_eq!(drain(&pool, &sender, 60).await.unwrap(), 2);
        // the undecodable task is gone, the failed one waits for its retry
        assert_eq!(db::outbox::count_remaining(&pool).await.unwrap(), 1);
        assert!(db::outbox::next_due(&pool).await.unwrap().is_none());
    }
}
