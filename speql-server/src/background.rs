//! Background worker (part of C9, §4.10): spends idle `db` capacity
//! pre-materializing the last speculated query so a following keystroke's
//! `create()` call finds a warm cache entry instead of starting cold.
//!
//! Runs at priority 0 and holds the slot under the key `"__background__"`,
//! so any foreground request — which always claims with its own session key
//! at priority ≥ 1 — preempts it immediately per [`JobSlot::claim`]'s
//! urgent-displaces-background rule.

use std::sync::Arc;

use crate::orchestrator::Core;

const BACKGROUND_KEY: &str = "__background__";

/// Run forever, waking on [`Core::background_signal`] and re-running
/// `create` against `last_speculated_sql` whenever the feature flag is on
/// and there's something to speculate on.
pub async fn run(core: Arc<Core>) {
    loop {
        core.background_signal.wait().await;

        if !core.config.enable.background_thread {
            continue;
        }

        let Some(sql) = core.last_speculated().await else {
            continue;
        };

        let ticket = core.db_slot.claim(0, BACKGROUND_KEY).await;
        if !ticket.is_current_holder().await {
            ticket.release().await;
            continue;
        }

        match crate::orchestrator::create(&core, &sql, 0, BACKGROUND_KEY).await {
            Ok(rewritten) => {
                tracing::debug!(sql = %rewritten, "background create materialized fragment");
            }
            Err(e) => {
                tracing::debug!(error = %e, "background create failed, discarding");
            }
        }

        ticket.release().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm_client::MockLlm;
    use crate::warehouse_client::MockWarehouse;
    use speql::Config;

    fn test_core() -> Arc<Core> {
        Core::new(Config::default(), Arc::new(MockLlm::new()), Arc::new(MockWarehouse::new()))
    }

    #[tokio::test]
    async fn background_noop_without_speculated_sql() {
        let core = test_core();
        core.background_signal.signal();

        let handle = tokio::spawn(run(Arc::clone(&core)));
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        handle.abort();

        assert!(core.db_slot.claim(0, "anything").await.is_current_holder().await);
    }

    #[tokio::test]
    async fn background_materializes_last_speculated_sql() {
        let warehouse = Arc::new(MockWarehouse::new());
        let core = Core::new(Config::default(), Arc::new(MockLlm::new()), Arc::clone(&warehouse));
        core.set_last_speculated("SELECT * FROM t".to_string()).await;
        core.background_signal.signal();

        let handle = tokio::spawn(run(Arc::clone(&core)));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        handle.abort();

        assert!(warehouse
            .call_log()
            .iter()
            .any(|c| c.starts_with("execute:CREATE TEMPORARY TABLE")));
    }
}
