use log::{debug, info};
use metrics::gauge;
use std::sync::Arc;
use tokio::sync::{Semaphore, broadcast, mpsc};
use tracing::Instrument;

use crate::queue::Identifiable;

/// Generic concurrent runner for queue-driven processors.
///
/// Bounded in-flight concurrency via a semaphore. On shutdown the runner
/// stops receiving and waits for in-flight tasks before returning.
pub struct ProcessorRunner {
    pub name: String,
    pub shutdown_rx: broadcast::Receiver<()>,
    pub concurrency: usize,
}

impl ProcessorRunner {
    pub fn new(name: &str, shutdown_rx: broadcast::Receiver<()>, concurrency: usize) -> Self {
        Self {
            name: name.to_string(),
            shutdown_rx,
            concurrency: concurrency.max(1),
        }
    }

    pub async fn run<T, F, Fut>(mut self, mut rx: mpsc::Receiver<T>, execute_fn: F)
    where
        T: Identifiable + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static + Clone,
        Fut: std::future::Future<Output = ()> + Send,
    {
        info!(
            "Starting {} processor with concurrency {}",
            self.name, self.concurrency
        );

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let metric_label = self.name.to_lowercase();
        let mut handled: u64 = 0;

        loop {
            let item = tokio::select! {
                _ = self.shutdown_rx.recv() => {
                    info!("{} processor received shutdown signal", self.name);
                    break;
                }
                item_opt = rx.recv() => match item_opt {
                    Some(item) => item,
                    None => {
                        info!("{} channel closed", self.name);
                        break;
                    }
                }
            };

            let permit = tokio::select! {
                _ = self.shutdown_rx.recv() => {
                    info!("{} processor received shutdown signal", self.name);
                    break;
                }
                res = semaphore.clone().acquire_owned() => match res {
                    Ok(p) => p,
                    Err(_) => break,
                }
            };

            handled += 1;
            if handled % 1000 == 0 {
                debug!("Processor {}: dispatched {} items", self.name, handled);
            }

            let execute_fn = execute_fn.clone();
            let task_id = item.get_id();
            let metric_label = metric_label.clone();

            tokio::spawn(
                async move {
                    gauge!("engine_active_tasks", "processor" => metric_label.clone())
                        .increment(1.0);
                    let _permit = permit;
                    execute_fn(item).await;
                    gauge!("engine_active_tasks", "processor" => metric_label).decrement(1.0);
                }
                .instrument(tracing::info_span!("processor_execution", item_id = %task_id)),
            );
        }

        // In-flight tasks hold permits until they finish.
        let _ = semaphore.acquire_many(self.concurrency as u32).await;
        info!("{} processor loop ended", self.name);
    }
}
