//! Persistent job queue with deduplication rules and priority ordering

use chrono::{DateTime, Duration, Utc};
use futures::{Stream, TryStreamExt};
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, trace};

use super::types::{AddOptions, ResolvedOptions, MAX_IDENTITY_LENGTH};
use super::worker_registry::{WorkerDefinition, WorkerRegistry};
use crate::config::ServerConfig;
use crate::errors::{QueueError, QueueResult};
use crate::models::{Labour, NewLabour, Rule};
use crate::repositories::{Bundle, LabourRepository, ScanPosition};

/// Queue engine over the `labours` table
pub struct JobQueue {
    labours: LabourRepository,
    registry: Arc<WorkerRegistry>,
    page_size: u32,
    include_unknown_in_flight: bool,
}

/// State of the lazy pending-labour cursor between pages
#[derive(Default)]
struct PendingCursor {
    after: Option<ScanPosition>,
    buffer: VecDeque<Labour>,
    exhausted: bool,
}

impl JobQueue {
    pub fn new(
        labours: LabourRepository,
        registry: Arc<WorkerRegistry>,
        config: &ServerConfig,
    ) -> Self {
        Self {
            labours,
            registry,
            page_size: config.page_size.max(1),
            include_unknown_in_flight: config.include_unknown_in_flight,
        }
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    pub fn labours(&self) -> &LabourRepository {
        &self.labours
    }

    /// Enqueue a labour for `worker`.
    ///
    /// Returns `None` when the `ignore` rule suppressed the insert.
    pub async fn add<P: Serialize>(
        &self,
        worker: &str,
        payload: P,
        options: AddOptions,
    ) -> QueueResult<Option<Labour>> {
        let payload = serde_json::to_value(payload)?;
        self.add_at(worker, payload, options, Utc::now()).await
    }

    pub async fn add_at(
        &self,
        worker: &str,
        payload: serde_json::Value,
        options: AddOptions,
        now: DateTime<Utc>,
    ) -> QueueResult<Option<Labour>> {
        let definition = self.registry.get(worker)?;
        let payload = match payload {
            serde_json::Value::Null => serde_json::json!({}),
            other => other,
        };

        let resolved = Self::resolve_options(definition, options);
        Self::validate_options(definition, &resolved, &payload)?;

        let new_labour = NewLabour {
            worker: definition.code.clone(),
            identity: resolved.identity.clone(),
            payload,
            priority: resolved.priority,
            by_recurring: resolved.by_recurring,
            execute_at: now + Duration::seconds(resolved.delay.max(0)),
        };

        let labour = self.labours.insert(&new_labour, resolved.rule, now).await?;
        if let Some(labour) = &labour {
            info!(
                "Enqueued labour {} ({}-{}, priority {}, rule {}, execute at {})",
                labour.id,
                labour.worker,
                labour.identity,
                labour.priority,
                resolved.rule,
                labour.execute_at.format("%Y-%m-%d %H:%M:%S UTC")
            );
        }
        Ok(labour)
    }

    fn resolve_options(definition: &WorkerDefinition, options: AddOptions) -> ResolvedOptions {
        ResolvedOptions {
            identity: options.identity.unwrap_or_default(),
            priority: options.priority.unwrap_or(definition.priority),
            delay: options.delay.unwrap_or(0),
            rule: options.rule.unwrap_or(definition.rule),
            by_recurring: options.by_recurring,
        }
    }

    fn validate_options(
        definition: &WorkerDefinition,
        options: &ResolvedOptions,
        payload: &serde_json::Value,
    ) -> QueueResult<()> {
        if options.identity.chars().count() > MAX_IDENTITY_LENGTH {
            return Err(QueueError::invalid_options(
                &definition.code,
                format!("identity is longer than {MAX_IDENTITY_LENGTH} characters"),
            ));
        }
        if options.priority < 0 {
            return Err(QueueError::invalid_options(
                &definition.code,
                format!("priority must not be negative, got {}", options.priority),
            ));
        }
        definition
            .worker
            .validate_options(options, payload)
            .map_err(|message| QueueError::invalid_options(&definition.code, message))
    }

    /// Dequeue up to `max` labours, moving each to `deployed`.
    ///
    /// Returns `None` when nothing was accepted.
    pub async fn receive(&self, max: usize) -> QueueResult<Option<Vec<Labour>>> {
        self.receive_at(max, Utc::now()).await
    }

    pub async fn receive_at(
        &self,
        max: usize,
        now: DateTime<Utc>,
    ) -> QueueResult<Option<Vec<Labour>>> {
        if max == 0 {
            return Ok(None);
        }

        let in_flight = self
            .labours
            .find_in_flight(self.include_unknown_in_flight)
            .await?;
        let mut in_flight_keys: HashSet<String> =
            in_flight.iter().map(Labour::in_flight_key).collect();
        let mut running_per_worker: HashMap<String, usize> = HashMap::new();
        for labour in in_flight.iter().filter(|l| !l.is_bundle_member()) {
            *running_per_worker.entry(labour.worker.clone()).or_insert(0) += 1;
        }

        let mut accepted = Vec::new();
        let mut candidates = std::pin::pin!(self.pending_labours(now));

        while accepted.len() < max {
            let Some(labour) = candidates.try_next().await? else {
                break;
            };

            let Some(definition) = self.registry.resolve(&labour.worker) else {
                trace!("Skipping labour {}: worker {} not registered", labour.id, labour.worker);
                continue;
            };

            let key = labour.in_flight_key();
            if definition.rule.excludes_in_flight() && in_flight_keys.contains(&key) {
                trace!("Skipping labour {}: {} already in flight", labour.id, key);
                continue;
            }

            let running = running_per_worker.get(&labour.worker).copied().unwrap_or(0);
            if definition.limit.is_some_and(|limit| running >= limit) {
                trace!(
                    "Skipping labour {}: worker {} at its limit of {}",
                    labour.id,
                    labour.worker,
                    running
                );
                continue;
            }

            let Some(bundle) = self.before_return(&labour, definition, now).await? else {
                continue;
            };

            in_flight_keys.insert(key);
            *running_per_worker.entry(labour.worker.clone()).or_insert(0) += 1;
            accepted.push(bundle.representative);
        }

        if accepted.is_empty() {
            return Ok(None);
        }

        debug!("Received {} labour(s)", accepted.len());
        Ok(Some(accepted))
    }

    /// Deploy the accepted labour; under `batch` its pending siblings join
    /// the bundle in the same transaction.
    async fn before_return(
        &self,
        labour: &Labour,
        definition: &WorkerDefinition,
        now: DateTime<Utc>,
    ) -> QueueResult<Option<Bundle>> {
        let batch = definition.rule == Rule::Batch;
        let bundle = self.labours.deploy(labour.id, batch, now).await?;

        if let Some(bundle) = &bundle {
            if !bundle.members.is_empty() {
                debug!(
                    "Labour {} deployed with {} bundled sibling(s): {:?}",
                    bundle.id(),
                    bundle.members.len(),
                    bundle.member_ids()
                );
            }
        }
        Ok(bundle)
    }

    /// Lazily page through eligible pending labours in dequeue order
    fn pending_labours(
        &self,
        now: DateTime<Utc>,
    ) -> impl Stream<Item = QueueResult<Labour>> + '_ {
        futures::stream::try_unfold(PendingCursor::default(), move |mut cursor| async move {
            if cursor.buffer.is_empty() && !cursor.exhausted {
                let page = self
                    .labours
                    .find_pending_page(now, cursor.after, self.page_size)
                    .await?;
                cursor.exhausted = page.len() < self.page_size as usize;
                cursor.after = page.last().map(ScanPosition::from).or(cursor.after);
                cursor.buffer.extend(page);
            }

            Ok::<_, QueueError>(cursor.buffer.pop_front().map(|labour| (labour, cursor)))
        })
    }
}
