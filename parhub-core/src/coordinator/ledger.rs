//! Task ledger
//!
//! In-memory record of every task the hub has seen, indexed by client and by
//! engine. Each known task id is in exactly one of `pending` and
//! `all_completed`; `unassigned` tags scheduled tasks not yet bound to an
//! engine.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tracing::{debug, error, warn};

use crate::error::{HubError, Result};
use crate::protocol::messages::{
    DbQuery, EngineLoad, EngineQueueStatus, ResultReply, TaskRequestHeader, TaskResultHeader,
    TaskSummary,
};
use crate::protocol::{EngineId, Lane, TaskStatus};

/// Everything known about one task
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub msg_id: String,
    pub client: String,
    pub lane: Lane,
    pub engine: Option<EngineId>,
    /// Queue identity of the engine, kept after the engine is gone
    pub engine_queue: Option<String>,
    pub submitted: Option<DateTime<Utc>>,
    pub started: Option<DateTime<Utc>>,
    pub completed: Option<DateTime<Utc>>,
    pub resubmitted: Option<DateTime<Utc>>,
    /// Request body
    pub content: Bytes,
    /// Result body
    pub result: Bytes,
    /// Result was synthesized because the engine died
    pub stranded: bool,
    /// `(stream, text)` side-channel output
    pub outputs: Vec<(String, String)>,
}

/// How a result was absorbed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultDisposition {
    /// Moved from pending to completed
    Completed,
    /// Task had already completed; fields were overwritten
    Late,
    /// No such task
    Unknown,
}

#[derive(Debug, Default)]
pub struct TaskLedger {
    tasks: HashMap<String, TaskRecord>,
    by_client: HashMap<String, BTreeSet<String>>,
    by_engine: HashMap<EngineId, BTreeSet<String>>,
    pending: BTreeSet<String>,
    all_completed: BTreeSet<String>,
    unassigned: BTreeSet<String>,
}

/// Synthetic result of a task whose engine died
pub fn stranded_content(msg_id: &str) -> String {
    format!("Engine died while running task `{}'", msg_id)
}

impl TaskLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new task; returns false if the id was already known
    pub fn save_request(
        &mut self,
        header: &TaskRequestHeader,
        lane: Lane,
        engine: Option<EngineId>,
        content: Bytes,
    ) -> bool {
        if self.tasks.contains_key(&header.msg_id) {
            warn!("Ignoring duplicate request for task {}", header.msg_id);
            return false;
        }
        let msg_id = header.msg_id.clone();
        self.tasks.insert(
            msg_id.clone(),
            TaskRecord {
                msg_id: msg_id.clone(),
                client: header.client.clone(),
                lane,
                engine,
                engine_queue: engine.and(header.engine.clone()),
                submitted: Some(header.submitted.unwrap_or_else(Utc::now)),
                started: None,
                completed: None,
                resubmitted: None,
                content,
                result: Bytes::new(),
                stranded: false,
                outputs: Vec::new(),
            },
        );
        self.by_client
            .entry(header.client.clone())
            .or_default()
            .insert(msg_id.clone());
        match engine {
            Some(eid) => {
                self.by_engine.entry(eid).or_default().insert(msg_id.clone());
            }
            None if lane == Lane::Scheduled => {
                self.unassigned.insert(msg_id.clone());
            }
            None => {}
        }
        debug!("Task {} pending ({:?})", msg_id, lane);
        self.pending.insert(msg_id);
        true
    }

    /// Record a result; the task leaves `pending` exactly once
    pub fn save_result(
        &mut self,
        header: &TaskResultHeader,
        engine: Option<EngineId>,
        result: Bytes,
    ) -> ResultDisposition {
        let msg_id = header.msg_id.as_str();
        self.unassigned.remove(msg_id);

        if !self.tasks.contains_key(msg_id) {
            warn!("Result for unknown task {}", msg_id);
            return ResultDisposition::Unknown;
        }
        if let Some(eid) = engine {
            self.assign(msg_id, eid, header.engine.clone());
        }

        let disposition = if self.pending.remove(msg_id) {
            self.all_completed.insert(msg_id.to_string());
            ResultDisposition::Completed
        } else {
            warn!(
                "Result for task {} that already completed (engine died before delivering it?)",
                msg_id
            );
            ResultDisposition::Late
        };

        if let Some(record) = self.tasks.get_mut(msg_id) {
            record.started = header.started.or(record.started);
            record.completed = Some(header.completed.unwrap_or_else(Utc::now));
            record.result = result;
            record.stranded = false;
        }
        disposition
    }

    /// Bind a task to an engine; returns false for unknown ids
    pub fn save_destination(&mut self, msg_id: &str, engine: EngineId, queue: &str) -> bool {
        if !self.tasks.contains_key(msg_id) {
            error!("Destination for unknown task {}", msg_id);
            return false;
        }
        self.unassigned.remove(msg_id);
        self.assign(msg_id, engine, Some(queue.to_string()));
        true
    }

    fn assign(&mut self, msg_id: &str, engine: EngineId, queue: Option<String>) {
        let Some(record) = self.tasks.get_mut(msg_id) else {
            return;
        };
        if let Some(previous) = record.engine.replace(engine) {
            if previous != engine {
                if let Some(ids) = self.by_engine.get_mut(&previous) {
                    ids.remove(msg_id);
                }
            }
        }
        if queue.is_some() {
            record.engine_queue = queue;
        }
        self.by_engine
            .entry(engine)
            .or_default()
            .insert(msg_id.to_string());
    }

    /// Force-complete every task still pending on a dead engine
    pub fn stranded_sweep(&mut self, engine: EngineId, queue: &str) -> Vec<String> {
        let stranded: Vec<String> = match self.by_engine.get(&engine) {
            Some(ids) => ids.intersection(&self.pending).cloned().collect(),
            None => return Vec::new(),
        };
        let now = Utc::now();
        for msg_id in &stranded {
            self.pending.remove(msg_id);
            self.all_completed.insert(msg_id.clone());
            if let Some(record) = self.tasks.get_mut(msg_id) {
                record.result = Bytes::from(stranded_content(msg_id));
                record.completed = Some(now);
                record.engine_queue = Some(queue.to_string());
                record.stranded = true;
            }
        }
        stranded
    }

    /// Append side-channel output to a task
    pub fn append_output(&mut self, msg_id: &str, stream: &str, text: &str) -> bool {
        match self.tasks.get_mut(msg_id) {
            Some(record) => {
                record.outputs.push((stream.to_string(), text.to_string()));
                true
            }
            None => false,
        }
    }

    /// Drop every record; returns how many were removed
    pub fn purge_all(&mut self) -> usize {
        let purged = self.tasks.len();
        self.tasks.clear();
        self.by_client.clear();
        self.by_engine.clear();
        self.pending.clear();
        self.all_completed.clear();
        self.unassigned.clear();
        purged
    }

    /// Evict completed tasks; fails without evicting anything if one is
    /// still pending. Unknown ids are skipped.
    pub fn purge(&mut self, msg_ids: &[String]) -> Result<usize> {
        if let Some(msg_id) = msg_ids.iter().find(|id| self.pending.contains(*id)) {
            return Err(HubError::TaskPending {
                msg_id: msg_id.clone(),
            });
        }
        Ok(msg_ids.iter().filter(|id| self.evict(id)).count())
    }

    /// Evict every completed task that ran on one of `engines`
    pub fn purge_engines(&mut self, engines: &[EngineId]) -> usize {
        let doomed: Vec<String> = engines
            .iter()
            .filter_map(|eid| self.by_engine.get(eid))
            .flat_map(|ids| ids.intersection(&self.all_completed).cloned())
            .collect();
        doomed.iter().filter(|id| self.evict(id)).count()
    }

    fn evict(&mut self, msg_id: &str) -> bool {
        let Some(record) = self.tasks.remove(msg_id) else {
            return false;
        };
        if let Some(ids) = self.by_client.get_mut(&record.client) {
            ids.remove(msg_id);
            if ids.is_empty() {
                self.by_client.remove(&record.client);
            }
        }
        if let Some(eid) = record.engine {
            if let Some(ids) = self.by_engine.get_mut(&eid) {
                ids.remove(msg_id);
            }
        }
        self.pending.remove(msg_id);
        self.all_completed.remove(msg_id);
        self.unassigned.remove(msg_id);
        true
    }

    fn engine_tasks(&self, engine: EngineId) -> impl Iterator<Item = &TaskRecord> {
        self.by_engine
            .get(&engine)
            .into_iter()
            .flatten()
            .filter_map(|id| self.tasks.get(id))
    }

    /// Outstanding tasks of `engine` split by lane
    pub fn load(&self, engine: EngineId) -> EngineLoad {
        let mut load = EngineLoad { queue: 0, tasks: 0 };
        for record in self.engine_tasks(engine) {
            if self.pending.contains(&record.msg_id) {
                match record.lane {
                    Lane::Immediate => load.queue += 1,
                    Lane::Scheduled => load.tasks += 1,
                }
            }
        }
        load
    }

    pub fn queue_status(&self, engine: EngineId, verbose: bool) -> EngineQueueStatus {
        let mut queue_ids = Vec::new();
        let mut completed_ids = Vec::new();
        let mut tasks = 0;
        for record in self.engine_tasks(engine) {
            if self.pending.contains(&record.msg_id) {
                match record.lane {
                    Lane::Immediate => queue_ids.push(record.msg_id.clone()),
                    Lane::Scheduled => tasks += 1,
                }
            } else if self.all_completed.contains(&record.msg_id) {
                completed_ids.push(record.msg_id.clone());
            }
        }
        EngineQueueStatus {
            queue: queue_ids.len(),
            tasks,
            completed: completed_ids.len(),
            queue_ids: verbose.then_some(queue_ids),
            completed_ids: verbose.then_some(completed_ids),
        }
    }

    /// Status of every id, plus result frames for completed ones in order.
    /// The first unknown id fails the whole request.
    pub fn results(&self, msg_ids: &[String], status_only: bool) -> Result<(ResultReply, Vec<Bytes>)> {
        let mut reply = ResultReply::default();
        let mut frames = Vec::new();
        for msg_id in msg_ids {
            let record = self
                .tasks
                .get(msg_id)
                .ok_or_else(|| HubError::UnknownTask {
                    msg_id: msg_id.clone(),
                })?;
            if self.pending.contains(msg_id) {
                reply.pending.push(msg_id.clone());
            } else {
                reply.completed.push(msg_id.clone());
                if !status_only {
                    frames.push(record.result.clone());
                }
            }
            reply.results.insert(msg_id.clone(), self.summarize(record));
        }
        Ok((reply, frames))
    }

    /// Every known task id, oldest submission first
    pub fn history(&self) -> Vec<String> {
        let mut records: Vec<&TaskRecord> = self.tasks.values().collect();
        records.sort_by(|a, b| {
            a.submitted
                .cmp(&b.submitted)
                .then_with(|| a.msg_id.cmp(&b.msg_id))
        });
        records.into_iter().map(|r| r.msg_id.clone()).collect()
    }

    /// Summaries of the tasks matching every set filter field
    pub fn query(&self, filter: &DbQuery) -> Vec<TaskSummary> {
        let candidates: Box<dyn Iterator<Item = &TaskRecord> + '_> = match &filter.client {
            Some(client) => Box::new(
                self.by_client
                    .get(client)
                    .into_iter()
                    .flatten()
                    .filter_map(|id| self.tasks.get(id)),
            ),
            None => Box::new(self.tasks.values()),
        };
        let mut records: Vec<TaskSummary> = candidates
            .filter(|r| filter.engine.map_or(true, |eid| r.engine == Some(eid)))
            .filter(|r| filter.lane.map_or(true, |lane| r.lane == lane))
            .map(|r| self.summarize(r))
            .filter(|s| filter.status.map_or(true, |status| s.status == status))
            .collect();
        records.sort_by(|a, b| a.submitted.cmp(&b.submitted).then_with(|| a.msg_id.cmp(&b.msg_id)));
        records
    }

    /// Request bodies of tasks eligible for resubmission
    pub fn resubmittable(&self, msg_ids: &[String]) -> Result<Vec<(String, Bytes)>> {
        msg_ids
            .iter()
            .map(|msg_id| {
                let record = self.tasks.get(msg_id).ok_or_else(|| HubError::UnknownTask {
                    msg_id: msg_id.clone(),
                })?;
                if !self.all_completed.contains(msg_id) {
                    return Err(HubError::TaskNotDone {
                        msg_id: msg_id.clone(),
                    });
                }
                Ok((msg_id.clone(), record.content.clone()))
            })
            .collect()
    }

    pub fn mark_resubmitted(&mut self, msg_id: &str, at: DateTime<Utc>) {
        if let Some(record) = self.tasks.get_mut(msg_id) {
            record.resubmitted = Some(at);
        }
    }

    pub fn summarize(&self, record: &TaskRecord) -> TaskSummary {
        TaskSummary {
            msg_id: record.msg_id.clone(),
            client: record.client.clone(),
            lane: record.lane,
            status: if self.pending.contains(&record.msg_id) {
                TaskStatus::Pending
            } else {
                TaskStatus::Completed
            },
            engine: record.engine,
            submitted: record.submitted,
            started: record.started,
            completed: record.completed,
            resubmitted: record.resubmitted,
            stranded: record.stranded,
        }
    }

    pub fn get(&self, msg_id: &str) -> Option<&TaskRecord> {
        self.tasks.get(msg_id)
    }

    pub fn is_pending(&self, msg_id: &str) -> bool {
        self.pending.contains(msg_id)
    }

    pub fn is_completed(&self, msg_id: &str) -> bool {
        self.all_completed.contains(msg_id)
    }

    pub fn is_unassigned(&self, msg_id: &str) -> bool {
        self.unassigned.contains(msg_id)
    }

    pub fn unassigned(&self) -> Vec<String> {
        self.unassigned.iter().cloned().collect()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn completed_count(&self) -> usize {
        self.all_completed.len()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Outstanding task counts per engine, for every engine with tasks
    pub fn engines_with_tasks(&self) -> BTreeMap<EngineId, usize> {
        self.by_engine
            .iter()
            .map(|(eid, ids)| (*eid, ids.intersection(&self.pending).count()))
            .filter(|(_, n)| *n > 0)
            .collect()
    }
}
