// Copyright 2025 jsvault Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use serde::{Deserialize, Serialize};
use std::fmt::Write;

/// Worker pool statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSnapshot {
    pub max_workers: usize,
    pub queue_capacity: usize,
    pub pool_size: usize,
    pub queue_depth: usize,
    pub active_count: usize,
    pub completed_count: u64,
    pub rejected_count: u64,
}

/// One registered task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskInfo {
    pub id: String,
    #[serde(rename = "type")]
    pub task_type: String,
    pub state: String,
    pub session_count: usize,
    pub running_sub_units: u64,
    pub total_sub_units: u64,
}

/// Process-wide diagnostics for the task registry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    pub session_count: usize,
    pub task_count: usize,
    /// Tasks removed by the sweep that produced this snapshot
    pub reclaimed_count: usize,
    /// Tasks removed since the registry was created
    pub reclaimed_total: u64,
    pub pool: PoolSnapshot,
    pub tasks: Vec<TaskInfo>,
}

impl RegistrySnapshot {
    /// Render the snapshot as a plain-text table for logs.
    pub fn summary_text(&self) -> String {
        let mut out = String::new();
        let pool = &self.pool;
        let _ = writeln!(
            out,
            "sessions={} tasks={} reclaimed={} (total {})",
            self.session_count, self.task_count, self.reclaimed_count, self.reclaimed_total
        );
        let _ = writeln!(
            out,
            "pool: size={}/{} queue={}/{} active={} completed={} rejected={}",
            pool.pool_size,
            pool.max_workers,
            pool.queue_depth,
            pool.queue_capacity,
            pool.active_count,
            pool.completed_count,
            pool.rejected_count
        );
        if self.tasks.is_empty() {
            return out;
        }

        let id_width = self
            .tasks
            .iter()
            .map(|task| task.id.len())
            .max()
            .unwrap_or(0)
            .max(2);
        let _ = writeln!(
            out,
            "{:<id_width$}  {:<10}  {:<8}  {:>8}  {:>7}  {:>5}",
            "id", "type", "state", "sessions", "running", "total"
        );
        for task in &self.tasks {
            let _ = writeln!(
                out,
                "{:<id_width$}  {:<10}  {:<8}  {:>8}  {:>7}  {:>5}",
                task.id,
                task.task_type,
                task.state,
                task.session_count,
                task.running_sub_units,
                task.total_sub_units
            );
        }
        out
    }
}
