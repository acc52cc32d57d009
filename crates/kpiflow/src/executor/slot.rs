/*
 *  Copyright 2025 Colliery Software
 *
 *  Licensed under the Apache License, Version 2.0 (the "License");
 *  you may not use this file except in compliance with the License.
 *  You may obtain a copy of the License at
 *
 *      http://www.apache.org/licenses/LICENSE-2.0
 *
 *  Unless required by applicable law or agreed to in writing, software
 *  distributed under the License is distributed on an "AS IS" BASIS,
 *  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *  See the License for the specific language governing permissions and
 *  limitations under the License.
 */

//! Ownership token for a job held by a worker task.
//!
//! A `JobSlot` carries the worker's view of a job together with its
//! concurrency permit. When the owning task ends without calling
//! [`JobSlot::finish`] (it panicked or was aborted during forced shutdown),
//! the drop handler marks the job failed and hands it to the engine's
//! abandoned queue so the outcome still reaches the store.

use chrono::Utc;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::OwnedSemaphorePermit;

use crate::models::JobExecution;

pub(crate) const ABORTED_MESSAGE: &str = "job task aborted before completion";

pub(crate) struct JobSlot {
    job: JobExecution,
    permit: Option<OwnedSemaphorePermit>,
    armed: bool,
    abandoned: UnboundedSender<JobExecution>,
}

impl JobSlot {
    /// `owned` is true when this worker created the pending row and is
    /// therefore responsible for it even before claiming.
    pub(crate) fn new(job: JobExecution, owned: bool, abandoned: UnboundedSender<JobExecution>) -> Self {
        Self {
            job,
            permit: None,
            armed: owned,
            abandoned,
        }
    }

    pub(crate) fn hold(&mut self, permit: OwnedSemaphorePermit) {
        self.permit = Some(permit);
    }

    /// Marks the job as owned by this worker after a successful claim.
    pub(crate) fn arm(&mut self) {
        self.armed = true;
    }

    pub(crate) fn is_owned(&self) -> bool {
        self.armed
    }

    pub(crate) fn job(&self) -> &JobExecution {
        &self.job
    }

    pub(crate) fn job_mut(&mut self) -> &mut JobExecution {
        &mut self.job
    }

    /// Disarms the slot and returns the final job state. The permit is
    /// released when the slot itself is dropped.
    pub(crate) fn finish(&mut self) -> JobExecution {
        self.armed = false;
        self.job.clone()
    }
}

impl Drop for JobSlot {
    fn drop(&mut self) {
        if !self.armed || self.job.status.is_terminal() {
            return;
        }
        self.job.fail(ABORTED_MESSAGE, Utc::now());
        // Receiver gone means the engine is gone too; recovery picks it up.
        let _ = self.abandoned.send(self.job.clone());
    }
}
