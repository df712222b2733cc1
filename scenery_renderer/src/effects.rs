//! Asynchronous effect compilation.
//!
//! A dedicated worker thread receives effects over a channel, compiles them with a
//! [`ShaderCompiler`] and sends results back. The render thread never blocks on it:
//! it submits and later drains whatever is ready.
//!
//! Dropping the uploader closes the job channel and joins the worker once it has
//! finished the job in hand.

use std::thread::{self, JoinHandle};

use anyhow::Context;
use crossbeam_channel::{Receiver, Sender};
use scenery_shared::{
    hash::ContentHash,
    render::{CompiledEffect, ShaderCompiler},
    storage::ManagedResource,
};
use tracing::{debug, error};

struct EffectJob {
    hash: ContentHash,
    resource: ManagedResource,
}

/// Outcome of compiling one effect.
#[derive(Debug)]
pub struct EffectResult {
    pub hash: ContentHash,
    pub result: Result<CompiledEffect, String>,
}

pub struct AsyncEffectUploader {
    job_tx: Option<Sender<EffectJob>>,
    result_rx: Receiver<EffectResult>,
    worker: Option<JoinHandle<()>>,
    in_flight: usize,
}

impl AsyncEffectUploader {
    pub fn new(mut compiler: Box<dyn ShaderCompiler>) -> anyhow::Result<Self> {
        let (job_tx, job_rx) = crossbeam_channel::unbounded::<EffectJob>();
        let (result_tx, result_rx) = crossbeam_channel::unbounded::<EffectResult>();

        let worker = thread::Builder::new()
            .name("effect-uploader".to_string())
            .spawn(move || {
                while let Ok(job) = job_rx.recv() {
                    // Decode through the handle so storage sees the size change.
                    let result = job
                        .resource
                        .decompressed_data()
                        .map_err(|e| e.to_string())
                        .and_then(|_| compiler.compile_effect(job.hash, &job.resource));
                    // Release the bytes before handing the result back.
                    drop(job.resource);
                    if result_tx
                        .send(EffectResult {
                            hash: job.hash,
                            result,
                        })
                        .is_err()
                    {
                        break;
                    }
                }
            })
            .context("spawn effect uploader thread")?;

        Ok(Self {
            job_tx: Some(job_tx),
            result_rx,
            worker: Some(worker),
            in_flight: 0,
        })
    }

    /// Queues an effect for compilation.
    pub fn submit(&mut self, hash: ContentHash, resource: ManagedResource) {
        let Some(tx) = &self.job_tx else {
            return;
        };
        match tx.send(EffectJob { hash, resource }) {
            Ok(()) => {
                self.in_flight += 1;
                debug!(%hash, in_flight = self.in_flight, "effect queued for compilation");
            }
            Err(e) => error!(%hash, error = %e, "effect uploader is gone"),
        }
    }

    /// Results that are ready now. Never blocks.
    pub fn poll_finished(&mut self) -> Vec<EffectResult> {
        let ready: Vec<EffectResult> = self.result_rx.try_iter().collect();
        self.in_flight = self.in_flight.saturating_sub(ready.len());
        ready
    }

    /// Effects submitted whose results have not been polled yet.
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }
}

impl Drop for AsyncEffectUploader {
    fn drop(&mut self) {
        self.job_tx = None;
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("effect uploader thread panicked");
            }
        }
    }
}
