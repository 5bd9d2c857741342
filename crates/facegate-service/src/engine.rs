use facegate_core::{CaptureAnalysis, DetectorError, ImageInput, PipelineError, PipelineFactory};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("engine queue is full")]
    Busy,
    #[error("engine workers exited")]
    ChannelClosed,
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("failed to spawn engine worker: {0}")]
    Spawn(#[source] std::io::Error),
}

type AnalysisReply = oneshot::Sender<Result<CaptureAnalysis, PipelineError>>;
type AnalysisReceiver = oneshot::Receiver<Result<CaptureAnalysis, PipelineError>>;

/// A capture waiting for a worker.
struct AnalyzeRequest {
    input: ImageInput,
    reply: AnalysisReply,
}

/// Clone-safe handle to the worker pool.
#[derive(Clone, Debug)]
pub struct EngineHandle {
    tx: mpsc::Sender<AnalyzeRequest>,
    workers: usize,
    capacity: usize,
    detectors: Arc<[&'static str]>,
}

impl EngineHandle {
    /// Queue one capture without waiting for a free slot.
    ///
    /// A full queue is reported as [`EngineError::Busy`] instead of making
    /// the caller wait behind it.
    pub fn submit(&self, input: ImageInput) -> Result<AnalysisReceiver, EngineError> {
        let (reply, reply_rx) = oneshot::channel();
        self.tx
            .try_send(AnalyzeRequest { input, reply })
            .map_err(|err| match err {
                TrySendError::Full(_) => EngineError::Busy,
                TrySendError::Closed(_) => EngineError::ChannelClosed,
            })?;
        Ok(reply_rx)
    }

    /// Decode, locate, extract and assess one capture.
    pub async fn analyze(&self, input: ImageInput) -> Result<CaptureAnalysis, EngineError> {
        let reply_rx = self.submit(input)?;
        Ok(reply_rx.await.map_err(|_| EngineError::ChannelClosed)??)
    }

    /// Analyze several captures concurrently, one result per input in order.
    ///
    /// Admission is decided on the first capture: a full queue fails the
    /// whole batch with [`EngineError::Busy`]. Once admitted, the remaining
    /// captures wait for queue slots, so a batch may be larger than the queue.
    pub async fn analyze_many(&self, inputs: Vec<ImageInput>) -> Vec<Result<CaptureAnalysis, EngineError>> {
        let total = inputs.len();
        let mut inputs = inputs.into_iter();
        let Some(first) = inputs.next() else {
            return Vec::new();
        };

        let mut pending = Vec::with_capacity(total);
        match self.submit(first) {
            Ok(reply_rx) => pending.push(Ok(reply_rx)),
            Err(err) => {
                let closed = matches!(err, EngineError::ChannelClosed);
                let mut results = vec![Err(err)];
                results.extend(inputs.map(|_| {
                    Err(if closed { EngineError::ChannelClosed } else { EngineError::Busy })
                }));
                return results;
            }
        }
        for input in inputs {
            pending.push(self.send(input).await);
        }

        let mut results = Vec::with_capacity(total);
        for submitted in pending {
            results.push(match submitted {
                Ok(reply_rx) => match reply_rx.await {
                    Ok(result) => result.map_err(EngineError::from),
                    Err(_) => Err(EngineError::ChannelClosed),
                },
                Err(err) => Err(err),
            });
        }
        results
    }

    /// Queue one capture, waiting for a free slot.
    async fn send(&self, input: ImageInput) -> Result<AnalysisReceiver, EngineError> {
        let (reply, reply_rx) = oneshot::channel();
        self.tx
            .send(AnalyzeRequest { input, reply })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        Ok(reply_rx)
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn queue_capacity(&self) -> usize {
        self.capacity
    }

    /// Names of the detectors each worker runs, in locator order.
    pub fn detectors(&self) -> &[&'static str] {
        &self.detectors
    }
}

/// Spawn `workers` pipeline threads fed from one bounded queue.
///
/// Every worker builds its own pipeline from `factory` and reports back
/// before this returns, so a missing or broken model fails start-up rather
/// than the first request.
pub fn spawn_engine(
    factory: Arc<dyn PipelineFactory>,
    workers: usize,
    queue_capacity: usize,
) -> Result<EngineHandle, EngineError> {
    let workers = workers.max(1);
    let capacity = queue_capacity.max(1);
    let (tx, rx) = mpsc::channel::<AnalyzeRequest>(capacity);
    let rx = Arc::new(Mutex::new(rx));
    let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<Vec<&'static str>, DetectorError>>();

    for id in 0..workers {
        let factory = Arc::clone(&factory);
        let rx = Arc::clone(&rx);
        let ready_tx = ready_tx.clone();
        std::thread::Builder::new()
            .name(format!("facegate-worker-{id}"))
            .spawn(move || {
                let mut pipeline = match factory.build() {
                    Ok(pipeline) => {
                        let _ = ready_tx.send(Ok(pipeline.detector_names()));
                        pipeline
                    }
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                drop(ready_tx);
                tracing::debug!(worker = id, "engine worker started");

                loop {
                    let next = match rx.lock() {
                        Ok(mut rx) => rx.blocking_recv(),
                        Err(poisoned) => poisoned.into_inner().blocking_recv(),
                    };
                    let Some(request) = next else { break };
                    let result = pipeline.analyze(&request.input);
                    let _ = request.reply.send(result);
                }
                tracing::debug!(worker = id, "engine worker exiting");
            })
            .map_err(EngineError::Spawn)?;
    }
    drop(ready_tx);

    let mut detectors = Vec::new();
    for _ in 0..workers {
        match ready_rx.recv() {
            Ok(Ok(names)) => detectors = names,
            Ok(Err(err)) => return Err(err.into()),
            Err(_) => return Err(EngineError::ChannelClosed),
        }
    }

    tracing::info!(workers, queue_capacity = capacity, detectors = ?detectors, "engine started");
    Ok(EngineHandle {
        tx,
        workers,
        capacity,
        detectors: detectors.into(),
    })
}
