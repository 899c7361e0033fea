//! LLM request handler.
//!
//! The LLMHandler ties all components together:
//! - Tokenizer and chat template for turning prompts into requests
//! - Scheduler for admission, growth and preemption
//! - Model executor (and optional draft executor) for the steps
//! - Callback pool for delivering outputs
//!
//! ## Handler Flow
//!
//! ```text
//!   caller threads                 loop thread                 callback workers
//!   ──────────────                 ───────────                 ────────────────
//!   schedule_async()
//!     tokenize ──► mpsc ──► drain submissions
//!                            scheduler.schedule()
//!                            draft.propose()  (speculative)
//!                            executor.execute()
//!                            scheduler.commit_step()
//!                            build outputs ──► sync_channel ──► callback(output)
//! ```
//!
//! The loop either runs on its own thread ([`LLMHandler::start`]) or inline
//! inside [`LLMHandler::run_until_complete`].

use std::collections::HashMap;
use std::panic;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::{HandlerOptions, SamplingParams};
use crate::core::request::{CancellationFlag, Priority, Request, RequestId, StoppingCriteria};
use crate::core::sequence::{FinishReason, Sequence};
use crate::engine::delivery::{CallbackPool, Completion, OutputSink};
use crate::engine::executor::{DraftExecutor, ModelExecutor, StepOutput};
use crate::engine::output::{OutputCallback, RequestOutput, SequenceOutput, Status, StatusCode};
use crate::engine::tokenizer::{ChatTemplate, Message, Tokenizer};
use crate::error::{Error, Result};
use crate::scheduler::{Batch, Scheduler};
use crate::speculative::AcceptanceStats;

/// How long an idle loop waits for a submission before rechecking its flags.
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(20);

struct Submission {
    request: Request,
    sink: Arc<OutputSink>,
}

/// State owned by the loop thread.
struct EngineLoop {
    scheduler: Scheduler,
    executor: Box<dyn ModelExecutor>,
    draft_executor: Option<Box<dyn DraftExecutor>>,
    tokenizer: Arc<dyn Tokenizer>,
    submissions: Receiver<Submission>,
    sinks: HashMap<RequestId, Arc<OutputSink>>,
    callbacks: Arc<CallbackPool>,
    num_speculative_tokens: usize,
    acceptance: AcceptanceStats,
    num_steps: u64,
}

impl EngineLoop {
    fn check_ready(&self) -> Result<()> {
        if self.num_speculative_tokens > 0 && self.draft_executor.is_none() {
            return Err(Error::Config(format!(
                "num_speculative_tokens is {} but no draft executor is set",
                self.num_speculative_tokens
            )));
        }
        Ok(())
    }

    /// Run ticks until `running` is cleared.
    fn run(&mut self, running: &AtomicBool) {
        info!("handler loop started");
        while running.load(Ordering::Acquire) {
            self.tick(Some(IDLE_POLL_INTERVAL));
        }
        info!(
            steps = self.num_steps,
            draft_acceptance = self.acceptance.acceptance_rate(),
            "handler loop stopped"
        );
    }

    /// One iteration: take submissions, schedule, execute, deliver.
    ///
    /// With `idle_wait` set, an idle loop blocks that long for a submission.
    fn tick(&mut self, idle_wait: Option<Duration>) {
        self.drain_submissions(idle_wait);

        let outputs = match self.scheduler.schedule() {
            Ok(outputs) => outputs,
            Err(e) => self.fatal(e),
        };
        for request in outputs.finished {
            self.emit_terminal(request);
        }
        if outputs.batch.is_empty() {
            return;
        }

        self.execute(outputs.batch);
        for request in self.scheduler.take_finished() {
            self.emit_terminal(request);
        }
    }

    fn has_unfinished_requests(&self) -> bool {
        self.scheduler.has_unfinished_requests()
    }

    fn drain_submissions(&mut self, idle_wait: Option<Duration>) {
        if let Some(timeout) = idle_wait {
            if !self.scheduler.has_unfinished_requests() {
                match self.submissions.recv_timeout(timeout) {
                    Ok(submission) => self.accept(submission),
                    Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => return,
                }
            }
        }
        while let Ok(submission) = self.submissions.try_recv() {
            self.accept(submission);
        }
    }

    fn accept(&mut self, submission: Submission) {
        let Submission { request, sink } = submission;
        let request_id = request.id();
        match self.scheduler.add_request(request) {
            Ok(()) => {
                self.sinks.insert(request_id, sink);
            }
            Err(e) => {
                warn!(request_id, error = %e, "request rejected by scheduler");
                let status = Status::new(StatusCode::InvalidArgument, e.to_string());
                self.callbacks
                    .dispatch(request_id, sink, RequestOutput::failed(request_id, status));
            }
        }
    }

    /// Run one model step over `batch` and apply its outputs.
    fn execute(&mut self, mut batch: Batch) {
        self.num_steps += 1;
        self.propose_drafts(&mut batch);
        debug!(
            step = self.num_steps,
            sequences = batch.len(),
            tokens = batch.num_tokens(),
            free_blocks = self.scheduler.block_manager().num_free_blocks(),
            "executing batch"
        );

        let request_ids = batch_request_ids(&batch);
        let step_outputs = self
            .executor
            .execute(&batch)
            .and_then(|outputs| validate_step_outputs(&batch, outputs));

        let step_outputs = match step_outputs {
            Ok(outputs) => outputs,
            Err(e) => {
                warn!(error = %e, sequences = batch.len(), "executor failed; failing batch");
                for request_id in request_ids {
                    if let Err(e) =
                        self.scheduler
                            .fail_request(request_id, FinishReason::Error, e.to_string())
                    {
                        self.check_fatal(e);
                    }
                }
                return;
            }
        };

        for (entry, output) in batch.iter().zip(&step_outputs) {
            self.acceptance
                .record(entry.draft_token_ids.len(), output.token_ids.len());
            if let Err(e) = self.scheduler.commit_step(output.seq_id, &output.token_ids) {
                self.check_fatal(e);
            }
        }

        for request_id in request_ids {
            self.emit_progress(request_id);
        }
    }

    fn propose_drafts(&mut self, batch: &mut Batch) {
        let k = self.num_speculative_tokens;
        let Some(draft) = self.draft_executor.as_mut() else {
            return;
        };
        if k == 0 {
            return;
        }

        match draft.propose(batch, k) {
            Ok(proposals) => {
                for (entry, drafts) in batch.entries.iter_mut().zip(proposals) {
                    entry.draft_token_ids = drafts.into_iter().take(entry.num_draft_tokens).collect();
                }
            }
            Err(e) => warn!(error = %e, "draft executor failed; running step without drafts"),
        }
    }

    /// Streaming output with the tokens produced since the last delivery.
    fn emit_progress(&mut self, request_id: RequestId) {
        let Some(sink) = self.sinks.get(&request_id).cloned() else {
            return;
        };
        let tokenizer = Arc::clone(&self.tokenizer);
        let Some(request) = self.scheduler.get_request_mut(request_id) else {
            return;
        };
        if !request.stream() || request.is_finished() {
            return;
        }

        let prompt_text = prompt_text(tokenizer.as_ref(), request);
        let skip_special = request.sampling_params().skip_special_tokens;
        let outputs: Vec<SequenceOutput> = request
            .sequences_mut()
            .iter_mut()
            .filter(|seq| seq.num_output_tokens() > seq.num_streamed_tokens())
            .filter_map(|seq| {
                stable_delta(tokenizer.as_ref(), seq, prompt_text.as_deref(), skip_special)
            })
            .collect();
        if outputs.is_empty() {
            return;
        }

        let output = RequestOutput {
            request_id,
            outputs,
            status: None,
            usage: None,
            finished: false,
        };
        self.callbacks.dispatch(request_id, sink, output);
    }

    /// Final output of a request that left the scheduler.
    fn emit_terminal(&mut self, mut request: Request) {
        let request_id = request.id();
        let Some(sink) = self.sinks.remove(&request_id) else {
            return;
        };

        let prompt_text = prompt_text(self.tokenizer.as_ref(), &request);
        let skip_special = request.sampling_params().skip_special_tokens;
        let outputs = request
            .sequences_mut()
            .iter_mut()
            .map(|seq| sequence_delta(self.tokenizer.as_ref(), seq, prompt_text.as_deref(), skip_special))
            .collect();

        let status = Status::from_request(&request);
        debug!(request_id, status = ?status.code, "request finished");
        let output = RequestOutput {
            request_id,
            outputs,
            status: Some(status),
            usage: Some(request.statistics()),
            finished: true,
        };
        self.callbacks.dispatch(request_id, sink, output);
    }

    fn check_fatal(&self, e: Error) {
        if e.is_fatal() {
            self.fatal(e);
        }
        warn!(error = %e, "ignoring stale step output");
    }

    fn fatal(&self, e: Error) -> ! {
        error!(error = %e, "KV cache bookkeeping is corrupt");
        panic!("fatal scheduler error: {e}");
    }
}

/// Distinct request ids of a batch, in batch order.
fn batch_request_ids(batch: &Batch) -> Vec<RequestId> {
    let mut ids: Vec<RequestId> = Vec::new();
    for seq_id in batch.seq_ids() {
        if !ids.contains(&seq_id.request_id) {
            ids.push(seq_id.request_id);
        }
    }
    ids
}

/// Check the executor returned one well-formed output per entry, in order.
fn validate_step_outputs(batch: &Batch, outputs: Vec<StepOutput>) -> Result<Vec<StepOutput>> {
    if outputs.len() != batch.len() {
        return Err(Error::Executor(format!(
            "expected {} step outputs, got {}",
            batch.len(),
            outputs.len()
        )));
    }

    let mut by_seq: HashMap<_, StepOutput> = outputs
        .into_iter()
        .map(|output| (output.seq_id, output))
        .collect();
    batch
        .iter()
        .map(|entry| {
            let output = by_seq
                .remove(&entry.seq_id)
                .ok_or_else(|| Error::Executor(format!("no output for sequence {}", entry.seq_id)))?;
            let max_tokens = entry.draft_token_ids.len() + 1;
            if output.token_ids.is_empty() || output.token_ids.len() > max_tokens {
                return Err(Error::Executor(format!(
                    "sequence {} produced {} tokens, expected 1..={max_tokens}",
                    entry.seq_id,
                    output.token_ids.len()
                )));
            }
            Ok(output)
        })
        .collect()
}

fn prompt_text(tokenizer: &dyn Tokenizer, request: &Request) -> Option<String> {
    if !request.echo() {
        return None;
    }
    let skip_special = request.sampling_params().skip_special_tokens;
    Some(decode_or_empty(tokenizer, request.prompt_tokens(), skip_special))
}

/// Streaming delta of `seq`, or `None` while its decoded text ends in an
/// incomplete character. The cursor only moves once the text is stable.
fn stable_delta(
    tokenizer: &dyn Tokenizer,
    seq: &mut Sequence,
    prompt_text: Option<&str>,
    skip_special: bool,
) -> Option<SequenceOutput> {
    let text = decode_or_empty(tokenizer, seq.output_token_ids(), skip_special);
    if text.ends_with(char::REPLACEMENT_CHARACTER) {
        return None;
    }
    Some(delta_from(seq, text, prompt_text))
}

/// Everything of `seq` not delivered yet; advances the streaming cursor.
fn sequence_delta(
    tokenizer: &dyn Tokenizer,
    seq: &mut Sequence,
    prompt_text: Option<&str>,
    skip_special: bool,
) -> SequenceOutput {
    let text = decode_or_empty(tokenizer, seq.output_token_ids(), skip_special);
    delta_from(seq, text, prompt_text)
}

fn delta_from(seq: &mut Sequence, text: String, prompt_text: Option<&str>) -> SequenceOutput {
    let first = seq.num_streamed_tokens() == 0 && seq.num_streamed_bytes() == 0;

    let mut delta = match prompt_text {
        Some(prompt) if first => prompt.to_string(),
        _ => String::new(),
    };
    match text.get(seq.num_streamed_bytes()..) {
        Some(tail) => delta.push_str(tail),
        None => warn!(
            index = seq.index(),
            streamed_bytes = seq.num_streamed_bytes(),
            "decoded text no longer extends the streamed prefix"
        ),
    }
    let token_ids = seq.output_token_ids()[seq.num_streamed_tokens().min(seq.num_output_tokens())..].to_vec();

    seq.mark_streamed(seq.num_output_tokens(), text.len());
    SequenceOutput {
        index: seq.index(),
        text: delta,
        token_ids,
        finish_reason: seq.finish_reason(),
    }
}

fn decode_or_empty(tokenizer: &dyn Tokenizer, token_ids: &[u32], skip_special: bool) -> String {
    tokenizer
        .decode(token_ids, skip_special)
        .unwrap_or_else(|e| {
            warn!(error = %e, "failed to decode tokens");
            String::new()
        })
}

/// Front end of the serving core.
///
/// # Example
///
/// ```
/// use nano_serve::engine::synthetic::{ByteTokenizer, SyntheticExecutor};
/// use nano_serve::{HandlerOptions, LLMHandler, Priority, SamplingParams};
/// use std::sync::Arc;
///
/// let options = HandlerOptions {
///     max_cache_size: 64 * 1024 * 1024,
///     num_callback_threads: 1,
///     ..Default::default()
/// };
/// let handler = LLMHandler::new(
///     options,
///     Box::new(SyntheticExecutor::new(7)),
///     Arc::new(ByteTokenizer::new()),
/// )
/// .unwrap();
///
/// handler.schedule_async(
///     "hello",
///     SamplingParams::default().max_tokens(4),
///     Priority::Medium,
///     false,
///     |output| {
///         assert!(output.finished);
///         true
///     },
/// );
/// handler.run_until_complete().unwrap();
/// ```
pub struct LLMHandler {
    options: HandlerOptions,
    tokenizer: Arc<dyn Tokenizer>,
    chat_template: Option<Arc<dyn ChatTemplate>>,
    submissions: Sender<Submission>,
    /// Loop state while no loop thread holds it.
    engine: Mutex<Option<EngineLoop>>,
    loop_handle: Mutex<Option<JoinHandle<EngineLoop>>>,
    running: Arc<AtomicBool>,
    completion: Arc<Completion>,
    callbacks: Arc<CallbackPool>,
    next_request_id: AtomicU64,
    total_blocks: usize,
}

impl LLMHandler {
    /// Create a handler, sizing and allocating the KV cache.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for invalid options or a cache budget too
    /// small for a single block, and any executor allocation error.
    pub fn new(
        options: HandlerOptions,
        mut executor: Box<dyn ModelExecutor>,
        tokenizer: Arc<dyn Tokenizer>,
    ) -> Result<Self> {
        options.validate()?;

        let bytes_per_token = executor.kv_cache_bytes_per_token();
        let total_blocks = options.num_blocks(bytes_per_token);
        if total_blocks == 0 {
            return Err(Error::Config(format!(
                "KV cache budget of {} bytes holds no block of {} tokens at {} bytes per token",
                options.max_cache_size, options.block_size, bytes_per_token
            )));
        }
        executor.allocate_kv_cache(total_blocks, options.block_size)?;
        info!(
            total_blocks,
            block_size = options.block_size,
            bytes_per_token,
            "KV cache allocated"
        );

        let completion = Arc::new(Completion::default());
        let callbacks = Arc::new(CallbackPool::new(
            options.num_callback_threads,
            options.callback_queue_capacity,
            Arc::clone(&completion),
        )?);

        let (submissions, receiver) = mpsc::channel();
        let engine = EngineLoop {
            scheduler: Scheduler::new(options.scheduler_config(), options.block_size, total_blocks),
            executor,
            draft_executor: None,
            tokenizer: Arc::clone(&tokenizer),
            submissions: receiver,
            sinks: HashMap::new(),
            callbacks: Arc::clone(&callbacks),
            num_speculative_tokens: options.speculative.num_speculative_tokens,
            acceptance: AcceptanceStats::default(),
            num_steps: 0,
        };

        Ok(Self {
            options,
            tokenizer,
            chat_template: None,
            submissions,
            engine: Mutex::new(Some(engine)),
            loop_handle: Mutex::new(None),
            running: Arc::new(AtomicBool::new(false)),
            completion,
            callbacks,
            next_request_id: AtomicU64::new(0),
            total_blocks,
        })
    }

    /// Use `draft` to propose speculative tokens.
    pub fn with_draft_executor(mut self, draft: Box<dyn DraftExecutor>) -> Self {
        if let Some(engine) = self.engine.get_mut().as_mut() {
            engine.draft_executor = Some(draft);
        }
        self
    }

    /// Use `template` for [`schedule_chat_async`](Self::schedule_chat_async).
    pub fn with_chat_template(mut self, template: Arc<dyn ChatTemplate>) -> Self {
        self.chat_template = Some(template);
        self
    }

    pub fn options(&self) -> &HandlerOptions {
        &self.options
    }

    /// Number of KV cache blocks in the pool.
    pub fn total_blocks(&self) -> usize {
        self.total_blocks
    }

    /// Whether the loop thread is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Requests whose terminal output has not been delivered yet.
    pub fn num_pending_requests(&self) -> usize {
        self.completion.pending()
    }

    /// Submit a text prompt; returns immediately.
    ///
    /// `callback` receives every output of the request and is called at
    /// least once; the last call carries the terminal status. Invalid
    /// parameters and tokenization failures are reported through it with
    /// [`StatusCode::InvalidArgument`].
    pub fn schedule_async<F>(
        &self,
        prompt: &str,
        params: SamplingParams,
        priority: Priority,
        stream: bool,
        callback: F,
    ) -> RequestId
    where
        F: FnMut(RequestOutput) -> bool + Send + 'static,
    {
        self.submit(Ok(prompt.to_string()), params, priority, stream, Box::new(callback))
    }

    /// Submit a conversation, formatted through the chat template.
    pub fn schedule_chat_async<F>(
        &self,
        messages: &[Message],
        params: SamplingParams,
        priority: Priority,
        stream: bool,
        callback: F,
    ) -> RequestId
    where
        F: FnMut(RequestOutput) -> bool + Send + 'static,
    {
        let prompt = match &self.chat_template {
            Some(template) => template.apply(messages),
            None => Err(Error::InvalidArgument(
                "no chat template configured".to_string(),
            )),
        };
        self.submit(prompt, params, priority, stream, Box::new(callback))
    }

    /// Spawn the loop thread.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the handler is already running or
    /// speculation is configured without a draft executor.
    pub fn start(&self) -> Result<()> {
        let mut guard = self.engine.lock();
        let engine = guard
            .as_ref()
            .ok_or_else(|| Error::Config("handler is already running".to_string()))?;
        engine.check_ready()?;

        let Some(mut engine) = guard.take() else {
            return Err(Error::HandlerStopped);
        };
        self.running.store(true, Ordering::Release);
        let running = Arc::clone(&self.running);
        let spawned = thread::Builder::new()
            .name("nano-serve-loop".to_string())
            .spawn(move || {
                engine.run(&running);
                engine
            });

        match spawned {
            Ok(handle) => {
                *self.loop_handle.lock() = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::Release);
                Err(Error::Io(e))
            }
        }
    }

    /// Stop the loop thread after its current tick and join it.
    ///
    /// Outstanding requests are kept; they resume on the next `start()` or
    /// `run_until_complete()`.
    pub fn stop(&self) {
        if let Some(Err(payload)) = self.join_loop() {
            panic::resume_unwind(payload);
        }
    }

    /// Block until every submitted request delivered its terminal output.
    ///
    /// Drives the loop on the calling thread when `start()` was not called.
    pub fn run_until_complete(&self) -> Result<()> {
        if self.is_running() {
            self.completion.wait_idle();
            return Ok(());
        }

        {
            let mut guard = self.engine.lock();
            let engine = guard.as_mut().ok_or(Error::HandlerStopped)?;
            engine.check_ready()?;
            loop {
                engine.tick(None);
                if engine.has_unfinished_requests() {
                    continue;
                }
                if self.completion.wait_idle_for(IDLE_POLL_INTERVAL) {
                    break;
                }
            }
        }
        self.completion.wait_idle();
        Ok(())
    }

    fn submit(
        &self,
        prompt: Result<String>,
        params: SamplingParams,
        priority: Priority,
        stream: bool,
        callback: OutputCallback,
    ) -> RequestId {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let sink = Arc::new(OutputSink::new(callback, CancellationFlag::new()));
        self.completion.add();

        let request = prompt.and_then(|prompt| {
            self.build_request(
                request_id,
                &prompt,
                params,
                priority,
                stream,
                sink.cancellation().clone(),
            )
        });
        let result = request.and_then(|request| {
            self.submissions
                .send(Submission {
                    request,
                    sink: Arc::clone(&sink),
                })
                .map_err(|_| Error::HandlerStopped)
        });

        if let Err(e) = result {
            debug!(request_id, error = %e, "request rejected");
            let code = match e {
                Error::InvalidArgument(_) | Error::Tokenization(_) => StatusCode::InvalidArgument,
                _ => StatusCode::Internal,
            };
            let output = RequestOutput::failed(request_id, Status::new(code, e.to_string()));
            self.callbacks.dispatch(request_id, sink, output);
        }
        request_id
    }

    fn build_request(
        &self,
        request_id: RequestId,
        prompt: &str,
        params: SamplingParams,
        priority: Priority,
        stream: bool,
        cancellation: CancellationFlag,
    ) -> Result<Request> {
        params.validate()?;

        let prompt_tokens = self.tokenizer.encode(prompt)?;
        if prompt_tokens.is_empty() {
            return Err(Error::InvalidArgument(
                "prompt tokenized to zero tokens".to_string(),
            ));
        }
        let stop_sequences = params
            .stop
            .iter()
            .map(|stop| self.tokenizer.encode(stop))
            .collect::<Result<Vec<_>>>()?;
        let criteria =
            StoppingCriteria::from_sampling_params(&params, self.tokenizer.eos_token_id(), stop_sequences);

        Ok(Request::new(request_id, prompt_tokens)
            .with_priority(priority)
            .with_sampling_params(params)
            .with_stopping_criteria(criteria)
            .with_stream(stream)
            .with_cancellation(cancellation))
    }

    /// Stop and join the loop thread, putting its state back.
    fn join_loop(&self) -> Option<thread::Result<()>> {
        self.running.store(false, Ordering::Release);
        let handle = self.loop_handle.lock().take()?;
        Some(handle.join().map(|engine| {
            *self.engine.lock() = Some(engine);
        }))
    }
}

impl Drop for LLMHandler {
    fn drop(&mut self) {
        if let Some(Err(_)) = self.join_loop() {
            error!("handler loop thread panicked");
        }
    }
}
