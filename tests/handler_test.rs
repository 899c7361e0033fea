//! Integration tests for LLMHandler, driven by the synthetic executors.

use std::collections::HashMap;
use std::sync::Arc;

use nano_serve::core::sequence::SequenceId;
use nano_serve::engine::synthetic::{
    ByteTokenizer, SimpleChatTemplate, SyntheticDraft, SyntheticExecutor,
};
use nano_serve::{
    Batch, Error, FinishReason, HandlerOptions, LLMHandler, Message, ModelExecutor, Priority,
    RequestId, RequestOutput, Result, SamplingParams, StatusCode, StepOutput,
};
use parking_lot::Mutex;

type Outputs = Arc<Mutex<Vec<RequestOutput>>>;

/// Bytes per token of the synthetic executor in these tests; one 16-slot
/// block is 1 KiB.
const BYTES_PER_TOKEN: u64 = 64;

fn options(num_blocks: u64) -> HandlerOptions {
    HandlerOptions {
        max_cache_size: num_blocks * 16 * BYTES_PER_TOKEN,
        max_memory_utilization: 1.0,
        num_callback_threads: 2,
        ..Default::default()
    }
}

fn handler(options: HandlerOptions) -> LLMHandler {
    let executor = SyntheticExecutor::new(0).with_bytes_per_token(BYTES_PER_TOKEN);
    LLMHandler::new(options, Box::new(executor), Arc::new(ByteTokenizer::new())).unwrap()
}

fn collect(outputs: &Outputs) -> impl FnMut(RequestOutput) -> bool + Send + 'static {
    let outputs = Arc::clone(outputs);
    move |output| {
        outputs.lock().push(output);
        true
    }
}

fn terminal(outputs: &Outputs, request_id: RequestId) -> RequestOutput {
    let outputs = outputs.lock();
    let mut terminals = outputs
        .iter()
        .filter(|output| output.request_id == request_id && output.finished);
    let output = terminals.next().cloned().unwrap();
    assert!(terminals.next().is_none(), "more than one terminal output");
    output
}

fn full_text(outputs: &Outputs, request_id: RequestId) -> String {
    outputs
        .lock()
        .iter()
        .filter(|output| output.request_id == request_id)
        .flat_map(|output| output.outputs.iter().map(|seq| seq.text.clone()))
        .collect()
}

#[test]
fn test_handler_sizes_cache() {
    let handler = handler(options(10));
    assert_eq!(handler.total_blocks(), 10);
    assert!(!handler.is_running());
}

#[test]
fn test_cache_budget_below_one_block_is_rejected() {
    let options = HandlerOptions {
        max_cache_size: 16,
        ..Default::default()
    };
    let executor = SyntheticExecutor::new(0);
    let result = LLMHandler::new(options, Box::new(executor), Arc::new(ByteTokenizer::new()));
    assert!(matches!(result, Err(Error::Config(_))));
}

#[test]
fn test_run_until_complete_inline() {
    let handler = handler(options(64));
    let outputs: Outputs = Arc::default();

    let ids: Vec<RequestId> = (0..3)
        .map(|i| {
            handler.schedule_async(
                &format!("prompt {i}"),
                SamplingParams::default().max_tokens(8),
                Priority::Medium,
                false,
                collect(&outputs),
            )
        })
        .collect();
    handler.run_until_complete().unwrap();

    assert_eq!(outputs.lock().len(), 3);
    for id in ids {
        let output = terminal(&outputs, id);
        assert_eq!(output.status.as_ref().unwrap().code, StatusCode::Ok);
        assert_eq!(output.outputs.len(), 1);
        assert_eq!(output.outputs[0].text.len(), 8);
        assert_eq!(output.outputs[0].token_ids.len(), 8);
        assert_eq!(output.outputs[0].finish_reason, Some(FinishReason::Length));

        let usage = output.usage.unwrap();
        assert_eq!(usage.num_generated_tokens, 8);
        assert_eq!(usage.num_total_tokens, usage.num_prompt_tokens + 8);
    }
    assert_eq!(handler.num_pending_requests(), 0);
}

#[test]
fn test_streaming_deltas_add_up_to_full_output() {
    let handler = handler(options(64));
    let streamed: Outputs = Arc::default();
    let whole: Outputs = Arc::default();
    handler.start().unwrap();

    let params = SamplingParams::default().max_tokens(12);
    let stream_id =
        handler.schedule_async("hello", params.clone(), Priority::Medium, true, collect(&streamed));
    let whole_id = handler.schedule_async("hello", params, Priority::Medium, false, collect(&whole));
    handler.run_until_complete().unwrap();
    handler.stop();

    let partials = streamed.lock().iter().filter(|output| !output.finished).count();
    assert_eq!(partials, 11);
    assert!(streamed
        .lock()
        .iter()
        .filter(|output| !output.finished)
        .all(|output| output.status.is_none()));

    let text = full_text(&streamed, stream_id);
    assert_eq!(text.len(), 12);
    assert_eq!(text, terminal(&whole, whole_id).outputs[0].text);
}

/// Replays a fixed byte sequence for every sequence it sees.
struct ScriptedExecutor {
    script: Vec<u32>,
    positions: HashMap<SequenceId, usize>,
}

impl ScriptedExecutor {
    fn new(text: &str) -> Self {
        Self {
            script: text.bytes().map(u32::from).collect(),
            positions: HashMap::new(),
        }
    }
}

impl ModelExecutor for ScriptedExecutor {
    fn kv_cache_bytes_per_token(&self) -> u64 {
        BYTES_PER_TOKEN
    }

    fn allocate_kv_cache(&mut self, _num_blocks: usize, _block_size: usize) -> Result<()> {
        Ok(())
    }

    fn execute(&mut self, batch: &Batch) -> Result<Vec<StepOutput>> {
        Ok(batch
            .iter()
            .map(|entry| {
                let position = self.positions.entry(entry.seq_id).or_default();
                let token = self.script[*position % self.script.len()];
                *position += 1;
                StepOutput::new(entry.seq_id, vec![token])
            })
            .collect())
    }
}

#[test]
fn test_streaming_holds_back_split_characters() {
    let handler = LLMHandler::new(
        options(8),
        Box::new(ScriptedExecutor::new("é!")),
        Arc::new(ByteTokenizer::new()),
    )
    .unwrap();
    let streamed: Outputs = Arc::default();
    let whole: Outputs = Arc::default();

    let params = SamplingParams::default().max_tokens(3);
    let stream_id =
        handler.schedule_async("hi", params.clone(), Priority::Medium, true, collect(&streamed));
    let whole_id = handler.schedule_async("hi", params, Priority::Medium, false, collect(&whole));
    handler.run_until_complete().unwrap();

    assert_eq!(terminal(&whole, whole_id).outputs[0].text, "é!");
    assert_eq!(full_text(&streamed, stream_id), "é!");

    let chunks: Vec<(bool, String, Vec<u32>)> = streamed
        .lock()
        .iter()
        .map(|output| {
            let seq = &output.outputs[0];
            (output.finished, seq.text.clone(), seq.token_ids.clone())
        })
        .collect();
    assert_eq!(
        chunks,
        vec![
            (false, "é".to_string(), vec![0xC3, 0xA9]),
            (true, "!".to_string(), vec![u32::from(b'!')]),
        ]
    );
}

#[test]
fn test_stop_string_and_echo() {
    let handler = handler(options(64));
    let outputs: Outputs = Arc::default();

    // After "hi" the synthetic model writes "cwqkeysm..."
    let params = SamplingParams::default().max_tokens(32).stop("qk").echo(true);
    let id = handler.schedule_async("hi", params, Priority::Medium, false, collect(&outputs));
    handler.run_until_complete().unwrap();

    let output = terminal(&outputs, id);
    assert_eq!(output.outputs[0].text, "hicwqk");
    assert_eq!(output.outputs[0].finish_reason, Some(FinishReason::Stop));
}

#[test]
fn test_false_callback_cancels_request() {
    let handler = handler(options(64));
    let calls: Outputs = Arc::default();
    let calls_cb = Arc::clone(&calls);
    handler.start().unwrap();

    let id = handler.schedule_async(
        "cancel me",
        SamplingParams::default().max_tokens(1000),
        Priority::Medium,
        true,
        move |output| {
            calls_cb.lock().push(output);
            false
        },
    );
    handler.run_until_complete().unwrap();
    handler.stop();

    let calls = calls.lock();
    assert_eq!(calls.len(), 2);
    assert!(!calls[0].finished);
    assert_eq!(calls[1].request_id, id);
    assert_eq!(calls[1].status.as_ref().unwrap().code, StatusCode::Cancelled);
}

#[test]
fn test_request_larger_than_cache_reports_capacity() {
    let handler = handler(options(2));
    let outputs: Outputs = Arc::default();

    let big = handler.schedule_async(
        &"x".repeat(40),
        SamplingParams::default().max_tokens(4),
        Priority::High,
        false,
        collect(&outputs),
    );
    let small = handler.schedule_async(
        "ok",
        SamplingParams::default().max_tokens(4),
        Priority::Low,
        false,
        collect(&outputs),
    );
    handler.run_until_complete().unwrap();

    let status = terminal(&outputs, big).status.unwrap();
    assert_eq!(status.code, StatusCode::CapacityExceeded);
    assert!(!status.message.is_empty());
    assert!(terminal(&outputs, small).is_ok());
}

#[test]
fn test_memory_pressure_preempts_and_completes_everything() {
    let handler = handler(options(4));
    let outputs: Outputs = Arc::default();
    handler.start().unwrap();

    // Every request ends at 50 tokens (4 blocks); only one fits at a time
    let priorities = [Priority::Low, Priority::High, Priority::Medium];
    let ids: Vec<RequestId> = (0..6)
        .map(|i| {
            handler.schedule_async(
                &format!("{i:0>20}"),
                SamplingParams::default().max_tokens(30),
                priorities[i % 3],
                i % 2 == 0,
                collect(&outputs),
            )
        })
        .collect();
    handler.run_until_complete().unwrap();
    handler.stop();

    let mut terminals: HashMap<RequestId, usize> = HashMap::new();
    for output in outputs.lock().iter().filter(|output| output.finished) {
        *terminals.entry(output.request_id).or_default() += 1;
        assert!(output.is_ok());
    }
    assert_eq!(terminals.len(), ids.len());
    assert!(terminals.values().all(|&count| count == 1));
    for id in ids {
        assert_eq!(full_text(&outputs, id).len(), 30);
    }
}

#[test]
fn test_invalid_requests_fail_fast() {
    let handler = handler(options(8));
    let outputs: Outputs = Arc::default();

    let empty = handler.schedule_async(
        "",
        SamplingParams::default(),
        Priority::Medium,
        false,
        collect(&outputs),
    );
    let zero = handler.schedule_async(
        "hi",
        SamplingParams::default().max_tokens(0),
        Priority::Medium,
        false,
        collect(&outputs),
    );
    handler.run_until_complete().unwrap();

    for id in [empty, zero] {
        let output = terminal(&outputs, id);
        assert_eq!(
            output.status.unwrap().code,
            StatusCode::InvalidArgument
        );
        assert!(output.outputs.is_empty());
    }
}

#[test]
fn test_chat_requires_template() {
    let outputs: Outputs = Arc::default();
    let messages = [Message::system("be brief"), Message::user("hi")];

    let plain = handler(options(8));
    let id = plain.schedule_chat_async(
        &messages,
        SamplingParams::default().max_tokens(2),
        Priority::Medium,
        false,
        collect(&outputs),
    );
    plain.run_until_complete().unwrap();
    assert_eq!(
        terminal(&outputs, id).status.unwrap().code,
        StatusCode::InvalidArgument
    );

    let templated = handler(options(8)).with_chat_template(Arc::new(SimpleChatTemplate));
    let id = templated.schedule_chat_async(
        &messages,
        SamplingParams::default().max_tokens(2).echo(true),
        Priority::Medium,
        false,
        collect(&outputs),
    );
    templated.run_until_complete().unwrap();
    let output = terminal(&outputs, id);
    assert!(output.is_ok());
    assert!(output.outputs[0].text.starts_with("<|system|>\nbe brief\n"));
}

#[test]
fn test_multiple_completions() {
    let handler = handler(options(16));
    let outputs: Outputs = Arc::default();

    let id = handler.schedule_async(
        "abc",
        SamplingParams::default().max_tokens(5).n(3),
        Priority::Medium,
        false,
        collect(&outputs),
    );
    handler.run_until_complete().unwrap();

    let output = terminal(&outputs, id);
    let indices: Vec<usize> = output.outputs.iter().map(|seq| seq.index).collect();
    assert_eq!(indices, vec![0, 1, 2]);
    assert_eq!(output.usage.unwrap().num_generated_tokens, 15);
}

#[test]
fn test_speculation_requires_draft_executor() {
    let mut options = options(16);
    options.speculative.num_speculative_tokens = 3;
    let handler = handler(options);

    assert!(matches!(handler.start(), Err(Error::Config(_))));
    assert!(matches!(handler.run_until_complete(), Err(Error::Config(_))));
}

#[test]
fn test_speculative_output_matches_plain_decoding() {
    let plain_outputs: Outputs = Arc::default();
    let plain = handler(options(64));
    let plain_id = plain.schedule_async(
        "speculate",
        SamplingParams::default().max_tokens(40),
        Priority::Medium,
        true,
        collect(&plain_outputs),
    );
    plain.run_until_complete().unwrap();

    let mut spec_options = options(64);
    spec_options.speculative.num_speculative_tokens = 4;
    let spec_outputs: Outputs = Arc::default();
    let speculative =
        handler(spec_options).with_draft_executor(Box::new(SyntheticDraft::new(1, 0.3)));
    let spec_id = speculative.schedule_async(
        "speculate",
        SamplingParams::default().max_tokens(40),
        Priority::Medium,
        true,
        collect(&spec_outputs),
    );
    speculative.run_until_complete().unwrap();

    assert_eq!(full_text(&spec_outputs, spec_id), full_text(&plain_outputs, plain_id));
    assert_eq!(
        terminal(&spec_outputs, spec_id).usage.unwrap().num_generated_tokens,
        40
    );
    // Accepted drafts mean fewer deliveries than tokens
    let spec_partials = spec_outputs.lock().iter().filter(|o| !o.finished).count();
    assert!(spec_partials < 39);
}

struct FailingExecutor;

impl ModelExecutor for FailingExecutor {
    fn kv_cache_bytes_per_token(&self) -> u64 {
        BYTES_PER_TOKEN
    }

    fn allocate_kv_cache(&mut self, _num_blocks: usize, _block_size: usize) -> Result<()> {
        Ok(())
    }

    fn execute(&mut self, _batch: &Batch) -> Result<Vec<StepOutput>> {
        Err(Error::Executor("device lost".to_string()))
    }
}

#[test]
fn test_executor_failure_reports_internal() {
    let handler = LLMHandler::new(
        options(8),
        Box::new(FailingExecutor),
        Arc::new(ByteTokenizer::new()),
    )
    .unwrap();
    let outputs: Outputs = Arc::default();

    let id = handler.schedule_async(
        "boom",
        SamplingParams::default(),
        Priority::Medium,
        true,
        collect(&outputs),
    );
    handler.run_until_complete().unwrap();

    assert_eq!(outputs.lock().len(), 1);
    let status = terminal(&outputs, id).status.unwrap();
    assert_eq!(status.code, StatusCode::Internal);
    assert!(status.message.contains("device lost"));
}

#[test]
fn test_restart_after_stop() {
    let handler = handler(options(16));
    let outputs: Outputs = Arc::default();

    handler.start().unwrap();
    assert!(handler.is_running());
    assert!(handler.start().is_err());
    handler.stop();
    assert!(!handler.is_running());

    let id = handler.schedule_async(
        "again",
        SamplingParams::default().max_tokens(3),
        Priority::Medium,
        false,
        collect(&outputs),
    );
    handler.start().unwrap();
    handler.run_until_complete().unwrap();
    handler.stop();
    assert!(terminal(&outputs, id).is_ok());
}
