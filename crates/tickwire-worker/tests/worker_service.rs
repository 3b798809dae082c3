//! Integration tests for WorkerRpcService against mocked frame channels.
//!
//! The parser mock replays a scripted list of parse results; the writer mock
//! records every frame it is handed and answers with scripted statuses.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use mockall::mock;
use serde_json::{json, Value};
use tickwire_core::protocol::{Frame, FrameError, FrameParser, FrameWriter, Opcode, WriteStatus};
use tickwire_worker::application::{
    JsonCodec, ProcedureFailure, ProcedureRegistry, ServiceState, WorkerRpcService,
};

mock! {
    pub Parser {}
    impl FrameParser for Parser {
        fn parse(&mut self) -> Result<Option<Frame>, FrameError>;
    }
}

mock! {
    pub Writer {}
    impl FrameWriter for Writer {
        fn write(&mut self, frame: &Frame) -> Result<WriteStatus, FrameError>;
        fn flush(&mut self) -> Result<WriteStatus, FrameError>;
    }
}

type Script = Arc<Mutex<VecDeque<Result<Option<Frame>, FrameError>>>>;
type Written = Arc<Mutex<Vec<Frame>>>;

/// A parser mock that pops scripted results and reports `Ok(None)` once the
/// script is exhausted.  The shared script lets tests see what was consumed.
fn scripted_parser(items: Vec<Result<Option<Frame>, FrameError>>) -> (MockParser, Script) {
    let script: Script = Arc::new(Mutex::new(items.into()));
    let shared = Arc::clone(&script);
    let mut parser = MockParser::new();
    parser
        .expect_parse()
        .returning(move || shared.lock().unwrap().pop_front().unwrap_or(Ok(None)));
    (parser, script)
}

/// A writer mock that records frames and answers each write with the next
/// scripted status (`Complete` once the script runs out).
fn recording_writer(statuses: Vec<WriteStatus>) -> (MockWriter, Written) {
    let written: Written = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&written);
    let mut statuses: VecDeque<WriteStatus> = statuses.into();
    let mut writer = MockWriter::new();
    writer.expect_write().returning(move |frame| {
        sink.lock().unwrap().push(frame.clone());
        Ok(statuses.pop_front().unwrap_or(WriteStatus::Complete))
    });
    (writer, written)
}

fn registry() -> ProcedureRegistry<JsonCodec> {
    let mut registry = ProcedureRegistry::new();
    registry
        .register_typed("echo", |(value,): (Value,), _| Ok(value))
        .unwrap()
        .register("explode", |_args, _| Err(anyhow::anyhow!("test")))
        .unwrap();
    registry
}

fn frames(items: Vec<Frame>) -> Vec<Result<Option<Frame>, FrameError>> {
    items.into_iter().map(|f| Ok(Some(f))).collect()
}

fn decode_failure(frame: &Frame) -> ProcedureFailure {
    assert_eq!(frame.opcode, Opcode::Error);
    serde_json::from_slice(&frame.payload).expect("failure report is JSON")
}

// ── Successful calls ──────────────────────────────────────────────────────────

#[test]
fn test_call_split_across_two_frames_yields_one_data_frame() {
    // Arrange
    let (parser, _) = scripted_parser(frames(vec![
        Frame::partial("echo,"),
        Frame::data(r#"["hi"]"#),
    ]));
    let (writer, written) = recording_writer(vec![]);
    let mut service = WorkerRpcService::new(JsonCodec, registry(), parser, writer);

    // Act
    let state = service.on_readable().unwrap();

    // Assert
    assert_eq!(state, ServiceState::Reading);
    let written = written.lock().unwrap();
    assert_eq!(written.len(), 1);
    assert_eq!(written[0].opcode, Opcode::Data);
    assert!(written[0].fin);
    let value: Value = serde_json::from_slice(&written[0].payload).unwrap();
    assert_eq!(value, json!("hi"));
    assert_eq!(service.buffered_len(), 0);
}

#[test]
fn test_arguments_containing_commas_are_preserved() {
    let (parser, _) = scripted_parser(frames(vec![Frame::data(r#"echo,["a,b,c"]"#)]));
    let (writer, written) = recording_writer(vec![]);
    let mut service = WorkerRpcService::new(JsonCodec, registry(), parser, writer);

    service.on_readable().unwrap();

    let written = written.lock().unwrap();
    assert_eq!(written[0].payload, br#""a,b,c""#.to_vec());
}

// ── Failed calls ──────────────────────────────────────────────────────────────

#[test]
fn test_unknown_procedure_yields_single_error_frame() {
    // Arrange
    let (parser, _) = scripted_parser(frames(vec![Frame::data("nope,[]")]));
    let (writer, written) = recording_writer(vec![]);
    let mut service = WorkerRpcService::new(JsonCodec, registry(), parser, writer);

    // Act
    service.on_readable().unwrap();

    // Assert
    let written = written.lock().unwrap();
    assert_eq!(written.len(), 1);
    let failure = decode_failure(&written[0]);
    assert_eq!(failure.procedure, "nope");
    assert_eq!(
        failure.message,
        "uncaught error encountered while invoking nope"
    );
    assert_eq!(failure.cause, "no procedure named `nope` is registered");
    assert_eq!(service.buffered_len(), 0);
}

#[test]
fn test_procedure_error_is_reported_and_service_keeps_running() {
    // Arrange
    let (parser, _) = scripted_parser(frames(vec![
        Frame::data("explode,[]"),
        Frame::data(r#"echo,[1]"#),
    ]));
    let (writer, written) = recording_writer(vec![]);
    let mut service = WorkerRpcService::new(JsonCodec, registry(), parser, writer);

    // Act
    let state = service.on_readable().unwrap();

    // Assert
    assert_eq!(state, ServiceState::Reading);
    let written = written.lock().unwrap();
    assert_eq!(written.len(), 2);
    let failure = decode_failure(&written[0]);
    assert_eq!(failure.procedure, "explode");
    assert_eq!(failure.cause, "test");
    assert_eq!(failure.causes, vec!["test".to_string()]);
    assert_eq!(written[1].opcode, Opcode::Data);
    assert_eq!(service.calls_served(), 2);
}

#[test]
fn test_missing_delimiter_yields_error_frame_naming_whole_payload() {
    let (parser, _) = scripted_parser(frames(vec![Frame::data("nodelimiter")]));
    let (writer, written) = recording_writer(vec![]);
    let mut service = WorkerRpcService::new(JsonCodec, registry(), parser, writer);

    service.on_readable().unwrap();

    let failure = decode_failure(&written.lock().unwrap()[0]);
    assert_eq!(failure.procedure, "nodelimiter");
    assert!(failure.cause.starts_with("malformed call payload"));
    assert_eq!(service.buffered_len(), 0);
}

#[test]
fn test_argument_list_that_is_not_an_array_is_reported() {
    let (parser, _) = scripted_parser(frames(vec![Frame::data(r#"echo,{"a":1}"#)]));
    let (writer, written) = recording_writer(vec![]);
    let mut service = WorkerRpcService::new(JsonCodec, registry(), parser, writer);

    service.on_readable().unwrap();

    let failure = decode_failure(&written.lock().unwrap()[0]);
    assert_eq!(failure.procedure, "echo");
    assert!(failure.cause.contains("must be a JSON array"));
}

// ── Backpressure ──────────────────────────────────────────────────────────────

#[test]
fn test_no_frame_is_parsed_while_response_write_is_pending() {
    // Arrange – the first response only partially writes
    let (parser, script) = scripted_parser(frames(vec![
        Frame::data(r#"echo,["first"]"#),
        Frame::data(r#"echo,["second"]"#),
    ]));
    let (mut writer, written) = recording_writer(vec![WriteStatus::Pending]);
    writer
        .expect_flush()
        .times(1)
        .returning(|| Ok(WriteStatus::Complete));
    let mut service = WorkerRpcService::new(JsonCodec, registry(), parser, writer);

    // Act – first readable event
    let state = service.on_readable().unwrap();

    // Assert – paused after the first call, second frame untouched
    assert_eq!(state, ServiceState::AwaitingWritable);
    assert_eq!(script.lock().unwrap().len(), 1);
    assert_eq!(written.lock().unwrap().len(), 1);

    // Act – a further readable event while paused does nothing
    assert_eq!(service.on_readable().unwrap(), ServiceState::AwaitingWritable);
    assert_eq!(script.lock().unwrap().len(), 1);

    // Act – the channel drains
    let state = service.on_writable().unwrap();

    // Assert – the queued call is answered once writing resumes
    assert_eq!(state, ServiceState::Reading);
    assert!(script.lock().unwrap().is_empty());
    let written = written.lock().unwrap();
    assert_eq!(written.len(), 2);
    assert_eq!(written[1].payload, br#""second""#.to_vec());
}

#[test]
fn test_flush_still_pending_keeps_service_paused() {
    let (parser, _) = scripted_parser(frames(vec![Frame::data(r#"echo,[1]"#)]));
    let (mut writer, _) = recording_writer(vec![WriteStatus::Pending]);
    writer
        .expect_flush()
        .times(2)
        .returning({
            let mut statuses = VecDeque::from([WriteStatus::Pending, WriteStatus::Complete]);
            move || Ok(statuses.pop_front().unwrap_or(WriteStatus::Complete))
        });
    let mut service = WorkerRpcService::new(JsonCodec, registry(), parser, writer);

    service.on_readable().unwrap();

    assert_eq!(service.on_writable().unwrap(), ServiceState::AwaitingWritable);
    assert_eq!(service.on_writable().unwrap(), ServiceState::Reading);
}

// ── Channel shutdown and failure ──────────────────────────────────────────────

#[test]
fn test_closed_input_reports_closed_state_and_drops_partial_call() {
    let mut items = frames(vec![Frame::partial("echo,")]);
    items.push(Err(FrameError::Closed { mid_frame: false }));
    let (parser, _) = scripted_parser(items);
    let (writer, written) = recording_writer(vec![]);
    let mut service = WorkerRpcService::new(JsonCodec, registry(), parser, writer);

    let state = service.on_readable().unwrap();

    assert_eq!(state, ServiceState::Closed);
    assert_eq!(service.buffered_len(), 0);
    assert!(written.lock().unwrap().is_empty());
}

#[test]
fn test_transport_error_is_returned_to_caller() {
    let (parser, _) = scripted_parser(vec![Err(FrameError::UnknownOpcode(0x7))]);
    let (writer, _) = recording_writer(vec![]);
    let mut service = WorkerRpcService::new(JsonCodec, registry(), parser, writer);

    let err = service.on_readable().unwrap_err();

    assert!(err.to_string().contains("unknown frame opcode"));
}
