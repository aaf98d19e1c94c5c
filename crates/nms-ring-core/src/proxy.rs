//! Proxy controller: supervises the duplexing loop end to end.
//!
//! Concurrent activities under one shared shutdown signal:
//!
//! 1. the session's blocking reader thread feeding the chunk channel;
//! 2. the echo loop — mirrors every chunk to the real terminal in read
//!    order, then hands the decoded text to the classifier path;
//! 3. the classifier task — severity/pass-marker events to the aggregator,
//!    prompt detection and input forwarding back to the child;
//! 4. the aggregator's flush loop;
//! 5. the exit-wait task;
//! 6. the detached operator-input thread, which only reads on request.
//!
//! The first broken link — read error, write error, child exit, Ctrl+C —
//! sets the signal once; closing the session is what actually unblocks the
//! pending read. Nothing is retried and no alert can fire after shutdown.

use std::io::Write;
use std::sync::Arc;
use std::thread;

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::aggregate::{self, AggregatorHandle};
use crate::classify::Classifier;
use crate::decode::{colorize, TextDecoder};
use crate::ring::RingPlayer;
use crate::session::Session;
use crate::types::{OutputChunk, ProxyError, ProxyOptions, Transport};

/// Run the proxy for one target process until it exits, a link breaks, or
/// the operator interrupts.
pub async fn run(
    path: &str,
    options: ProxyOptions,
    player: Arc<RingPlayer>,
) -> Result<(), ProxyError> {
    run_with_input(path, options, player, OperatorInput::stdin()).await
}

async fn run_with_input(
    path: &str,
    options: ProxyOptions,
    player: Arc<RingPlayer>,
    input: OperatorInput,
) -> Result<(), ProxyError> {
    let mut session = Session::spawn(path, &options)?;
    let output = session
        .take_output()
        .ok_or_else(|| ProxyError::Launch("session output unavailable".into()))?;
    let writer = session
        .take_writer()
        .ok_or_else(|| ProxyError::Launch("session writer unavailable".into()))?;

    let (stop_tx, stop_rx) = watch::channel(false);
    let (aggregator, aggregator_task) =
        aggregate::spawn(options.debounce, player, stop_rx.clone());

    let classifier = Classifier::new(options.pass_marker.clone(), options.prompt_markers.clone());
    let (text_tx, text_rx) = mpsc::unbounded_channel();
    let mut classify_task = tokio::spawn(classify_loop(
        text_rx,
        classifier,
        aggregator,
        writer,
        options.line_ending.clone(),
        input,
        stop_rx.clone(),
    ));

    let decoder = match options.transport {
        Transport::Pty => TextDecoder::Utf8,
        Transport::Raw => TextDecoder::Gbk,
    };
    let mut echo_task = tokio::spawn(echo_loop(
        output,
        options.transport,
        decoder,
        text_tx,
        stop_rx.clone(),
    ));

    let mut exit_task = tokio::spawn({
        let exit = session.take_exit();
        let stop = stop_rx.clone();
        async move {
            match exit {
                Some(exit) => exit.wait(stop).await,
                None => Ok(()),
            }
        }
    });

    // Supervise: whichever link breaks first decides the outcome, then the
    // shared signal and session close tear the rest down.
    let mut echo_result: Option<Result<(), ProxyError>> = None;
    let mut classify_result: Option<Result<(), ProxyError>> = None;
    let mut exit_result: Option<Result<(), ProxyError>> = None;

    tokio::select! {
        exit = &mut exit_task => {
            exit_result = Some(join_flatten(exit));
        }
        echo = &mut echo_task => {
            echo_result = Some(join_flatten(echo));
            // Output EOF is usually observed before the exit notification;
            // still collect the status so an abnormal exit is not lost to
            // the race.
            if matches!(echo_result, Some(Ok(()))) {
                tokio::select! {
                    exit = &mut exit_task => {
                        exit_result = Some(join_flatten(exit));
                    }
                    _ = tokio::signal::ctrl_c() => {
                        info!("interrupted, shutting down");
                    }
                }
            }
        }
        classify = &mut classify_task => {
            classify_result = Some(join_flatten(classify));
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, shutting down");
        }
    }

    let _ = stop_tx.send(true);
    session.close();

    if echo_result.is_none() {
        echo_result = Some(join_flatten(echo_task.await));
    }
    if classify_result.is_none() {
        classify_result = Some(join_flatten(classify_task.await));
    }
    if exit_result.is_none() {
        exit_result = Some(join_flatten(exit_task.await));
    }
    let _ = aggregator_task.await;

    // Report the first broken link: the mirror itself outranks exit status.
    echo_result.unwrap_or(Ok(()))?;
    classify_result.unwrap_or(Ok(()))?;
    exit_result.unwrap_or(Ok(()))
}

fn join_flatten(
    result: Result<Result<(), ProxyError>, tokio::task::JoinError>,
) -> Result<(), ProxyError> {
    match result {
        Ok(inner) => inner,
        Err(e) => {
            error!(error = %e, "proxy task failed");
            Ok(())
        }
    }
}

/// Echo loop: one consumer of the ordered chunk channel.
///
/// Echo order equals read order exactly; classification runs on its own
/// task so a slow prompt or alert never delays what the operator sees.
async fn echo_loop(
    mut output: mpsc::Receiver<OutputChunk>,
    transport: Transport,
    decoder: TextDecoder,
    text_tx: mpsc::UnboundedSender<String>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), ProxyError> {
    let mut stdout = std::io::stdout();
    loop {
        tokio::select! {
            biased;

            _ = shutdown.wait_for(|stop| *stop) => return Ok(()),

            chunk = output.recv() => match chunk {
                Some(OutputChunk::Data(bytes)) => {
                    match handle_data(&bytes, transport, decoder, &mut stdout) {
                        Ok(text) => {
                            let _ = text_tx.send(text);
                        }
                        Err(e @ ProxyError::Decode(_)) => {
                            // Decode failure on one chunk is not fatal.
                            warn!(error = %e, "skipping undecodable chunk");
                        }
                        Err(e) => {
                            error!(error = %e, "terminal echo failed");
                            return Err(e);
                        }
                    }
                }
                Some(OutputChunk::Closed(None)) | None => {
                    debug!("target output ended");
                    return Ok(());
                }
                Some(OutputChunk::Closed(Some(e))) => {
                    error!(error = %e, "target output read failed");
                    return Err(ProxyError::Read(e));
                }
            }
        }
    }
}

/// Mirror one chunk to `sink` and return the text to classify.
///
/// On the PTY transport the raw bytes pass through untouched — the child's
/// own formatting is already in them — and classification sees a lossy
/// UTF-8 view. On the raw transport the chunk is decoded first and the
/// echo gets synthesized color; an undecodable chunk is skipped whole.
fn handle_data(
    bytes: &[u8],
    transport: Transport,
    decoder: TextDecoder,
    sink: &mut dyn Write,
) -> Result<String, ProxyError> {
    match transport {
        Transport::Pty => {
            sink.write_all(bytes).map_err(ProxyError::Write)?;
            sink.flush().map_err(ProxyError::Write)?;
            Ok(String::from_utf8_lossy(bytes).into_owned())
        }
        Transport::Raw => {
            let text = decoder.decode(bytes)?;
            sink.write_all(colorize(&text).as_bytes())
                .map_err(ProxyError::Write)?;
            sink.flush().map_err(ProxyError::Write)?;
            Ok(text.into_owned())
        }
    }
}

/// One-line-at-a-time bridge to the operator's terminal.
///
/// Stdin is read on a detached thread that only reads after an explicit
/// request: an unanswered prompt leaves the thread parked in `read_line`,
/// but nothing awaits it, so shutdown and process exit are never held up,
/// and unsolicited typing stays in the terminal's buffer.
struct OperatorInput {
    requests: mpsc::Sender<()>,
    lines: mpsc::Receiver<std::io::Result<String>>,
}

impl OperatorInput {
    fn stdin() -> Self {
        let (requests, mut request_rx) = mpsc::channel::<()>(1);
        let (line_tx, lines) = mpsc::channel(1);
        let builder = thread::Builder::new().name("stdin-reader".to_string());
        let spawned = builder.spawn(move || {
            while request_rx.blocking_recv().is_some() {
                if line_tx.blocking_send(read_operator_line()).is_err() {
                    return;
                }
            }
        });
        if let Err(e) = spawned {
            // Channels are closed in this case, so read_line yields None.
            warn!(error = %e, "failed to spawn stdin reader thread");
        }
        Self { requests, lines }
    }

    /// Request and await one line. `None` means the source is gone.
    async fn read_line(&mut self) -> Option<std::io::Result<String>> {
        self.requests.send(()).await.ok()?;
        self.lines.recv().await
    }
}

/// Classifier task: consumes decoded chunks in order, fans severity and
/// pass-complete events out to the aggregator, and services prompts.
///
/// Prompt forwarding is a synchronous hand-off: this task waits for the
/// operator's line while the echo loop keeps running, so output continues
/// to appear but no second prompt is serviced until the first completes.
async fn classify_loop(
    mut rx: mpsc::UnboundedReceiver<String>,
    classifier: Classifier,
    aggregator: AggregatorHandle,
    mut writer: Box<dyn Write + Send>,
    line_ending: String,
    mut input: OperatorInput,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), ProxyError> {
    let mut prompt_shutdown = shutdown.clone();
    loop {
        tokio::select! {
            biased;

            _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => return Ok(()),

            text = rx.recv() => {
                let Some(text) = text else { return Ok(()) };
                let found = classifier.classify(&text);
                if found.is_empty() {
                    continue;
                }

                // Window effects first so the pass marker is not held up by
                // a prompt in the same chunk.
                if found.pass_complete {
                    aggregator.pass_complete();
                }
                for level in found.levels {
                    aggregator.level(level);
                }

                if found.prompt {
                    let line = tokio::select! {
                        biased;
                        _ = prompt_shutdown.wait_for(|stop| *stop) => return Ok(()),
                        line = input.read_line() => match line {
                            Some(Ok(line)) => line,
                            Some(Err(e)) => {
                                warn!(error = %e, "could not read operator input");
                                continue;
                            }
                            None => {
                                warn!("operator input unavailable");
                                continue;
                            }
                        }
                    };
                    forward_line(&mut *writer, &line, &line_ending)?;
                }
            }
        }
    }
}

/// One line from the controlling terminal, without its terminator.
fn read_operator_line() -> std::io::Result<String> {
    let mut buf = String::new();
    let n = std::io::stdin().read_line(&mut buf)?;
    if n == 0 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "stdin closed",
        ));
    }
    Ok(buf.trim_end_matches(['\r', '\n']).to_string())
}

/// Forward one operator line to the child with the terminator it expects.
fn forward_line(
    writer: &mut dyn Write,
    line: &str,
    line_ending: &str,
) -> Result<(), ProxyError> {
    writer.write_all(line.as_bytes()).map_err(ProxyError::Write)?;
    writer
        .write_all(line_ending.as_bytes())
        .map_err(ProxyError::Write)?;
    writer.flush().map_err(ProxyError::Write)?;
    debug!(len = line.len(), "forwarded operator input");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use crate::aggregate::Notify;
    use crate::level::Severity;

    #[derive(Default)]
    struct Recorder {
        rings: Mutex<Vec<Severity>>,
    }

    impl Notify for Recorder {
        fn notify(&self, level: Severity) {
            self.rings.lock().unwrap().push(level);
        }
    }

    struct Broken;

    impl Write for Broken {
        fn write(&mut self, _: &[u8]) -> std::io::Result<usize> {
            Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone"))
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    struct SharedSink(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    /// Operator input that answers requests from a fixed script.
    fn scripted_input(lines: Vec<std::io::Result<String>>) -> OperatorInput {
        let (requests, mut request_rx) = mpsc::channel::<()>(1);
        let (line_tx, lines_rx) = mpsc::channel(1);
        tokio::spawn(async move {
            let mut lines = lines.into_iter();
            while request_rx.recv().await.is_some() {
                let Some(line) = lines.next() else { return };
                if line_tx.send(line).await.is_err() {
                    return;
                }
            }
        });
        OperatorInput {
            requests,
            lines: lines_rx,
        }
    }

    /// Operator input that accepts requests and never answers.
    fn silent_input() -> OperatorInput {
        let (requests, mut request_rx) = mpsc::channel::<()>(1);
        let (line_tx, lines_rx) = mpsc::channel(1);
        tokio::spawn(async move {
            let _keep_open = line_tx;
            while request_rx.recv().await.is_some() {}
        });
        OperatorInput {
            requests,
            lines: lines_rx,
        }
    }

    #[test]
    fn test_pty_echo_is_lossless_and_order_preserving() {
        // Whatever the child wrote — ANSI sequences, partial UTF-8,
        // arbitrary bytes — reaches the terminal byte-for-byte.
        let chunks: [&[u8]; 3] = [
            b"\x1b[1;32m[SSS] \x1b[0m\xe5\xae\x8c",
            b"\xe7\xbe\x8e",
            &[0xff, 0x00, 0x7f],
        ];
        let mut sink = Vec::new();
        for chunk in chunks {
            handle_data(chunk, Transport::Pty, TextDecoder::Utf8, &mut sink).unwrap();
        }
        let expected: Vec<u8> = chunks.concat();
        assert_eq!(sink, expected);
    }

    #[test]
    fn test_pty_classification_text_never_mutates_echo() {
        let bytes = b"[A] x [SSS] y";
        let mut sink = Vec::new();
        let text =
            handle_data(bytes, Transport::Pty, TextDecoder::Utf8, &mut sink).unwrap();
        assert_eq!(sink, bytes);
        assert_eq!(text, "[A] x [SSS] y");
    }

    #[test]
    fn test_raw_echo_is_decoded_and_colorized() {
        // "[SSS] 完美" in GBK.
        let mut bytes = b"[SSS] ".to_vec();
        bytes.extend_from_slice(&[0xcd, 0xea, 0xc3, 0xc0]);
        let mut sink = Vec::new();
        let text =
            handle_data(&bytes, Transport::Raw, TextDecoder::Gbk, &mut sink).unwrap();
        assert_eq!(text, "[SSS] 完美");
        let echoed = String::from_utf8(sink).unwrap();
        assert!(echoed.contains("\x1b[48;2;255;215;0m SSS \x1b[0m"));
        assert!(echoed.contains("完美"));
    }

    #[test]
    fn test_raw_undecodable_chunk_is_skipped_whole() {
        let mut sink = Vec::new();
        let err = handle_data(&[0xc3], Transport::Raw, TextDecoder::Gbk, &mut sink).unwrap_err();
        assert!(matches!(err, ProxyError::Decode(_)));
        assert!(sink.is_empty(), "a skipped chunk must not be partially echoed");
    }

    #[test]
    fn test_forward_line_appends_expected_terminator() {
        let mut child_input = Vec::new();
        forward_line(&mut child_input, "Y", "\n").unwrap();
        assert_eq!(child_input, b"Y\n");

        let mut crlf_input = Vec::new();
        forward_line(&mut crlf_input, "3", "\r\n").unwrap();
        assert_eq!(crlf_input, b"3\r\n");
    }

    #[test]
    fn test_forward_line_write_failure_is_fatal() {
        let err = forward_line(&mut Broken, "Y", "\n").unwrap_err();
        assert!(matches!(err, ProxyError::Write(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_prompt_forwards_one_line_without_ringing() {
        let (text_tx, text_rx) = mpsc::unbounded_channel();
        let (_stop_tx, stop_rx) = watch::channel(false);
        let recorder = Arc::new(Recorder::default());
        let (aggregator, aggregator_task) =
            aggregate::spawn(Duration::from_millis(500), recorder.clone(), stop_rx.clone());
        let sink = SharedSink::default();

        let task = tokio::spawn(classify_loop(
            text_rx,
            Classifier::default(),
            aggregator,
            Box::new(sink.clone()),
            "\n".into(),
            scripted_input(vec![Ok("Y".into()), Ok("N".into())]),
            stop_rx,
        ));

        text_tx.send("[Y]我同意 [N]不同意: ".into()).unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;

        // One prompt means one forwarded line; the second scripted line is
        // never consumed, and the prompt opens no aggregation window.
        assert_eq!(*sink.0.lock().unwrap(), b"Y\n");
        assert!(recorder.rings.lock().unwrap().is_empty());

        drop(text_tx);
        task.await.unwrap().unwrap();
        aggregator_task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_prompt_write_failure_ends_the_classifier() {
        let (text_tx, text_rx) = mpsc::unbounded_channel();
        let (_stop_tx, stop_rx) = watch::channel(false);
        let recorder = Arc::new(Recorder::default());
        let (aggregator, aggregator_task) =
            aggregate::spawn(Duration::from_millis(500), recorder, stop_rx.clone());

        let task = tokio::spawn(classify_loop(
            text_rx,
            Classifier::default(),
            aggregator,
            Box::new(Broken),
            "\n".into(),
            scripted_input(vec![Ok("Y".into())]),
            stop_rx,
        ));

        text_tx.send("请输入命令: ".into()).unwrap();
        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, ProxyError::Write(_)));
        aggregator_task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_abandons_pending_prompt_read() {
        let (text_tx, text_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);
        let recorder = Arc::new(Recorder::default());
        let (aggregator, aggregator_task) =
            aggregate::spawn(Duration::from_millis(500), recorder, stop_rx.clone());

        let task = tokio::spawn(classify_loop(
            text_rx,
            Classifier::default(),
            aggregator,
            Box::new(SharedSink::default()),
            "\n".into(),
            silent_input(),
            stop_rx,
        ));

        // The prompt is outstanding and no answer is coming.
        text_tx.send("请输入选择: ".into()).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        stop_tx.send(true).unwrap();
        task.await.unwrap().unwrap();
        aggregator_task.await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_abnormal_exit_reported_after_output_ends() {
        // The child's EOF arrives before its exit notification; the status
        // must still be collected and surfaced.
        let opts = ProxyOptions {
            transport: Transport::Raw,
            ..ProxyOptions::default()
        };
        let player = Arc::new(RingPlayer::new(Severity::Sss));
        let err = run("/bin/false", opts, player).await.unwrap_err();
        assert!(matches!(err, ProxyError::Exit(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_forward_failure_tears_the_session_down() {
        use std::os::unix::fs::PermissionsExt;

        // The child closes its own stdin, prompts, then lingers. Forwarding
        // the answer hits the closed pipe; the session must end on that
        // write failure instead of waiting the child out.
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("probe.sh");
        std::fs::write(&script, "#!/bin/sh\nexec 0<&-\necho PROMPT:\nsleep 2\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let opts = ProxyOptions {
            transport: Transport::Raw,
            prompt_markers: vec!["PROMPT:".into()],
            ..ProxyOptions::default()
        };
        let player = Arc::new(RingPlayer::new(Severity::Sss));
        let started = std::time::Instant::now();
        let err = run_with_input(
            script.to_str().unwrap(),
            opts,
            player,
            scripted_input(vec![Ok("Y".into())]),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ProxyError::Write(_)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
